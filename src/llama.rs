//! llama.cpp wire types and the single-slot backend call (`handle_llamacpp`
//! in the original). `LlamaRequest` mirrors the reference `/completion`
//! request verbatim; `LlamaResponse` is the subset of the backend's reply
//! the middleware reads (content, stop flags, timings).

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

use crate::connector::BackendConnector;
use crate::error::MiddlewareError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlamaRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_p: Option<f32>,
    #[serde(default)]
    pub n_predict: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_keep: Option<i64>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default)]
    pub id_slot: i64,
    #[serde(default)]
    pub cache_prompt: bool,
    #[serde(default)]
    pub logit_bias: Vec<(i64, f64)>,
}

/// Clamps `n_predict` to `[1, 2000]`; anything outside that range (including
/// the unset/zero default) becomes 2000.
pub fn clamp_n_predict(n: i64) -> i64 {
    if (1..=2000).contains(&n) {
        n
    } else {
        2000
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlamaResponse {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub stop: bool,
    #[serde(default)]
    pub stopped_eos: bool,
    #[serde(default)]
    pub stopped_limit: bool,
    #[serde(default)]
    pub stopped_word: bool,
    #[serde(default)]
    pub tokens_cached: i64,
    #[serde(default)]
    pub tokens_evaluated: i64,
    #[serde(default)]
    pub tokens_predicted: i64,
    #[serde(default)]
    pub timings: LlamaResponseTimings,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct LlamaResponseTimings {
    #[serde(default)]
    pub predicted_n: i64,
    #[serde(default)]
    pub prompt_n: i64,
}

/// Strips a leading `"data: "` frame prefix, then derives `(content,
/// finish_reason)`. A payload shorter than 2 bytes after stripping is an
/// ignorable keep-alive/empty line, not an error.
pub fn extract_from_llama_line(
    line: &[u8],
) -> Result<Option<(String, Option<&'static str>)>, MiddlewareError> {
    let data = line.strip_prefix(b"data: ").unwrap_or(line);
    if data.len() < 2 {
        return Ok(None);
    }
    let resp: LlamaResponse = serde_json::from_slice(data)?;
    let finish_reason = if resp.stopped_eos || resp.stopped_word {
        Some("stop")
    } else if resp.stopped_limit {
        Some("length")
    } else {
        None
    };
    Ok(Some((resp.content, finish_reason)))
}

/// Sends `req` to the physical slot at `endpoint_url`/`slot_index`, clamping
/// `n_predict` and stamping `id_slot` as the scheduler assigned it.
pub async fn handle_llamacpp<F, Fut>(
    connector: &BackendConnector,
    endpoint_url: &str,
    mut req: LlamaRequest,
    slot_index: usize,
    line_by_line: bool,
    yield_line: F,
) -> Result<(), MiddlewareError>
where
    F: FnMut(Bytes) -> Fut,
    Fut: Future<Output = bool>,
{
    req.id_slot = slot_index as i64;
    req.n_predict = clamp_n_predict(req.n_predict);
    let body = serde_json::to_vec(&req).map_err(|e| MiddlewareError::Internal(e.to_string()))?;
    connector
        .request(endpoint_url, body, line_by_line, &[], yield_line)
        .await
}

/// Convenience used by the tool protocol: run a single non-streaming
/// completion and return its decoded `LlamaResponse`.
pub async fn run_single_completion(
    connector: &Arc<BackendConnector>,
    endpoint_url: &str,
    slot_index: usize,
    req: LlamaRequest,
) -> Result<LlamaResponse, MiddlewareError> {
    let mut result: Option<LlamaResponse> = None;
    handle_llamacpp(connector, endpoint_url, req, slot_index, false, |line| {
        let parsed = serde_json::from_slice::<LlamaResponse>(&line);
        let ok = parsed.is_ok();
        if let Ok(r) = parsed {
            result = Some(r);
        }
        async move { ok }
    })
    .await?;
    result.ok_or_else(|| MiddlewareError::BackendIo("backend returned no response".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn n_predict_clamps_out_of_range_values_to_default() {
        assert_eq!(clamp_n_predict(0), 2000);
        assert_eq!(clamp_n_predict(-5), 2000);
        assert_eq!(clamp_n_predict(2001), 2000);
        assert_eq!(clamp_n_predict(1), 1);
        assert_eq!(clamp_n_predict(2000), 2000);
        assert_eq!(clamp_n_predict(500), 500);
    }

    #[test]
    fn extract_strips_data_prefix_and_derives_finish_reason() {
        let line = br#"data: {"content":"hi","stopped_eos":true}"#;
        let (content, reason) = extract_from_llama_line(line).unwrap().unwrap();
        assert_eq!(content, "hi");
        assert_eq!(reason, Some("stop"));
    }

    #[test]
    fn extract_ignores_short_payloads() {
        assert!(extract_from_llama_line(b"data: ").unwrap().is_none());
        assert!(extract_from_llama_line(b"").unwrap().is_none());
    }

    #[test]
    fn extract_maps_stopped_limit_to_length() {
        let line = br#"{"content":"","stopped_limit":true}"#;
        let (_, reason) = extract_from_llama_line(line).unwrap().unwrap();
        assert_eq!(reason, Some("length"));
    }
}
