//! Raw passthrough handler (C7): bypasses the slot queue entirely and
//! forwards the client body verbatim to a single configured backend
//! endpoint, for non-chat OpenAI-style upstreams.
//!
//! Grounded in `pkg/openai/openaichat.go`. **REDESIGN FLAG applied**: the
//! original hard-codes `req.MaxTokens = 500` and
//! `req.Model = "/tmp/models/zephyr/"` as debug leftovers before forwarding;
//! here both are optional configuration (`passthrough.max_tokens`,
//! `passthrough.model_override`) that, left unset, leaves the client's
//! request untouched (see DESIGN.md).

use std::sync::Arc;

use axum::extract::State;
use axum::response::Response;
use bytes::Bytes;
use reqwest::header::{HeaderName, HeaderValue};
use serde_json::Value;

use crate::error::MiddlewareError;
use crate::streaming::stream_backend_response_with_headers;
use crate::AppState;

#[derive(Debug, Clone)]
pub struct PassthroughConfig {
    pub url: String,
    pub auth_token: Option<String>,
    pub max_tokens: Option<i64>,
    pub model_override: Option<String>,
    pub line_by_line: bool,
}

/// Forwards `body` to `config.url` verbatim, optionally overriding
/// `max_tokens`/`model` fields first, with an `Authorization: Bearer` header
/// when `auth_token` is configured. No slot queue is involved.
pub async fn passthrough(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, MiddlewareError> {
    let Some(config) = state.passthrough.clone() else {
        return Err(MiddlewareError::BadRequest(
            "passthrough endpoint is not configured".into(),
        ));
    };

    let body = apply_overrides(&body, &config)?;

    let mut headers: Vec<(HeaderName, HeaderValue)> = Vec::new();
    if let Some(token) = &config.auth_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| MiddlewareError::Internal(e.to_string()))?;
        headers.push((reqwest::header::AUTHORIZATION, value));
    }

    let connector = state.connector.clone();
    let line_by_line = config.line_by_line;
    let forward = |line: Bytes| -> Result<Option<Bytes>, MiddlewareError> { Ok(Some(line)) };

    Ok(stream_backend_response_with_headers(
        connector,
        config.url.clone(),
        body,
        line_by_line,
        headers,
        forward,
        None,
        std::future::ready(()),
    )
    .await)
}

/// Applies the configured `max_tokens`/`model` overrides to the client's raw
/// JSON body, leaving any field the client already set untouched when no
/// override is configured.
fn apply_overrides(body: &[u8], config: &PassthroughConfig) -> Result<Vec<u8>, MiddlewareError> {
    if config.max_tokens.is_none() && config.model_override.is_none() {
        return Ok(body.to_vec());
    }
    let mut value: Value = serde_json::from_slice(body)?;
    if let Some(max_tokens) = config.max_tokens {
        value["max_tokens"] = Value::from(max_tokens);
    }
    if let Some(model) = &config.model_override {
        value["model"] = Value::from(model.clone());
    }
    serde_json::to_vec(&value).map_err(|e| MiddlewareError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_overrides_leaves_body_byte_identical() {
        let config = PassthroughConfig {
            url: "http://x".into(),
            auth_token: None,
            max_tokens: None,
            model_override: None,
            line_by_line: false,
        };
        let body = br#"{"model":"gpt-4","max_tokens":10}"#;
        assert_eq!(apply_overrides(body, &config).unwrap(), body.to_vec());
    }

    #[test]
    fn overrides_replace_only_configured_fields() {
        let config = PassthroughConfig {
            url: "http://x".into(),
            auth_token: None,
            max_tokens: Some(500),
            model_override: Some("/tmp/models/zephyr/".into()),
            line_by_line: false,
        };
        let body = br#"{"model":"gpt-4","max_tokens":10,"temperature":0.5}"#;
        let out = apply_overrides(body, &config).unwrap();
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["max_tokens"], 500);
        assert_eq!(value["model"], "/tmp/models/zephyr/");
        assert_eq!(value["temperature"], 0.5);
    }
}
