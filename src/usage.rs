//! Usage tracker (C6): buffers the request body once to derive an initial
//! [`Usage`], then wraps the response body so every line flowing to the
//! client is also fed through a pluggable [`UsageUpdater`] before a final
//! commit hook runs once the response finishes.
//!
//! Grounded in `pkg/usage/{middleware,passthroughwriter,types,defaultusageupdater}.go`
//! and the backend-specific updaters in `pkg/llamacpp/usage.go` /
//! `pkg/ollama/usage.go`. The Go `passthroughWriter` mutates a fixed-size
//! ring buffer byte by byte as `Write` is called by the handler; here the
//! same ring buffer is fed from the axum response body stream instead.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::MiddlewareError;
use crate::AppState;

/// Byte/token accounting accumulated over one request's lifetime.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct Usage {
    pub input_bytes: usize,
    pub output_bytes: usize,
    pub input_token: i64,
    pub input_token_processed: i64,
    pub output_token: i64,
    pub images: i64,
}

/// Creates and updates [`Usage`] metrics based on the request/response
/// bodies. `update` errors are logged and discarded by the caller — usage
/// accounting is best-effort and must never fail a request (§7).
pub trait UsageUpdater: Send + Sync {
    fn usage_from_input(&self, request_body: &[u8]) -> Usage;
    fn update(&self, usage: &mut Usage, line: &[u8]) -> Result<(), String>;
}

/// The fallback updater: counts raw bytes in and out, no token accounting.
pub struct DefaultUsageUpdater;

impl UsageUpdater for DefaultUsageUpdater {
    fn usage_from_input(&self, request_body: &[u8]) -> Usage {
        Usage {
            input_bytes: request_body.len(),
            ..Default::default()
        }
    }

    fn update(&self, usage: &mut Usage, line: &[u8]) -> Result<(), String> {
        usage.output_bytes += line.len();
        Ok(())
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct LlamaPromptOnly {
    #[serde(default)]
    prompt: String,
}

/// Reads `content`/`stop`/`timings` out of streamed llama.cpp lines, matching
/// `LlamacppUsageUpdater.Update`.
pub struct LlamaCppUsageUpdater;

impl UsageUpdater for LlamaCppUsageUpdater {
    fn usage_from_input(&self, request_body: &[u8]) -> Usage {
        let prompt_len = serde_json::from_slice::<LlamaPromptOnly>(request_body)
            .map(|r| r.prompt.len())
            .unwrap_or(0);
        Usage {
            input_bytes: prompt_len,
            ..Default::default()
        }
    }

    fn update(&self, usage: &mut Usage, line: &[u8]) -> Result<(), String> {
        if line.is_empty() {
            return Ok(());
        }
        let data = line.strip_prefix(b"data: ").unwrap_or(line);
        let resp: crate::llama::LlamaResponse =
            serde_json::from_slice(data).map_err(|e| e.to_string())?;

        usage.output_bytes += resp.content.len();
        if !resp.content.is_empty() {
            usage.output_token += 1;
        }
        if resp.stop {
            usage.input_token = resp.tokens_evaluated;
            usage.input_token_processed = resp.timings.prompt_n;
            usage.output_token = resp.timings.predicted_n;
        }
        Ok(())
    }
}

static OLLAMA_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#""prompt_eval_count":(\d+),"prompt_eval_duration":(\d+),"eval_count":(\d+),"eval_duration":(\d+)\}"#,
    )
    .unwrap()
});

/// Scans each line for the Ollama usage-summary tail object; a miss fails
/// softly for that line only, matching `OllamaUsageUpdater.Update`.
pub struct OllamaUsageUpdater;

impl UsageUpdater for OllamaUsageUpdater {
    fn usage_from_input(&self, request_body: &[u8]) -> Usage {
        Usage {
            input_bytes: request_body.len(),
            ..Default::default()
        }
    }

    fn update(&self, usage: &mut Usage, line: &[u8]) -> Result<(), String> {
        usage.output_bytes += line.len();
        let line = std::str::from_utf8(line).map_err(|e| e.to_string())?;
        let caps = OLLAMA_PATTERN
            .captures(line)
            .ok_or_else(|| "no matches found".to_string())?;
        let prompt_eval_count: i64 = caps[1].parse().map_err(|_| "bad prompt_eval_count")?;
        let eval_count: i64 = caps[3].parse().map_err(|_| "bad eval_count")?;
        usage.input_token += prompt_eval_count;
        usage.output_token += eval_count;
        Ok(())
    }
}

/// Carries the accumulator across the response stream and guarantees
/// `processUsage` fires exactly once, whichever way the stream ends.
///
/// `stream::unfold`'s `None` arm — natural end of body — only runs if the
/// stream is polled to exhaustion; on client disconnect axum/hyper drops the
/// body early and that arm never runs. The `Drop` impl is the fallback: if
/// `commit` was never called, it logs whatever totals were accumulated so
/// far, matching the Go original's unconditional
/// `processUsage(ctx, *usage)` call after `ServeHTTP` returns regardless of
/// how the handler got there.
struct UsageGuard {
    usage: Usage,
    updater: Arc<dyn UsageUpdater>,
    committed: bool,
}

impl UsageGuard {
    fn new(usage: Usage, updater: Arc<dyn UsageUpdater>) -> Self {
        Self {
            usage,
            updater,
            committed: false,
        }
    }

    fn update(&mut self, line: &[u8]) {
        if let Err(err) = self.updater.update(&mut self.usage, line) {
            tracing::debug!(error = %err, "usage update failed for line");
        }
    }

    /// Commits the accumulated totals once, marking the guard so `Drop`
    /// doesn't log a second time.
    fn commit(mut self) {
        self.committed = true;
        log_usage(&self.usage, true);
    }
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        if !self.committed {
            log_usage(&self.usage, false);
        }
    }
}

fn log_usage(usage: &Usage, complete: bool) {
    tracing::info!(
        input_bytes = usage.input_bytes,
        output_bytes = usage.output_bytes,
        input_token = usage.input_token,
        input_token_processed = usage.input_token_processed,
        output_token = usage.output_token,
        complete,
        "request usage"
    );
}

const LINE_BUF_CAPACITY: usize = 256 * 1024;

/// Mirrors `passthroughWriter`'s byte-at-a-time ring buffer: a line is cut
/// either at `\n` (not included in the line) or when the buffer fills up
/// (the byte that would overflow it is dropped, like the original).
struct LineBuf {
    data: Vec<u8>,
    pos: usize,
}

impl LineBuf {
    fn new() -> Self {
        Self {
            data: vec![0u8; LINE_BUF_CAPACITY],
            pos: 0,
        }
    }

    fn feed(&mut self, chunk: &[u8], mut on_line: impl FnMut(&[u8])) {
        let max = self.data.len() - 1;
        for &byte in chunk {
            if byte == b'\n' || self.pos == max {
                on_line(&self.data[..self.pos]);
                self.pos = 0;
            } else {
                self.data[self.pos] = byte;
                self.pos += 1;
            }
        }
    }
}

/// axum middleware wiring C6 into the request pipeline: buffers the request
/// body to compute the starting [`Usage`], then streams the response body
/// through the line-scanning updater behind an [`UsageGuard`], which commits
/// once the stream ends naturally or, via its `Drop` impl, once it is
/// dropped early (client disconnect).
pub async fn usage_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return MiddlewareError::BadRequest("error reading body".into()).into_response()
        }
    };
    let usage = state.usage_updater.usage_from_input(&bytes);
    let req = Request::from_parts(parts, Body::from(bytes));

    let response = next.run(req).await;
    let (resp_parts, resp_body) = response.into_parts();
    let guard = UsageGuard::new(usage, state.usage_updater.clone());

    let inner = resp_body.into_data_stream();
    let wrapped = stream::unfold(
        (inner, guard, LineBuf::new(), false),
        |(mut inner, mut guard, mut linebuf, done)| async move {
            if done {
                return None;
            }
            match inner.next().await {
                Some(Ok(chunk)) => {
                    linebuf.feed(&chunk, |line| guard.update(line));
                    Some((Ok::<Bytes, axum::Error>(chunk), (inner, guard, linebuf, false)))
                }
                Some(Err(err)) => Some((Err(err), (inner, guard, linebuf, true))),
                None => {
                    guard.commit();
                    None
                }
            }
        },
    );

    Response::from_parts(resp_parts, Body::from_stream(wrapped))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_marks_the_guard_committed_so_drop_does_not_log_again() {
        let updater: Arc<dyn UsageUpdater> = Arc::new(DefaultUsageUpdater);
        let mut guard = UsageGuard::new(Usage::default(), updater);
        guard.update(b"hello");
        assert_eq!(guard.usage.output_bytes, 5);
        guard.commit();
        // commit() consumes the guard; its own Drop runs immediately
        // afterwards and must see `committed == true` and stay silent. There
        // is nothing further to assert here beyond "this doesn't panic or
        // double count" — the logging itself is exercised by inspection.
    }

    #[test]
    fn dropping_an_uncommitted_guard_does_not_panic() {
        let updater: Arc<dyn UsageUpdater> = Arc::new(DefaultUsageUpdater);
        let mut guard = UsageGuard::new(Usage::default(), updater);
        guard.update(b"partial");
        assert!(!guard.committed);
        drop(guard);
    }

    #[test]
    fn default_updater_counts_bytes() {
        let updater = DefaultUsageUpdater;
        let mut usage = updater.usage_from_input(b"hello");
        assert_eq!(usage.input_bytes, 5);
        updater.update(&mut usage, b"world").unwrap();
        assert_eq!(usage.output_bytes, 5);
    }

    #[test]
    fn llamacpp_updater_accumulates_tokens_and_overwrites_on_stop() {
        let updater = LlamaCppUsageUpdater;
        let mut usage = Usage::default();
        updater
            .update(&mut usage, br#"data: {"content":"hi"}"#)
            .unwrap();
        assert_eq!(usage.output_bytes, 2);
        assert_eq!(usage.output_token, 1);

        updater
            .update(
                &mut usage,
                br#"{"content":"","stop":true,"tokens_evaluated":12,"timings":{"prompt_n":12,"predicted_n":7}}"#,
            )
            .unwrap();
        assert_eq!(usage.input_token, 12);
        assert_eq!(usage.input_token_processed, 12);
        assert_eq!(usage.output_token, 7);
    }

    #[test]
    fn ollama_updater_matches_summary_tail_and_fails_softly_otherwise() {
        let updater = OllamaUsageUpdater;
        let mut usage = Usage::default();
        let line = br#"{"done":true,"prompt_eval_count":10,"prompt_eval_duration":1,"eval_count":20,"eval_duration":2}"#;
        updater.update(&mut usage, line).unwrap();
        assert_eq!(usage.input_token, 10);
        assert_eq!(usage.output_token, 20);

        let mut other = Usage::default();
        assert!(updater.update(&mut other, b"not usage data").is_err());
    }

    #[test]
    fn line_buffer_cuts_on_newline_and_on_overflow() {
        let mut buf = LineBuf::new();
        let mut lines = Vec::new();
        buf.feed(b"ab\ncd", |l| lines.push(l.to_vec()));
        assert_eq!(lines, vec![b"ab".to_vec()]);

        let mut full = LineBuf {
            data: vec![0u8; 4],
            pos: 0,
        };
        let mut cuts = Vec::new();
        full.feed(b"abcdef", |l| cuts.push(l.to_vec()));
        // capacity 4 -> max index 3; first cut happens once pos reaches 3
        assert_eq!(cuts[0], b"abc".to_vec());
    }
}
