//! Chat pipeline (C4): parse, template, slot, tool probe, backend call,
//! per-line OpenAI rewrite, `[DONE]` sentinel.
//!
//! Grounded in `pkg/llamacpp/handler.go`'s `NewLlamacppChatHandler`.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use bytes::Bytes;
use tracing::Instrument;

use super::tools::{handle_tools, ToolContext};
use super::types::{build_completion_frame, ChatCompletionMessage, ChatRequest};
use crate::error::MiddlewareError;
use crate::ids::nanosecond_hex_id;
use crate::llama::{clamp_n_predict, extract_from_llama_line, LlamaRequest};
use crate::session::SessionData;
use crate::streaming::stream_backend_response;
use crate::AppState;

const DONE_SENTINEL: &[u8] = b"\ndata: [DONE]";

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionData>,
    Json(chat_req): Json<ChatRequest>,
) -> Result<Response, MiddlewareError> {
    if chat_req.messages.is_empty() {
        return Err(MiddlewareError::BadRequest("messages must not be empty".into()));
    }

    let token_id = session.token_id;
    let span = tracing::info_span!(
        "chat_completions",
        token_id,
        user_id = %session.user_id,
        slot = tracing::field::Empty,
        endpoint_slot = tracing::field::Empty,
        endpoint = tracing::field::Empty,
    );

    async move {
        let request_id = nanosecond_hex_id();
        let handle = state.queue.request_slot(token_id, chat_req.slot).await;
        let current = tracing::Span::current();
        current.record("slot", handle.index);
        current.record("endpoint_slot", handle.endpoint_slot.slot);
        current.record("endpoint", tracing::field::display(&handle.endpoint_url));
        tracing::info!("got slot");

        let tool_ctx = ToolContext {
            connector: &state.connector,
            endpoint_url: &handle.endpoint_url,
            slot_index: handle.endpoint_slot.slot,
            template: &state.template,
            stop: &state.stop,
            tool_calls: &state.tool_calls,
        };

        let tool_outcome = handle_tools(
            &tool_ctx,
            &chat_req.messages,
            &chat_req.tools,
            &chat_req.tool_choice,
        )
        .await;

        let tool_outcome = match tool_outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                state.queue.release_slot(handle).await;
                return Err(err);
            }
        };

        if let Some(message) = tool_outcome {
            state.queue.release_slot(handle).await;
            let frame = build_completion_frame(
                chat_req.stream,
                &request_id,
                &chat_req.model,
                message,
                Some("tool_call"),
            );
            return Ok(write_single_frame(chat_req.stream, &frame));
        }

        let prompt = match state.template.render(&chat_req.messages) {
            Ok(prompt) => prompt,
            Err(err) => {
                state.queue.release_slot(handle).await;
                return Err(err);
            }
        };

        let llama_req = LlamaRequest {
            prompt,
            stream: chat_req.stream,
            n_predict: clamp_n_predict(chat_req.max_tokens),
            temperature: chat_req.temperature,
            top_p: chat_req.top_p,
            cache_prompt: true,
            stop: Some(state.stop.clone()),
            id_slot: handle.endpoint_slot.slot as i64,
            logit_bias: state.default_logit_bias.clone(),
            ..Default::default()
        };
        let body = match serde_json::to_vec(&llama_req) {
            Ok(body) => body,
            Err(err) => {
                state.queue.release_slot(handle).await;
                return Err(MiddlewareError::Internal(err.to_string()));
            }
        };

        let connector = state.connector.clone();
        let endpoint_url = handle.endpoint_url.clone();
        let stream = chat_req.stream;
        let model = chat_req.model.clone();

        let rewrite = move |line: Bytes| -> Result<Option<Bytes>, MiddlewareError> {
            let Some((content, finish_reason)) = extract_from_llama_line(&line)? else {
                return Ok(None);
            };
            let frame = build_completion_frame(
                stream,
                &request_id,
                &model,
                ChatCompletionMessage {
                    role: "assistant".to_string(),
                    content: Some(content),
                    tool_calls: Vec::new(),
                },
                finish_reason,
            );
            Ok(Some(frame_bytes(stream, &frame)))
        };

        let trailer = stream.then(|| Bytes::from_static(DONE_SENTINEL));
        let queue = state.queue.clone();
        let release = async move {
            queue.release_slot(handle).await;
        };
        let response = stream_backend_response(
            connector, endpoint_url, body, stream, rewrite, trailer, release,
        )
        .await;
        Ok(response)
    }
    .instrument(span)
    .await
}

fn frame_bytes(stream: bool, frame: &serde_json::Value) -> Bytes {
    let json = serde_json::to_vec(frame).expect("frame always serializes");
    if stream {
        let mut out = Vec::with_capacity(json.len() + 7);
        out.extend_from_slice(b"\ndata: ");
        out.extend_from_slice(&json);
        Bytes::from(out)
    } else {
        Bytes::from(json)
    }
}

fn write_single_frame(stream: bool, frame: &serde_json::Value) -> Response {
    let bytes = frame_bytes(stream, frame);
    ([("content-type", "application/json")], bytes).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::template::ChatTemplate;
    use crate::connector::BackendConnector;
    use crate::expiring_map::ExpiringMap;
    use crate::queue::SlotQueue;
    use crate::session::{BearerTokenSessionProvider, TokenLimiter};
    use crate::usage::DefaultUsageUpdater;
    use axum::http::StatusCode;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState {
            queue: Arc::new(SlotQueue::new(&[])),
            connector: Arc::new(BackendConnector::new()),
            template: ChatTemplate::compile("{{#each this}}{{this.role}}: {{this.content}}\n{{/each}}")
                .unwrap(),
            stop: Vec::new(),
            default_logit_bias: Vec::new(),
            tool_calls: ExpiringMap::new(),
            session_provider: Arc::new(BearerTokenSessionProvider {
                auth_key: None,
                default_token_concurrency_limit: 4,
            }),
            token_limiter: TokenLimiter::new(),
            usage_updater: Arc::new(DefaultUsageUpdater),
            passthrough: None,
            line_by_line: false,
        })
    }

    fn test_session() -> SessionData {
        SessionData {
            token_id: 1,
            user_id: "u".to_string(),
            token_concurrency_limit: 4,
        }
    }

    #[tokio::test]
    async fn empty_messages_is_rejected_before_any_slot_or_backend_work() {
        let chat_req: ChatRequest = serde_json::from_str(r#"{"messages":[]}"#).unwrap();
        let result = chat_completions(
            State(test_state()),
            Extension(test_session()),
            Json(chat_req),
        )
        .await;
        assert!(matches!(result, Err(MiddlewareError::BadRequest(_))));
    }

    #[tokio::test]
    async fn missing_messages_field_fails_json_decode() {
        let decoded = serde_json::from_str::<ChatRequest>(r#"{"model":"x"}"#);
        assert!(decoded.is_err());
    }

    #[tokio::test]
    async fn bad_request_error_maps_to_400() {
        let response = MiddlewareError::BadRequest("messages must not be empty".into())
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
