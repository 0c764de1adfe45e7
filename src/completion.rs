//! Non-chat completion endpoint (SPEC_FULL §4.4 expansion, `NewLlamacppHandler`
//! in the original): decodes a raw llama.cpp [`LlamaRequest`], acquires a
//! slot keyed on `(SessionID, request.id_slot)` — the client's `id_slot`
//! value doubles as the affinity key before the scheduler overwrites it —
//! forwards to the backend via C1, and releases the slot on every exit path.
//! No OpenAI framing; the backend's lines are forwarded verbatim.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Response;
use axum::{Extension, Json};
use bytes::Bytes;
use tracing::Instrument;

use crate::error::MiddlewareError;
use crate::llama::{clamp_n_predict, LlamaRequest};
use crate::session::SessionData;
use crate::streaming::stream_backend_response;
use crate::AppState;

pub async fn completion(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionData>,
    Json(req): Json<LlamaRequest>,
) -> Result<Response, MiddlewareError> {
    let token_id = session.token_id;
    let span = tracing::info_span!(
        "completion",
        token_id,
        user_id = %session.user_id,
        slot = tracing::field::Empty,
        endpoint_slot = tracing::field::Empty,
        endpoint = tracing::field::Empty,
    );
    async move {
        let mut req = req;
        let handle = state.queue.request_slot(token_id, req.id_slot).await;
        let current = tracing::Span::current();
        current.record("slot", handle.index);
        current.record("endpoint_slot", handle.endpoint_slot.slot);
        current.record("endpoint", tracing::field::display(&handle.endpoint_url));
        tracing::info!("got slot");

        req.id_slot = handle.endpoint_slot.slot as i64;
        req.n_predict = clamp_n_predict(req.n_predict);
        // `line_by_line` is a fixed construction-time setting (§6), not derived
        // from the client's `stream` field — only the chat handler couples the
        // two, per `NewLlamacppHandler` in the original.
        let line_by_line = state.line_by_line;

        let body = match serde_json::to_vec(&req) {
            Ok(body) => body,
            Err(err) => {
                state.queue.release_slot(handle).await;
                return Err(MiddlewareError::Internal(err.to_string()));
            }
        };

        let connector = state.connector.clone();
        let endpoint_url = handle.endpoint_url.clone();
        let queue = state.queue.clone();
        let release = async move {
            queue.release_slot(handle).await;
        };

        let passthrough = |line: Bytes| -> Result<Option<Bytes>, MiddlewareError> { Ok(Some(line)) };
        let response = stream_backend_response(
            connector,
            endpoint_url,
            body,
            line_by_line,
            passthrough,
            None,
            release,
        )
        .await;
        Ok(response)
    }
    .instrument(span)
    .await
}
