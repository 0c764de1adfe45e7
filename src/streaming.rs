//! Bridges `BackendConnector`'s callback-style line pump into an axum
//! streaming response body.
//!
//! The connector's `yield_line` callback is synchronous-shaped but must
//! cross an `mpsc` channel to reach the response body constructed on the
//! handler's return path. To preserve "500 before any output, 200 once
//! output exists" as closely as an async streaming body allows, the first
//! produced chunk is awaited before the `Response` is built: a backend
//! failure with zero output becomes a real error response, while a failure
//! after streaming has begun is logged and the stream simply ends early
//! (see DESIGN.md).

use std::sync::Arc;

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderName, HeaderValue};
use tokio_stream::wrappers::ReceiverStream;

use crate::connector::BackendConnector;
use crate::error::MiddlewareError;

const CHANNEL_CAPACITY: usize = 16;

/// Runs `request` against `connector`, rewriting each line through `rewrite`
/// before it reaches the client. `rewrite` returning `Ok(None)` drops the
/// line (e.g. an ignorable short payload); returning `Err` logs and aborts
/// the stream. `trailer`, if present, is appended once the backend read
/// finishes successfully (the `"\ndata: [DONE]"` sentinel in streaming mode).
/// `release` runs once the backend read finishes, success or not — it is the
/// caller's slot release, which must outlive the first-chunk commit point
/// since the physical slot stays occupied for the whole backend read, not
/// just until the first byte reaches the client.
pub async fn stream_backend_response<R, F>(
    connector: Arc<BackendConnector>,
    endpoint_url: String,
    body: Vec<u8>,
    line_by_line: bool,
    rewrite: R,
    trailer: Option<Bytes>,
    release: F,
) -> Response
where
    R: FnMut(Bytes) -> Result<Option<Bytes>, MiddlewareError> + Send + 'static,
    F: std::future::Future<Output = ()> + Send + 'static,
{
    stream_backend_response_with_headers(
        connector,
        endpoint_url,
        body,
        line_by_line,
        Vec::new(),
        rewrite,
        trailer,
        release,
    )
    .await
}

/// Same as [`stream_backend_response`] but also attaches `extra_headers` to
/// the outbound backend request (the passthrough route's `Authorization`
/// bearer header).
pub async fn stream_backend_response_with_headers<R, F>(
    connector: Arc<BackendConnector>,
    endpoint_url: String,
    body: Vec<u8>,
    line_by_line: bool,
    extra_headers: Vec<(HeaderName, HeaderValue)>,
    mut rewrite: R,
    trailer: Option<Bytes>,
    release: F,
) -> Response
where
    R: FnMut(Bytes) -> Result<Option<Bytes>, MiddlewareError> + Send + 'static,
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Bytes>(CHANNEL_CAPACITY);

    let join = tokio::spawn(async move {
        let result = connector
            .request(&endpoint_url, body, line_by_line, &extra_headers, |line| {
                let outcome = rewrite(line);
                let tx = tx.clone();
                async move {
                    match outcome {
                        Ok(Some(chunk)) => tx.send(chunk).await.is_ok(),
                        Ok(None) => true,
                        Err(err) => {
                            tracing::error!(error = %err, "rewriting backend line");
                            false
                        }
                    }
                }
            })
            .await;
        if result.is_ok() {
            if let Some(trailer) = trailer {
                let _ = tx.send(trailer).await;
            }
        }
        release.await;
        result
    });

    let first = rx.recv().await;

    let Some(first_chunk) = first else {
        return match join.await {
            Ok(Ok(())) => (StatusCode::OK, Body::empty()).into_response(),
            Ok(Err(err)) => err.into_response(),
            Err(_) => MiddlewareError::Internal("backend task panicked".into()).into_response(),
        };
    };

    tokio::spawn(async move {
        if let Ok(Err(err)) = join.await {
            tracing::error!(error = %err, "backend error after streaming had already started");
        }
    });

    let rest = ReceiverStream::new(rx);
    let combined = futures::stream::once(async move { Ok::<_, std::convert::Infallible>(first_chunk) })
        .chain(rest.map(Ok::<_, std::convert::Infallible>));

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from_stream(combined))
        .expect("building a streamed response never fails")
}
