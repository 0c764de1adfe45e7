//! The middleware's single error type.
//!
//! Mirrors the error-kind taxonomy of the original Go service (backend I/O,
//! client write, bad request, missing session, tool not found, config/
//! internal) in the `LLMError`-style idiom the teacher crate uses: a plain
//! enum, hand-written `Display`, and `From` impls for the error types that
//! cross into it at the request boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum MiddlewareError {
    /// Network/timeout/read failure talking to a backend. 500, no retry.
    BackendIo(String),
    /// The downstream client socket broke, or a yield callback aborted the read.
    ClientWrite(String),
    /// JSON decode failure, empty messages, template failure, malformed tool syntax. 400.
    BadRequest(String),
    /// No session could be extracted for the request. 401.
    Unauthorized(String),
    /// Token concurrency limiter found no `SessionData` in the request. 500.
    NoToken(String),
    /// Encoding, internal invariant, or other unexpected failure. 500.
    Internal(String),
}

impl fmt::Display for MiddlewareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MiddlewareError::BackendIo(m) => write!(f, "backend I/O error: {m}"),
            MiddlewareError::ClientWrite(m) => write!(f, "client write error: {m}"),
            MiddlewareError::BadRequest(m) => write!(f, "bad request: {m}"),
            MiddlewareError::Unauthorized(m) => write!(f, "unauthorized: {m}"),
            MiddlewareError::NoToken(m) => write!(f, "no token found: {m}"),
            MiddlewareError::Internal(m) => write!(f, "internal error: {m}"),
        }
    }
}

impl std::error::Error for MiddlewareError {}

impl From<reqwest::Error> for MiddlewareError {
    fn from(err: reqwest::Error) -> Self {
        MiddlewareError::BackendIo(err.to_string())
    }
}

impl From<serde_json::Error> for MiddlewareError {
    fn from(err: serde_json::Error) -> Self {
        MiddlewareError::BadRequest(err.to_string())
    }
}

impl From<handlebars::RenderError> for MiddlewareError {
    fn from(err: handlebars::RenderError) -> Self {
        MiddlewareError::BadRequest(format!("bad request (messages): {err}"))
    }
}

impl IntoResponse for MiddlewareError {
    fn into_response(self) -> Response {
        let status = match &self {
            MiddlewareError::BackendIo(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MiddlewareError::ClientWrite(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MiddlewareError::BadRequest(_) => StatusCode::BAD_REQUEST,
            MiddlewareError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            MiddlewareError::NoToken(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MiddlewareError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
