//! Session extraction (C10) and the per-token concurrency limiter (C3).
//!
//! The original treats authentication as an opaque collaborator reached
//! through ambient request context; this crate needs a concrete, swappable
//! stand-in to be a runnable service, so `SessionProvider` plays that role
//! with a bearer-token default implementation.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::error::MiddlewareError;
use crate::AppState;

#[derive(Debug, Clone)]
pub struct SessionData {
    pub token_id: i64,
    pub user_id: String,
    pub token_concurrency_limit: usize,
}

pub trait SessionProvider: Send + Sync {
    fn extract(&self, headers: &HeaderMap) -> Option<SessionData>;
}

/// Treats the bearer token (if any) as the user id. If `auth_key` is
/// configured, the request must carry exactly that token; otherwise any
/// bearer token (or none, mapped to the anonymous `token_id = 0` session) is
/// accepted.
pub struct BearerTokenSessionProvider {
    pub auth_key: Option<String>,
    pub default_token_concurrency_limit: usize,
}

impl SessionProvider for BearerTokenSessionProvider {
    fn extract(&self, headers: &HeaderMap) -> Option<SessionData> {
        let bearer = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "));

        match (&self.auth_key, bearer) {
            (Some(required), Some(token)) if token == required => Some(SessionData {
                token_id: stable_hash(token),
                user_id: token.to_string(),
                token_concurrency_limit: self.default_token_concurrency_limit,
            }),
            (Some(_), _) => None,
            (None, Some(token)) => Some(SessionData {
                token_id: stable_hash(token),
                user_id: token.to_string(),
                token_concurrency_limit: self.default_token_concurrency_limit,
            }),
            (None, None) => Some(SessionData {
                token_id: 0,
                user_id: String::new(),
                token_concurrency_limit: self.default_token_concurrency_limit,
            }),
        }
    }
}

fn stable_hash(s: &str) -> i64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish() as i64
}

/// Fetch-or-create one counting semaphore per token id (C3). The map grows
/// monotonically for the process lifetime, bounded by distinct tokens seen.
pub struct TokenLimiter {
    semaphores: Mutex<HashMap<i64, Arc<Semaphore>>>,
}

impl TokenLimiter {
    pub fn new() -> Self {
        Self {
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(
        &self,
        session: &SessionData,
    ) -> Result<OwnedSemaphorePermit, MiddlewareError> {
        let semaphore = {
            let mut map = self.semaphores.lock().await;
            map.entry(session.token_id)
                .or_insert_with(|| Arc::new(Semaphore::new(session.token_concurrency_limit.max(1))))
                .clone()
        };
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| MiddlewareError::NoToken("token semaphore closed".into()))
    }
}

impl Default for TokenLimiter {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn session_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    match state.session_provider.extract(req.headers()) {
        Some(session) => {
            req.extensions_mut().insert(session);
            next.run(req).await
        }
        None => MiddlewareError::Unauthorized("not authorized".into()).into_response(),
    }
}

pub async fn token_limiter_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(session) = req.extensions().get::<SessionData>().cloned() else {
        return MiddlewareError::NoToken("no token found".into()).into_response();
    };
    let _permit = match state.token_limiter.acquire(&session).await {
        Ok(permit) => permit,
        Err(err) => return err.into_response(),
    };
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn anonymous_request_gets_token_id_zero_when_no_auth_key_configured() {
        let provider = BearerTokenSessionProvider {
            auth_key: None,
            default_token_concurrency_limit: 4,
        };
        let headers = HeaderMap::new();
        let session = provider.extract(&headers).unwrap();
        assert_eq!(session.token_id, 0);
    }

    #[test]
    fn mismatched_auth_key_is_rejected() {
        let provider = BearerTokenSessionProvider {
            auth_key: Some("secret".into()),
            default_token_concurrency_limit: 4,
        };
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer wrong"),
        );
        assert!(provider.extract(&headers).is_none());
    }

    #[test]
    fn matching_auth_key_is_accepted() {
        let provider = BearerTokenSessionProvider {
            auth_key: Some("secret".into()),
            default_token_concurrency_limit: 4,
        };
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer secret"),
        );
        assert!(provider.extract(&headers).is_some());
    }

    #[tokio::test]
    async fn token_limiter_enforces_per_token_capacity() {
        let limiter = TokenLimiter::new();
        let session = SessionData {
            token_id: 42,
            user_id: "u".into(),
            token_concurrency_limit: 1,
        };
        let first = limiter.acquire(&session).await.unwrap();
        let second = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            limiter.acquire(&session),
        )
        .await;
        assert!(second.is_err(), "second acquire should have blocked");
        drop(first);
        let third = limiter.acquire(&session).await;
        assert!(third.is_ok());
    }
}
