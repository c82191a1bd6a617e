//! Bearer token middleware
//!
//! With no tokens configured every request passes. Otherwise the
//! `Authorization: Bearer <token>` header must carry one of them.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::debug;

/// Accepted bearer tokens
pub type AuthTokens = Arc<Vec<String>>;

/// Reject requests without a configured bearer token
pub async fn require_bearer(
    State(tokens): State<AuthTokens>,
    req: Request,
    next: Next,
) -> Response {
    if tokens.is_empty() {
        return next.run(req).await;
    }

    let token = extract_bearer(req.headers().get(axum::http::header::AUTHORIZATION));
    match token {
        Some(token) if tokens.iter().any(|t| *t == token) => next.run(req).await,
        _ => {
            debug!(path = %req.uri().path(), "Rejected unauthenticated request");
            unauthorized()
        }
    }
}

fn extract_bearer(header: Option<&HeaderValue>) -> Option<String> {
    let value = header?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "Unauthorized"})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bearer() {
        let header = HeaderValue::from_static("Bearer abc ");
        assert_eq!(extract_bearer(Some(&header)), Some("abc".to_string()));

        let lower = HeaderValue::from_static("bearer xyz");
        assert_eq!(extract_bearer(Some(&lower)), Some("xyz".to_string()));

        let basic = HeaderValue::from_static("Basic Zm9vOmJhcg==");
        assert_eq!(extract_bearer(Some(&basic)), None);
        assert_eq!(extract_bearer(None), None);
    }
}
