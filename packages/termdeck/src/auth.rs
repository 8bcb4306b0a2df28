//! Authentication: bearer tokens mapped to owner ids.
//!
//! Requests present a token either as `Authorization: Bearer <token>` or as a
//! `token` query parameter (browsers cannot set headers on a WebSocket
//! upgrade). The middleware resolves the owner before any handler runs, so an
//! unauthenticated upgrade is refused with 401 and never reaches the
//! WebSocket handler. With auth disabled every caller is the `local` owner.

use axum::{
    Json,
    body::Body,
    extract::{Query, Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::config::{AuthConfig, LOCAL_OWNER};

/// The caller a request acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub owner_id: String,
}

impl AuthUser {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
        }
    }

    pub fn local() -> Self {
        Self::new(LOCAL_OWNER)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authentication required")]
    MissingCredential,
    #[error("invalid credential")]
    InvalidCredential,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Token from the `Authorization` header, else from the `token` query param.
fn presented_token(request: &Request<Body>) -> Option<String> {
    let from_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());
    from_header.or_else(|| {
        Query::<TokenQuery>::try_from_uri(request.uri())
            .ok()
            .and_then(|q| q.0.token)
    })
}

/// Resolve the caller, or refuse with 401.
pub fn authenticate(config: &AuthConfig, request: &Request<Body>) -> Result<AuthUser, AuthError> {
    if !config.enabled {
        return Ok(AuthUser::local());
    }
    let token = presented_token(request).ok_or(AuthError::MissingCredential)?;
    config
        .owner_for_token(&token)
        .map(AuthUser::new)
        .ok_or(AuthError::InvalidCredential)
}

pub async fn auth_middleware(
    State(config): State<Arc<AuthConfig>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if is_public_route(request.uri().path()) {
        return next.run(request).await;
    }

    match authenticate(&config, &request) {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(e) => {
            debug!(uri = %request.uri().path(), "rejected request: {}", e);
            e.into_response()
        }
    }
}

fn is_public_route(path: &str) -> bool {
    path == "/health" || path.starts_with("/health/") || path == "/metrics"
}

/// Extract AuthUser from request extensions (set by middleware).
/// Returns 401 if not present.
impl<S> axum::extract::FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        parts.extensions.get::<AuthUser>().cloned().ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Authentication required"})),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(enabled: bool) -> AuthConfig {
        let mut tokens = HashMap::new();
        tokens.insert("s3cret".to_string(), "alice".to_string());
        AuthConfig { enabled, tokens }
    }

    fn request(uri: &str, auth: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = auth {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn bearer_header_resolves_owner() {
        let user = authenticate(&config(true), &request("/api/sessions", Some("Bearer s3cret"))).unwrap();
        assert_eq!(user.owner_id, "alice");
    }

    #[test]
    fn query_token_resolves_owner() {
        let user = authenticate(&config(true), &request("/api/ws?token=s3cret", None)).unwrap();
        assert_eq!(user, AuthUser::new("alice"));
    }

    #[test]
    fn missing_and_invalid_tokens_rejected() {
        assert!(matches!(
            authenticate(&config(true), &request("/api/ws", None)),
            Err(AuthError::MissingCredential)
        ));
        assert!(matches!(
            authenticate(&config(true), &request("/api/ws?token=wrong", None)),
            Err(AuthError::InvalidCredential)
        ));
        assert!(matches!(
            authenticate(&config(true), &request("/api/ws", Some("Basic s3cret"))),
            Err(AuthError::MissingCredential)
        ));
    }

    #[test]
    fn disabled_auth_is_local_owner() {
        let user = authenticate(&config(false), &request("/api/sessions", None)).unwrap();
        assert_eq!(user, AuthUser::local());
    }

    #[test]
    fn public_routes() {
        assert!(is_public_route("/health"));
        assert!(is_public_route("/health/live"));
        assert!(is_public_route("/metrics"));
        assert!(!is_public_route("/api/sessions"));
        assert!(!is_public_route("/api/ws"));
    }
}
