//! Shared-token authentication for the standard listener.
//!
//! When a token is configured every path except `/_hawser/health` requires it,
//! either in the `X-Hawser-Token` header or, failing that, the `token` query
//! parameter. The header is removed before the call is forwarded to Docker.

use axum::{
    extract::{Query, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::error::AgentError;
use crate::state::AppState;

/// Header carrying the shared token.
pub const TOKEN_HEADER: &str = "x-hawser-token";

/// Path exempt from authentication.
pub const HEALTH_PATH: &str = "/_hawser/health";

/// Axum middleware rejecting requests that lack the configured token.
///
/// Passes everything through when no token is configured.
pub async fn require_token(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = state.config.token() {
        if request.uri().path() != HEALTH_PATH {
            let provided = provided_token(&request);
            let ok = provided
                .as_deref()
                .is_some_and(|p| constant_time_eq(expected.as_bytes(), p.as_bytes()));
            if !ok {
                tracing::debug!(path = %request.uri().path(), "rejected request without valid token");
                return AgentError::Unauthorized.into_response();
            }
        }
    }

    request.headers_mut().remove(TOKEN_HEADER);
    next.run(request).await
}

/// `?token=` fallback for clients that cannot set headers.
#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Token from the header, else from the `token` query parameter.
fn provided_token(request: &Request) -> Option<String> {
    if let Some(v) = request
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        return Some(v.to_string());
    }
    Query::<TokenQuery>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(q)| q.token)
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so the token length does not leak through response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}
