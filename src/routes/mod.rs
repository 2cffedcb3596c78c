//! HTTP route handlers for standard mode.
//!
//! | Method | Path              | Auth | Description                      |
//! |--------|-------------------|------|----------------------------------|
//! | GET    | `/_hawser/health` | No   | Daemon reachability check        |
//! | GET    | `/_hawser/info`   | Yes  | Agent identity and Docker version |
//! | any    | everything else   | Yes  | Forwarded to the Docker daemon   |
//!
//! Authentication applies only when a token is configured, see
//! [`crate::auth::require_token`].

pub mod forward;
pub mod health;
pub mod info;

use axum::{middleware, routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::state::AppState;

/// Build the standard-mode router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(auth::HEALTH_PATH, get(health::health))
        .route("/_hawser/info", get(info::info))
        .fallback(forward::forward)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_token,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
