//! Unauthenticated health-check endpoint.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::state::AppState;

/// `GET /_hawser/health`: 200 when the daemon answers `/_ping`, 503 otherwise.
pub async fn health(State(state): State<AppState>) -> Response {
    match state.docker().ping().await {
        Ok(()) => Json(json!({"status": "healthy"})).into_response(),
        Err(e) => {
            tracing::warn!("health check failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Docker unhealthy: {e}"),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::StatusCode;

    use crate::docker::mock::MockDocker;
    use crate::routes::test_support::{app, body_string, get, send};

    #[tokio::test]
    async fn test_healthy() {
        let response = send(app(Arc::new(MockDocker::ok("OK")), None), get("/_hawser/health")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_unhealthy() {
        let response = send(
            app(Arc::new(MockDocker::unreachable()), None),
            get("/_hawser/health"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_string(response).await;
        assert!(body.starts_with("Docker unhealthy: "));
        assert!(body.contains("connection refused"));
    }
}
