//! Agent information endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /_hawser/info`: agent identity plus the daemon's version.
///
/// `dockerVersion` is `"unknown"` when the daemon cannot be queried; the
/// endpoint itself still answers 200.
pub async fn info(State(state): State<AppState>) -> Json<Value> {
    let docker_version = match state.docker().version().await {
        Ok(v) => v.version,
        Err(e) => {
            tracing::debug!("docker version unavailable: {e}");
            "unknown".to_string()
        }
    };

    Json(json!({
        "agentId": state.config.agent.id,
        "agentName": state.config.agent.name,
        "dockerVersion": docker_version,
        "mode": "standard",
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::StatusCode;
    use serde_json::Value;

    use crate::docker::mock::MockDocker;
    use crate::routes::test_support::{app, body_string, get, send};

    async fn info_body(docker: MockDocker) -> Value {
        let response = send(app(Arc::new(docker), None), get("/_hawser/info")).await;
        assert_eq!(response.status(), StatusCode::OK);
        serde_json::from_str(&body_string(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_info_fields() {
        let body = info_body(MockDocker::ok("{}")).await;
        assert_eq!(body["agentId"], "agent-123");
        assert_eq!(body["agentName"], "test-host");
        assert_eq!(body["dockerVersion"], "27.1.1");
        assert_eq!(body["mode"], "standard");
    }

    #[tokio::test]
    async fn test_info_without_daemon() {
        let body = info_body(MockDocker::unreachable()).await;
        assert_eq!(body["dockerVersion"], "unknown");
    }
}
