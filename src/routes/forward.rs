//! Catch-all handler forwarding every other call to the Docker daemon.

use axum::{
    body::Body,
    extract::{Request, State},
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::proxy::{strip_hop_by_hop, ProxyBody, ProxyReply};
use crate::relay;
use crate::state::AppState;

/// Forward the call verbatim. Streaming endpoints are relayed chunk by chunk;
/// the relay stops when the client goes away.
pub async fn forward(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string());
    let streaming = relay::is_streaming_request(&parts.method, &path);

    match state
        .proxy
        .dispatch(parts.method.clone(), &path, parts.headers, body, streaming)
        .await
    {
        Ok(reply) => into_response(reply, &path),
        Err(e) => {
            warn!(method = %parts.method, path = %path, "proxy failed: {e}");
            e.into_response()
        }
    }
}

fn into_response(reply: ProxyReply, path: &str) -> Response {
    let ProxyReply {
        status,
        mut headers,
        body,
    } = reply;
    // Framing headers belong to the daemon hop.
    strip_hop_by_hop(&mut headers);

    let body = match body {
        ProxyBody::Buffered(bytes) => Body::from(bytes),
        ProxyBody::Streaming(daemon) => {
            let (mut writer, body) = relay::body_channel();
            let path = path.to_string();
            tokio::spawn(async move {
                let outcome = relay::pump(daemon, &mut writer).await;
                debug!(path = %path, ?outcome, "stream relay finished");
            });
            body
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use futures::FutureExt;

    use crate::docker::mock::{reply, streamed, MockDocker};
    use crate::routes::test_support::{app, body_string, get, send};

    #[tokio::test]
    async fn test_forwards_method_path_query_and_body() {
        let docker = Arc::new(MockDocker::new(|_, _| {
            async { Some(reply(201, r#"{"Id":"c0ffee","Warnings":[]}"#)) }.boxed()
        }));
        let request = Request::builder()
            .method(Method::POST)
            .uri("/v1.45/containers/create?name=web")
            .header("content-type", "application/json")
            .header("connection", "keep-alive")
            .body(Body::from(r#"{"Image":"nginx"}"#))
            .unwrap();

        let response = send(app(docker.clone(), None), request).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["api-version"], "1.45");
        assert_eq!(
            body_string(response).await,
            r#"{"Id":"c0ffee","Warnings":[]}"#
        );

        let calls = docker.calls();
        assert_eq!(calls[0].method, Method::POST);
        assert_eq!(calls[0].path, "/v1.45/containers/create?name=web");
        assert_eq!(&calls[0].body[..], br#"{"Image":"nginx"}"#);
        assert!(calls[0].headers.get("connection").is_none());
    }

    #[tokio::test]
    async fn test_reply_keeps_end_to_end_headers_only() {
        let docker = Arc::new(MockDocker::new(|_, _| {
            async {
                let mut daemon = reply(200, "[]");
                daemon
                    .headers
                    .insert("docker-experimental", "false".parse().unwrap());
                daemon.headers.insert("connection", "close".parse().unwrap());
                daemon
                    .headers
                    .insert("keep-alive", "timeout=5".parse().unwrap());
                Some(daemon)
            }
            .boxed()
        }));
        let response = send(app(docker, None), get("/containers/json")).await;
        let headers = response.headers();
        assert_eq!(headers["api-version"], "1.45");
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(headers["docker-experimental"], "false");
        assert!(headers.get("connection").is_none());
        assert!(headers.get("keep-alive").is_none());
    }

    #[tokio::test]
    async fn test_daemon_error_status_passes_through() {
        let docker = Arc::new(MockDocker::new(|_, _| {
            async { Some(reply(404, r#"{"message":"No such container: x"}"#)) }.boxed()
        }));
        let response = send(app(docker, None), get("/containers/x/json")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_string(response).await.contains("No such container"));
    }

    #[tokio::test]
    async fn test_unreachable_daemon_is_bad_gateway() {
        let response = send(app(Arc::new(MockDocker::unreachable()), None), get("/info")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_string(response)
            .await
            .starts_with("Docker request failed: "));
    }

    #[tokio::test]
    async fn test_streaming_endpoint_relays_chunks() {
        let docker = Arc::new(MockDocker::new(|_, path| {
            assert!(path.starts_with("/containers/abc/logs"));
            async {
                Some(streamed(
                    vec![b"first line\n".as_slice(), b"second line\n".as_slice()],
                    false,
                ))
            }
            .boxed()
        }));
        let response = send(
            app(docker, None),
            get("/containers/abc/logs?follow=1&stdout=1"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "first line\nsecond line\n");
    }

    #[tokio::test]
    async fn test_stream_read_error_keeps_delivered_data() {
        let docker = Arc::new(MockDocker::new(|_, _| {
            async { Some(streamed(vec![b"partial\n".as_slice()], true)) }.boxed()
        }));
        let response = send(app(docker, None), get("/events")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "partial\n");
    }
}
