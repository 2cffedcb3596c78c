//! HTTP/1.1 client for the local Docker daemon.
//!
//! Opens a fresh connection per call, over the Unix socket (default) or a
//! `tcp://host:port` endpoint. Response bodies are handed back unread so
//! streaming endpoints (logs, events, pulls) flow through without buffering.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method};
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use super::{DaemonResponse, DockerApi, DockerVersion};
use crate::error::{AgentError, Result};

/// Largest `/version` body we are willing to read.
const MAX_VERSION_BODY: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl Endpoint {
    fn parse(socket: &str) -> Self {
        if let Some(addr) = socket.strip_prefix("tcp://") {
            Self::Tcp(addr.trim_end_matches('/').to_string())
        } else {
            Self::Unix(PathBuf::from(socket.strip_prefix("unix://").unwrap_or(socket)))
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Unix(path) => path.display().to_string(),
            Self::Tcp(addr) => format!("tcp://{addr}"),
        }
    }
}

/// Daemon client. Cheap to share behind an `Arc`; holds no connection state.
#[derive(Debug, Clone)]
pub struct DockerClient {
    endpoint: Endpoint,
    connect_timeout: Duration,
}

impl DockerClient {
    /// `socket` is a filesystem path, `unix://<path>` or `tcp://<host:port>`.
    #[must_use]
    pub fn new(socket: &str, connect_timeout: Duration) -> Self {
        Self {
            endpoint: Endpoint::parse(socket),
            connect_timeout,
        }
    }

    async fn send(&self, request: hyper::Request<Body>) -> Result<hyper::Response<Incoming>> {
        let target = self.endpoint.describe();
        let unreachable = |e: std::io::Error| {
            AgentError::DaemonUnavailable(format!("cannot connect to {target}: {e}"))
        };
        let timed_out = |_| {
            AgentError::DaemonUnavailable(format!(
                "timed out connecting to {}",
                self.endpoint.describe()
            ))
        };

        match &self.endpoint {
            Endpoint::Unix(path) => {
                let stream = tokio::time::timeout(self.connect_timeout, UnixStream::connect(path))
                    .await
                    .map_err(timed_out)?
                    .map_err(unreachable)?;
                exchange(TokioIo::new(stream), request).await
            }
            Endpoint::Tcp(addr) => {
                let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
                    .await
                    .map_err(timed_out)?
                    .map_err(unreachable)?;
                exchange(TokioIo::new(stream), request).await
            }
        }
    }
}

/// Run one request over a fresh HTTP/1.1 connection.
async fn exchange<I>(io: I, request: hyper::Request<Body>) -> Result<hyper::Response<Incoming>>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, conn) = http1::handshake(io)
        .await
        .map_err(|e| AgentError::DaemonUnavailable(format!("handshake failed: {e}")))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            let msg = e.to_string().to_lowercase();
            if !msg.contains("canceled") && !msg.contains("incomplete") {
                debug!("docker connection ended: {e}");
            }
        }
    });

    sender
        .send_request(request)
        .await
        .map_err(|e| AgentError::DaemonUnavailable(e.to_string()))
}

#[async_trait]
impl DockerApi for DockerClient {
    async fn request_raw(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Body,
    ) -> Result<DaemonResponse> {
        let uri = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let mut request = hyper::Request::builder()
            .method(method)
            .uri(uri)
            .body(body)
            .map_err(|e| AgentError::DaemonUnavailable(format!("invalid request: {e}")))?;

        *request.headers_mut() = headers;
        request
            .headers_mut()
            .insert(header::HOST, HeaderValue::from_static("docker"));
        request
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));

        let response = self.send(request).await?;
        let (parts, incoming) = response.into_parts();
        Ok(DaemonResponse {
            status: parts.status,
            headers: parts.headers,
            body: Body::new(incoming),
        })
    }

    async fn version(&self) -> Result<DockerVersion> {
        let response = self
            .request_raw(Method::GET, "/version", HeaderMap::new(), Body::empty())
            .await?;
        if !response.status.is_success() {
            return Err(AgentError::DaemonUnavailable(format!(
                "/version returned {}",
                response.status
            )));
        }
        let bytes = Limited::new(response.body, MAX_VERSION_BODY)
            .collect()
            .await
            .map_err(|e| AgentError::DaemonUnavailable(format!("reading /version: {e}")))?
            .to_bytes();
        serde_json::from_slice(&bytes)
            .map_err(|e| AgentError::DaemonUnavailable(format!("unreadable /version: {e}")))
    }

    async fn ping(&self) -> Result<()> {
        let response = self
            .request_raw(Method::GET, "/_ping", HeaderMap::new(), Body::empty())
            .await?;
        if response.status.is_success() {
            Ok(())
        } else {
            Err(AgentError::DaemonUnavailable(format!(
                "/_ping returned {}",
                response.status
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(
            Endpoint::parse("/var/run/docker.sock"),
            Endpoint::Unix(PathBuf::from("/var/run/docker.sock"))
        );
        assert_eq!(
            Endpoint::parse("unix:///run/user/1000/docker.sock"),
            Endpoint::Unix(PathBuf::from("/run/user/1000/docker.sock"))
        );
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:2375/"),
            Endpoint::Tcp("127.0.0.1:2375".into())
        );
    }

    #[tokio::test]
    async fn test_missing_socket_is_daemon_unavailable() {
        let client = DockerClient::new("/nonexistent/hawser-test.sock", Duration::from_secs(1));
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, AgentError::DaemonUnavailable(_)));
        assert!(err.to_string().contains("/nonexistent/hawser-test.sock"));
    }

    #[tokio::test]
    async fn test_roundtrip_over_unix_socket() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let dir = std::env::temp_dir().join(format!("hawser-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let sock = dir.join("docker.sock");
        let listener = tokio::net::UnixListener::bind(&sock).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let head = String::from_utf8_lossy(&buf[..n]).to_string();
            let body = r#"{"Version":"27.1.1","ApiVersion":"1.46"}"#;
            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(reply.as_bytes()).await.unwrap();
            head
        });

        let client = DockerClient::new(sock.to_str().unwrap(), Duration::from_secs(1));
        let version = client.version().await.unwrap();
        assert_eq!(version.version, "27.1.1");
        assert_eq!(version.api_version, "1.46");

        let head = server.await.unwrap();
        assert!(head.starts_with("GET /version HTTP/1.1"));
        assert!(head.to_lowercase().contains("host: docker"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
