//! Proxy core: turns one Docker API call into one daemon call.
//!
//! Shared by the standard listener and the edge tunnel. Holds no state across
//! calls besides the daemon handle.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use tracing::debug;

use crate::docker::DockerApi;
use crate::error::Result;
use crate::relay;

/// Headers that describe a single transport hop and are never forwarded.
pub const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, plus any header the `Connection` header names.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all("connection")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    for name in listed {
        headers.remove(name);
    }
}

/// Reply body as produced by the daemon.
pub enum ProxyBody {
    /// Read in full.
    Buffered(Bytes),
    /// Still attached to the daemon; must be pumped.
    Streaming(Body),
}

pub struct ProxyReply {
    pub status: StatusCode,
    /// Daemon response headers, unmodified.
    pub headers: HeaderMap,
    pub body: ProxyBody,
}

#[derive(Clone)]
pub struct ProxyCore {
    docker: Arc<dyn DockerApi>,
}

impl ProxyCore {
    pub fn new(docker: Arc<dyn DockerApi>) -> Self {
        Self { docker }
    }

    pub fn docker(&self) -> &Arc<dyn DockerApi> {
        &self.docker
    }

    /// Forward one call. When `streaming` is set the reply body is left
    /// attached to the daemon, otherwise it is read in full.
    ///
    /// Errors are [`crate::error::AgentError::DaemonUnavailable`].
    pub async fn dispatch(
        &self,
        method: Method,
        path: &str,
        mut headers: HeaderMap,
        body: Body,
        streaming: bool,
    ) -> Result<ProxyReply> {
        strip_hop_by_hop(&mut headers);
        debug!(%method, path, streaming, "forwarding to docker");

        let response = self.docker.request_raw(method, path, headers, body).await?;
        let body = if streaming {
            ProxyBody::Streaming(response.body)
        } else {
            ProxyBody::Buffered(relay::read_full(response.body).await?)
        };

        Ok(ProxyReply {
            status: response.status,
            headers: response.headers,
            body,
        })
    }
}
