//! Docker daemon access.
//!
//! Everything above this module talks to the daemon through [`DockerApi`],
//! a narrow seam: a raw request/response call plus version and
//! ping checks. [`DockerClient`] implements it over the local socket.

pub mod client;

pub use client::DockerClient;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode};
use serde::Deserialize;

use crate::error::Result;

/// Subset of `GET /version` the agent cares about.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DockerVersion {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "ApiVersion")]
    pub api_version: String,
}

/// A daemon reply whose body has not been read yet.
///
/// Dropping it releases the underlying connection.
pub struct DaemonResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

/// Calls the agent makes against the Docker daemon.
///
/// Implementations must be usable concurrently from many tasks.
#[async_trait]
pub trait DockerApi: Send + Sync {
    /// Forward one HTTP call verbatim. `path` may carry a query string.
    async fn request_raw(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Body,
    ) -> Result<DaemonResponse>;

    async fn version(&self) -> Result<DockerVersion>;

    /// `GET /_ping`; `Ok` only when the daemon answers with a success status.
    async fn ping(&self) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory daemon used by tests across the crate.

    use std::sync::Mutex;

    use axum::body::Bytes;
    use futures::future::BoxFuture;
    use futures::FutureExt;

    use super::{async_trait, Body, DaemonResponse, DockerApi, DockerVersion, HeaderMap, Method};
    use crate::error::{AgentError, Result};

    type Handler =
        Box<dyn Fn(Method, String) -> BoxFuture<'static, Option<DaemonResponse>> + Send + Sync>;

    /// A call observed by [`MockDocker`].
    #[derive(Debug, Clone)]
    pub struct SeenCall {
        pub method: Method,
        pub path: String,
        pub headers: HeaderMap,
        pub body: Bytes,
    }

    pub struct MockDocker {
        handler: Handler,
        pub calls: Mutex<Vec<SeenCall>>,
    }

    impl MockDocker {
        /// `handler` returning `None` simulates an unreachable daemon.
        pub fn new<F>(handler: F) -> Self
        where
            F: Fn(Method, String) -> BoxFuture<'static, Option<DaemonResponse>>
                + Send
                + Sync
                + 'static,
        {
            Self {
                handler: Box::new(handler),
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Always answers 200 with `body`.
        pub fn ok(body: &'static str) -> Self {
            Self::new(move |_, _| async move { Some(reply(200, body)) }.boxed())
        }

        pub fn unreachable() -> Self {
            Self::new(|_, _| async { None }.boxed())
        }

        pub fn calls(&self) -> Vec<SeenCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    /// A buffered reply.
    pub fn reply(status: u16, body: &'static str) -> DaemonResponse {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("api-version", "1.45".parse().unwrap());
        DaemonResponse {
            status: axum::http::StatusCode::from_u16(status).unwrap(),
            headers,
            body: Body::from(body),
        }
    }

    /// A reply whose body yields `chunks` then ends, or errors if `fail` is set.
    pub fn streamed(chunks: Vec<&'static [u8]>, fail: bool) -> DaemonResponse {
        let mut items: Vec<std::io::Result<Bytes>> =
            chunks.into_iter().map(|c| Ok(Bytes::from_static(c))).collect();
        if fail {
            items.push(Err(std::io::Error::other("daemon went away")));
        }
        DaemonResponse {
            status: axum::http::StatusCode::OK,
            headers: HeaderMap::new(),
            body: Body::from_stream(futures::stream::iter(items)),
        }
    }

    /// A reply whose body never produces data and never ends.
    pub fn endless() -> DaemonResponse {
        DaemonResponse {
            status: axum::http::StatusCode::OK,
            headers: HeaderMap::new(),
            body: Body::from_stream(futures::stream::pending::<std::io::Result<Bytes>>()),
        }
    }

    #[async_trait]
    impl DockerApi for MockDocker {
        async fn request_raw(
            &self,
            method: Method,
            path: &str,
            headers: HeaderMap,
            body: Body,
        ) -> Result<DaemonResponse> {
            let body = axum::body::to_bytes(body, usize::MAX)
                .await
                .unwrap_or_default();
            self.calls.lock().unwrap().push(SeenCall {
                method: method.clone(),
                path: path.to_string(),
                headers,
                body,
            });
            (self.handler)(method, path.to_string())
                .await
                .ok_or_else(|| AgentError::DaemonUnavailable("connection refused".into()))
        }

        async fn version(&self) -> Result<DockerVersion> {
            self.ping().await?;
            Ok(DockerVersion {
                version: "27.1.1".into(),
                api_version: "1.46".into(),
            })
        }

        async fn ping(&self) -> Result<()> {
            match (self.handler)(Method::GET, "/_ping".into()).await {
                Some(_) => Ok(()),
                None => Err(AgentError::DaemonUnavailable("connection refused".into())),
            }
        }
    }
}
