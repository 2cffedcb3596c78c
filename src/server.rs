//! Standard mode: the inbound HTTP(S) listener.
//!
//! Connections are served by hyper directly so plain TCP and TLS share one
//! accept loop, and so shutdown can be graceful per connection: on
//! cancellation the listener closes, idle keep-alive connections are told to
//! finish, and whatever is still running after the grace period is aborted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::docker::DockerApi;
use crate::error::{AgentError, Result};
use crate::routes;
use crate::state::AppState;
use crate::tls;

/// Bind the configured port and serve until `shutdown` is cancelled.
///
/// `port` overrides the configured port (`hawser standard --port`).
pub async fn run(
    config: Arc<Config>,
    docker: Arc<dyn DockerApi>,
    port: Option<u16>,
    shutdown: CancellationToken,
) -> Result<()> {
    let port = port.unwrap_or(config.server.port);
    let acceptor = match (&config.server.tls_cert, &config.server.tls_key) {
        (Some(cert), Some(key)) => Some(tls::load_acceptor(cert, key)?),
        _ => None,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| AgentError::Transport(format!("binding {addr}: {e}")))?;

    info!(
        "Standard mode listening on {addr} ({})",
        if acceptor.is_some() { "https" } else { "http" }
    );
    if config.token().is_none() {
        warn!("No TOKEN configured, the Docker API is exposed without authentication");
    }

    let grace = config.shutdown_grace();
    let app = routes::router(AppState::new(config, docker));
    serve(listener, app, acceptor, shutdown, grace).await;
    Ok(())
}

/// Accept loop. Returns once every connection has finished or been aborted.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    acceptor: Option<TlsAcceptor>,
    shutdown: CancellationToken,
    grace: Duration,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                let app = app.clone();
                let acceptor = acceptor.clone();
                let shutdown = shutdown.clone();
                connections.spawn(async move {
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => serve_connection(tls_stream, app, shutdown).await,
                            Err(e) => debug!(%peer, "TLS handshake failed: {e}"),
                        },
                        None => serve_connection(stream, app, shutdown).await,
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    info!(active = connections.len(), "listener closed, draining connections");

    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = connections.len(),
            "grace period elapsed, closing remaining connections"
        );
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
}

async fn serve_connection<S>(stream: S, app: Router, shutdown: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
        app.clone().call(request)
    });
    let conn = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    let mut conn = std::pin::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        () = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(err) = result {
        let msg = err.to_string().to_lowercase();
        if !msg.contains("shutting down")
            && !msg.contains("connection reset")
            && !msg.contains("broken pipe")
        {
            error!("Error serving connection: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::mock::{endless, MockDocker};
    use crate::docker::DockerClient;
    use axum::body::Body;
    use axum::http::{HeaderMap, Method, StatusCode};
    use futures::FutureExt;

    async fn start(
        docker: MockDocker,
        grace: Duration,
    ) -> (SocketAddr, CancellationToken, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut config = Config::default();
        config.agent.id = "agent-1".into();
        let app = routes::router(AppState::new(Arc::new(config), Arc::new(docker)));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(serve(listener, app, None, shutdown.clone(), grace));
        (addr, shutdown, handle)
    }

    fn client(addr: SocketAddr) -> DockerClient {
        DockerClient::new(&format!("tcp://{addr}"), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_serves_over_tcp() {
        let (addr, shutdown, handle) = start(MockDocker::ok("OK"), Duration::from_secs(1)).await;

        let response = client(addr)
            .request_raw(Method::GET, "/_hawser/health", HeaderMap::new(), Body::empty())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_grace_period_bounds_shutdown() {
        let docker = MockDocker::new(|_, _| async { Some(endless()) }.boxed());
        let (addr, shutdown, handle) = start(docker, Duration::from_millis(200)).await;

        let response = client(addr)
            .request_raw(Method::GET, "/events", HeaderMap::new(), Body::empty())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);

        let started = std::time::Instant::now();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        drop(response);
    }

    #[tokio::test]
    async fn test_stops_accepting_after_shutdown() {
        let (addr, shutdown, handle) = start(MockDocker::ok("OK"), Duration::from_secs(1)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let err = client(addr)
            .request_raw(Method::GET, "/_hawser/health", HeaderMap::new(), Body::empty())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::DaemonUnavailable(_)));
    }
}
