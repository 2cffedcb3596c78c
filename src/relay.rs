//! Stream relay.
//!
//! Decides which Docker API calls produce unbounded bodies (logs with follow,
//! attach, exec start, events, builds, image pulls/pushes) and pumps those
//! bodies to a [`ChunkWriter`] in bounded chunks as they arrive.

use std::io;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::Method;
use futures::TryStreamExt;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::error::{AgentError, Result};
use crate::protocol::Message;

/// Largest chunk read from the daemon and forwarded in one write.
pub const CHUNK_SIZE: usize = 4096;

/// Whether a call's reply body may be unbounded and must be relayed
/// incrementally. Any query string is ignored.
pub fn is_streaming_request(method: &Method, path: &str) -> bool {
    let path = path.split_once('?').map_or(path, |(p, _)| p);

    (path.contains("/logs") && method == Method::GET)
        || path.contains("/attach")
        || (path.contains("/exec/") && path.contains("/start"))
        || path.ends_with("/events")
        || (path.contains("/build") && method == Method::POST)
        || ((path.contains("/images/create") || path.contains("/images/push"))
            && method == Method::POST)
}

/// The destination of a relayed body went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed;

/// Sink for relayed chunks. Each accepted chunk is handed on immediately.
#[async_trait]
pub trait ChunkWriter: Send + Sync {
    async fn write_chunk(&mut self, chunk: Bytes) -> std::result::Result<(), Closed>;

    /// Resolves once the destination is gone. Lets a pump stop while the
    /// daemon is silent instead of waiting for the next chunk.
    async fn closed(&self) {
        std::future::pending::<()>().await;
    }
}

/// How a [`pump`] finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Daemon closed the body cleanly.
    Eof { bytes: u64 },
    /// Reading from the daemon failed; everything before the failure was delivered.
    ReadError { bytes: u64, error: String },
    /// The writer stopped accepting chunks.
    Closed { bytes: u64 },
}

/// Copy `body` into `writer` in chunks of at most [`CHUNK_SIZE`] bytes.
///
/// The daemon body is dropped on return, whatever the outcome.
pub async fn pump<W: ChunkWriter + ?Sized>(body: Body, writer: &mut W) -> PumpOutcome {
    let stream = body.into_data_stream().map_err(io::Error::other);
    let mut reader = std::pin::pin!(StreamReader::new(stream));
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut bytes = 0u64;

    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            () = writer.closed() => {
                debug!(bytes, "relay destination closed while idle");
                return PumpOutcome::Closed { bytes };
            }
        };
        match read {
            Ok(0) => return PumpOutcome::Eof { bytes },
            Ok(n) => {
                if writer
                    .write_chunk(Bytes::copy_from_slice(&buf[..n]))
                    .await
                    .is_err()
                {
                    debug!(bytes, "relay destination closed");
                    return PumpOutcome::Closed { bytes };
                }
                bytes += n as u64;
            }
            Err(e) => {
                warn!(bytes, "relay read failed: {e}");
                return PumpOutcome::ReadError {
                    bytes,
                    error: e.to_string(),
                };
            }
        }
    }
}

/// Read a bounded daemon body in full.
pub async fn read_full(body: Body) -> Result<Bytes> {
    axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| AgentError::DaemonUnavailable(format!("reading response body: {e}")))
}

/// Writer feeding an HTTP response body (standard mode).
pub struct BodyWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

/// Create a response body fed by the returned writer.
///
/// The body ends when the writer is dropped. Dropping the body (client gone)
/// makes the writer report [`Closed`].
pub fn body_channel() -> (BodyWriter, Body) {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(16);
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    (BodyWriter { tx }, Body::from_stream(stream))
}

#[async_trait]
impl ChunkWriter for BodyWriter {
    async fn write_chunk(&mut self, chunk: Bytes) -> std::result::Result<(), Closed> {
        self.tx.send(Ok(chunk)).await.map_err(|_| Closed)
    }

    async fn closed(&self) {
        self.tx.closed().await;
    }
}

/// Writer emitting `stream` tunnel messages for one request (edge mode).
pub struct MessageWriter {
    request_id: String,
    tx: mpsc::Sender<Message>,
}

impl MessageWriter {
    pub fn new(request_id: impl Into<String>, tx: mpsc::Sender<Message>) -> Self {
        Self {
            request_id: request_id.into(),
            tx,
        }
    }
}

#[async_trait]
impl ChunkWriter for MessageWriter {
    async fn write_chunk(&mut self, chunk: Bytes) -> std::result::Result<(), Closed> {
        self.tx
            .send(Message::stream(&self.request_id, chunk.to_vec()))
            .await
            .map_err(|_| Closed)
    }

    async fn closed(&self) {
        self.tx.closed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecWriter {
        chunks: Vec<Bytes>,
        accept: usize,
    }

    #[async_trait]
    impl ChunkWriter for VecWriter {
        async fn write_chunk(&mut self, chunk: Bytes) -> std::result::Result<(), Closed> {
            if self.chunks.len() >= self.accept {
                return Err(Closed);
            }
            self.chunks.push(chunk);
            Ok(())
        }
    }

    fn writer(accept: usize) -> VecWriter {
        VecWriter {
            chunks: Vec::new(),
            accept,
        }
    }

    fn body_of(items: Vec<io::Result<Bytes>>) -> Body {
        Body::from_stream(futures::stream::iter(items))
    }

    #[test]
    fn test_classification() {
        assert!(is_streaming_request(&Method::GET, "/containers/abc/logs"));
        assert!(!is_streaming_request(&Method::POST, "/containers/abc/logs"));
        assert!(is_streaming_request(&Method::GET, "/events"));
        assert!(!is_streaming_request(&Method::GET, "/containers/json"));
        assert!(is_streaming_request(&Method::POST, "/images/create"));
        assert!(is_streaming_request(&Method::POST, "/v1.45/images/push"));
        assert!(!is_streaming_request(&Method::POST, "/images/nginx/tag"));
        assert!(!is_streaming_request(&Method::GET, "/images/create"));
        assert!(is_streaming_request(&Method::POST, "/containers/abc/attach"));
        assert!(is_streaming_request(&Method::POST, "/exec/123/start"));
        assert!(!is_streaming_request(&Method::POST, "/exec/123/resize"));
        assert!(is_streaming_request(&Method::POST, "/build"));
        assert!(!is_streaming_request(&Method::GET, "/build/prune"));
    }

    #[test]
    fn test_classification_ignores_query() {
        assert!(is_streaming_request(
            &Method::GET,
            "/events?since=1700000000&filters=%7B%7D"
        ));
        assert!(is_streaming_request(
            &Method::GET,
            "/containers/abc/logs?follow=1&stdout=1"
        ));
        assert!(!is_streaming_request(&Method::GET, "/containers/json?q=/events"));
    }

    #[tokio::test]
    async fn test_pump_splits_into_bounded_chunks() {
        let payload = vec![7u8; CHUNK_SIZE * 2 + 100];
        let mut w = writer(usize::MAX);
        let outcome = pump(Body::from(payload.clone()), &mut w).await;

        assert_eq!(
            outcome,
            PumpOutcome::Eof {
                bytes: payload.len() as u64
            }
        );
        assert!(w.chunks.iter().all(|c| c.len() <= CHUNK_SIZE));
        let joined: Vec<u8> = w.chunks.iter().flat_map(|c| c.to_vec()).collect();
        assert_eq!(joined, payload);
    }

    #[tokio::test]
    async fn test_pump_keeps_data_before_read_error() {
        let body = body_of(vec![
            Ok(Bytes::from_static(b"line one\n")),
            Ok(Bytes::from_static(b"line two\n")),
            Err(io::Error::other("socket reset")),
        ]);
        let mut w = writer(usize::MAX);
        let outcome = pump(body, &mut w).await;

        match outcome {
            PumpOutcome::ReadError { bytes, error } => {
                assert_eq!(bytes, 18);
                assert!(error.contains("socket reset"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let joined: Vec<u8> = w.chunks.iter().flat_map(|c| c.to_vec()).collect();
        assert_eq!(joined, b"line one\nline two\n");
    }

    #[tokio::test]
    async fn test_pump_stops_when_writer_closes() {
        let body = Body::from_stream(futures::stream::repeat_with(|| {
            Ok::<_, io::Error>(Bytes::from_static(b"tick\n"))
        }));
        let mut w = writer(3);
        let outcome = pump(body, &mut w).await;
        assert!(matches!(outcome, PumpOutcome::Closed { .. }));
        assert_eq!(w.chunks.len(), 3);
    }

    #[tokio::test]
    async fn test_body_channel_delivers_and_ends() {
        let (mut tx, body) = body_channel();
        tokio::spawn(async move {
            tx.write_chunk(Bytes::from_static(b"abc")).await.unwrap();
            tx.write_chunk(Bytes::from_static(b"def")).await.unwrap();
        });
        let bytes = read_full(body).await.unwrap();
        assert_eq!(&bytes[..], b"abcdef");
    }

    #[tokio::test]
    async fn test_body_channel_reports_dropped_reader() {
        let (mut tx, body) = body_channel();
        drop(body);
        assert_eq!(tx.write_chunk(Bytes::from_static(b"x")).await, Err(Closed));
    }

    #[tokio::test]
    async fn test_pump_stops_on_idle_disconnect() {
        let (mut tx, body) = body_channel();
        let silent = Body::from_stream(futures::stream::pending::<io::Result<Bytes>>());
        let pump_task = tokio::spawn(async move { pump(silent, &mut tx).await });
        drop(body);
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(2), pump_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, PumpOutcome::Closed { bytes: 0 });
    }

    #[tokio::test]
    async fn test_message_writer_tags_request_id() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut w = MessageWriter::new("req-9", tx);
        w.write_chunk(Bytes::from_static(b"hello")).await.unwrap();

        match rx.recv().await.unwrap() {
            Message::Stream(chunk) => {
                assert_eq!(chunk.request_id, "req-9");
                assert_eq!(chunk.data, b"hello");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
