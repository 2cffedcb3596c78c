//! Tunnel client: outbound WebSocket session to the control plane.
//!
//! One session at a time. Each session connects, introduces the agent with
//! `hello`, waits for `welcome`, then serves `request` messages until the
//! connection drops, after which it reconnects with backoff. All in-flight
//! requests are failed locally when a session ends.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::pending::{Completion, PendingRequests};
use super::SessionState;
use crate::config::Config;
use crate::docker::DockerApi;
use crate::error::{AgentError, Result};
use crate::metrics::MetricsCollector;
use crate::protocol::{
    Capability, Heartbeat, Message, Metrics, Payload, ProtocolError, Request, Response,
};
use crate::proxy::{ProxyBody, ProxyCore, ProxyReply};
use crate::relay::{self, MessageWriter, PumpOutcome};
use crate::state::TunnelStats;
use crate::util;

/// Capacity of the writer's control lane (ping, pong, metrics, errors).
const CONTROL_LANE: usize = 64;
/// Capacity of the writer's data lane (responses and stream chunks).
const DATA_LANE: usize = 256;
/// How long a closing session waits for the writer to flush a close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Why an active session ended without a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisconnectReason {
    /// Local shutdown requested.
    Shutdown,
    /// Peer sent a close frame or the stream ended.
    RemoteClosed,
    /// A ping went unanswered for a full heartbeat interval.
    PongTimeout,
}

/// Edge-mode client. Cheap handles to its state are available before
/// [`TunnelClient::run`] consumes it.
pub struct TunnelClient {
    config: Arc<Config>,
    proxy: ProxyCore,
    stats: Arc<TunnelStats>,
    pending: Arc<PendingRequests>,
    state_tx: watch::Sender<SessionState>,
}

impl TunnelClient {
    pub fn new(config: Arc<Config>, docker: Arc<dyn DockerApi>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            config,
            proxy: ProxyCore::new(docker),
            stats: Arc::new(TunnelStats::new()),
            pending: Arc::new(PendingRequests::new()),
            state_tx,
        }
    }

    /// Observe session state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> Arc<TunnelStats> {
        Arc::clone(&self.stats)
    }

    pub fn pending(&self) -> Arc<PendingRequests> {
        Arc::clone(&self.pending)
    }

    /// Spawn [`TunnelClient::run`] on the runtime.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(shutdown))
    }

    /// Connect and reconnect until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let edge = &self.config.edge;
        let url = edge
            .url
            .clone()
            .ok_or_else(|| AgentError::Config("edge mode requires DOCKHAND_SERVER_URL".into()))?;
        let mut backoff = Backoff::new(
            edge.reconnect_delay(),
            edge.reconnect_max_delay(),
            edge.stable_duration(),
        );

        loop {
            let mut active_since = None;
            let result = self.connect_and_run(&url, &shutdown, &mut active_since).await;
            let active_for = active_since.map(|t: Instant| t.elapsed());

            self.stats.connected.store(false, Ordering::Relaxed);
            self.fail_pending().await;
            self.state_tx.send_replace(SessionState::Disconnected);

            match result {
                Ok(DisconnectReason::Shutdown) => break,
                Ok(reason) => info!(?reason, "Tunnel: session ended"),
                Err(e) => warn!("Tunnel: {e}"),
            }
            debug!(
                sent = self.stats.messages_sent.load(Ordering::Relaxed),
                received = self.stats.messages_received.load(Ordering::Relaxed),
                "Tunnel: message totals"
            );
            if let Some((median, p95)) = self.stats.rtt_stats().await {
                debug!(rtt_median_ms = median, rtt_p95_ms = p95, "Tunnel: link quality");
            }

            backoff.session_ended(active_for);
            let delay = backoff.next_delay();
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            info!("Tunnel: reconnecting in {}s", delay.as_secs_f64());

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown.cancelled() => break,
            }
        }

        info!("Tunnel: stopped");
        Ok(())
    }

    /// One connection: connect, handshake, serve until disconnect.
    async fn connect_and_run(
        &self,
        url: &str,
        shutdown: &CancellationToken,
        active_since: &mut Option<Instant>,
    ) -> Result<DisconnectReason> {
        let edge = &self.config.edge;
        self.state_tx.send_replace(SessionState::Connecting);

        let docker_version = match self.proxy.docker().version().await {
            Ok(v) => v.version,
            Err(e) => {
                warn!("Tunnel: Docker version unavailable: {e}");
                "unknown".to_string()
            }
        };

        info!("Tunnel: connecting to {url}");
        let connect = tokio::time::timeout(
            edge.handshake_timeout(),
            tokio_tungstenite::connect_async(url),
        );
        let (ws, _response) = tokio::select! {
            () = shutdown.cancelled() => return Ok(DisconnectReason::Shutdown),
            connected = connect => connected
                .map_err(|_| AgentError::Transport("connect timed out".into()))??,
        };
        let (mut sink, mut stream) = ws.split();

        self.state_tx.send_replace(SessionState::Handshaking);
        let hello = Message::hello(
            &self.config.agent.id,
            &self.config.agent.name,
            self.config.token().unwrap_or_default(),
            &docker_version,
            &util::hostname(),
            edge.capabilities.clone(),
        );
        sink.send(WsMessage::Text(hello.encode()?.into())).await?;

        let welcome = tokio::select! {
            () = shutdown.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return Ok(DisconnectReason::Shutdown);
            }
            welcome = tokio::time::timeout(edge.handshake_timeout(), await_welcome(&mut stream)) => welcome
                .map_err(|_| AgentError::Transport("no welcome before handshake timeout".into()))??,
        };
        info!(
            environment_id = welcome.environment_id,
            "Tunnel: connected{}",
            welcome.message.map(|m| format!(" ({m})")).unwrap_or_default()
        );

        *active_since = Some(Instant::now());
        self.stats.connected.store(true, Ordering::Relaxed);
        self.state_tx.send_replace(SessionState::Active);

        let (control_tx, control_rx) = mpsc::channel(CONTROL_LANE);
        let (data_tx, data_rx) = mpsc::channel(DATA_LANE);
        let stop_writer = CancellationToken::new();
        let mut writer = tokio::spawn(write_loop(
            sink,
            control_rx,
            data_rx,
            stop_writer.clone(),
            Arc::clone(&self.stats),
        ));

        let session = ActiveSession {
            proxy: &self.proxy,
            pending: &self.pending,
            stats: &self.stats,
            control_tx,
            data_tx,
            awaiting_pong: None,
        };
        let result = session.serve(&mut stream, &mut writer, shutdown, edge).await;

        // Abort handlers first so nothing queues behind the close frame.
        self.fail_pending().await;
        stop_writer.cancel();
        if !writer.is_finished()
            && tokio::time::timeout(CLOSE_TIMEOUT, &mut writer)
                .await
                .is_err()
        {
            writer.abort();
        }
        result
    }

    /// Abort every in-flight handler; the control plane sees no reply for them.
    async fn fail_pending(&self) {
        let failed = self.pending.fail_all().await;
        if failed > 0 {
            warn!(failed, "Tunnel: failed in-flight requests after disconnect");
            self.stats
                .requests_failed_on_disconnect
                .fetch_add(failed as u64, Ordering::Relaxed);
        }
    }
}

/// Read frames until `welcome`. Anything else ends the handshake.
async fn await_welcome<S>(stream: &mut S) -> Result<crate::protocol::Welcome>
where
    S: futures_util::Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame? {
            WsMessage::Text(text) => {
                return match Message::decode(&text)? {
                    Message::Welcome(welcome) => Ok(welcome),
                    Message::Error(e) => Err(AgentError::Rejected(e.error)),
                    _ => Err(ProtocolError::Unexpected("expected welcome").into()),
                };
            }
            WsMessage::Close(frame) => {
                let reason = frame.map(|f| f.reason.as_str().to_string()).unwrap_or_default();
                return Err(AgentError::Rejected(if reason.is_empty() {
                    "connection closed during handshake".into()
                } else {
                    reason
                }));
            }
            _ => {}
        }
    }
    Err(AgentError::Transport("connection closed during handshake".into()))
}

/// Writer task. Control traffic always goes out before queued data.
async fn write_loop<S>(
    mut sink: S,
    mut control_rx: mpsc::Receiver<Message>,
    mut data_rx: mpsc::Receiver<Message>,
    stop: CancellationToken,
    stats: Arc<TunnelStats>,
) where
    S: Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    loop {
        let msg = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            Some(msg) = control_rx.recv() => msg,
            Some(msg) = data_rx.recv() => msg,
            else => break,
        };
        let text = match msg.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("Tunnel: dropping unencodable {:?}: {e}", msg.message_type());
                continue;
            }
        };
        if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
            debug!("Tunnel: write failed: {e}");
            return;
        }
        stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        if msg.is_terminal() {
            debug!(
                request_id = msg.request_id().unwrap_or_default(),
                kind = msg.message_type().as_str(),
                "Tunnel: request finished"
            );
        }
    }
    let _ = sink.send(WsMessage::Close(None)).await;
    let _ = sink.close().await;
}

/// Per-connection state while Active.
struct ActiveSession<'a> {
    proxy: &'a ProxyCore,
    pending: &'a Arc<PendingRequests>,
    stats: &'a Arc<TunnelStats>,
    control_tx: mpsc::Sender<Message>,
    data_tx: mpsc::Sender<Message>,
    /// Send time of the unanswered ping, if any.
    awaiting_pong: Option<Instant>,
}

impl ActiveSession<'_> {
    async fn serve<S>(
        mut self,
        stream: &mut S,
        writer: &mut JoinHandle<()>,
        shutdown: &CancellationToken,
        edge: &crate::config::EdgeConfig,
    ) -> Result<DisconnectReason>
    where
        S: futures_util::Stream<
                Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>,
            > + Unpin,
    {
        let period = edge.heartbeat_interval();
        let mut heartbeat = ticker(period);

        let send_metrics = edge.capabilities.contains(&Capability::Metrics);
        let mut metrics_tick = ticker(edge.metrics_interval());
        let mut collector = MetricsCollector::new();
        if send_metrics {
            self.send_control(Message::Metrics(Metrics {
                timestamp: util::unix_millis(),
                metrics: collector.sample(),
            }));
        }

        loop {
            tokio::select! {
                () = shutdown.cancelled() => return Ok(DisconnectReason::Shutdown),
                _ = &mut *writer => {
                    return Err(AgentError::Transport("connection writer stopped".into()));
                }
                _ = heartbeat.tick() => {
                    if self.awaiting_pong.is_some() {
                        warn!("Tunnel: no pong within {}s", period.as_secs());
                        return Ok(DisconnectReason::PongTimeout);
                    }
                    self.awaiting_pong = Some(Instant::now());
                    self.send_control(Message::Ping(Heartbeat { timestamp: util::unix_millis() }));
                }
                _ = metrics_tick.tick(), if send_metrics => {
                    self.send_control(Message::Metrics(Metrics {
                        timestamp: util::unix_millis(),
                        metrics: collector.sample(),
                    }));
                }
                frame = stream.next() => {
                    match frame {
                        None => return Ok(DisconnectReason::RemoteClosed),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(WsMessage::Close(_))) => return Ok(DisconnectReason::RemoteClosed),
                        Some(Ok(WsMessage::Text(text))) => {
                            self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                            self.handle_text(&text).await;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    async fn handle_text(&mut self, text: &str) {
        let msg = match Message::decode(text) {
            Ok(msg) => msg,
            Err(ProtocolError::InvalidRequest { request_id, source }) => {
                warn!(request_id = %request_id, "Tunnel: undecodable request: {source}");
                self.reply_scoped(Message::error(
                    Some(&request_id),
                    format!("malformed request: {source}"),
                    "INVALID_MESSAGE",
                ));
                return;
            }
            Err(e) => {
                warn!("Tunnel: undecodable message: {e}");
                self.violation(&e);
                return;
            }
        };

        match msg {
            Message::Request(request) => self.dispatch(request).await,
            Message::Ping(hb) => self.send_control(Message::Pong(hb)),
            Message::Pong(_) => {
                if let Some(sent) = self.awaiting_pong.take() {
                    let rtt = u64::try_from(sent.elapsed().as_millis()).unwrap_or(u64::MAX);
                    self.stats.record_rtt(rtt).await;
                }
            }
            Message::Error(e) => match e.request_id {
                None => warn!(code = ?e.code, "Tunnel: control plane error: {}", e.error),
                Some(id) => debug!(request_id = %id, "Tunnel: control plane error: {}", e.error),
            },
            Message::Stream(chunk) => {
                debug!(request_id = %chunk.request_id, "Tunnel: ignoring inbound stream data");
            }
            other => {
                let e = ProtocolError::Unexpected(other.message_type().as_str());
                warn!("Tunnel: {e}");
                self.violation(&e);
            }
        }
    }

    /// Start a handler task for `request`, or reject it at connection level.
    async fn dispatch(&mut self, request: Request) {
        if request.request_id.is_empty() {
            self.violation(&ProtocolError::MissingRequestId);
            return;
        }
        let Ok(method) = Method::from_bytes(request.method.as_bytes()) else {
            self.reply_scoped(Message::error(
                Some(&request.request_id),
                format!("invalid method {:?}", request.method),
                "INVALID_MESSAGE",
            ));
            return;
        };

        let request_id = request.request_id.clone();
        debug!(request_id = %request_id, %method, path = %request.path, "Tunnel: request");
        let proxy = self.proxy.clone();
        let data_tx = self.data_tx.clone();
        let work = move |done: Completion| handle_request(proxy, method, request, data_tx, done);
        if let Err(e) = self.pending.spawn(request_id, work).await {
            warn!("Tunnel: {e}");
            self.violation(&e);
        }
    }

    /// Reply to a protocol violation with a connection-level error.
    fn violation(&self, e: &ProtocolError) {
        self.send_control(Message::error(None, e.to_string(), e.code()));
    }

    /// Queue a scoped error on the data lane without holding up the reader.
    fn reply_scoped(&self, msg: Message) {
        let data_tx = self.data_tx.clone();
        tokio::spawn(async move {
            let _ = data_tx.send(msg).await;
        });
    }

    fn send_control(&self, msg: Message) {
        if self.control_tx.try_send(msg).is_err() {
            debug!("Tunnel: control lane full, dropping message");
        }
    }
}

/// Periodic timer whose first tick is one `period` away. A stalled runtime
/// delays later ticks instead of firing them back to back.
fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Serve one tunnelled call and queue its terminal message. The id is
/// released first so the peer can reuse it once it sees the reply.
async fn handle_request(
    proxy: ProxyCore,
    method: Method,
    request: Request,
    data_tx: mpsc::Sender<Message>,
    done: Completion,
) {
    let id = request.request_id;
    let streaming = request.streaming || relay::is_streaming_request(&method, &request.path);
    let body = request
        .body
        .map_or_else(Body::empty, |p| Body::from(p.as_bytes().to_vec()));

    let terminal = match proxy
        .dispatch(method, &request.path, header_map(&request.headers), body, streaming)
        .await
    {
        Err(e) => Message::error(Some(&id), e.to_string(), e.code()),
        Ok(reply) if streaming => {
            if reply.status.as_u16() >= 400 {
                let status = reply.status;
                let detail = reply_bytes(reply)
                    .await
                    .map(|b| daemon_message(&b))
                    .unwrap_or_default();
                Message::error(
                    Some(&id),
                    format!("Docker returned {status}: {detail}"),
                    "DOCKER_ERROR",
                )
            } else {
                let daemon = match reply.body {
                    ProxyBody::Streaming(body) => body,
                    ProxyBody::Buffered(bytes) => Body::from(bytes),
                };
                let mut writer = MessageWriter::new(id.clone(), data_tx.clone());
                match relay::pump(daemon, &mut writer).await {
                    PumpOutcome::Eof { .. } => Message::stream_end(&id, None),
                    PumpOutcome::ReadError { error, .. } => Message::stream_end(&id, Some(error)),
                    PumpOutcome::Closed { .. } => return,
                }
            }
        }
        Ok(reply) => {
            let status_code = reply.status.as_u16();
            let headers = joined_headers(&reply.headers);
            match reply_bytes(reply).await {
                Ok(bytes) => match payload(&bytes) {
                    Ok(body) => Message::Response(Response {
                        request_id: id.clone(),
                        status_code,
                        headers,
                        body,
                    }),
                    Err(e) => Message::error(Some(&id), e.to_string(), e.code()),
                },
                Err(e) => Message::error(Some(&id), e.to_string(), e.code()),
            }
        }
    };

    done.finish().await;
    if data_tx.send(terminal).await.is_err() {
        debug!(request_id = %id, "Tunnel: connection gone before reply");
    }
}

async fn reply_bytes(reply: ProxyReply) -> Result<axum::body::Bytes> {
    match reply.body {
        ProxyBody::Buffered(bytes) => Ok(bytes),
        ProxyBody::Streaming(body) => relay::read_full(body).await,
    }
}

fn payload(bytes: &[u8]) -> std::result::Result<Option<Payload>, ProtocolError> {
    if bytes.is_empty() {
        Ok(None)
    } else {
        Payload::from_bytes(bytes).map(Some)
    }
}

/// `message` field of a Docker error body, else the body text.
fn daemon_message(bytes: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(bytes)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(bytes).trim().to_string())
}

/// Tunnel headers to a `HeaderMap`, skipping names or values that are not valid HTTP.
fn header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => debug!(header = %name, "Tunnel: skipping invalid header"),
        }
    }
    map
}

/// Flatten a `HeaderMap`, joining repeated headers with `", "`.
fn joined_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for name in headers.keys() {
        let values: Vec<&str> = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if !values.is_empty() {
            out.insert(name.as_str().to_string(), values.join(", "));
        }
    }
    out
}
