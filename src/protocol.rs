//! Tunnel wire protocol.
//!
//! Every message is a single JSON object carried in one WebSocket text frame
//! and discriminated by its `type` field. Field names are camelCase and
//! optional fields are omitted when empty so the encoding stays compatible
//! with the control plane.
//!
//! ```text
//! agent                         control plane
//!   | -- hello ------------------> |
//!   | <------------------ welcome --|
//!   | <------------------ request --|   (many, concurrently)
//!   | -- response | stream* stream_end | error -> |
//!   | -- ping / metrics ---------> |
//!   | <--------------------- pong --|
//! ```
//!
//! Request and response bodies are embedded raw JSON and never re-parsed;
//! stream chunks are base64.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;
use thiserror::Error;

/// Protocol version advertised in `hello`.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Closed set of message discriminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Hello,
    Welcome,
    Request,
    Response,
    Stream,
    StreamEnd,
    Metrics,
    Ping,
    Pong,
    Error,
}

impl MessageType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::Welcome => "welcome",
            Self::Request => "request",
            Self::Response => "response",
            Self::Stream => "stream",
            Self::StreamEnd => "stream_end",
            Self::Metrics => "metrics",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error => "error",
        }
    }

    /// Parse a wire discriminator. Returns `None` for anything outside the set.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "hello" => Self::Hello,
            "welcome" => Self::Welcome,
            "request" => Self::Request,
            "response" => Self::Response,
            "stream" => Self::Stream,
            "stream_end" => Self::StreamEnd,
            "metrics" => Self::Metrics,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "error" => Self::Error,
            _ => return None,
        })
    }
}

/// Optional agent features advertised in `hello`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Docker Compose support.
    Compose,
    /// Interactive exec support.
    Exec,
    /// Host metrics collection.
    Metrics,
}

/// Errors raised while decoding or validating tunnel messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message has no type")]
    MissingType,
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("request is missing requestId")]
    MissingRequestId,
    #[error("requestId {0} is already in flight")]
    DuplicateRequestId(String),
    #[error("unexpected {0} message")]
    Unexpected(&'static str),
    /// A `request` whose id was readable but whose other fields were not.
    #[error("malformed request {request_id}: {source}")]
    InvalidRequest {
        request_id: String,
        source: serde_json::Error,
    },
}

impl ProtocolError {
    /// Code sent back in a connection-level `error` message.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) | Self::MissingType | Self::InvalidRequest { .. } => {
                "INVALID_MESSAGE"
            }
            Self::UnknownType(_) => "UNKNOWN_MESSAGE",
            Self::MissingRequestId => "MISSING_REQUEST_ID",
            Self::DuplicateRequestId(_) => "DUPLICATE_REQUEST_ID",
            Self::Unexpected(_) => "UNEXPECTED_MESSAGE",
        }
    }
}

/// An opaque body, kept as the exact JSON text it arrived as.
#[derive(Debug, Clone)]
pub struct Payload(Box<RawValue>);

impl Payload {
    /// Wrap raw bytes for the wire.
    ///
    /// Valid JSON is embedded verbatim; anything else becomes a JSON string
    /// (lossy UTF-8).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if let Ok(text) = std::str::from_utf8(bytes) {
            if let Ok(raw) = RawValue::from_string(text.to_string()) {
                return Ok(Self(raw));
            }
        }
        let text = String::from_utf8_lossy(bytes);
        Ok(Self(serde_json::value::to_raw_value(&text)?))
    }

    /// The JSON text of this payload.
    #[must_use]
    pub fn get(&self) -> &str {
        self.0.get()
    }

    /// The JSON text as bytes, ready to forward to the daemon.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.get().as_bytes()
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Box::<RawValue>::deserialize(deserializer).map(Self)
    }
}

/// `hello`: agent identity, sent once per connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub version: String,
    pub agent_id: String,
    pub agent_name: String,
    pub token: String,
    pub docker_version: String,
    pub hostname: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

/// `welcome`: handshake accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    pub environment_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `request`: one Docker API call issued by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Empty when the peer omitted it; rejected by the session.
    #[serde(default)]
    pub request_id: String,
    pub method: String,
    pub path: String,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Payload>,
    #[serde(default)]
    pub streaming: bool,
}

/// `response`: terminal reply for a non-streaming request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub request_id: String,
    pub status_code: u16,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Payload>,
}

/// `stream`: one chunk of an unbounded reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    pub request_id: String,
    #[serde(default, with = "base64_data")]
    pub data: Vec<u8>,
    /// `stdout`, `stderr`, or absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
}

/// `stream_end`: terminal message for a streaming request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEnd {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `metrics`: periodic host statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub timestamp: i64,
    pub metrics: HostMetrics,
}

/// Host CPU, memory, disk and network counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostMetrics {
    /// Percentage, 0-100.
    pub cpu_usage: f64,
    pub cpu_cores: u32,
    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_free: u64,
    pub disk_total: u64,
    pub disk_used: u64,
    pub disk_free: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

/// `ping` / `pong` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Unix milliseconds.
    pub timestamp: i64,
}

/// `error`: scoped to one request when `request_id` is set, else connection-level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// A decoded tunnel message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello(Hello),
    Welcome(Welcome),
    Request(Request),
    Response(Response),
    Stream(StreamChunk),
    StreamEnd(StreamEnd),
    Metrics(Metrics),
    Ping(Heartbeat),
    Pong(Heartbeat),
    Error(ErrorMessage),
}

/// Only used to peek at the discriminator before picking a concrete type.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(rename = "requestId")]
    request_id: Option<String>,
}

/// `null` headers decode as an empty map.
fn null_as_empty<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, String>, D::Error> {
    Ok(Option::<BTreeMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Serialize)]
struct Tagged<'a, T> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    body: &'a T,
}

fn tagged<T: Serialize>(kind: MessageType, body: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(&Tagged {
        kind: kind.as_str(),
        body,
    })?)
}

impl Message {
    /// Build a `hello` carrying the current protocol version.
    #[must_use]
    pub fn hello(
        agent_id: &str,
        agent_name: &str,
        token: &str,
        docker_version: &str,
        hostname: &str,
        capabilities: Vec<Capability>,
    ) -> Self {
        Self::Hello(Hello {
            version: PROTOCOL_VERSION.to_string(),
            agent_id: agent_id.to_string(),
            agent_name: agent_name.to_string(),
            token: token.to_string(),
            docker_version: docker_version.to_string(),
            hostname: hostname.to_string(),
            capabilities,
        })
    }

    #[must_use]
    pub fn stream(request_id: &str, data: Vec<u8>) -> Self {
        Self::Stream(StreamChunk {
            request_id: request_id.to_string(),
            data,
            stream: None,
        })
    }

    #[must_use]
    pub fn stream_end(request_id: &str, reason: Option<String>) -> Self {
        Self::StreamEnd(StreamEnd {
            request_id: request_id.to_string(),
            reason,
        })
    }

    #[must_use]
    pub fn error(request_id: Option<&str>, error: impl Into<String>, code: &str) -> Self {
        Self::Error(ErrorMessage {
            request_id: request_id.map(ToString::to_string),
            error: error.into(),
            code: Some(code.to_string()),
        })
    }

    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Hello(_) => MessageType::Hello,
            Self::Welcome(_) => MessageType::Welcome,
            Self::Request(_) => MessageType::Request,
            Self::Response(_) => MessageType::Response,
            Self::Stream(_) => MessageType::Stream,
            Self::StreamEnd(_) => MessageType::StreamEnd,
            Self::Metrics(_) => MessageType::Metrics,
            Self::Ping(_) => MessageType::Ping,
            Self::Pong(_) => MessageType::Pong,
            Self::Error(_) => MessageType::Error,
        }
    }

    /// Correlation id, for the variants that carry one.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Request(m) => Some(&m.request_id),
            Self::Response(m) => Some(&m.request_id),
            Self::Stream(m) => Some(&m.request_id),
            Self::StreamEnd(m) => Some(&m.request_id),
            Self::Error(m) => m.request_id.as_deref(),
            _ => None,
        }
    }

    /// Whether this message ends the lifetime of its `request_id`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Response(_) | Self::StreamEnd(_))
            || matches!(self, Self::Error(e) if e.request_id.is_some())
    }

    /// Encode to the JSON text sent in one frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let kind = self.message_type();
        match self {
            Self::Hello(m) => tagged(kind, m),
            Self::Welcome(m) => tagged(kind, m),
            Self::Request(m) => tagged(kind, m),
            Self::Response(m) => tagged(kind, m),
            Self::Stream(m) => tagged(kind, m),
            Self::StreamEnd(m) => tagged(kind, m),
            Self::Metrics(m) => tagged(kind, m),
            Self::Ping(m) | Self::Pong(m) => tagged(kind, m),
            Self::Error(m) => tagged(kind, m),
        }
    }

    /// Decode one frame.
    ///
    /// The discriminator is read first so an unknown `type` is reported as
    /// such rather than as a generic parse failure.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let kind = envelope.kind.ok_or(ProtocolError::MissingType)?;
        let Some(kind) = MessageType::parse(&kind) else {
            return Err(ProtocolError::UnknownType(kind));
        };
        Ok(match kind {
            MessageType::Hello => Self::Hello(serde_json::from_str(text)?),
            MessageType::Welcome => Self::Welcome(serde_json::from_str(text)?),
            MessageType::Request => {
                Self::Request(serde_json::from_str(text).map_err(|source| {
                    match envelope.request_id.filter(|id| !id.is_empty()) {
                        Some(request_id) => ProtocolError::InvalidRequest { request_id, source },
                        None => ProtocolError::Malformed(source),
                    }
                })?)
            }
            MessageType::Response => Self::Response(serde_json::from_str(text)?),
            MessageType::Stream => Self::Stream(serde_json::from_str(text)?),
            MessageType::StreamEnd => Self::StreamEnd(serde_json::from_str(text)?),
            MessageType::Metrics => Self::Metrics(serde_json::from_str(text)?),
            MessageType::Ping => Self::Ping(serde_json::from_str(text)?),
            MessageType::Pong => Self::Pong(serde_json::from_str(text)?),
            MessageType::Error => Self::Error(serde_json::from_str(text)?),
        })
    }
}

/// Base64 (standard alphabet) for stream chunk bytes. `null` decodes as empty.
mod base64_data {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let Some(text) = Option::<String>::deserialize(deserializer)? else {
            return Ok(Vec::new());
        };
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
