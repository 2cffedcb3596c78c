//! Edge mode: outbound tunnel to the control plane.
//!
//! The agent dials out, authenticates with `hello`, and then serves Docker API
//! calls that arrive as `request` messages over the same WebSocket.
//!
//! ```text
//! Disconnected -> Connecting -> Handshaking -> Active
//!       ^                                        |
//!       +---------- backoff <--------------------+
//! ```

pub mod backoff;
pub mod client;
pub mod pending;

pub use client::TunnelClient;

/// Where the tunnel session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Opening the WebSocket.
    Connecting,
    /// `hello` sent, waiting for `welcome`.
    Handshaking,
    /// Serving requests.
    Active,
}
