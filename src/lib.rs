#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! hawser library: the building blocks of the Docker agent.
//!
//! - `docker`: daemon access over the local socket
//! - `proxy` / `relay`: forwarding one call and relaying streamed bodies
//! - `server` / `routes` / `auth` / `tls`: standard mode listener
//! - `tunnel` / `protocol`: edge mode client and its wire format
//! - `config`: TOML + env-var configuration
//! - `metrics`: host statistics for the control plane

pub mod auth;
pub mod config;
pub mod docker;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod proxy;
pub mod relay;
pub mod routes;
pub mod server;
pub mod state;
pub mod tls;
pub mod tunnel;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use docker::{DockerApi, DockerClient};
pub use error::{AgentError, Result};
pub use state::AppState;
pub use tunnel::TunnelClient;
