//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `AGENT_ID`, `AGENT_NAME`, `DOCKER_SOCKET`,
//!    `PORT`, `TLS_CERT`, `TLS_KEY`, `TOKEN`, `DOCKHAND_SERVER_URL`,
//!    `HEARTBEAT_INTERVAL`, `RECONNECT_DELAY`, `RECONNECT_MAX_DELAY`,
//!    `LOG_LEVEL`
//! 2. **Config file**: path via `--config <path>`, or `hawser.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [agent]
//! id = "6f1c0a52-1d7e-4c1b-9d59-0b7a4f6f2b11"  # random per start when omitted
//! name = "build-box-01"                        # host name when omitted
//!
//! [docker]
//! socket = "/var/run/docker.sock"              # or "tcp://127.0.0.1:2375"
//! connect_timeout_secs = 10
//!
//! [server]
//! port = 2376
//! tls_cert = "/etc/hawser/cert.pem"            # both or neither
//! tls_key = "/etc/hawser/key.pem"
//! shutdown_grace_secs = 10
//!
//! [auth]
//! token = "shared-secret"
//!
//! # Omit `url` to run in standard mode
//! [edge]
//! url = "wss://dockhand.example.com/api/hawser/connect"
//! heartbeat_interval_secs = 30
//! reconnect_delay_secs = 1
//! reconnect_max_delay_secs = 60
//! handshake_timeout_secs = 10
//! stable_secs = 60
//! metrics_interval_secs = 30
//! capabilities = ["compose", "exec", "metrics"]
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AgentError, Result};
use crate::protocol::Capability;

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "hawser.toml";

/// Longest accepted interval or timeout (one day).
pub const MAX_INTERVAL_SECS: u64 = 86_400;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub edge: EdgeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Agent identity reported in `hello` and `/_hawser/info`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    /// Stable agent id. Empty until [`Config::load`] fills in a random UUID.
    #[serde(default)]
    pub id: String,
    /// Human-readable name. Empty until [`Config::load`] fills in the host name.
    #[serde(default)]
    pub name: String,
}

/// How to reach the local Docker daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfig {
    /// Unix socket path, `unix://<path>` or `tcp://<host:port>`.
    #[serde(default = "default_socket")]
    pub socket: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Standard-mode listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// TCP port bound on all interfaces (default 2376).
    #[serde(default = "default_port")]
    pub port: u16,
    /// PEM certificate chain. TLS is on when this and `tls_key` are set.
    pub tls_cert: Option<String>,
    /// PEM private key.
    pub tls_key: Option<String>,
    /// Seconds in-flight connections get to finish after shutdown starts.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

/// Shared token. Optional in standard mode, required in edge mode.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    pub token: Option<String>,
}

/// Edge-mode tunnel settings. Edge mode is selected when `url` is set.
#[derive(Debug, Clone, Deserialize)]
pub struct EdgeConfig {
    /// Control-plane WebSocket URL (`ws://` or `wss://`).
    pub url: Option<String>,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Initial reconnect delay, doubled after each failure.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    /// Time allowed between connecting and receiving `welcome`.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// A session active this long resets the reconnect delay to its base.
    #[serde(default = "default_stable_secs")]
    pub stable_secs: u64,
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive (default `info`). `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_socket() -> String {
    "/var/run/docker.sock".to_string()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_port() -> u16 {
    2376
}
fn default_shutdown_grace() -> u64 {
    10
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_reconnect_delay() -> u64 {
    1
}
fn default_reconnect_max_delay() -> u64 {
    60
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_stable_secs() -> u64 {
    60
}
fn default_metrics_interval() -> u64 {
    30
}
fn default_capabilities() -> Vec<Capability> {
    vec![Capability::Compose, Capability::Exec, Capability::Metrics]
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            tls_cert: None,
            tls_key: None,
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            url: None,
            heartbeat_interval_secs: default_heartbeat_interval(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            handshake_timeout_secs: default_handshake_timeout(),
            stable_secs: default_stable_secs(),
            metrics_interval_secs: default_metrics_interval(),
            capabilities: default_capabilities(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl EdgeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_delay_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn stable_duration(&self) -> Duration {
        Duration::from_secs(self.stable_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `hawser.toml` in the
    /// current directory is used when present. Identity defaults are filled in
    /// and the result is validated.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.fill_identity();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| AgentError::Config(format!("parsing {}: {e}", path.display())))
    }

    /// Overlay environment variables fetched through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("AGENT_ID") {
            self.agent.id = v;
        }
        if let Some(v) = var("AGENT_NAME") {
            self.agent.name = v;
        }
        if let Some(v) = var("DOCKER_SOCKET") {
            self.docker.socket = v;
        }
        if let Some(v) = var("PORT") {
            self.server.port = parse_number("PORT", &v)?;
        }
        if let Some(v) = var("TLS_CERT") {
            self.server.tls_cert = Some(v);
        }
        if let Some(v) = var("TLS_KEY") {
            self.server.tls_key = Some(v);
        }
        if let Some(v) = var("TOKEN") {
            self.auth.token = Some(v);
        }
        if let Some(v) = var("DOCKHAND_SERVER_URL") {
            self.edge.url = Some(v);
        }
        if let Some(v) = var("HEARTBEAT_INTERVAL") {
            self.edge.heartbeat_interval_secs = parse_number("HEARTBEAT_INTERVAL", &v)?;
        }
        if let Some(v) = var("RECONNECT_DELAY") {
            self.edge.reconnect_delay_secs = parse_number("RECONNECT_DELAY", &v)?;
        }
        if let Some(v) = var("RECONNECT_MAX_DELAY") {
            self.edge.reconnect_max_delay_secs = parse_number("RECONNECT_MAX_DELAY", &v)?;
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.logging.level = v;
        }
        Ok(())
    }

    /// Random agent id and host name for whatever identity was not configured.
    pub fn fill_identity(&mut self) {
        if self.agent.id.trim().is_empty() {
            self.agent.id = uuid::Uuid::new_v4().to_string();
        }
        if self.agent.name.trim().is_empty() {
            self.agent.name = crate::util::hostname();
        }
    }

    /// Reject combinations the agent cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            return Err(AgentError::Config(
                "TLS needs both a certificate and a key".into(),
            ));
        }

        if let Some(url) = &self.edge.url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(AgentError::Config(format!(
                    "edge URL must start with ws:// or wss://, got {url}"
                )));
            }
            if self.token().is_none() {
                return Err(AgentError::Config("edge mode requires a token".into()));
            }
        }

        if self.edge.reconnect_delay_secs > self.edge.reconnect_max_delay_secs {
            return Err(AgentError::Config(format!(
                "reconnect delay {}s exceeds maximum {}s",
                self.edge.reconnect_delay_secs, self.edge.reconnect_max_delay_secs
            )));
        }
        if self.edge.heartbeat_interval_secs == 0 {
            return Err(AgentError::Config(
                "heartbeat interval must be at least 1s".into(),
            ));
        }
        if self.edge.metrics_interval_secs == 0 {
            return Err(AgentError::Config(
                "metrics interval must be at least 1s".into(),
            ));
        }
        for (name, secs) in [
            ("heartbeat interval", self.edge.heartbeat_interval_secs),
            ("metrics interval", self.edge.metrics_interval_secs),
            ("reconnect max delay", self.edge.reconnect_max_delay_secs),
            ("handshake timeout", self.edge.handshake_timeout_secs),
            ("stable threshold", self.edge.stable_secs),
        ] {
            if secs > MAX_INTERVAL_SECS {
                return Err(AgentError::Config(format!(
                    "{name} {secs}s exceeds the {MAX_INTERVAL_SECS}s limit"
                )));
            }
        }
        Ok(())
    }

    /// Edge mode is selected by the presence of a control-plane URL.
    pub fn edge_mode(&self) -> bool {
        self.edge.url.is_some()
    }

    /// Configured token, ignoring an empty string.
    pub fn token(&self) -> Option<&str> {
        self.auth.token.as_deref().filter(|t| !t.is_empty())
    }

    pub fn docker_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.docker.connect_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_grace_secs)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| AgentError::Config(format!("{key} must be a number, got {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 2376);
        assert_eq!(config.docker.socket, "/var/run/docker.sock");
        assert_eq!(config.edge.heartbeat_interval_secs, 30);
        assert_eq!(config.edge.reconnect_delay_secs, 1);
        assert_eq!(config.edge.reconnect_max_delay_secs, 60);
        assert_eq!(config.server.shutdown_grace_secs, 10);
        assert_eq!(config.edge.capabilities.len(), 3);
        assert_eq!(config.logging.level, "info");
        assert!(!config.edge_mode());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_sections() {
        let config: Config = toml::from_str(
            r#"
            [agent]
            name = "rack-7"

            [server]
            port = 2375

            [edge]
            url = "wss://dockhand.example.com/api/hawser/connect"
            capabilities = ["compose", "metrics"]

            [auth]
            token = "s3cret"
            "#,
        )
        .unwrap();
        assert_eq!(config.agent.name, "rack-7");
        assert_eq!(config.server.port, 2375);
        assert_eq!(config.edge.heartbeat_interval_secs, 30);
        assert_eq!(
            config.edge.capabilities,
            vec![Capability::Compose, Capability::Metrics]
        );
        assert!(config.edge_mode());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_capability_rejected() {
        let parsed: std::result::Result<Config, _> = toml::from_str(
            r#"
            [edge]
            capabilities = ["compose", "teleport"]
            "#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config: Config = toml::from_str("[server]\nport = 9000\n").unwrap();
        config
            .apply_env(env(&[
                ("PORT", "2377"),
                ("TOKEN", "abc"),
                ("DOCKHAND_SERVER_URL", "ws://127.0.0.1:3000/connect"),
                ("HEARTBEAT_INTERVAL", "5"),
                ("LOG_LEVEL", "debug"),
                ("AGENT_NAME", ""),
            ]))
            .unwrap();
        assert_eq!(config.server.port, 2377);
        assert_eq!(config.token(), Some("abc"));
        assert_eq!(config.edge.heartbeat_interval_secs, 5);
        assert_eq!(config.logging.level, "debug");
        assert!(config.agent.name.is_empty());
        assert!(config.edge_mode());
    }

    #[test]
    fn test_env_bad_number() {
        let mut config = Config::default();
        let err = config.apply_env(env(&[("PORT", "twenty")])).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn test_fill_identity() {
        let mut config = Config::default();
        config.agent.id = "agent-1".into();
        config.fill_identity();
        assert_eq!(config.agent.id, "agent-1");
        assert!(!config.agent.name.is_empty());

        let mut fresh = Config::default();
        fresh.fill_identity();
        assert!(uuid::Uuid::parse_str(&fresh.agent.id).is_ok());
    }

    #[test]
    fn test_validation_failures() {
        let mut half_tls = Config::default();
        half_tls.server.tls_cert = Some("/tmp/cert.pem".into());
        assert!(half_tls.validate().is_err());

        let mut no_token = Config::default();
        no_token.edge.url = Some("wss://dockhand.example.com/connect".into());
        assert!(no_token.validate().is_err());

        let mut bad_scheme = Config::default();
        bad_scheme.edge.url = Some("https://dockhand.example.com/connect".into());
        bad_scheme.auth.token = Some("t".into());
        assert!(bad_scheme.validate().is_err());

        let mut inverted = Config::default();
        inverted.edge.reconnect_delay_secs = 120;
        assert!(inverted.validate().is_err());

        let mut no_heartbeat = Config::default();
        no_heartbeat.edge.heartbeat_interval_secs = 0;
        assert!(no_heartbeat.validate().is_err());

        let mut no_metrics = Config::default();
        no_metrics.edge.metrics_interval_secs = 0;
        assert!(no_metrics.validate().is_err());

        let mut huge_heartbeat = Config::default();
        huge_heartbeat.edge.heartbeat_interval_secs = u64::MAX;
        assert!(huge_heartbeat.validate().is_err());

        let mut huge_cap = Config::default();
        huge_cap.edge.reconnect_max_delay_secs = u64::MAX / 2 + 1;
        let err = huge_cap.validate().unwrap_err();
        assert!(err.to_string().contains("reconnect max delay"));
    }

    #[test]
    fn test_empty_token_is_absent() {
        let mut config = Config::default();
        config.auth.token = Some(String::new());
        assert_eq!(config.token(), None);
    }
}
