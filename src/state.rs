//! Shared state: the standard-mode router state and edge tunnel counters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::Config;
use crate::docker::DockerApi;
use crate::proxy::ProxyCore;

/// State handed to every standard-mode handler via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    pub proxy: ProxyCore,
}

impl AppState {
    pub fn new(config: Arc<Config>, docker: Arc<dyn DockerApi>) -> Self {
        Self {
            config,
            proxy: ProxyCore::new(docker),
        }
    }

    pub fn docker(&self) -> &Arc<dyn DockerApi> {
        self.proxy.docker()
    }
}

/// Maximum number of pong RTT samples kept for quality tracking.
const MAX_RTT_SAMPLES: usize = 20;

/// Tunnel statistics. Atomics on the hot path, a mutex only for RTT samples.
pub struct TunnelStats {
    pub connected: AtomicBool,
    pub reconnects: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub requests_failed_on_disconnect: AtomicU64,
    /// Rolling window of pong RTT samples (ms).
    pub rtt_samples: Mutex<VecDeque<u64>>,
}

impl TunnelStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            requests_failed_on_disconnect: AtomicU64::new(0),
            rtt_samples: Mutex::new(VecDeque::with_capacity(MAX_RTT_SAMPLES)),
        }
    }

    /// Record a pong RTT sample, evicting the oldest at capacity.
    pub async fn record_rtt(&self, rtt_ms: u64) {
        let mut samples = self.rtt_samples.lock().await;
        if samples.len() >= MAX_RTT_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(rtt_ms);
    }

    /// Median and p95 RTT, or `None` before the first pong.
    pub async fn rtt_stats(&self) -> Option<(u64, u64)> {
        let samples = self.rtt_samples.lock().await;
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let median = sorted[sorted.len() / 2];
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let p95_idx = (sorted.len() as f64 * 0.95).ceil() as usize;
        let p95 = sorted[p95_idx.min(sorted.len() - 1)];
        Some((median, p95))
    }
}

impl Default for TunnelStats {
    fn default() -> Self {
        Self::new()
    }
}
