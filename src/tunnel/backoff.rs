//! Reconnect delay policy.

use std::time::Duration;

/// Doubling delay capped at `max`, reset to `base` once a session has stayed
/// up for the stable threshold.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    stable: Duration,
    current: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration, stable: Duration) -> Self {
        Self {
            base,
            max,
            stable,
            current: base,
        }
    }

    /// Delay before the next attempt. Each call doubles the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Account for a finished session that was active for `active_for`.
    pub fn session_ended(&mut self, active_for: Option<Duration>) {
        if active_for.is_some_and(|d| d >= self.stable) {
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}
