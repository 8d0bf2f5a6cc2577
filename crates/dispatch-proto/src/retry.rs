//! Lazy Pirate retry configuration for the `DpeClient` DEALER socket.
//!
//! From zguide Chapter 4: retry requests on timeout, track peer health via
//! successful responses rather than socket state, and cap backoff so a dead
//! peer doesn't push reconnect delays out to hours.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Timeout per request attempt.
    pub timeout: Duration,
    /// Maximum retry attempts before giving up on a request.
    pub max_retries: u32,
    /// Initial backoff between retries.
    pub backoff_base: Duration,
    /// Backoff ceiling; exponential growth is capped here.
    pub backoff_max: Duration,
    /// Consecutive heartbeat failures before a peer is marked dead.
    pub max_failures: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            max_failures: 5,
        }
    }
}

impl RetryConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// attempt 0 => no delay, attempt n => min(backoff_base * 2^(n-1), backoff_max).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.backoff_base.saturating_mul(multiplier);
        std::cmp::min(delay, self.backoff_max)
    }
}

/// Whether a peer is currently responding, tracked independently of ZMQ's
/// own (invisible) socket/connection state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unknown = 0,
    Connected = 1,
    Dead = 2,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connected,
            2 => ConnectionState::Dead,
            _ => ConnectionState::Unknown,
        }
    }
}

#[derive(Debug)]
pub struct HealthTracker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    last_success: RwLock<Option<Instant>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Unknown as u8),
            consecutive_failures: AtomicU32::new(0),
            last_success: RwLock::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_alive(&self) -> bool {
        self.state() != ConnectionState::Dead
    }

    pub async fn record_success(&self) {
        *self.last_success.write().await = Some(Instant::now());
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.set_state(ConnectionState::Connected);
    }

    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_max() {
        let config = RetryConfig {
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(config.backoff_for_attempt(0), Duration::ZERO);
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for_attempt(7), Duration::from_secs(5));
        assert_eq!(config.backoff_for_attempt(100), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn health_tracker_recovers_after_success() {
        let tracker = HealthTracker::new();
        tracker.record_failure();
        tracker.record_failure();
        assert!(!tracker.is_connected());
        tracker.record_success().await;
        assert!(tracker.is_connected());
    }
}
