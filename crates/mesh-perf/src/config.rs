//! Harness configuration.

use std::env;
use std::time::Duration;

use crate::PerfError;

/// Shape of a ping-pong run.
///
/// A run stops when `messages` round trips have been started, or when
/// `duration` has elapsed, whichever comes first. `messages == 0` means no
/// count limit, in which case `duration` must be set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfConfig {
    /// Concurrent ping/pong agent pairs
    pub pairs: usize,

    /// Round trips across all pairs
    pub messages: u64,

    /// Wall-clock limit
    pub duration: Option<Duration>,

    /// Padding added to each request payload
    pub payload_bytes: usize,

    /// How long a pinger waits for its echo before counting an error
    pub reply_timeout: Duration,
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            pairs: 4,
            messages: 10_000,
            duration: None,
            payload_bytes: 256,
            reply_timeout: Duration::from_secs(5),
        }
    }
}

impl PerfConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MESH_PERF_PAIRS`: Ping/pong pairs (default: 4)
    /// - `MESH_PERF_MESSAGES`: Round trips, 0 for unlimited (default: 10000)
    /// - `MESH_PERF_DURATION_SECS`: Wall-clock limit (default: unset)
    /// - `MESH_PERF_PAYLOAD_BYTES`: Request padding (default: 256)
    /// - `MESH_PERF_REPLY_TIMEOUT_MS`: Echo deadline (default: 5000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            pairs: env_parse("MESH_PERF_PAIRS").unwrap_or(defaults.pairs),
            messages: env_parse("MESH_PERF_MESSAGES").unwrap_or(defaults.messages),
            duration: env_parse("MESH_PERF_DURATION_SECS").map(Duration::from_secs),
            payload_bytes: env_parse("MESH_PERF_PAYLOAD_BYTES").unwrap_or(defaults.payload_bytes),
            reply_timeout: env_parse("MESH_PERF_REPLY_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.reply_timeout),
        }
    }

    #[must_use]
    pub fn with_pairs(mut self, pairs: usize) -> Self {
        self.pairs = pairs;
        self
    }

    #[must_use]
    pub fn with_messages(mut self, messages: u64) -> Self {
        self.messages = messages;
        self
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn validate(&self) -> Result<(), PerfError> {
        if self.pairs == 0 {
            return Err(PerfError::Config("pairs must be at least 1".into()));
        }
        if self.messages == 0 && self.duration.is_none() {
            return Err(PerfError::Config(
                "a run needs a message count or a duration".into(),
            ));
        }
        if self.duration == Some(Duration::ZERO) {
            return Err(PerfError::Config("duration must be non-zero".into()));
        }
        if self.reply_timeout.is_zero() {
            return Err(PerfError::Config("reply_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
