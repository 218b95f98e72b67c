//! Bus configuration from environment variables.

use std::env;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::errors::BusError;

/// Default NATS endpoint.
pub const DEFAULT_BUS_URL: &str = "nats://127.0.0.1:4222";

/// URL scheme selecting the in-process log.
pub const MEMORY_SCHEME: &str = "memory://";

/// Connection and delivery settings for a [`MessageBus`](crate::MessageBus).
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Log endpoint (`nats://`, `tls://`, `ws://` or `memory://`)
    pub url: String,

    /// Retries after the initial connection attempt
    pub max_reconnect: u32,

    /// Base delay between connection attempts
    pub reconnect_wait: Duration,

    /// Upper bound for a single backoff delay
    pub max_reconnect_delay: Duration,

    /// Per-message handler deadline before the record is redelivered
    pub ack_wait: Duration,

    /// Unacknowledged deliveries allowed per subscription
    pub max_in_flight: usize,

    /// Deadline for a single connection attempt
    pub connect_timeout: Duration,

    /// Deadline for publish and replay calls
    pub request_timeout: Duration,

    /// Deliveries of one record before it is dead-lettered
    pub max_deliver: u32,

    /// Client name reported to the server
    pub client_name: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_BUS_URL.to_string(),
            max_reconnect: 10,
            reconnect_wait: Duration::from_secs(2),
            max_reconnect_delay: Duration::from_secs(30),
            ack_wait: Duration::from_secs(30),
            max_in_flight: 1000,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            max_deliver: 5,
            client_name: "agent-mesh".to_string(),
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env_u64(key).map(Duration::from_millis).unwrap_or(default)
}

impl BusConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MESH_BUS_URL`: Log endpoint (default: nats://127.0.0.1:4222)
    /// - `MESH_MAX_RECONNECT`: Retries after the first attempt (default: 10)
    /// - `MESH_RECONNECT_WAIT_MS`: Base backoff delay (default: 2000)
    /// - `MESH_MAX_RECONNECT_DELAY_MS`: Backoff cap (default: 30000)
    /// - `MESH_ACK_WAIT_MS`: Handler deadline (default: 30000)
    /// - `MESH_MAX_IN_FLIGHT`: Unacked deliveries per subscription (default: 1000)
    /// - `MESH_CONNECT_TIMEOUT_MS`: Per-attempt connect deadline (default: 5000)
    /// - `MESH_REQUEST_TIMEOUT_MS`: Publish/replay deadline (default: 10000)
    /// - `MESH_MAX_DELIVER`: Deliveries before dead-lettering (default: 5)
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: env::var("MESH_BUS_URL").unwrap_or(defaults.url),
            max_reconnect: env_u64("MESH_MAX_RECONNECT")
                .map(|v| v as u32)
                .unwrap_or(defaults.max_reconnect),
            reconnect_wait: env_millis("MESH_RECONNECT_WAIT_MS", defaults.reconnect_wait),
            max_reconnect_delay: env_millis(
                "MESH_MAX_RECONNECT_DELAY_MS",
                defaults.max_reconnect_delay,
            ),
            ack_wait: env_millis("MESH_ACK_WAIT_MS", defaults.ack_wait),
            max_in_flight: env_u64("MESH_MAX_IN_FLIGHT")
                .map(|v| v as usize)
                .unwrap_or(defaults.max_in_flight),
            connect_timeout: env_millis("MESH_CONNECT_TIMEOUT_MS", defaults.connect_timeout),
            request_timeout: env_millis("MESH_REQUEST_TIMEOUT_MS", defaults.request_timeout),
            max_deliver: env_u64("MESH_MAX_DELIVER")
                .map(|v| v as u32)
                .unwrap_or(defaults.max_deliver),
            client_name: env::var("MESH_CLIENT_NAME").unwrap_or(defaults.client_name),
        }
    }

    /// In-process configuration with short deadlines, for tests and local runs.
    pub fn in_memory() -> Self {
        Self {
            url: MEMORY_SCHEME.to_string(),
            max_reconnect: 0,
            reconnect_wait: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(100),
            ack_wait: Duration::from_secs(2),
            max_in_flight: 256,
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(2),
            max_deliver: 5,
            client_name: "agent-mesh-test".to_string(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Whether the URL selects the in-process log.
    pub fn is_memory(&self) -> bool {
        self.url.starts_with(MEMORY_SCHEME)
    }

    /// Reject settings the bus cannot operate with.
    pub fn validate(&self) -> Result<(), BusError> {
        if self.url.trim().is_empty() {
            return Err(BusError::Config("bus url is empty".into()));
        }
        let zero = [
            ("ack_wait", self.ack_wait),
            ("connect_timeout", self.connect_timeout),
            ("request_timeout", self.request_timeout),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, d)| d.is_zero()) {
            return Err(BusError::Config(format!("{name} must be greater than zero")));
        }
        if self.max_in_flight == 0 {
            return Err(BusError::Config("max_in_flight must be at least 1".into()));
        }
        if self.max_deliver == 0 {
            return Err(BusError::Config("max_deliver must be at least 1".into()));
        }
        Ok(())
    }

    /// Backoff schedule shared by startup connection and background reconnects.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.reconnect_wait, self.max_reconnect_delay)
    }
}
