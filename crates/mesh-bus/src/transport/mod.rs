//! # Log Transport
//!
//! The bus talks to its durable log through [`LogTransport`]. Two
//! implementations exist:
//!
//! - [`JetStreamTransport`]: NATS JetStream over `async-nats`
//! - [`MemoryLog`]: an in-process log with the same delivery semantics,
//!   selected by `memory://` URLs
//!
//! ## Delivery contract
//!
//! - Records get a per-stream sequence number at append time
//! - A consumer sees matching records in sequence order
//! - Every delivery must be settled with ack, nak or term
//! - An unsettled delivery is redelivered after the consumer's ack wait
//! - A record is delivered at most `max_deliver` times

mod jetstream;
mod memory;

pub use jetstream::JetStreamTransport;
pub use memory::MemoryLog;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use mesh_telemetry::metrics;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::errors::BusError;
use crate::streams::StreamSpec;

// =============================================================================
// CONNECTION STATE
// =============================================================================

/// Lifecycle of the connection to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
            Self::Reconnecting => 3.0,
            Self::Closed => 4.0,
        }
    }

    /// Whether appends can currently reach the log.
    pub fn accepts_writes(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, observable connection state.
#[derive(Debug, Clone)]
pub struct StateCell {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Record a transition. `Closed` is terminal.
    pub fn set(&self, next: ConnectionState) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == next || *current == ConnectionState::Closed {
                return false;
            }
            *current = next;
            true
        });
        if !changed {
            return;
        }
        metrics::CONNECTION_STATE.set(next.gauge_value());
        match next {
            ConnectionState::Reconnecting | ConnectionState::Disconnected => {
                warn!(state = %next, "Log connection lost")
            }
            ConnectionState::Connected => info!(state = %next, "Log connection established"),
            _ => debug!(state = %next, "Log connection state changed"),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

// =============================================================================
// RECORDS AND DELIVERIES
// =============================================================================

/// A stored record, as read back for replay.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub subject: String,
    pub payload: Bytes,
    pub sequence: u64,
}

/// Settles one delivery with the log.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BusError>;

    /// Negative-acknowledge; the log redelivers after `delay` (immediately if `None`).
    async fn nak(&self, delay: Option<Duration>) -> Result<(), BusError>;

    /// Stop redelivering this record.
    async fn term(&self) -> Result<(), BusError>;
}

/// One delivery of a record to a consumer.
pub struct Delivery {
    pub subject: String,
    pub payload: Bytes,
    pub sequence: u64,
    /// 1 on first delivery, incremented per redelivery
    pub attempt: u32,
    acker: Box<dyn Acker>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("sequence", &self.sequence)
            .field("attempt", &self.attempt)
            .field("len", &self.payload.len())
            .finish()
    }
}

impl Delivery {
    pub fn new(
        subject: String,
        payload: Bytes,
        sequence: u64,
        attempt: u32,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            subject,
            payload,
            sequence,
            attempt,
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), BusError> {
        self.acker.ack().await
    }

    pub async fn nak(self, delay: Option<Duration>) -> Result<(), BusError> {
        self.acker.nak(delay).await
    }

    pub async fn term(self) -> Result<(), BusError> {
        self.acker.term().await
    }
}

/// Stream of deliveries for one consumer. Ends when the consumer is gone.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BusError>> + Send>>;

/// Durable consumer registration.
#[derive(Debug, Clone)]
pub struct ConsumerSpec {
    pub stream: String,
    pub durable_name: String,
    pub filter_subject: String,
    pub ack_wait: Duration,
    pub max_deliver: u32,
    pub max_in_flight: usize,
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// Durable, subject-addressed log.
#[async_trait]
pub trait LogTransport: Send + Sync {
    /// Short name for logs (`jetstream`, `memory`).
    fn name(&self) -> &'static str;

    /// Connection state this transport reports into.
    fn state(&self) -> StateCell;

    /// Create the stream if missing. Existing streams are left as they are.
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<(), BusError>;

    /// Append a record and return its stream sequence.
    async fn append(&self, subject: &str, payload: Bytes) -> Result<u64, BusError>;

    /// Create or resume a durable consumer and start receiving deliveries.
    async fn consume(&self, spec: ConsumerSpec) -> Result<DeliveryStream, BusError>;

    /// Every record in `stream` matching `filter`, in sequence order.
    async fn read_all(&self, stream: &str, filter: &str) -> Result<Vec<LogRecord>, BusError>;

    /// Flush pending writes and release the connection.
    async fn close(&self) -> Result<(), BusError>;
}

/// Open one connection to the log named by `config.url`.
pub async fn open(config: &BusConfig, state: StateCell) -> Result<Arc<dyn LogTransport>, BusError> {
    if config.is_memory() {
        let log = MemoryLog::with_state(state);
        return Ok(Arc::new(log));
    }
    let transport = JetStreamTransport::connect(config, state).await?;
    Ok(Arc::new(transport))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions_are_observable() {
        let cell = StateCell::new();
        let rx = cell.subscribe();
        assert_eq!(cell.get(), ConnectionState::Disconnected);

        cell.set(ConnectionState::Connecting);
        cell.set(ConnectionState::Connected);
        assert_eq!(*rx.borrow(), ConnectionState::Connected);
        assert!(cell.get().accepts_writes());

        cell.set(ConnectionState::Reconnecting);
        assert!(!cell.get().accepts_writes());
    }

    #[test]
    fn test_closed_is_terminal() {
        let cell = StateCell::new();
        cell.set(ConnectionState::Closed);
        cell.set(ConnectionState::Connected);
        assert_eq!(cell.get(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_open_memory_url() {
        let cell = StateCell::new();
        let transport = open(&BusConfig::in_memory(), cell.clone()).await.unwrap();
        assert_eq!(transport.name(), "memory");
        assert_eq!(cell.get(), ConnectionState::Connected);
    }
}
