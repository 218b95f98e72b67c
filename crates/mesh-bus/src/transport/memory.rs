//! # In-Memory Log
//!
//! Single-process implementation of [`LogTransport`] with the delivery
//! semantics of the networked log:
//!
//! - per-stream sequences and subject-wildcard stream routing
//! - durable consumers whose cursor survives resubscription
//! - explicit ack/nak/term with ack-deadline redelivery
//! - retention by age and total bytes
//!
//! Suitable for tests and single-node runs. The record store is shared by
//! every handle from [`MemoryLog::attach`]; each handle has its own
//! connection state, so one bus closing does not close the others.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    Acker, ConnectionState, ConsumerSpec, Delivery, DeliveryStream, LogRecord, LogTransport,
    StateCell,
};
use crate::errors::BusError;
use crate::streams::StreamSpec;
use crate::subjects::{Subject, SubjectPattern};

struct Stored {
    sequence: u64,
    subject: Subject,
    payload: Bytes,
    stored_at: Instant,
}

struct StreamLog {
    spec: StreamSpec,
    patterns: Vec<SubjectPattern>,
    records: VecDeque<Stored>,
    last_sequence: u64,
    bytes: u64,
}

impl StreamLog {
    fn new(spec: &StreamSpec) -> Result<Self, BusError> {
        let patterns = spec
            .subjects
            .iter()
            .map(|s| SubjectPattern::parse(*s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            spec: *spec,
            patterns,
            records: VecDeque::new(),
            last_sequence: 0,
            bytes: 0,
        })
    }

    fn accepts(&self, subject: &Subject) -> bool {
        self.patterns.iter().any(|p| p.matches(subject))
    }

    fn push(&mut self, subject: Subject, payload: Bytes) -> u64 {
        self.last_sequence += 1;
        self.bytes += payload.len() as u64;
        self.records.push_back(Stored {
            sequence: self.last_sequence,
            subject,
            payload,
            stored_at: Instant::now(),
        });
        self.enforce_retention();
        self.last_sequence
    }

    /// Drop the oldest records until both limits hold. The newest record is kept.
    fn enforce_retention(&mut self) {
        let now = Instant::now();
        while self.records.len() > 1 {
            let Some(oldest) = self.records.front() else {
                break;
            };
            let too_old = now.duration_since(oldest.stored_at) > self.spec.max_age;
            let too_big = self.bytes > self.spec.max_bytes;
            if !too_old && !too_big {
                break;
            }
            if let Some(evicted) = self.records.pop_front() {
                self.bytes -= evicted.payload.len() as u64;
            }
        }
    }

    fn get(&self, sequence: u64) -> Option<&Stored> {
        let index = self.records.partition_point(|r| r.sequence < sequence);
        self.records.get(index).filter(|r| r.sequence == sequence)
    }

    /// First record after `after` whose subject matches `filter`.
    fn next_match(&self, after: u64, filter: &SubjectPattern) -> Option<&Stored> {
        let start = self.records.partition_point(|r| r.sequence <= after);
        self.records
            .range(start..)
            .find(|r| filter.matches(&r.subject))
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    attempts: u32,
    redeliver_at: Instant,
}

#[derive(Default)]
struct Cursor {
    /// Highest sequence handed out for the first time
    delivered_through: u64,
    /// Delivered, not yet acked or terminated
    pending: BTreeMap<u64, Pending>,
}

struct Consumer {
    stream: String,
    durable_name: String,
    filter: SubjectPattern,
    ack_wait: Duration,
    max_deliver: u32,
    max_in_flight: usize,
    cursor: Mutex<Cursor>,
    wake: Notify,
}

impl Consumer {
    fn settle(&self, sequence: u64) {
        self.cursor.lock().pending.remove(&sequence);
        self.wake.notify_one();
    }
}

#[derive(Default)]
struct Store {
    streams: RwLock<HashMap<String, StreamLog>>,
    consumers: Mutex<HashMap<(String, String), Arc<Consumer>>>,
}

/// In-process durable log.
#[derive(Clone)]
pub struct MemoryLog {
    store: Arc<Store>,
    /// Bumped on every append to wake consumers
    head: Arc<watch::Sender<u64>>,
    state: StateCell,
    closed: CancellationToken,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    /// Create an empty log with a connected handle.
    #[must_use]
    pub fn new() -> Self {
        Self::with_state(StateCell::new())
    }

    /// Create an empty log reporting into `state`.
    #[must_use]
    pub fn with_state(state: StateCell) -> Self {
        let (head, _) = watch::channel(0);
        state.set(ConnectionState::Connected);
        Self {
            store: Arc::new(Store::default()),
            head: Arc::new(head),
            state,
            closed: CancellationToken::new(),
        }
    }

    /// New connection handle onto the same records and consumers.
    #[must_use]
    pub fn attach(&self) -> Self {
        let state = StateCell::new();
        state.set(ConnectionState::Connected);
        Self {
            store: Arc::clone(&self.store),
            head: Arc::clone(&self.head),
            state,
            closed: CancellationToken::new(),
        }
    }

    /// Simulate losing and regaining the connection.
    ///
    /// While unavailable, appends fail with a transport error and no
    /// deliveries are made.
    pub fn set_available(&self, available: bool) {
        self.state.set(if available {
            ConnectionState::Connected
        } else {
            ConnectionState::Reconnecting
        });
    }

    /// Records currently retained in `stream`.
    #[must_use]
    pub fn record_count(&self, stream: &str) -> usize {
        self.store
            .streams
            .read()
            .get(stream)
            .map_or(0, |s| s.records.len())
    }

    /// Unsettled deliveries of a durable consumer.
    #[must_use]
    pub fn pending_count(&self, stream: &str, durable_name: &str) -> usize {
        self.store
            .consumers
            .lock()
            .get(&(stream.to_string(), durable_name.to_string()))
            .map_or(0, |c| c.cursor.lock().pending.len())
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.is_cancelled() {
            return Err(BusError::Closed);
        }
        if !self.state.get().accepts_writes() {
            return Err(BusError::Transport(format!(
                "log unavailable ({})",
                self.state.get()
            )));
        }
        Ok(())
    }

    fn consumer_for(&self, spec: &ConsumerSpec) -> Result<Arc<Consumer>, BusError> {
        let filter = SubjectPattern::parse(spec.filter_subject.as_str())?;
        let key = (spec.stream.clone(), spec.durable_name.clone());
        let mut consumers = self.store.consumers.lock();
        let consumer = consumers.entry(key).or_insert_with(|| {
            debug!(
                stream = %spec.stream,
                consumer = %spec.durable_name,
                filter = %spec.filter_subject,
                "Durable consumer created"
            );
            Arc::new(Consumer {
                stream: spec.stream.clone(),
                durable_name: spec.durable_name.clone(),
                filter: filter.clone(),
                ack_wait: spec.ack_wait,
                max_deliver: spec.max_deliver.max(1),
                max_in_flight: spec.max_in_flight.max(1),
                cursor: Mutex::new(Cursor::default()),
                wake: Notify::new(),
            })
        });
        if consumer.filter != filter {
            return Err(BusError::Config(format!(
                "consumer {} on {} already filters {}, not {}",
                spec.durable_name, spec.stream, consumer.filter, filter
            )));
        }
        Ok(Arc::clone(consumer))
    }
}

// =============================================================================
// DELIVERY LOOP
// =============================================================================

struct MemoryAcker {
    consumer: Arc<Consumer>,
    sequence: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BusError> {
        self.consumer.settle(self.sequence);
        Ok(())
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), BusError> {
        if let Some(pending) = self.consumer.cursor.lock().pending.get_mut(&self.sequence) {
            pending.redeliver_at = Instant::now() + delay.unwrap_or_default();
        }
        self.consumer.wake.notify_one();
        Ok(())
    }

    async fn term(&self) -> Result<(), BusError> {
        self.consumer.settle(self.sequence);
        Ok(())
    }
}

enum Poll {
    Ready(Delivery),
    /// Nothing deliverable; retry at this instant if set
    Idle(Option<Instant>),
}

struct DeliveryLoop {
    log: MemoryLog,
    consumer: Arc<Consumer>,
    head: watch::Receiver<u64>,
    state: watch::Receiver<ConnectionState>,
}

impl DeliveryLoop {
    async fn next(&mut self) -> Option<Result<Delivery, BusError>> {
        loop {
            if self.log.closed.is_cancelled() {
                return None;
            }
            self.head.borrow_and_update();
            let available = self.state.borrow_and_update().accepts_writes();

            let retry_at = if available {
                match self.poll() {
                    Poll::Ready(delivery) => return Some(Ok(delivery)),
                    Poll::Idle(retry_at) => retry_at,
                }
            } else {
                None
            };

            let timer = async move {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.log.closed.cancelled() => return None,
                changed = self.head.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                changed = self.state.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = self.consumer.wake.notified() => {}
                _ = timer => {}
            }
        }
    }

    fn poll(&self) -> Poll {
        let consumer = &self.consumer;
        let now = Instant::now();
        let streams = self.log.store.streams.read();
        let Some(stream) = streams.get(&consumer.stream) else {
            return Poll::Idle(None);
        };
        let mut cursor = consumer.cursor.lock();

        // Redeliveries first, oldest sequence first
        let mut retry_at: Option<Instant> = None;
        let mut exhausted = Vec::new();
        let mut due = None;
        for (&sequence, pending) in cursor.pending.iter() {
            if pending.redeliver_at > now {
                retry_at = Some(retry_at.map_or(pending.redeliver_at, |t| t.min(pending.redeliver_at)));
                continue;
            }
            if pending.attempts >= consumer.max_deliver || stream.get(sequence).is_none() {
                exhausted.push(sequence);
                continue;
            }
            due = Some(sequence);
            break;
        }
        for sequence in exhausted {
            cursor.pending.remove(&sequence);
            warn!(
                stream = %consumer.stream,
                consumer = %consumer.durable_name,
                sequence,
                "Record dropped from redelivery (max deliveries reached or evicted)"
            );
        }

        if let Some(sequence) = due {
            let Some(record) = stream.get(sequence) else {
                return Poll::Idle(retry_at);
            };
            let Some(pending) = cursor.pending.get_mut(&sequence) else {
                return Poll::Idle(retry_at);
            };
            pending.attempts += 1;
            pending.redeliver_at = now + consumer.ack_wait;
            let attempt = pending.attempts;
            return Poll::Ready(self.delivery(record, attempt));
        }

        if cursor.pending.len() >= consumer.max_in_flight {
            return Poll::Idle(retry_at);
        }

        match stream.next_match(cursor.delivered_through, &consumer.filter) {
            Some(record) => {
                cursor.delivered_through = record.sequence;
                cursor.pending.insert(
                    record.sequence,
                    Pending {
                        attempts: 1,
                        redeliver_at: now + consumer.ack_wait,
                    },
                );
                Poll::Ready(self.delivery(record, 1))
            }
            None => {
                cursor.delivered_through = stream.last_sequence;
                Poll::Idle(retry_at)
            }
        }
    }

    fn delivery(&self, record: &Stored, attempt: u32) -> Delivery {
        Delivery::new(
            record.subject.to_string(),
            record.payload.clone(),
            record.sequence,
            attempt,
            Box::new(MemoryAcker {
                consumer: Arc::clone(&self.consumer),
                sequence: record.sequence,
            }),
        )
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

#[async_trait]
impl LogTransport for MemoryLog {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn state(&self) -> StateCell {
        self.state.clone()
    }

    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<(), BusError> {
        let mut streams = self.store.streams.write();
        if !streams.contains_key(spec.name) {
            streams.insert(spec.name.to_string(), StreamLog::new(spec)?);
            debug!(stream = spec.name, "Stream created");
        }
        Ok(())
    }

    async fn append(&self, subject: &str, payload: Bytes) -> Result<u64, BusError> {
        self.ensure_open()?;
        let subject = Subject::parse(subject)?;

        let sequence = {
            let mut streams = self.store.streams.write();
            let stream = streams
                .values_mut()
                .find(|s| s.accepts(&subject))
                .ok_or_else(|| {
                    BusError::Transport(format!("no stream accepts subject {subject}"))
                })?;
            stream.push(subject, payload)
        };

        self.head.send_modify(|head| *head += 1);
        Ok(sequence)
    }

    async fn consume(&self, spec: ConsumerSpec) -> Result<DeliveryStream, BusError> {
        if self.closed.is_cancelled() {
            return Err(BusError::Closed);
        }
        if !self.store.streams.read().contains_key(&spec.stream) {
            return Err(BusError::Transport(format!("stream {} not found", spec.stream)));
        }
        let consumer = self.consumer_for(&spec)?;

        let delivery_loop = DeliveryLoop {
            log: self.clone(),
            consumer,
            head: self.head.subscribe(),
            state: self.state.subscribe(),
        };
        let deliveries = futures::stream::unfold(delivery_loop, |mut dl| async move {
            dl.next().await.map(|item| (item, dl))
        });
        Ok(Box::pin(deliveries))
    }

    async fn read_all(&self, stream: &str, filter: &str) -> Result<Vec<LogRecord>, BusError> {
        self.ensure_open()?;
        let filter = SubjectPattern::parse(filter)?;
        let streams = self.store.streams.read();
        let stream = streams
            .get(stream)
            .ok_or_else(|| BusError::Transport(format!("stream {stream} not found")))?;

        Ok(stream
            .records
            .iter()
            .filter(|r| filter.matches(&r.subject))
            .map(|r| LogRecord {
                subject: r.subject.to_string(),
                payload: r.payload.clone(),
                sequence: r.sequence,
            })
            .collect())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.closed.cancel();
        self.state.set(ConnectionState::Closed);
        Ok(())
    }
}
