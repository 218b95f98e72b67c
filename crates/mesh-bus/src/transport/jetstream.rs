//! # JetStream Transport
//!
//! [`LogTransport`] over NATS JetStream.
//!
//! - Streams use file storage with limits retention
//! - Subscriptions are durable pull consumers with explicit ack, deliver-all
//! - Replay uses a short-lived ephemeral consumer that reads the filter's
//!   backlog in batches and is then left to expire
//! - Background reconnects use the bus backoff policy; state changes from
//!   the client's event callback are mirrored into the [`StateCell`]

use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy},
    stream::{RetentionPolicy, StorageType},
    AckKind,
};
use async_nats::{ClientError, Event};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{
    Acker, ConnectionState, ConsumerSpec, Delivery, DeliveryStream, LogRecord, LogTransport,
    StateCell,
};
use crate::config::BusConfig;
use crate::errors::BusError;
use crate::streams::StreamSpec;

/// Records fetched per request while reading a replay backlog.
const REPLAY_BATCH: u64 = 256;

/// Idle time after which the server removes a replay consumer.
const REPLAY_CONSUMER_TTL: Duration = Duration::from_secs(30);

/// JetStream-backed durable log.
pub struct JetStreamTransport {
    client: async_nats::Client,
    context: jetstream::Context,
    state: StateCell,
}

impl JetStreamTransport {
    /// Make one connection attempt, bounded by `config.connect_timeout`.
    ///
    /// Retrying failed attempts is the caller's job; once connected, the
    /// client reconnects on its own with the same backoff schedule.
    pub async fn connect(config: &BusConfig, state: StateCell) -> Result<Self, BusError> {
        let policy = config.backoff();
        let events = state.clone();

        let options = async_nats::ConnectOptions::new()
            .name(&config.client_name)
            .connection_timeout(config.connect_timeout)
            .request_timeout(Some(config.request_timeout))
            .max_reconnects(Some(config.max_reconnect as usize))
            .reconnect_delay_callback(move |attempts| {
                policy.delay(attempts.saturating_sub(1) as u32)
            })
            .event_callback(move |event| {
                let state = events.clone();
                async move {
                    match state_for_event(&event) {
                        Some(next) => state.set(next),
                        None => debug!(event = %event, "NATS client event"),
                    }
                }
            });

        let client = tokio::time::timeout(config.connect_timeout, options.connect(config.url.as_str()))
            .await
            .map_err(|_| BusError::Timeout {
                operation: "connect",
                after: config.connect_timeout,
            })?
            .map_err(|e| BusError::Transport(format!("connect to {}: {e}", config.url)))?;

        state.set(ConnectionState::Connected);
        info!(url = %config.url, "Connected to JetStream");

        let context = jetstream::new(client.clone());
        Ok(Self {
            client,
            context,
            state,
        })
    }
}

/// Connection state implied by a client event, if any.
///
/// Once reconnects are exhausted the client stops trying, so the connection
/// is closed for good.
fn state_for_event(event: &Event) -> Option<ConnectionState> {
    match event {
        Event::Connected => Some(ConnectionState::Connected),
        Event::Disconnected => Some(ConnectionState::Reconnecting),
        Event::ClientError(ClientError::MaxReconnects) => {
            warn!("NATS client gave up reconnecting");
            Some(ConnectionState::Closed)
        }
        _ => None,
    }
}

struct JetStreamAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(&self) -> Result<(), BusError> {
        self.message.ack().await.map_err(BusError::transport)
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), BusError> {
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(BusError::transport)
    }

    async fn term(&self) -> Result<(), BusError> {
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(BusError::transport)
    }
}

fn into_delivery(message: jetstream::Message) -> Result<Delivery, BusError> {
    let (sequence, attempt) = message
        .info()
        .map(|info| (info.stream_sequence, info.delivered.max(1) as u32))
        .map_err(BusError::transport)?;
    let subject = message.subject.to_string();
    let payload = message.payload.clone();
    Ok(Delivery::new(
        subject,
        payload,
        sequence,
        attempt,
        Box::new(JetStreamAcker { message }),
    ))
}

#[async_trait]
impl LogTransport for JetStreamTransport {
    fn name(&self) -> &'static str {
        "jetstream"
    }

    fn state(&self) -> StateCell {
        self.state.clone()
    }

    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<(), BusError> {
        let config = jetstream::stream::Config {
            name: spec.name.to_string(),
            subjects: spec.subjects.iter().map(|s| s.to_string()).collect(),
            retention: RetentionPolicy::Limits,
            storage: StorageType::File,
            max_age: spec.max_age,
            max_bytes: i64::try_from(spec.max_bytes).unwrap_or(i64::MAX),
            ..Default::default()
        };
        self.context
            .get_or_create_stream(config)
            .await
            .map_err(|e| BusError::Transport(format!("provision stream {}: {e}", spec.name)))?;
        debug!(stream = spec.name, "Stream ready");
        Ok(())
    }

    async fn append(&self, subject: &str, payload: Bytes) -> Result<u64, BusError> {
        if !self.state.get().accepts_writes() {
            return Err(BusError::Transport(format!(
                "connection is {}",
                self.state.get()
            )));
        }
        let ack = self
            .context
            .publish(subject.to_string(), payload)
            .await
            .map_err(BusError::transport)?
            .await
            .map_err(BusError::transport)?;
        Ok(ack.sequence)
    }

    async fn consume(&self, spec: ConsumerSpec) -> Result<DeliveryStream, BusError> {
        let stream = self
            .context
            .get_stream(&spec.stream)
            .await
            .map_err(BusError::transport)?;

        let consumer: jetstream::consumer::PullConsumer = stream
            .get_or_create_consumer(
                &spec.durable_name,
                pull::Config {
                    durable_name: Some(spec.durable_name.clone()),
                    filter_subject: spec.filter_subject.clone(),
                    ack_policy: AckPolicy::Explicit,
                    deliver_policy: DeliverPolicy::All,
                    ack_wait: spec.ack_wait,
                    max_deliver: i64::from(spec.max_deliver),
                    max_ack_pending: i64::try_from(spec.max_in_flight).unwrap_or(i64::MAX),
                    ..Default::default()
                },
            )
            .await
            .map_err(BusError::transport)?;

        // An existing durable keeps its own filter; never attach to a different one
        let existing = &consumer.cached_info().config.filter_subject;
        if *existing != spec.filter_subject {
            return Err(BusError::Config(format!(
                "consumer {} on {} already filters {existing}, not {}",
                spec.durable_name, spec.stream, spec.filter_subject
            )));
        }

        let messages = consumer.messages().await.map_err(BusError::transport)?;
        debug!(
            stream = %spec.stream,
            consumer = %spec.durable_name,
            filter = %spec.filter_subject,
            "Durable consumer attached"
        );

        let deliveries = messages.map(|item| match item {
            Ok(message) => into_delivery(message),
            Err(e) => Err(BusError::transport(e)),
        });
        Ok(Box::pin(deliveries))
    }

    async fn read_all(&self, stream: &str, filter: &str) -> Result<Vec<LogRecord>, BusError> {
        let stream = self
            .context
            .get_stream(stream)
            .await
            .map_err(BusError::transport)?;

        let mut consumer: jetstream::consumer::PullConsumer = stream
            .create_consumer(pull::Config {
                filter_subject: filter.to_string(),
                deliver_policy: DeliverPolicy::All,
                ack_policy: AckPolicy::None,
                inactive_threshold: REPLAY_CONSUMER_TTL,
                ..Default::default()
            })
            .await
            .map_err(BusError::transport)?;

        let mut remaining = consumer
            .info()
            .await
            .map_err(BusError::transport)?
            .num_pending;
        let mut records = Vec::with_capacity(remaining.min(4 * REPLAY_BATCH) as usize);

        while remaining > 0 {
            let mut batch = consumer
                .fetch()
                .max_messages(remaining.min(REPLAY_BATCH) as usize)
                .messages()
                .await
                .map_err(BusError::transport)?;

            let mut received = 0u64;
            while let Some(message) = batch.next().await {
                let message = message.map_err(BusError::transport)?;
                let sequence = message
                    .info()
                    .map(|info| info.stream_sequence)
                    .map_err(BusError::transport)?;
                records.push(LogRecord {
                    subject: message.subject.to_string(),
                    payload: message.payload.clone(),
                    sequence,
                });
                received += 1;
            }
            if received == 0 {
                warn!(remaining, "Replay backlog ended early");
                break;
            }
            remaining = remaining.saturating_sub(received);
        }

        Ok(records)
    }

    async fn close(&self) -> Result<(), BusError> {
        let result = self.client.flush().await.map_err(BusError::transport);
        self.state.set(ConnectionState::Closed);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_client_events_map_to_connection_state() {
        assert_eq!(state_for_event(&Event::Connected), Some(ConnectionState::Connected));
        assert_eq!(
            state_for_event(&Event::Disconnected),
            Some(ConnectionState::Reconnecting)
        );
        assert_eq!(
            state_for_event(&Event::ClientError(ClientError::MaxReconnects)),
            Some(ConnectionState::Closed)
        );
        assert_eq!(state_for_event(&Event::LameDuckMode), None);
        assert_eq!(
            state_for_event(&Event::ClientError(ClientError::Other("x".into()))),
            None
        );
    }

    #[test]
    fn test_exhausted_reconnects_leave_state_closed() {
        let state = StateCell::new();
        state.set(ConnectionState::Connected);
        for event in [
            Event::Disconnected,
            Event::ClientError(ClientError::MaxReconnects),
            Event::Connected,
        ] {
            if let Some(next) = state_for_event(&event) {
                state.set(next);
            }
        }
        assert_eq!(state.get(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_fast() {
        let config = BusConfig {
            url: "nats://127.0.0.1:1".to_string(),
            connect_timeout: Duration::from_secs(2),
            ..BusConfig::default()
        };
        let state = StateCell::new();
        let started = Instant::now();
        let result = JetStreamTransport::connect(&config, state.clone()).await;

        assert!(matches!(result, Err(BusError::Transport(_) | BusError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_ne!(state.get(), ConnectionState::Connected);
    }
}
