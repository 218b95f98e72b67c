//! # Message Bus
//!
//! Owns the connection to the durable log and exposes publish, subscribe,
//! replay and close. All operations take `&self`; share the bus through an
//! `Arc`.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected ◄──► Reconnecting
//!                      │              │                │
//!                      └── (retries exhausted)         └──► Closed
//! ```
//!
//! Construction retries the initial connection `max_reconnect` times with
//! jittered exponential backoff, then provisions the stream topology. A
//! publish issued while the connection is not `Connected` fails with a
//! transport error; nothing is queued.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use mesh_telemetry::{log_message_event, metrics, time_histogram, TracingMiddleware};
use mesh_types::{CanonicalSerializer, Message};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::BusConfig;
use crate::context::BusContext;
use crate::dead_letter::{DeadLetter, DLQ_SUBJECT};
use crate::errors::{BusError, SubjectError, TenantScopeError};
use crate::stats::{BusStats, BusStatsSnapshot};
use crate::streams::{self, StreamSpec, TOPOLOGY};
use crate::subjects::{validate_token, Subject, SubjectBuilder, SubjectPattern};
use crate::subscription::{durable_name_for, Dispatcher, MessageHandler, Subscription};
use crate::tenant::{self, TenantSubjectBuilder};
use crate::transport::{self, ConnectionState, ConsumerSpec, LogTransport, StateCell};

/// Result of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Stream the record was appended to
    pub stream: &'static str,
    /// Stream sequence assigned by the log
    pub sequence: u64,
    pub message_id: String,
    /// Envelope hash of the message as written
    pub envelope_hash: String,
}

/// Tenant-aware, tamper-evident, replayable message bus.
pub struct MessageBus {
    transport: Arc<dyn LogTransport>,
    config: BusConfig,
    tracing: Arc<dyn TracingMiddleware>,
    state: StateCell,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    stats: Arc<BusStats>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("transport", &self.transport.name())
            .field("url", &self.config.url)
            .field("state", &self.state.get())
            .finish()
    }
}

impl MessageBus {
    /// Connect to the log named by `config.url` and provision the streams.
    ///
    /// # Errors
    ///
    /// - `Config` if the configuration is unusable
    /// - `Transport` once every connection attempt has failed
    /// - `Timeout` if every attempt timed out
    pub async fn connect(
        config: BusConfig,
        tracing: Arc<dyn TracingMiddleware>,
    ) -> Result<Self, BusError> {
        config.validate()?;
        let state = StateCell::new();
        let transport = connect_with_retry(&config, &state).await?;
        Self::with_transport(transport, config, tracing).await
    }

    /// Build a bus over an already-open transport.
    pub async fn with_transport(
        transport: Arc<dyn LogTransport>,
        config: BusConfig,
        tracing: Arc<dyn TracingMiddleware>,
    ) -> Result<Self, BusError> {
        config.validate()?;
        for spec in &TOPOLOGY {
            provision(transport.as_ref(), spec, &config).await?;
        }

        info!(
            transport = transport.name(),
            url = %config.url,
            streams = TOPOLOGY.len(),
            "Message bus ready"
        );

        Ok(Self {
            state: transport.state(),
            transport,
            config,
            tracing,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            stats: Arc::new(BusStats::default()),
            closed: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // PUBLISH
    // =========================================================================

    /// Seal `msg` and append it to the log under `subject`.
    ///
    /// Unsealed messages get the current trace context and are sealed here.
    /// A message that is already sealed is written as-is, but only if its
    /// hash still validates. No retry: transport failures surface to the
    /// caller.
    pub async fn publish(
        &self,
        ctx: &BusContext,
        subject: &str,
        msg: Message,
    ) -> Result<PublishReceipt, BusError> {
        let _timer = time_histogram!(metrics::PUBLISH_DURATION);
        let result = self.try_publish(ctx, subject, msg).await;
        match &result {
            Ok(receipt) => {
                self.stats.record_published();
                metrics::MESSAGES_PUBLISHED
                    .with_label_values(&[receipt.stream])
                    .inc();
            }
            Err(e) => {
                self.stats.record_publish_failure();
                metrics::PUBLISH_FAILURES.with_label_values(&[e.kind()]).inc();
                debug!(subject = %subject, error = %e, "Publish failed");
            }
        }
        result
    }

    async fn try_publish(
        &self,
        ctx: &BusContext,
        subject: &str,
        mut msg: Message,
    ) -> Result<PublishReceipt, BusError> {
        self.ensure_open()?;
        ctx.ensure_active()?;

        let subject = Subject::parse(subject)?;
        if subject.is_tenant_scoped() || streams::is_tenant_route(&subject) {
            self.check_tenant(ctx, subject.as_str(), "publish")?;
        }
        let stream = streams::stream_for_subject(&subject)
            .ok_or_else(|| SubjectError::Unrouted(subject.to_string()))?;

        let state = self.state.get();
        if !state.accepts_writes() {
            return Err(BusError::Transport(format!("connection is {state}")));
        }

        let span = self.tracing.publish_span(subject.as_str(), &msg);
        if msg.is_sealed() {
            msg.validate_hash()?;
        } else {
            self.tracing.inject_trace_context(&span, &mut msg);
            msg.seal()?;
        }
        let bytes = Bytes::from(CanonicalSerializer::serialize(&msg)?);

        let sequence = self
            .bounded(ctx, "publish", self.transport.append(subject.as_str(), bytes))
            .instrument(span)
            .await?;

        log_message_event!(
            debug,
            &msg,
            "Message published",
            subject = %subject,
            stream = stream.name,
            sequence = sequence
        );

        Ok(PublishReceipt {
            stream: stream.name,
            sequence,
            message_id: msg.id,
            envelope_hash: msg.envelope_hash,
        })
    }

    // =========================================================================
    // SUBSCRIBE
    // =========================================================================

    /// Deliver messages on `subject` to `handler` through a durable consumer
    /// named after the subject.
    ///
    /// Returns once the consumer is registered; delivery continues until the
    /// returned [`Subscription`] is dropped or unsubscribed, `ctx` is
    /// cancelled, or the bus is closed.
    pub async fn subscribe<H: MessageHandler>(
        &self,
        ctx: &BusContext,
        subject: &str,
        handler: H,
    ) -> Result<Subscription, BusError> {
        let durable_name = durable_name_for(subject);
        self.subscribe_durable(ctx, subject, &durable_name, handler)
            .await
    }

    /// Like [`subscribe`](Self::subscribe) with an explicit consumer name.
    ///
    /// Subscriptions sharing a name share one cursor: each record goes to
    /// one of them.
    pub async fn subscribe_durable<H: MessageHandler>(
        &self,
        ctx: &BusContext,
        subject: &str,
        durable_name: &str,
        handler: H,
    ) -> Result<Subscription, BusError> {
        self.ensure_open()?;
        ctx.ensure_active()?;

        let pattern = SubjectPattern::parse(subject)?;
        self.check_pattern_scope(ctx, &pattern)?;
        validate_token(durable_name)?;
        let stream = streams::stream_for_filter(&pattern)
            .ok_or_else(|| SubjectError::Unrouted(pattern.to_string()))?;

        let spec = ConsumerSpec {
            stream: stream.name.to_string(),
            durable_name: durable_name.to_string(),
            filter_subject: pattern.to_string(),
            ack_wait: self.config.ack_wait,
            max_deliver: self.config.max_deliver,
            max_in_flight: self.config.max_in_flight,
        };
        let deliveries = self
            .bounded(ctx, "subscribe", self.transport.consume(spec))
            .await?;

        let stop = self.shutdown.child_token();
        let dispatcher = Dispatcher {
            subject: pattern.to_string(),
            consumer: durable_name.to_string(),
            stream: stream.name,
            ctx: ctx.clone(),
            handler: Arc::new(handler),
            tracing: Arc::clone(&self.tracing),
            transport: Arc::clone(&self.transport),
            stats: Arc::clone(&self.stats),
            ack_wait: self.config.ack_wait,
            max_deliver: self.config.max_deliver,
        };
        let task = self.tasks.spawn(dispatcher.run(deliveries, stop.clone()));

        info!(
            subject = %pattern,
            consumer = durable_name,
            stream = stream.name,
            "Subscribed"
        );
        Ok(Subscription::new(
            pattern.to_string(),
            durable_name.to_string(),
            stop,
            task,
        ))
    }

    // =========================================================================
    // REPLAY
    // =========================================================================

    /// Every message of `workflow_id` with `ts >= from`, oldest first.
    ///
    /// Reads `workflows.<id>.*`, prefixed with the context's tenant when it
    /// has one. Ties in `ts` keep log order. Records that fail to decode or
    /// validate are skipped and logged.
    pub async fn replay(
        &self,
        ctx: &BusContext,
        workflow_id: &str,
        from: DateTime<Utc>,
    ) -> Result<Vec<Message>, BusError> {
        self.ensure_open()?;
        ctx.ensure_active()?;
        let _timer = time_histogram!(metrics::REPLAY_DURATION);

        let filter = match ctx.tenant_opt() {
            Some(tenant) => TenantSubjectBuilder::new(tenant.clone()).workflow_all(workflow_id)?,
            None => SubjectBuilder::workflow_all(workflow_id)?,
        };

        let span = self.tracing.replay_span(workflow_id);
        let records = self
            .bounded(
                ctx,
                "replay",
                self.transport.read_all(streams::MESSAGES.name, filter.as_str()),
            )
            .instrument(span)
            .await?;

        let total = records.len();
        let mut messages = Vec::with_capacity(total);
        for record in records {
            let decoded = CanonicalSerializer::deserialize(&record.payload)
                .and_then(|msg| CanonicalSerializer::validate_hash(&msg).map(|()| msg));
            match decoded {
                Ok(msg) if msg.timestamp >= from => messages.push(msg),
                Ok(_) => {}
                Err(e) => {
                    if e.is_integrity() {
                        metrics::INTEGRITY_FAILURES
                            .with_label_values(&[streams::MESSAGES.name])
                            .inc();
                    }
                    warn!(
                        subject = %record.subject,
                        sequence = record.sequence,
                        error = %e,
                        "Skipping unreadable record during replay"
                    );
                }
            }
        }
        messages.sort_by_key(|m| m.timestamp);

        debug!(
            workflow_id = workflow_id,
            filter = %filter,
            scanned = total,
            returned = messages.len(),
            "Replay complete"
        );
        Ok(messages)
    }

    /// Records moved to the dead-letter queue, oldest first.
    pub async fn dead_letters(&self, ctx: &BusContext) -> Result<Vec<DeadLetter>, BusError> {
        self.ensure_open()?;
        ctx.ensure_active()?;

        let records = self
            .bounded(
                ctx,
                "dead_letters",
                self.transport.read_all(streams::SYSTEM.name, DLQ_SUBJECT),
            )
            .await?;

        let mut letters = Vec::with_capacity(records.len());
        for record in records {
            match DeadLetter::from_bytes(&record.payload) {
                Ok(letter) => letters.push(letter),
                Err(e) => warn!(
                    sequence = record.sequence,
                    error = %e,
                    "Skipping unreadable dead letter"
                ),
            }
        }
        Ok(letters)
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Stop all subscriptions, wait for in-flight handlers, and release the
    /// connection. Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        self.tasks.close();
        if tokio::time::timeout(self.config.request_timeout, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.tasks.len(),
                "Dispatch tasks still running at close"
            );
        }

        let result = self.transport.close().await;
        self.state.set(ConnectionState::Closed);
        info!(transport = self.transport.name(), "Message bus closed");
        result
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Stream of connection state changes, starting with the current state.
    pub fn state_changes(&self) -> WatchStream<ConnectionState> {
        WatchStream::new(self.state.subscribe())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> BusStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.is_closed() {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_tenant(
        &self,
        ctx: &BusContext,
        subject: &str,
        operation: &'static str,
    ) -> Result<(), BusError> {
        tenant::check_access(ctx, subject, operation).map_err(|e| {
            self.stats.record_rejected();
            BusError::from(e)
        })?;
        Ok(())
    }

    /// Tenant rules for subscription patterns.
    ///
    /// A wildcard in the tenant position spans tenants and is refused to
    /// every caller. A pattern that names a tenant, or that lies on a
    /// tenant-prefixed route, must name the caller's tenant.
    fn check_pattern_scope(
        &self,
        ctx: &BusContext,
        pattern: &SubjectPattern,
    ) -> Result<(), BusError> {
        let leading_wildcard = matches!(pattern.as_str().split('.').next(), Some("*" | ">"));
        if leading_wildcard {
            let err = match ctx.tenant_opt() {
                Some(_) => TenantScopeError::InvalidFormat {
                    subject: pattern.to_string(),
                    reason: "wildcard in tenant position".to_string(),
                },
                None => TenantScopeError::MissingTenant,
            };
            self.stats.record_rejected();
            metrics::TENANT_REJECTIONS
                .with_label_values(&["subscribe"])
                .inc();
            mesh_telemetry::log_security_event!(
                "Cross-tenant wildcard subscription rejected",
                subject = %pattern,
                error = %err
            );
            return Err(err.into());
        }
        if pattern.is_tenant_scoped() || streams::is_tenant_filter(pattern) {
            return self.check_tenant(ctx, pattern.as_str(), "subscribe");
        }
        Ok(())
    }

    /// Bound `fut` by the request timeout, the caller's context and bus shutdown.
    async fn bounded<T>(
        &self,
        ctx: &BusContext,
        operation: &'static str,
        fut: impl Future<Output = Result<T, BusError>>,
    ) -> Result<T, BusError> {
        let after = self.config.request_timeout;
        ctx.run(async {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Err(BusError::Closed),
                result = tokio::time::timeout(after, fut) => result
                    .map_err(|_| BusError::Timeout { operation, after })
                    .and_then(|inner| inner),
            }
        })
        .await
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn provision(
    transport: &dyn LogTransport,
    spec: &StreamSpec,
    config: &BusConfig,
) -> Result<(), BusError> {
    tokio::time::timeout(config.request_timeout, transport.ensure_stream(spec))
        .await
        .map_err(|_| BusError::Timeout {
            operation: "provision stream",
            after: config.request_timeout,
        })?
}

/// Initial attempt plus `max_reconnect` retries, with jittered backoff between.
async fn connect_with_retry(
    config: &BusConfig,
    state: &StateCell,
) -> Result<Arc<dyn LogTransport>, BusError> {
    let policy = config.backoff();
    let attempts = config.max_reconnect.saturating_add(1);
    let mut last_transport_error = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = policy.delay(attempt - 1);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying log connection");
            tokio::time::sleep(delay).await;
        }

        state.set(ConnectionState::Connecting);
        let outcome =
            tokio::time::timeout(config.connect_timeout, transport::open(config, state.clone()))
                .await;
        match outcome {
            Ok(Ok(transport)) => {
                metrics::CONNECTION_ATTEMPTS
                    .with_label_values(&["success"])
                    .inc();
                return Ok(transport);
            }
            Ok(Err(BusError::Timeout { .. })) | Err(_) => {
                metrics::CONNECTION_ATTEMPTS
                    .with_label_values(&["timeout"])
                    .inc();
                warn!(attempt = attempt + 1, of = attempts, url = %config.url, "Connection attempt timed out");
            }
            Ok(Err(e)) => {
                metrics::CONNECTION_ATTEMPTS
                    .with_label_values(&["failed"])
                    .inc();
                warn!(attempt = attempt + 1, of = attempts, url = %config.url, error = %e, "Connection attempt failed");
                last_transport_error = Some(e);
            }
        }
        state.set(ConnectionState::Disconnected);
    }

    error!(url = %config.url, attempts, "Giving up on log connection");
    Err(last_transport_error.unwrap_or(BusError::Timeout {
        operation: "connect",
        after: config.connect_timeout,
    }))
}
