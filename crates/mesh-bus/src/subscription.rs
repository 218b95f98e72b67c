//! # Subscriptions
//!
//! A subscription is a durable consumer plus a dispatch task. For every
//! delivery the task runs:
//!
//! ```text
//! bytes ──decode──► Message ──validate hash──► handler (≤ ack_wait) ──► ack
//!          │                    │                      │
//!          └── nak ◄────────────┴──── nak ◄────────────┘ (error or timeout)
//! ```
//!
//! A record that fails to decode or validate never reaches the handler. On
//! its last allowed delivery a failing record is dead-lettered and
//! terminated instead of being naked again.
//!
//! Dropping a [`Subscription`] stops delivery; [`Subscription::unsubscribe`]
//! also waits for the in-flight handler to finish.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use mesh_telemetry::{log_message_event, log_security_event, metrics, time_histogram, TracingMiddleware};
use mesh_types::{CanonicalSerializer, CodecError, Message};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument};

use crate::context::BusContext;
use crate::dead_letter::{DeadLetter, FailureKind, DLQ_SUBJECT};
use crate::stats::BusStats;
use crate::transport::{Delivery, DeliveryStream, LogTransport};

/// Handles messages delivered to a subscription.
///
/// Returning `Ok` acknowledges the message; returning an error negatively
/// acknowledges it so the log redelivers it.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: BusContext, msg: Message) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler.
///
/// ```rust,ignore
/// bus.subscribe(&ctx, "agents.planner.in", handler_fn(|_ctx, msg| async move {
///     println!("{}", msg.id);
///     Ok(())
/// })).await?;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(BusContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(BusContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: BusContext, msg: Message) -> anyhow::Result<()> {
        (self.0)(ctx, msg).await
    }
}

/// Handle to an active subscription.
///
/// When dropped, delivery stops. The durable consumer and its cursor stay in
/// the log, so subscribing again under the same name resumes where this one
/// left off.
#[derive(Debug)]
pub struct Subscription {
    subject: String,
    consumer: String,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(
        subject: String,
        consumer: String,
        token: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            subject,
            consumer,
            token,
            task: Some(task),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Durable consumer name.
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled() && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop delivery and wait for the dispatch task to exit.
    pub async fn unsubscribe(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(subject = %self.subject, error = %e, "Dispatch task ended abnormally");
            }
        }
        debug!(subject = %self.subject, consumer = %self.consumer, "Unsubscribed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Per-subscription dispatch loop.
pub(crate) struct Dispatcher {
    pub subject: String,
    pub consumer: String,
    pub stream: &'static str,
    pub ctx: BusContext,
    pub handler: Arc<dyn MessageHandler>,
    pub tracing: Arc<dyn TracingMiddleware>,
    pub transport: Arc<dyn LogTransport>,
    pub stats: Arc<BusStats>,
    pub ack_wait: std::time::Duration,
    pub max_deliver: u32,
}

enum Outcome {
    Acked,
    Failed(FailureKind, String),
    Cancelled,
}

impl Dispatcher {
    /// Run until `stop` fires, the caller's context is cancelled, or the
    /// delivery stream ends.
    pub async fn run(self, mut deliveries: DeliveryStream, stop: CancellationToken) {
        metrics::ACTIVE_SUBSCRIPTIONS.inc();
        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = self.ctx.cancellation().cancelled() => break,
                next = deliveries.next() => next,
            };
            match next {
                Some(Ok(delivery)) => self.dispatch(delivery, &stop).await,
                Some(Err(e)) => {
                    warn!(subject = %self.subject, error = %e, "Delivery stream error");
                }
                None => {
                    debug!(subject = %self.subject, "Delivery stream ended");
                    break;
                }
            }
        }
        metrics::ACTIVE_SUBSCRIPTIONS.dec();
    }

    async fn dispatch(&self, delivery: Delivery, stop: &CancellationToken) {
        self.stats.record_delivered();

        let msg = match self.decode(&delivery.payload) {
            Ok(msg) => msg,
            Err(e) => {
                let kind = if e.is_integrity() {
                    FailureKind::Integrity
                } else {
                    FailureKind::Decode
                };
                self.reject(delivery, kind, e.to_string()).await;
                return;
            }
        };

        let span = self.tracing.consume_span(&delivery.subject, &msg);
        let outcome = self.invoke(msg.clone(), stop).instrument(span).await;

        match outcome {
            Outcome::Acked => {
                metrics::DELIVERIES.with_label_values(&["acked"]).inc();
                self.stats.record_acked();
                if let Err(e) = delivery.ack().await {
                    warn!(subject = %self.subject, error = %e, "Ack failed; record will be redelivered");
                }
            }
            Outcome::Failed(kind, reason) => {
                log_message_event!(
                    warn,
                    &msg,
                    "Handler failed",
                    subject = %delivery.subject,
                    attempt = delivery.attempt,
                    error = %reason
                );
                self.reject(delivery, kind, reason).await;
            }
            Outcome::Cancelled => {
                // Hand the record back so another consumer instance can take it
                if let Err(e) = delivery.nak(None).await {
                    debug!(error = %e, "Nak on shutdown failed");
                }
            }
        }
    }

    fn decode(&self, payload: &Bytes) -> Result<Message, CodecError> {
        let msg = CanonicalSerializer::deserialize(payload)?;
        CanonicalSerializer::validate_hash(&msg)?;
        Ok(msg)
    }

    async fn invoke(&self, msg: Message, stop: &CancellationToken) -> Outcome {
        let _timer = time_histogram!(metrics::HANDLER_DURATION);
        let handler_ctx = self.ctx.child();
        let run = tokio::time::timeout(self.ack_wait, self.handler.handle(handler_ctx, msg));

        tokio::select! {
            biased;
            _ = stop.cancelled() => Outcome::Cancelled,
            _ = self.ctx.cancellation().cancelled() => Outcome::Cancelled,
            result = run => match result {
                Ok(Ok(())) => Outcome::Acked,
                Ok(Err(e)) => Outcome::Failed(FailureKind::Handler, format!("{e:#}")),
                Err(_) => Outcome::Failed(
                    FailureKind::Timeout,
                    format!("handler exceeded ack wait of {:?}", self.ack_wait),
                ),
            },
        }
    }

    /// Nak a failed delivery, or dead-letter it on its last attempt.
    async fn reject(&self, delivery: Delivery, kind: FailureKind, reason: String) {
        let label = match kind {
            FailureKind::Decode => "nak_decode",
            FailureKind::Integrity => "nak_integrity",
            FailureKind::Handler => "nak_handler",
            FailureKind::Timeout => "nak_timeout",
        };

        match kind {
            FailureKind::Integrity => {
                metrics::INTEGRITY_FAILURES
                    .with_label_values(&[self.stream])
                    .inc();
                log_security_event!(
                    "Envelope hash mismatch; record withheld from handler",
                    subject = %delivery.subject,
                    sequence = delivery.sequence,
                    error = %reason
                );
            }
            FailureKind::Decode => {
                warn!(
                    subject = %delivery.subject,
                    sequence = delivery.sequence,
                    error = %reason,
                    "Undecodable record"
                );
            }
            FailureKind::Handler | FailureKind::Timeout => {}
        }

        if delivery.attempt >= self.max_deliver {
            if delivery.subject == DLQ_SUBJECT {
                // Dead letters are never dead-lettered again
                warn!(sequence = delivery.sequence, "Dropping unprocessable dead letter");
                if let Err(e) = delivery.term().await {
                    warn!(subject = %self.subject, error = %e, "Term failed");
                }
                return;
            }
            self.dead_letter(delivery, kind, reason).await;
            return;
        }

        metrics::DELIVERIES.with_label_values(&[label]).inc();
        self.stats.record_naked();
        if let Err(e) = delivery.nak(None).await {
            warn!(subject = %self.subject, error = %e, "Nak failed; record will be redelivered after ack wait");
        }
    }

    async fn dead_letter(&self, delivery: Delivery, kind: FailureKind, reason: String) {
        let letter = DeadLetter {
            subject: delivery.subject.clone(),
            consumer: self.consumer.clone(),
            sequence: delivery.sequence,
            deliveries: delivery.attempt,
            kind,
            error: reason,
            payload: String::from_utf8_lossy(&delivery.payload).into_owned(),
            dead_lettered_at: Utc::now(),
        };

        let written = match letter.to_bytes() {
            Ok(bytes) => self.transport.append(DLQ_SUBJECT, Bytes::from(bytes)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            // Leave the record naked so it is not lost
            error!(subject = %delivery.subject, error = %e, "Dead-letter write failed");
            if let Err(e) = delivery.nak(None).await {
                warn!(error = %e, "Nak after dead-letter failure failed");
            }
            return;
        }

        metrics::DELIVERIES.with_label_values(&["dead_lettered"]).inc();
        self.stats.record_dead_lettered();
        warn!(
            subject = %delivery.subject,
            sequence = delivery.sequence,
            deliveries = delivery.attempt,
            kind = kind.as_str(),
            "Record dead-lettered"
        );
        if let Err(e) = delivery.term().await {
            warn!(subject = %self.subject, error = %e, "Term failed");
        }
    }
}

/// Hex digits of the pattern digest appended to default consumer names.
const DURABLE_DIGEST_LEN: usize = 12;

/// Durable consumer name derived from a subject pattern.
///
/// `agents.*.in` becomes `mesh_agents_star_in_<digest>`. The readable part
/// is lossy (`*` and a literal `star` look alike), so the suffix is a digest
/// of the exact pattern and distinct patterns get distinct names.
pub fn durable_name_for(subject: &str) -> String {
    let mut name = String::with_capacity(subject.len() + DURABLE_DIGEST_LEN + 6);
    name.push_str("mesh_");
    for token in subject.split('.') {
        if !name.ends_with('_') {
            name.push('_');
        }
        match token {
            "*" => name.push_str("star"),
            ">" => name.push_str("all"),
            literal => name.extend(
                literal
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' }),
            ),
        }
    }
    let digest = hex::encode(Sha256::digest(subject.as_bytes()));
    name.push('_');
    name.push_str(&digest[..DURABLE_DIGEST_LEN]);
    name
}
