//! # Ping-Pong Harness
//!
//! Each pair is two agents on the bus. The pinger publishes a request to
//! `agents.<pong>.in`, the ponger echoes the payload back to
//! `agents.<ping>.in`, and the pinger waits for that echo before sending the
//! next request. One request in flight per pair keeps the loop closed, so the
//! measured latency is the full publish → deliver → republish → deliver path.
//!
//! ```text
//!   pinger ──request──► agents.<pong>.in ──► echo handler
//!     ▲                                            │
//!     └── reply channel ◄── agents.<ping>.in ◄─────┘
//! ```
//!
//! Samples flow to a single channel and are only read once every pinger has
//! stopped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mesh_bus::{handler_fn, BusContext, MessageBus, MessageHandler, SubjectBuilder};
use mesh_types::{Message, MessageId};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::PerfConfig;
use crate::report::PerfReport;
use crate::PerfError;

/// Payload key carrying the per-pair round-trip number.
const SEQ_KEY: &str = "seq";

/// Pause after a retryable publish failure.
const RETRY_PAUSE: Duration = Duration::from_millis(50);

/// Drives closed-loop ping-pong traffic over a [`MessageBus`].
pub struct PerformanceHarness {
    bus: Arc<MessageBus>,
    config: PerfConfig,
    ctx: BusContext,
}

impl PerformanceHarness {
    pub fn new(bus: Arc<MessageBus>, config: PerfConfig) -> Result<Self, PerfError> {
        config.validate()?;
        Ok(Self {
            bus,
            config,
            ctx: BusContext::new(),
        })
    }

    /// Run under `ctx`; cancelling it stops the pingers early.
    #[must_use]
    pub fn with_context(mut self, ctx: BusContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn config(&self) -> &PerfConfig {
        &self.config
    }

    /// Run until the message count or the duration is reached.
    ///
    /// Agent names are unique per run, so durable consumers left in the log
    /// by an earlier run never see this run's traffic.
    pub async fn run(&self) -> Result<PerfReport, PerfError> {
        let run_id = MessageId::generate().to_lowercase();
        let counters = Arc::new(Counters::default());
        let budget = Arc::new(Budget::new(self.config.messages));
        let (sample_tx, mut sample_rx) = mpsc::unbounded_channel();
        let padding = "x".repeat(self.config.payload_bytes);

        let mut subscriptions = Vec::with_capacity(self.config.pairs * 2);
        let mut pingers = Vec::with_capacity(self.config.pairs);
        for pair in 0..self.config.pairs {
            let ping = format!("perf-{run_id}-ping-{pair}");
            let pong = format!("perf-{run_id}-pong-{pair}");
            let ping_subject = SubjectBuilder::agent_in(&ping)?.to_string();
            let pong_subject = SubjectBuilder::agent_in(&pong)?.to_string();

            let echo = echo_handler(Arc::clone(&self.bus), ping_subject.clone());
            subscriptions.push(self.bus.subscribe(&self.ctx, &pong_subject, echo).await?);

            let (reply_tx, reply_rx) = mpsc::unbounded_channel();
            let replies = reply_handler(reply_tx);
            subscriptions.push(self.bus.subscribe(&self.ctx, &ping_subject, replies).await?);

            pingers.push(Pinger {
                bus: Arc::clone(&self.bus),
                ctx: self.ctx.clone(),
                from: ping,
                to: pong,
                target: pong_subject,
                replies: reply_rx,
                samples: sample_tx.clone(),
                budget: Arc::clone(&budget),
                counters: Arc::clone(&counters),
                reply_timeout: self.config.reply_timeout,
                padding: padding.clone(),
            });
        }
        drop(sample_tx);

        info!(
            run = %run_id,
            pairs = self.config.pairs,
            messages = self.config.messages,
            duration = ?self.config.duration,
            "Starting ping-pong run"
        );

        let started = Instant::now();
        let deadline = self.config.duration.map(|d| started + d);
        let mut tasks = JoinSet::new();
        for pinger in pingers {
            tasks.spawn(pinger.run(deadline));
        }
        let mut joined = Ok(());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                joined = Err(PerfError::Task(e.to_string()));
            }
        }
        let elapsed = started.elapsed();

        for subscription in subscriptions {
            subscription.unsubscribe().await;
        }
        joined?;

        let mut samples = Vec::new();
        while let Some(sample) = sample_rx.recv().await {
            samples.push(sample);
        }

        let report = PerfReport::build(
            self.config.pairs,
            counters.sent.load(Ordering::Relaxed),
            counters.received.load(Ordering::Relaxed),
            counters.errors.load(Ordering::Relaxed),
            elapsed,
            samples,
        );
        info!(
            run = %run_id,
            sent = report.sent,
            received = report.received,
            errors = report.errors,
            throughput = report.throughput_per_sec,
            p99_us = report.latency.map(|l| l.p99_us),
            "Ping-pong run complete"
        );
        Ok(report)
    }
}

/// Republishes every request's payload to `reply_to`.
fn echo_handler(bus: Arc<MessageBus>, reply_to: String) -> impl MessageHandler {
    handler_fn(move |ctx: BusContext, msg: Message| {
        let bus = Arc::clone(&bus);
        let reply_to = reply_to.clone();
        async move {
            let reply = Message::response(msg.to, msg.from).with_payload(msg.payload);
            bus.publish(&ctx, &reply_to, reply).await?;
            Ok::<_, anyhow::Error>(())
        }
    })
}

/// Forwards each echo's sequence number to the waiting pinger.
fn reply_handler(tx: mpsc::UnboundedSender<u64>) -> impl MessageHandler {
    handler_fn(move |_ctx: BusContext, msg: Message| {
        let tx = tx.clone();
        async move {
            match msg.payload.get(SEQ_KEY).and_then(|v| v.as_u64()) {
                Some(seq) => {
                    // The pinger may already have stopped
                    let _ = tx.send(seq);
                }
                None => debug!(message_id = %msg.id, "Echo without sequence number"),
            }
            Ok::<_, anyhow::Error>(())
        }
    })
}

// =============================================================================
// PINGER
// =============================================================================

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    errors: AtomicU64,
}

/// Round trips left to hand out across all pingers. `limit == 0` is unbounded.
struct Budget {
    limit: u64,
    claimed: AtomicU64,
}

impl Budget {
    fn new(limit: u64) -> Self {
        Self {
            limit,
            claimed: AtomicU64::new(0),
        }
    }

    fn claim(&self) -> bool {
        self.limit == 0 || self.claimed.fetch_add(1, Ordering::Relaxed) < self.limit
    }
}

struct Pinger {
    bus: Arc<MessageBus>,
    ctx: BusContext,
    from: String,
    to: String,
    target: String,
    replies: mpsc::UnboundedReceiver<u64>,
    samples: mpsc::UnboundedSender<Duration>,
    budget: Arc<Budget>,
    counters: Arc<Counters>,
    reply_timeout: Duration,
    padding: String,
}

impl Pinger {
    async fn run(mut self, deadline: Option<Instant>) {
        let mut seq = 0u64;
        loop {
            if self.ctx.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            if !self.budget.claim() {
                break;
            }
            seq += 1;

            let request = Message::request(self.from.as_str(), self.to.as_str())
                .with_payload(json!({ SEQ_KEY: seq, "pad": self.padding }));
            let sent_at = Instant::now();
            if let Err(e) = self.bus.publish(&self.ctx, &self.target, request).await {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(pinger = %self.from, error = %e, "Ping publish failed");
                if !e.is_retryable() {
                    break;
                }
                tokio::time::sleep(RETRY_PAUSE).await;
                continue;
            }
            self.counters.sent.fetch_add(1, Ordering::Relaxed);

            if self.await_reply(seq).await {
                self.counters.received.fetch_add(1, Ordering::Relaxed);
                // The receiver outlives every pinger
                let _ = self.samples.send(sent_at.elapsed());
            } else if self.ctx.is_cancelled() {
                break;
            } else {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(pinger = %self.from, seq, "Echo did not arrive in time");
            }
        }
        debug!(pinger = %self.from, rounds = seq, "Pinger stopped");
    }

    /// Wait for the echo of `seq`, discarding late echoes of earlier rounds.
    async fn await_reply(&mut self, seq: u64) -> bool {
        let replies = &mut self.replies;
        let matched = async {
            while let Some(got) = replies.recv().await {
                if got == seq {
                    return true;
                }
            }
            false
        };
        tokio::select! {
            biased;
            _ = self.ctx.cancellation().cancelled() => false,
            result = tokio::time::timeout(self.reply_timeout, matched) => result.unwrap_or(false),
        }
    }
}
