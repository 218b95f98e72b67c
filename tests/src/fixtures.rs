//! Shared fixtures for integration flows.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mesh_bus::{handler_fn, BusConfig, BusContext, MemoryLog, MessageBus, MessageHandler};
use mesh_telemetry::{NoopTracing, TracingMiddleware};
use mesh_types::Message;
use tokio::sync::mpsc;

/// Default wait for a delivery that is expected to arrive.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(3);

/// A bus over a fresh in-process log, plus a handle to that log.
pub async fn memory_bus() -> (MessageBus, MemoryLog) {
    memory_bus_with(BusConfig::in_memory(), Arc::new(NoopTracing)).await
}

pub async fn memory_bus_with(
    config: BusConfig,
    tracing: Arc<dyn TracingMiddleware>,
) -> (MessageBus, MemoryLog) {
    let log = MemoryLog::new();
    let bus = MessageBus::with_transport(Arc::new(log.clone()), config, tracing)
        .await
        .expect("memory bus");
    (bus, log)
}

/// Another process's bus: its own connection onto the same log.
pub async fn attached_bus(log: &MemoryLog, config: BusConfig) -> (MessageBus, MemoryLog) {
    let handle = log.attach();
    let bus = MessageBus::with_transport(Arc::new(handle.clone()), config, Arc::new(NoopTracing))
        .await
        .expect("attached bus");
    (bus, handle)
}

/// Handler that forwards every delivered message to a channel.
pub fn collector() -> (impl MessageHandler, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |_ctx: BusContext, msg: Message| {
        let tx = tx.clone();
        async move {
            tx.send(msg)?;
            Ok::<_, anyhow::Error>(())
        }
    });
    (handler, rx)
}

pub async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(DELIVERY_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("collector dropped")
}

/// Assert nothing arrives within `window`.
pub async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Message>, window: Duration) {
    if let Ok(Some(msg)) = tokio::time::timeout(window, rx.recv()).await {
        panic!("unexpected delivery: {} from {}", msg.id, msg.from);
    }
}

/// Poll `condition` until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
