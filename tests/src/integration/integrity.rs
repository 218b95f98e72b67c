//! # Envelope Integrity
//!
//! A rogue writer with raw access to the log appends records that were
//! altered after sealing, or that are not messages at all. Consumers in
//! another process must never hand them to application code, and must move
//! them to the dead-letter queue once redelivery is exhausted.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::{Duration as ChronoDuration, Utc};
    use mesh_bus::{
        BusConfig, BusContext, FailureKind, LogTransport, MemoryLog, MessageBus, DLQ_SUBJECT,
    };
    use mesh_telemetry::NoopTracing;
    use mesh_types::{canonical::to_canonical_vec, CanonicalSerializer, Message};
    use serde_json::json;

    use crate::fixtures::{assert_silent, attached_bus, collector, memory_bus_with, recv, wait_until};

    fn strict_config() -> BusConfig {
        BusConfig {
            max_deliver: 2,
            ..BusConfig::in_memory()
        }
    }

    async fn strict_bus() -> (MessageBus, MemoryLog) {
        memory_bus_with(strict_config(), Arc::new(NoopTracing)).await
    }

    /// A sealed message whose payload was rewritten afterwards.
    fn forged(from: &str, to: &str) -> Bytes {
        let mut msg = Message::request(from, to).with_payload(json!({ "amount": 10 }));
        msg.seal().unwrap();
        msg.payload = json!({ "amount": 10_000_000 });
        Bytes::from(to_canonical_vec(&msg).unwrap())
    }

    #[tokio::test]
    async fn test_forged_record_is_dead_lettered_not_delivered() {
        let (producer, log) = strict_bus().await;
        let (consumer, _handle) = attached_bus(&log, strict_config()).await;
        let rogue = log.attach();
        let ctx = BusContext::new();

        let (handler, mut rx) = collector();
        let _sub = consumer
            .subscribe(&ctx, "agents.treasury.in", handler)
            .await
            .unwrap();

        rogue
            .append("agents.treasury.in", forged("mallory", "treasury"))
            .await
            .unwrap();
        let honest = Message::request("alice", "treasury").with_payload(json!({ "amount": 10 }));
        let honest_id = honest.id.clone();
        producer
            .publish(&ctx, "agents.treasury.in", honest)
            .await
            .unwrap();

        assert_eq!(recv(&mut rx).await.id, honest_id);
        assert_silent(&mut rx, Duration::from_millis(200)).await;
        assert!(wait_until(Duration::from_secs(3), || consumer.stats().dead_lettered == 1).await);

        // Visible from any process sharing the log
        let letters = producer.dead_letters(&ctx).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].kind, FailureKind::Integrity);
        assert_eq!(letters[0].subject, "agents.treasury.in");
        assert_eq!(letters[0].deliveries, 2);
        assert!(letters[0].payload.contains("10000000"));
    }

    #[tokio::test]
    async fn test_dead_letter_subscribers_do_not_loop() {
        let (bus, log) = strict_bus().await;
        let ctx = BusContext::new();

        let (handler, _rx) = collector();
        let _poisoned = bus.subscribe(&ctx, "agents.a.in", handler).await.unwrap();
        // Dead letters are not messages, so this subscriber can never decode them
        let (dlq_handler, mut dlq_rx) = collector();
        let _dlq = bus.subscribe(&ctx, DLQ_SUBJECT, dlq_handler).await.unwrap();

        log.append("agents.a.in", Bytes::from_static(b"{\"not\":\"a message\"}"))
            .await
            .unwrap();

        assert!(wait_until(Duration::from_secs(3), || bus.stats().dead_lettered == 1).await);
        assert_silent(&mut dlq_rx, Duration::from_millis(300)).await;
        assert_eq!(bus.stats().dead_lettered, 1);
        assert_eq!(log.record_count("SYSTEM"), 1);

        let letters = bus.dead_letters(&ctx).await.unwrap();
        assert_eq!(letters[0].kind, FailureKind::Decode);
    }

    #[tokio::test]
    async fn test_replay_skips_forged_history() {
        let (bus, log) = strict_bus().await;
        let ctx = BusContext::new();
        let since = Utc::now() - ChronoDuration::seconds(1);

        bus.publish(&ctx, "workflows.wf-9.in", Message::event("a", "wf-9"))
            .await
            .unwrap();
        log.append("workflows.wf-9.in", forged("mallory", "wf-9"))
            .await
            .unwrap();
        bus.publish(&ctx, "workflows.wf-9.out", Message::event("wf-9", "a"))
            .await
            .unwrap();

        let history = bus.replay(&ctx, "wf-9", since).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|m| m.validate_hash().is_ok()));
        assert!(history.iter().all(|m| m.from != "mallory"));
    }

    #[tokio::test]
    async fn test_sealed_bytes_survive_the_log_unchanged() {
        let (bus, log) = strict_bus().await;
        let ctx = BusContext::new();

        let mut msg = Message::request("agent-1", "agent-2")
            .with_payload(json!({ "z": 1, "a": { "y": [3, 2, 1], "b": null } }));
        msg.seal().unwrap();
        let receipt = bus.publish(&ctx, "agents.agent-2.in", msg.clone()).await.unwrap();
        assert_eq!(receipt.envelope_hash, msg.envelope_hash);

        let records = log.read_all("MESSAGES", "agents.agent-2.in").await.unwrap();
        assert_eq!(records.len(), 1);
        let expected = CanonicalSerializer::serialize(&msg).unwrap();
        assert_eq!(records[0].payload.as_ref(), expected.as_slice());

        let decoded = CanonicalSerializer::deserialize(&records[0].payload).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.validate_hash().is_ok());
    }
}
