//! # Resilience
//!
//! Connection loss, consumer restarts and brokers that never answer.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use futures::StreamExt;
    use mesh_bus::{BusConfig, BusContext, BusError, ConnectionState, MessageBus};
    use mesh_telemetry::NoopTracing;
    use mesh_types::Message;

    use crate::fixtures::{assert_silent, attached_bus, collector, memory_bus, recv};

    #[tokio::test]
    async fn test_outage_is_reported_and_delivery_resumes() {
        let (producer, log) = memory_bus().await;
        let (consumer, consumer_link) = attached_bus(&log, BusConfig::in_memory()).await;
        let ctx = BusContext::new();
        let mut states = consumer.state_changes();
        assert_eq!(states.next().await, Some(ConnectionState::Connected));

        let (handler, mut rx) = collector();
        let _sub = consumer.subscribe(&ctx, "agents.ops.in", handler).await.unwrap();

        consumer_link.set_available(false);
        assert_eq!(states.next().await, Some(ConnectionState::Reconnecting));

        // The outage is the consumer's; the producer keeps writing
        let err = consumer
            .publish(&ctx, "agents.ops.in", Message::event("consumer", "ops"))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Transport(_)));
        assert!(err.is_retryable());

        let queued = Message::event("producer", "ops");
        let queued_id = queued.id.clone();
        producer.publish(&ctx, "agents.ops.in", queued).await.unwrap();
        assert_silent(&mut rx, Duration::from_millis(150)).await;

        consumer_link.set_available(true);
        assert_eq!(states.next().await, Some(ConnectionState::Connected));
        assert_eq!(recv(&mut rx).await.id, queued_id);
    }

    #[tokio::test]
    async fn test_restarted_consumer_resumes_its_cursor() {
        let (producer, log) = memory_bus().await;
        let ctx = BusContext::new();

        let (first, _link) = attached_bus(&log, BusConfig::in_memory()).await;
        let (handler, mut rx) = collector();
        let _sub = first
            .subscribe_durable(&ctx, "workflows.*.in", "billing", handler)
            .await
            .unwrap();
        let seen = Message::event("a", "wf-1");
        let seen_id = seen.id.clone();
        producer.publish(&ctx, "workflows.wf-1.in", seen).await.unwrap();
        assert_eq!(recv(&mut rx).await.id, seen_id);
        first.close().await.unwrap();

        let mut missed = Vec::new();
        for wf in ["wf-2", "wf-3"] {
            let msg = Message::event("a", wf);
            missed.push(msg.id.clone());
            producer
                .publish(&ctx, &format!("workflows.{wf}.in"), msg)
                .await
                .unwrap();
        }

        let (second, _link) = attached_bus(&log, BusConfig::in_memory()).await;
        let (handler, mut rx) = collector();
        let _sub = second
            .subscribe_durable(&ctx, "workflows.*.in", "billing", handler)
            .await
            .unwrap();
        for id in missed {
            assert_eq!(recv(&mut rx).await.id, id);
        }
        assert_silent(&mut rx, Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn test_cancelling_one_subscription_leaves_others_running() {
        let (bus, _log) = memory_bus().await;
        let doomed_ctx = BusContext::new();
        let steady_ctx = BusContext::new();

        let (doomed, mut doomed_rx) = collector();
        let (steady, mut steady_rx) = collector();
        let doomed_sub = bus
            .subscribe_durable(&doomed_ctx, "system.health", "doomed", doomed)
            .await
            .unwrap();
        let _steady_sub = bus
            .subscribe_durable(&steady_ctx, "system.health", "steady", steady)
            .await
            .unwrap();

        doomed_ctx.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!doomed_sub.is_active());

        let ping = Message::control("monitor", "mesh");
        let ping_id = ping.id.clone();
        bus.publish(&steady_ctx, "system.health", ping).await.unwrap();

        assert_eq!(recv(&mut steady_rx).await.id, ping_id);
        assert_silent(&mut doomed_rx, Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn test_memory_url_connects_through_the_front_door() {
        let bus = MessageBus::connect(BusConfig::in_memory(), Arc::new(NoopTracing))
            .await
            .unwrap();
        assert_eq!(bus.state(), ConnectionState::Connected);

        bus.close().await.unwrap();
        let mut states = bus.state_changes();
        assert_eq!(states.next().await, Some(ConnectionState::Closed));
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_within_bounds() {
        let config = BusConfig {
            url: "nats://127.0.0.1:1".to_string(),
            max_reconnect: 2,
            reconnect_wait: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(1),
            ..BusConfig::default()
        };
        let started = Instant::now();
        let result = MessageBus::connect(config, Arc::new(NoopTracing)).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(BusError::Transport(_))), "{result:?}");
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(10), "took {elapsed:?}");
    }
}
