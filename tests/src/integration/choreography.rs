//! # Agent Choreography
//!
//! A planner hands a task to a worker over tenant-scoped agent subjects. The
//! worker answers on the planner's inbox and records progress on the
//! workflow's outbound subject. Replay then reconstructs the workflow trail.
//!
//! ```text
//! planner ──request──► <tenant>.agents.worker.in
//!                              │
//!                              ├──response──► <tenant>.agents.planner.in
//!                              └──events────► <tenant>.workflows.wf-7.out
//! ```

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{Duration as ChronoDuration, Utc};
    use mesh_bus::{
        handler_fn, BusConfig, BusContext, Direction, MessageBus, TenantId, TenantSubjectBuilder,
    };
    use mesh_telemetry::{OtelTracing, PropagatedContext};
    use mesh_types::{Cost, Message, MessageType};
    use serde_json::json;

    use crate::fixtures::{collector, memory_bus, memory_bus_with, recv, wait_until};

    const WORKFLOW: &str = "wf-7";

    /// Worker that answers every request and logs two workflow events.
    async fn spawn_worker(
        bus: &Arc<MessageBus>,
        ctx: &BusContext,
        subjects: &TenantSubjectBuilder,
    ) -> mesh_bus::Subscription {
        let inbox = subjects.agent("worker", Direction::In).unwrap();
        let reply_to = subjects.agent("planner", Direction::In).unwrap().to_string();
        let trail = subjects.workflow(WORKFLOW, Direction::Out).unwrap().to_string();

        let worker_bus = Arc::clone(bus);
        let handler = handler_fn(move |ctx: BusContext, request: Message| {
            let bus = Arc::clone(&worker_bus);
            let reply_to = reply_to.clone();
            let trail = trail.clone();
            async move {
                for step in ["started", "finished"] {
                    let event = Message::event("worker", WORKFLOW)
                        .with_payload(json!({ "step": step, "request": request.id }));
                    bus.publish(&ctx, &trail, event).await?;
                }

                let mut reply = Message::response("worker", request.from.as_str())
                    .with_payload(json!({ "result": "summary ready" }))
                    .with_metadata("in_reply_to", json!(request.id))
                    .with_cost(Cost::new(120, 0.0024));
                PropagatedContext::from_message(&request).inject_into(&mut reply);
                bus.publish(&ctx, &reply_to, reply).await?;
                Ok::<_, anyhow::Error>(())
            }
        });

        bus.subscribe(ctx, inbox.as_str(), handler).await.unwrap()
    }

    #[tokio::test]
    async fn test_request_response_and_workflow_replay() {
        let (bus, _log) = memory_bus().await;
        let bus = Arc::new(bus);
        let tenant = TenantId::generate();
        let ctx = BusContext::for_tenant(tenant.clone());
        let subjects = TenantSubjectBuilder::new(tenant);
        let started = Utc::now() - ChronoDuration::seconds(1);

        let _worker = spawn_worker(&bus, &ctx, &subjects).await;
        let (planner, mut replies) = collector();
        let _planner = bus
            .subscribe(
                &ctx,
                subjects.agent("planner", Direction::In).unwrap().as_str(),
                planner,
            )
            .await
            .unwrap();

        let request = Message::request("planner", "worker")
            .with_payload(json!({ "task": "summarize", "doc": "q3-report" }))
            .with_metadata("workflow_id", json!(WORKFLOW));
        let request_id = request.id.clone();
        bus.publish(
            &ctx,
            subjects.agent("worker", Direction::In).unwrap().as_str(),
            request,
        )
        .await
        .unwrap();

        let reply = recv(&mut replies).await;
        assert_eq!(reply.kind, MessageType::Response);
        assert_eq!(reply.from, "worker");
        assert_eq!(reply.to, "planner");
        assert_eq!(reply.metadata.get("in_reply_to"), Some(&json!(request_id)));
        assert!(reply.validate_hash().is_ok());

        let trail = bus.replay(&ctx, WORKFLOW, started).await.unwrap();
        let steps: Vec<_> = trail
            .iter()
            .map(|m| m.payload["step"].as_str().unwrap_or_default())
            .collect();
        assert_eq!(steps, ["started", "finished"]);
        assert!(trail.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_trace_context_follows_the_conversation() {
        let (bus, _log) =
            memory_bus_with(BusConfig::in_memory(), Arc::new(OtelTracing::new("choreography")))
                .await;
        let bus = Arc::new(bus);
        let tenant = TenantId::generate();
        let ctx = BusContext::for_tenant(tenant.clone());
        let subjects = TenantSubjectBuilder::new(tenant);

        // Tap the worker inbox with a second consumer to see the request as delivered
        let (tap, mut tapped) = collector();
        let _tap = bus
            .subscribe_durable(
                &ctx,
                subjects.agent("worker", Direction::In).unwrap().as_str(),
                "tap",
                tap,
            )
            .await
            .unwrap();
        let _worker = spawn_worker(&bus, &ctx, &subjects).await;
        let (planner, mut replies) = collector();
        let _planner = bus
            .subscribe(
                &ctx,
                subjects.agent("planner", Direction::In).unwrap().as_str(),
                planner,
            )
            .await
            .unwrap();

        bus.publish(
            &ctx,
            subjects.agent("worker", Direction::In).unwrap().as_str(),
            Message::request("planner", "worker"),
        )
        .await
        .unwrap();

        let request = recv(&mut tapped).await;
        let request_trace = PropagatedContext::from_message(&request);
        assert!(request_trace.is_valid());
        assert_eq!(request.trace_id.as_deref().map(str::len), Some(32));
        assert_eq!(request.span_id.as_deref().map(str::len), Some(16));
        // Trace context is sealed into the envelope
        assert!(request.validate_hash().is_ok());

        let reply = recv(&mut replies).await;
        let reply_trace = PropagatedContext::from_message(&reply);
        assert_eq!(reply_trace.trace_id, request_trace.trace_id);
        assert_ne!(reply_trace.span_id, request_trace.span_id);
    }

    #[tokio::test]
    async fn test_replay_window_excludes_earlier_history() {
        let (bus, _log) = memory_bus().await;
        let ctx = BusContext::new();
        let t0 = Utc::now();

        for (offset, step) in [(-60, "old"), (0, "a"), (1, "b"), (2, "c")] {
            let msg = Message::event("agent-1", WORKFLOW)
                .with_timestamp(t0 + ChronoDuration::seconds(offset))
                .with_payload(json!({ "step": step }));
            bus.publish(&ctx, "workflows.wf-7.in", msg).await.unwrap();
        }

        let replayed = bus
            .replay(&ctx, WORKFLOW, t0 - ChronoDuration::seconds(1))
            .await
            .unwrap();
        let steps: Vec<_> = replayed
            .iter()
            .map(|m| m.payload["step"].as_str().unwrap_or_default())
            .collect();
        assert_eq!(steps, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_concurrent_publishers_share_one_bus() {
        let (bus, _log) = memory_bus().await;
        let bus = Arc::new(bus);
        let ctx = BusContext::new();
        let (handler, mut rx) = collector();
        let _sub = bus.subscribe(&ctx, "agents.sink.in", handler).await.unwrap();

        let mut publishers = Vec::new();
        for p in 0..8 {
            let bus = Arc::clone(&bus);
            let ctx = ctx.clone();
            publishers.push(tokio::spawn(async move {
                for i in 0..25 {
                    let msg = Message::event(format!("producer-{p}"), "sink")
                        .with_payload(json!({ "i": i }));
                    bus.publish(&ctx, "agents.sink.in", msg).await.unwrap();
                }
            }));
        }
        for publisher in publishers {
            publisher.await.unwrap();
        }

        let mut received = 0;
        while received < 200 {
            recv(&mut rx).await;
            received += 1;
        }
        assert_eq!(bus.stats().published, 200);
        assert!(wait_until(Duration::from_secs(2), || bus.stats().acked == 200).await);
    }
}
