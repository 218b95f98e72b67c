//! # Tenant Isolation
//!
//! Two tenants share one bus and one log. Nothing either does may reach the
//! other: not publishes, not subscriptions, not replays.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{Duration as ChronoDuration, Utc};
    use mesh_bus::{
        extract_tenant, validate_subject_tenant_access, BusContext, BusError, Direction, TenantId,
        TenantScopeError, TenantSubjectBuilder,
    };
    use mesh_types::Message;
    use serde_json::json;

    use crate::fixtures::{assert_silent, collector, memory_bus, recv};

    struct Tenant {
        id: TenantId,
        ctx: BusContext,
        subjects: TenantSubjectBuilder,
    }

    fn tenant() -> Tenant {
        let id = TenantId::generate();
        Tenant {
            ctx: BusContext::for_tenant(id.clone()),
            subjects: TenantSubjectBuilder::new(id.clone()),
            id,
        }
    }

    #[tokio::test]
    async fn test_same_agent_name_in_two_tenants_stays_apart() {
        let (bus, _log) = memory_bus().await;
        let (a, b) = (tenant(), tenant());

        let (handler_a, mut inbox_a) = collector();
        let (handler_b, mut inbox_b) = collector();
        let subject_a = a.subjects.agent("assistant", Direction::In).unwrap();
        let subject_b = b.subjects.agent("assistant", Direction::In).unwrap();
        let _sub_a = bus.subscribe(&a.ctx, subject_a.as_str(), handler_a).await.unwrap();
        let _sub_b = bus.subscribe(&b.ctx, subject_b.as_str(), handler_b).await.unwrap();

        let msg = Message::request("user", "assistant").with_payload(json!({ "q": "balance?" }));
        let id = msg.id.clone();
        bus.publish(&a.ctx, subject_a.as_str(), msg).await.unwrap();

        assert_eq!(recv(&mut inbox_a).await.id, id);
        assert_silent(&mut inbox_b, Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_cross_tenant_operations_are_refused() {
        let (bus, _log) = memory_bus().await;
        let (a, b) = (tenant(), tenant());
        let subject_a = a.subjects.workflow("wf-1", Direction::In).unwrap();

        // Tenant B writing into tenant A's workflow
        let err = bus
            .publish(&b.ctx, subject_a.as_str(), Message::event("mallory", "wf-1"))
            .await
            .unwrap_err();
        match err {
            BusError::TenantScope(TenantScopeError::CrossTenant {
                subject_tenant,
                context_tenant,
            }) => {
                assert_eq!(subject_tenant, a.id.as_str());
                assert_eq!(context_tenant, b.id.as_str());
            }
            other => panic!("expected cross-tenant rejection, got {other:?}"),
        }

        // Tenant B listening on tenant A's traffic
        let (handler, _rx) = collector();
        let pattern = a.subjects.workflow_all("wf-1").unwrap();
        let err = bus
            .subscribe(&b.ctx, pattern.as_str(), handler)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::TenantScope(_)));

        // No tenant at all
        let err = bus
            .publish(&BusContext::new(), subject_a.as_str(), Message::event("x", "wf-1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::TenantScope(TenantScopeError::MissingTenant)
        ));

        // Wildcard in the tenant position
        let (handler, _rx) = collector();
        let err = bus
            .subscribe(&b.ctx, "*.workflows.wf-1.in", handler)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::TenantScope(_)));

        assert_eq!(bus.stats().rejected, 4);
        assert_eq!(bus.stats().published, 0);
    }

    #[tokio::test]
    async fn test_untenanted_caller_cannot_span_tenants() {
        let (bus, _log) = memory_bus().await;
        let a = tenant();

        let (handler, _rx) = collector();
        let err = bus
            .subscribe(&BusContext::new(), "*.agents.*.in", handler)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::TenantScope(TenantScopeError::MissingTenant)
        ));

        // A subject on a tenant route must carry a real tenant id
        let err = bus
            .publish(&a.ctx, "notatenant.agents.x.in", Message::event("x", "x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::TenantScope(TenantScopeError::InvalidFormat { .. })
        ));

        let subject = a.subjects.agent("secret", Direction::In).unwrap();
        bus.publish(&a.ctx, subject.as_str(), Message::event("x", "secret"))
            .await
            .unwrap();
        assert_eq!(bus.stats().rejected, 2);
        assert_eq!(bus.stats().published, 1);
    }

    #[tokio::test]
    async fn test_replay_only_returns_own_tenant_history() {
        let (bus, _log) = memory_bus().await;
        let (a, b) = (tenant(), tenant());
        let since = Utc::now() - ChronoDuration::seconds(5);

        for (t, count) in [(&a, 3), (&b, 2)] {
            let subject = t.subjects.workflow("shared-name", Direction::In).unwrap();
            for i in 0..count {
                let msg = Message::event("agent", "shared-name").with_payload(json!({ "i": i }));
                bus.publish(&t.ctx, subject.as_str(), msg).await.unwrap();
            }
        }
        // Untenanted traffic under the same workflow id
        bus.publish(
            &BusContext::new(),
            "workflows.shared-name.in",
            Message::event("agent", "shared-name"),
        )
        .await
        .unwrap();

        let history_a = bus.replay(&a.ctx, "shared-name", since).await.unwrap();
        let history_b = bus.replay(&b.ctx, "shared-name", since).await.unwrap();
        let history_global = bus
            .replay(&BusContext::new(), "shared-name", since)
            .await
            .unwrap();

        assert_eq!(history_a.len(), 3);
        assert_eq!(history_b.len(), 2);
        assert_eq!(history_global.len(), 1);
    }

    #[tokio::test]
    async fn test_untenanted_wildcards_do_not_see_tenant_traffic() {
        let (bus, _log) = memory_bus().await;
        let a = tenant();
        let (handler, mut rx) = collector();
        let _sub = bus
            .subscribe(&BusContext::new(), "agents.*.in", handler)
            .await
            .unwrap();

        let subject = a.subjects.agent("bot", Direction::In).unwrap();
        bus.publish(&a.ctx, subject.as_str(), Message::event("x", "bot"))
            .await
            .unwrap();
        assert_silent(&mut rx, Duration::from_millis(200)).await;

        bus.publish(&BusContext::new(), "agents.bot.in", Message::event("x", "bot"))
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await.to, "bot");
    }

    #[test]
    fn test_routing_helpers_agree_with_builder() {
        let a = tenant();
        let subject = a.subjects.tool("search", Direction::Out).unwrap();

        assert_eq!(extract_tenant(subject.as_str()).unwrap(), a.id);
        assert!(validate_subject_tenant_access(&a.ctx, subject.as_str()).is_ok());

        let b = tenant();
        assert!(matches!(
            validate_subject_tenant_access(&b.ctx, subject.as_str()),
            Err(TenantScopeError::CrossTenant { .. })
        ));
    }
}
