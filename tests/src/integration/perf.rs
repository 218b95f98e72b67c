//! # Performance Harness
//!
//! The ping-pong harness driving a real bus end to end.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use mesh_bus::{BusConfig, BusContext};
    use mesh_perf::{PerfConfig, PerformanceHarness};
    use mesh_telemetry::OtelTracing;

    use crate::fixtures::{memory_bus, memory_bus_with};

    #[tokio::test]
    async fn test_traced_run_reports_every_round_trip() {
        let (bus, log) =
            memory_bus_with(BusConfig::in_memory(), Arc::new(OtelTracing::new("perf"))).await;
        let bus = Arc::new(bus);
        let config = PerfConfig::default().with_pairs(3).with_messages(30);

        let report = PerformanceHarness::new(Arc::clone(&bus), config)
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(report.pairs, 3);
        assert_eq!((report.sent, report.received, report.errors), (30, 30, 0));
        assert!(report.throughput_per_sec > 0.0);
        assert_eq!(log.record_count("MESSAGES"), 60);

        let json = serde_json::to_value(&report).unwrap();
        for key in ["p50_us", "p90_us", "p95_us", "p99_us", "max_us", "mean_us", "min_us"] {
            assert!(json["latency"][key].is_number(), "missing {key}");
        }
    }

    #[tokio::test]
    async fn test_cancelled_context_ends_the_run_early() {
        let (bus, _log) = memory_bus().await;
        let ctx = BusContext::new();
        let config = PerfConfig::default()
            .with_pairs(2)
            .with_messages(0)
            .with_duration(Duration::from_secs(30));
        let harness = PerformanceHarness::new(Arc::new(bus), config)
            .unwrap()
            .with_context(ctx.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            ctx.cancel();
        });
        let report = tokio::time::timeout(Duration::from_secs(10), harness.run())
            .await
            .expect("cancelled run did not stop")
            .unwrap();
        canceller.await.unwrap();

        assert!(report.elapsed_ms < 10_000.0);
        assert!(report.received > 0);
    }
}
