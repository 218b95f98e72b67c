//! mesh-perf: ping-pong latency and throughput for the agent mesh bus.
//!
//! Prints a JSON report on stdout. Logs go to stderr.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mesh_bus::{BusConfig, MessageBus};
use mesh_perf::{PerfConfig, PerformanceHarness};
use mesh_telemetry::{init_telemetry, NoopTracing, OtelTracing, TelemetryConfig, TracingMiddleware};

/// Closed-loop ping-pong benchmark for the message bus
#[derive(Parser, Debug)]
#[command(name = "mesh-perf")]
#[command(about = "Measure round-trip latency and throughput of the agent mesh bus")]
struct Args {
    /// Bus URL (`memory://` for the in-process log)
    #[arg(short, long, env = "MESH_BUS_URL", default_value = "memory://")]
    url: String,

    /// Concurrent ping/pong pairs
    #[arg(short, long, env = "MESH_PERF_PAIRS", default_value_t = 4)]
    pairs: usize,

    /// Round trips across all pairs (0 = until --duration)
    #[arg(short = 'n', long, env = "MESH_PERF_MESSAGES", default_value_t = 10_000)]
    messages: u64,

    /// Wall-clock limit in seconds
    #[arg(short, long, env = "MESH_PERF_DURATION_SECS")]
    duration: Option<u64>,

    /// Padding bytes per request
    #[arg(long, env = "MESH_PERF_PAYLOAD_BYTES", default_value_t = 256)]
    payload_bytes: usize,

    /// Echo deadline in milliseconds
    #[arg(long, env = "MESH_PERF_REPLY_TIMEOUT_MS", default_value_t = 5_000)]
    reply_timeout_ms: u64,

    /// Propagate trace context through every message
    #[arg(long)]
    trace: bool,

    /// Pretty-print the report
    #[arg(long)]
    pretty: bool,
}

impl Args {
    fn perf_config(&self) -> PerfConfig {
        PerfConfig {
            pairs: self.pairs,
            messages: self.messages,
            duration: self.duration.map(Duration::from_secs),
            payload_bytes: self.payload_bytes,
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _telemetry = init_telemetry(TelemetryConfig::for_component("perf"))?;

    let tracing: Arc<dyn TracingMiddleware> = if args.trace {
        Arc::new(OtelTracing::new("mesh-perf"))
    } else {
        Arc::new(NoopTracing)
    };
    let bus_config = BusConfig::from_env().with_url(args.url.clone());
    let bus = Arc::new(MessageBus::connect(bus_config, tracing).await?);

    let harness = PerformanceHarness::new(Arc::clone(&bus), args.perf_config())?;
    let report = harness.run().await;
    bus.close().await?;
    let report = report?;

    let json = if args.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{json}");
    Ok(())
}
