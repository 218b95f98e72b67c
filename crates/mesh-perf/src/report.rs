//! Run results and latency statistics.

use std::time::Duration;

use serde::Serialize;

/// Outcome of one harness run. Serialized as the CLI's JSON output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerfReport {
    pub pairs: usize,
    /// Requests accepted by the bus
    pub sent: u64,
    /// Echoes matched to their request
    pub received: u64,
    /// Failed publishes plus echoes that never arrived
    pub errors: u64,
    pub elapsed_ms: f64,
    /// Completed round trips per second
    pub throughput_per_sec: f64,
    /// `None` when no round trip completed
    pub latency: Option<LatencySummary>,
}

impl PerfReport {
    pub(crate) fn build(
        pairs: usize,
        sent: u64,
        received: u64,
        errors: u64,
        elapsed: Duration,
        mut samples: Vec<Duration>,
    ) -> Self {
        let secs = elapsed.as_secs_f64();
        let throughput_per_sec = if secs > 0.0 {
            received as f64 / secs
        } else {
            0.0
        };
        Self {
            pairs,
            sent,
            received,
            errors,
            elapsed_ms: secs * 1_000.0,
            throughput_per_sec,
            latency: LatencySummary::from_samples(&mut samples),
        }
    }
}

/// Round-trip latency distribution, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub min_us: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p90_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

impl LatencySummary {
    /// Sorts `samples` in place. Returns `None` for an empty slice.
    pub fn from_samples(samples: &mut [Duration]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();
        let sorted: &[Duration] = samples;

        let total: Duration = sorted.iter().sum();
        let at = |pct: f64| percentile(sorted, pct).map_or(0, micros);

        Some(Self {
            samples: sorted.len(),
            min_us: micros(sorted[0]),
            mean_us: total.as_secs_f64() * 1e6 / sorted.len() as f64,
            p50_us: at(50.0),
            p90_us: at(90.0),
            p95_us: at(95.0),
            p99_us: at(99.0),
            max_us: micros(sorted[sorted.len() - 1]),
        })
    }
}

/// Nearest-rank percentile of an ascending slice.
///
/// The value at rank `ceil(pct * n / 100)`, clamped to `1..=n`.
pub fn percentile(sorted: &[Duration], pct: f64) -> Option<Duration> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = (pct * n as f64 / 100.0).ceil() as usize;
    Some(sorted[rank.clamp(1, n) - 1])
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}
