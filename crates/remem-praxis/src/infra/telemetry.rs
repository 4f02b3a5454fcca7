//! Telemetry
//!
//! Latency reservoirs for percentile reporting plus Prometheus collectors
//! that can be registered into a caller-owned registry.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use prometheus::{Histogram, HistogramOpts, HistogramVec, IntCounter, IntGauge, Registry};
use serde::{Deserialize, Serialize};

/// Samples kept per operation
pub const RESERVOIR_SIZE: usize = 1024;

/// Index-facing operations with tracked latency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexOp {
    Query,
    Insert,
    Evict,
}

impl IndexOp {
    fn label(&self) -> &'static str {
        match self {
            IndexOp::Query => "query",
            IndexOp::Insert => "insert",
            IndexOp::Evict => "evict",
        }
    }
}

/// Sliding window of the most recent latencies
#[derive(Debug, Default)]
struct LatencyReservoir {
    samples: Mutex<VecDeque<u64>>,
}

impl LatencyReservoir {
    fn record(&self, micros: u64) {
        let mut samples = self.samples.lock();
        if samples.len() == RESERVOIR_SIZE {
            samples.pop_front();
        }
        samples.push_back(micros);
    }

    fn summary(&self) -> LatencySummary {
        let mut sorted: Vec<u64> = self.samples.lock().iter().copied().collect();
        sorted.sort_unstable();
        LatencySummary {
            samples: sorted.len(),
            p50_us: percentile(&sorted, 0.50),
            p99_us: percentile(&sorted, 0.99),
        }
    }
}

/// Nearest-rank percentile of a sorted slice
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Latency percentiles for one operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub p50_us: u64,
    pub p99_us: u64,
}

/// Point-in-time metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub store_size: usize,
    pub query_latency: LatencySummary,
    pub insert_latency: LatencySummary,
    pub evict_latency: LatencySummary,
    pub eviction_count: u64,
    pub breakthrough_count: u64,
    pub index_inconsistencies: u64,
    pub loop_runs: u64,
    pub loop_failures: u64,
}

/// Engine metrics
pub struct RememMetrics {
    query: LatencyReservoir,
    insert: LatencyReservoir,
    evict: LatencyReservoir,
    pub op_duration_seconds: HistogramVec,
    pub query_candidates: Histogram,
    pub store_size: IntGauge,
    pub evictions_total: IntCounter,
    pub breakthroughs_total: IntCounter,
    pub index_inconsistencies_total: IntCounter,
    pub loop_runs_total: IntCounter,
    pub loop_failures_total: IntCounter,
}

impl RememMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            query: LatencyReservoir::default(),
            insert: LatencyReservoir::default(),
            evict: LatencyReservoir::default(),
            op_duration_seconds: HistogramVec::new(
                HistogramOpts::new(
                    "remem_index_op_duration_seconds",
                    "Index operation duration",
                )
                .buckets(vec![
                    0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5,
                ]),
                &["op"],
            )?,
            query_candidates: Histogram::with_opts(
                HistogramOpts::new(
                    "remem_query_candidates",
                    "Candidates gathered per scope query",
                )
                .buckets(prometheus::exponential_buckets(1.0, 2.0, 12)?),
            )?,
            store_size: IntGauge::new("remem_store_size", "Experiences currently stored")?,
            evictions_total: IntCounter::new(
                "remem_evictions_total",
                "Experiences evicted for capacity",
            )?,
            breakthroughs_total: IntCounter::new(
                "remem_breakthroughs_total",
                "Experiences promoted to the collective",
            )?,
            index_inconsistencies_total: IntCounter::new(
                "remem_index_inconsistencies_total",
                "Index entries found pointing at missing records",
            )?,
            loop_runs_total: IntCounter::new("remem_loop_runs_total", "Control loop runs")?,
            loop_failures_total: IntCounter::new(
                "remem_loop_failures_total",
                "Control loop runs ending in a failed outcome",
            )?,
        })
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.op_duration_seconds.clone()))?;
        registry.register(Box::new(self.query_candidates.clone()))?;
        registry.register(Box::new(self.store_size.clone()))?;
        registry.register(Box::new(self.evictions_total.clone()))?;
        registry.register(Box::new(self.breakthroughs_total.clone()))?;
        registry.register(Box::new(self.index_inconsistencies_total.clone()))?;
        registry.register(Box::new(self.loop_runs_total.clone()))?;
        registry.register(Box::new(self.loop_failures_total.clone()))?;
        Ok(())
    }

    fn reservoir(&self, op: IndexOp) -> &LatencyReservoir {
        match op {
            IndexOp::Query => &self.query,
            IndexOp::Insert => &self.insert,
            IndexOp::Evict => &self.evict,
        }
    }

    pub fn observe(&self, op: IndexOp, elapsed: Duration) {
        self.reservoir(op).record(elapsed.as_micros() as u64);
        self.op_duration_seconds
            .with_label_values(&[op.label()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_candidates(&self, count: usize) {
        self.query_candidates.observe(count as f64);
    }

    pub fn record_evictions(&self, count: usize) {
        self.evictions_total.inc_by(count as u64);
    }

    pub fn record_breakthrough(&self) {
        self.breakthroughs_total.inc();
    }

    pub fn record_inconsistency(&self) {
        self.index_inconsistencies_total.inc();
    }

    pub fn record_loop(&self, success: bool) {
        self.loop_runs_total.inc();
        if !success {
            self.loop_failures_total.inc();
        }
    }

    pub fn set_store_size(&self, size: usize) {
        self.store_size.set(size as i64);
    }

    pub fn latency(&self, op: IndexOp) -> LatencySummary {
        self.reservoir(op).summary()
    }

    pub fn snapshot(&self, store_size: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            store_size,
            query_latency: self.latency(IndexOp::Query),
            insert_latency: self.latency(IndexOp::Insert),
            evict_latency: self.latency(IndexOp::Evict),
            eviction_count: self.evictions_total.get(),
            breakthrough_count: self.breakthroughs_total.get(),
            index_inconsistencies: self.index_inconsistencies_total.get(),
            loop_runs: self.loop_runs_total.get(),
            loop_failures: self.loop_failures_total.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentiles() {
        let sorted: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&sorted, 0.50), 50);
        assert_eq!(percentile(&sorted, 0.99), 99);
        assert_eq!(percentile(&[], 0.5), 0);
        assert_eq!(percentile(&[7], 0.99), 7);
    }

    #[test]
    fn test_reservoir_is_bounded() {
        let metrics = RememMetrics::new().unwrap();
        for i in 0..(RESERVOIR_SIZE as u64 + 100) {
            metrics.observe(IndexOp::Insert, Duration::from_micros(i));
        }
        let summary = metrics.latency(IndexOp::Insert);
        assert_eq!(summary.samples, RESERVOIR_SIZE);
        // Oldest 100 samples were dropped
        assert!(summary.p50_us >= 100);
    }

    #[test]
    fn test_snapshot_counters() {
        let metrics = RememMetrics::new().unwrap();
        metrics.record_evictions(3);
        metrics.record_breakthrough();
        metrics.record_inconsistency();
        metrics.record_loop(true);
        metrics.record_loop(false);

        let snap = metrics.snapshot(12);
        assert_eq!(snap.store_size, 12);
        assert_eq!(snap.eviction_count, 3);
        assert_eq!(snap.breakthrough_count, 1);
        assert_eq!(snap.index_inconsistencies, 1);
        assert_eq!(snap.loop_runs, 2);
        assert_eq!(snap.loop_failures, 1);
    }

    #[test]
    fn test_register_into_registry() {
        let registry = Registry::new();
        let metrics = RememMetrics::new().unwrap();
        metrics.register(&registry).unwrap();
        metrics.observe(IndexOp::Query, Duration::from_micros(40));
        assert!(!registry.gather().is_empty());
    }
}
