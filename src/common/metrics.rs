//! Agent metrics
//!
//! Dispatch outcomes per event kind, topology actions and handler latency,
//! rendered in the Prometheus text format on `/metrics`.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for handler durations (in milliseconds)
const LATENCY_BUCKETS: [f64; 9] = [
    5.0, 25.0, 100.0, 250.0, 1000.0, 5000.0, 15000.0, 60000.0, 300000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        let boundaries = LATENCY_BUCKETS.to_vec();
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.boundaries.len());

        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative buckets, last one is +Inf
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.buckets.len());
        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            let le = self.boundaries.get(i).copied().unwrap_or(f64::INFINITY);
            result.push((le, cumulative));
        }
        result
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge for tracking current values
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Outcome counters for one event kind
#[derive(Debug, Default)]
pub struct EventMetrics {
    pub converged: Counter,
    pub deferred: Counter,
    pub failed: Counter,
    pub latency: Histogram,
}

/// Per-agent metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    events: Mutex<BTreeMap<&'static str, Arc<EventMetrics>>>,

    pub promotions: Counter,
    pub takeovers: Counter,
    pub data_wipes: Counter,
    pub raft_admin_calls: Counter,
    pub supervisor_reloads: Counter,

    /// Highest epoch seen on any link
    pub highest_epoch: Gauge,
    /// Events waiting for the next dispatch cycle
    pub deferred_queue: Gauge,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(BTreeMap::new()),
            promotions: Counter::new(),
            takeovers: Counter::new(),
            data_wipes: Counter::new(),
            raft_admin_calls: Counter::new(),
            supervisor_reloads: Counter::new(),
            highest_epoch: Gauge::default(),
            deferred_queue: Gauge::default(),
            start_time: Instant::now(),
        }
    }

    pub fn event(&self, kind: &'static str) -> Arc<EventMetrics> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.entry(kind).or_default().clone()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Record the outcome of one handler run
    pub fn record_dispatch(&self, kind: &'static str, outcome: &str, duration: Duration) {
        let m = self.event(kind);
        m.latency.observe(duration.as_secs_f64() * 1000.0);
        match outcome {
            "converged" => m.converged.inc(),
            "deferred" => m.deferred.inc(),
            _ => m.failed.inc(),
        }
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters = [
            ("promotions_total", "Promotions performed by this member", &self.promotions),
            ("takeovers_total", "Standby takeovers started", &self.takeovers),
            ("data_wipes_total", "Data directory wipes", &self.data_wipes),
            ("raft_admin_calls_total", "Raft admin invocations", &self.raft_admin_calls),
            ("supervisor_reloads_total", "Supervisor configuration reloads", &self.supervisor_reloads),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP topokeeper_{} {}", name, help);
            let _ = writeln!(out, "# TYPE topokeeper_{} counter", name);
            let _ = writeln!(out, "topokeeper_{} {}", name, counter.get());
        }

        out.push_str("# HELP topokeeper_highest_epoch Highest promoted-cluster-counter observed\n");
        out.push_str("# TYPE topokeeper_highest_epoch gauge\n");
        let _ = writeln!(out, "topokeeper_highest_epoch {}", self.highest_epoch.get());

        out.push_str("# HELP topokeeper_deferred_events Events waiting for the next cycle\n");
        out.push_str("# TYPE topokeeper_deferred_events gauge\n");
        let _ = writeln!(out, "topokeeper_deferred_events {}", self.deferred_queue.get());

        out.push_str("# HELP topokeeper_uptime_seconds Agent uptime in seconds\n");
        out.push_str("# TYPE topokeeper_uptime_seconds gauge\n");
        let _ = writeln!(out, "topokeeper_uptime_seconds {}", self.uptime_seconds());

        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());

        out.push_str("# HELP topokeeper_dispatch_total Handler runs per event and outcome\n");
        out.push_str("# TYPE topokeeper_dispatch_total counter\n");
        for (kind, m) in events.iter() {
            for (outcome, c) in [
                ("converged", &m.converged),
                ("deferred", &m.deferred),
                ("failed", &m.failed),
            ] {
                let _ = writeln!(
                    out,
                    "topokeeper_dispatch_total{{event=\"{}\",outcome=\"{}\"}} {}",
                    kind,
                    outcome,
                    c.get()
                );
            }
        }

        out.push_str("# HELP topokeeper_dispatch_duration_ms Handler duration in milliseconds\n");
        out.push_str("# TYPE topokeeper_dispatch_duration_ms histogram\n");
        for (kind, m) in events.iter() {
            for (le, count) in m.latency.get_buckets() {
                let le = if le.is_infinite() {
                    "+Inf".to_string()
                } else {
                    le.to_string()
                };
                let _ = writeln!(
                    out,
                    "topokeeper_dispatch_duration_ms_bucket{{event=\"{}\",le=\"{}\"}} {}",
                    kind, le, count
                );
            }
            let _ = writeln!(
                out,
                "topokeeper_dispatch_duration_ms_sum{{event=\"{}\"}} {}",
                kind,
                m.latency.sum()
            );
            let _ = writeln!(
                out,
                "topokeeper_dispatch_duration_ms_count{{event=\"{}\"}} {}",
                kind,
                m.latency.count()
            );
        }

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new();
        hist.observe(3.0);
        hist.observe(50.0);
        hist.observe(1_000_000.0);

        assert_eq!(hist.count(), 3);
        let buckets = hist.get_buckets();
        assert_eq!(buckets.first().unwrap().1, 1);
        assert_eq!(buckets.last().unwrap(), &(f64::INFINITY, 3));
    }

    #[test]
    fn test_record_dispatch() {
        let registry = MetricsRegistry::new();
        registry.record_dispatch("link_changed", "converged", Duration::from_millis(10));
        registry.record_dispatch("link_changed", "deferred", Duration::from_millis(10));
        registry.record_dispatch("witness_joined", "failed", Duration::from_millis(10));

        let link = registry.event("link_changed");
        assert_eq!(link.converged.get(), 1);
        assert_eq!(link.deferred.get(), 1);

        let text = registry.to_prometheus();
        assert!(text.contains("topokeeper_dispatch_total{event=\"witness_joined\",outcome=\"failed\"} 1"));
        assert!(text.contains("topokeeper_promotions_total 0"));
    }
}
