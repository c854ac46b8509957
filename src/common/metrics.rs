//! Assignment metrics
//!
//! Atomic counters, gauges and latency histograms, grouped per procedure kind.
//! Instances are owned by the assignment context; there is no global registry.

use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket boundaries for procedure durations (in milliseconds)
const DURATION_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 30000.0,
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
        Self::with_buckets(&DURATION_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let mut buckets = Vec::with_capacity(boundaries.len() + 1);
        for _ in 0..=boundaries.len() {
            buckets.push(AtomicU64::new(0));
        }
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in the histogram
    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // Stored as microseconds for precision
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64() * 1000.0);
    }

    /// Cumulative bucket counts, ending with +Inf
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
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

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        // Saturate at zero; restored procedures may release without a matching inc
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters for one procedure kind
#[derive(Debug, Default)]
pub struct ProcedureMetrics {
    pub submitted: Counter,
    pub succeeded: Counter,
    pub failed: Counter,
    pub duration: Histogram,
}

impl ProcedureMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, elapsed: Duration) {
        self.succeeded.inc();
        self.duration.observe_duration(elapsed);
    }

    pub fn record_failure(&self, elapsed: Duration) {
        self.failed.inc();
        self.duration.observe_duration(elapsed);
    }
}

/// Dispatcher RPC counters
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    pub rpcs_sent: Counter,
    pub operations_sent: Counter,
    pub rpc_retries: Counter,
    pub operations_failed: Counter,
}

#[derive(Debug, Default)]
pub struct AssignmentMetrics {
    pub assign: ProcedureMetrics,
    pub unassign: ProcedureMetrics,
    pub move_region: ProcedureMetrics,
    pub server_crash: ProcedureMetrics,
    /// Shared with the remote dispatcher
    pub dispatch: Arc<DispatchMetrics>,
    pub regions_in_transition: Gauge,
    pub reports_received: Counter,
    pub reports_ignored: Counter,
}

impl AssignmentMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        for (name, metrics) in [
            ("assign", &self.assign),
            ("unassign", &self.unassign),
            ("move", &self.move_region),
            ("server_crash", &self.server_crash),
        ] {
            let _ = writeln!(
                out,
                "regionmaster_procedures_submitted_total{{kind=\"{}\"}} {}",
                name,
                metrics.submitted.get()
            );
            let _ = writeln!(
                out,
                "regionmaster_procedures_succeeded_total{{kind=\"{}\"}} {}",
                name,
                metrics.succeeded.get()
            );
            let _ = writeln!(
                out,
                "regionmaster_procedures_failed_total{{kind=\"{}\"}} {}",
                name,
                metrics.failed.get()
            );
            for (le, count) in metrics.duration.get_buckets() {
                let le = if le.is_infinite() {
                    "+Inf".to_string()
                } else {
                    le.to_string()
                };
                let _ = writeln!(
                    out,
                    "regionmaster_procedure_duration_ms_bucket{{kind=\"{}\",le=\"{}\"}} {}",
                    name, le, count
                );
            }
            let _ = writeln!(
                out,
                "regionmaster_procedure_duration_ms_sum{{kind=\"{}\"}} {}",
                name,
                metrics.duration.sum()
            );
            let _ = writeln!(
                out,
                "regionmaster_procedure_duration_ms_count{{kind=\"{}\"}} {}",
                name,
                metrics.duration.count()
            );
        }

        let _ = writeln!(
            out,
            "regionmaster_rpcs_sent_total {}",
            self.dispatch.rpcs_sent.get()
        );
        let _ = writeln!(
            out,
            "regionmaster_operations_sent_total {}",
            self.dispatch.operations_sent.get()
        );
        let _ = writeln!(
            out,
            "regionmaster_rpc_retries_total {}",
            self.dispatch.rpc_retries.get()
        );
        let _ = writeln!(
            out,
            "regionmaster_operations_failed_total {}",
            self.dispatch.operations_failed.get()
        );
        let _ = writeln!(
            out,
            "regionmaster_regions_in_transition {}",
            self.regions_in_transition.get()
        );
        let _ = writeln!(
            out,
            "regionmaster_reports_received_total {}",
            self.reports_received.get()
        );
        let _ = writeln!(
            out,
            "regionmaster_reports_ignored_total {}",
            self.reports_ignored.get()
        );

        out
    }
}
