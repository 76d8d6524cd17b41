//! Counters and latency tracking for executors.

use hdrhistogram::Histogram;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

// one hour in nanoseconds
const MAX_TRACKED_LATENCY_NS: u64 = 3_600_000_000_000;

/// Executor metrics collector
#[derive(Debug)]
pub struct Metrics {
    tasks_submitted: AtomicU64,
    tasks_executed: AtomicU64,
    tasks_panicked: AtomicU64,
    tasks_dropped: AtomicU64,

    busy_time_ns: AtomicU64,

    // submit -> start
    queue_latency: Option<RwLock<Histogram<u64>>>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        let queue_latency = match Histogram::new_with_max(MAX_TRACKED_LATENCY_NS, 3) {
            Ok(hist) => Some(RwLock::new(hist)),
            Err(e) => {
                tracing::warn!(error = %e, "queue latency histogram disabled");
                None
            }
        };

        Self {
            tasks_submitted: AtomicU64::new(0),
            tasks_executed: AtomicU64::new(0),
            tasks_panicked: AtomicU64::new(0),
            tasks_dropped: AtomicU64::new(0),
            busy_time_ns: AtomicU64::new(0),
            queue_latency,
            start_time: Instant::now(),
        }
    }

    pub fn record_submitted(&self, count: u64) {
        self.tasks_submitted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: u64) {
        self.tasks_dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a task that started after waiting `queued` and ran for `busy`.
    pub fn record_execution(&self, queued: Duration, busy: Duration) {
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);
        self.busy_time_ns
            .fetch_add(busy.as_nanos() as u64, Ordering::Relaxed);

        if let Some(hist) = &self.queue_latency {
            // best-effort: the sample is skipped while the histogram is locked
            if let Some(mut hist) = hist.try_write() {
                let ns = (queued.as_nanos() as u64).clamp(1, MAX_TRACKED_LATENCY_NS);
                let _ = hist.record(ns);
            }
        }
    }

    pub fn record_panic(&self) {
        self.tasks_panicked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (avg, p50, p99, max) = match &self.queue_latency {
            Some(hist) => {
                let hist = hist.read();
                if hist.len() > 0 {
                    (
                        hist.mean() as u64,
                        hist.value_at_quantile(0.50),
                        hist.value_at_quantile(0.99),
                        hist.max(),
                    )
                } else {
                    (0, 0, 0, 0)
                }
            }
            None => (0, 0, 0, 0),
        };

        MetricsSnapshot {
            uptime: self.start_time.elapsed(),
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_executed: self.tasks_executed.load(Ordering::Relaxed),
            tasks_panicked: self.tasks_panicked.load(Ordering::Relaxed),
            tasks_dropped: self.tasks_dropped.load(Ordering::Relaxed),
            busy_time_ns: self.busy_time_ns.load(Ordering::Relaxed),
            avg_queue_latency_ns: avg,
            p50_queue_latency_ns: p50,
            p99_queue_latency_ns: p99,
            max_queue_latency_ns: max,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub uptime: Duration,
    pub tasks_submitted: u64,
    /// Includes tasks that panicked.
    pub tasks_executed: u64,
    pub tasks_panicked: u64,
    pub tasks_dropped: u64,
    pub busy_time_ns: u64,
    pub avg_queue_latency_ns: u64,
    pub p50_queue_latency_ns: u64,
    pub p99_queue_latency_ns: u64,
    pub max_queue_latency_ns: u64,
}

impl MetricsSnapshot {
    /// Accepted tasks that have neither run nor been dropped.
    pub fn outstanding(&self) -> u64 {
        self.tasks_submitted
            .saturating_sub(self.tasks_executed + self.tasks_dropped)
    }

    pub fn tasks_per_second(&self) -> f64 {
        let seconds = self.uptime.as_secs_f64();
        if seconds == 0.0 {
            return 0.0;
        }
        self.tasks_executed as f64 / seconds
    }
}
