//! Metrics & diagnostics (§4.9, §6): counters, HDR-style latency
//! histograms, sliding-window throughput, and the frozen `MetricsSnapshot`
//! used for JSON/Prometheus export and for the autoscaler/bottleneck
//! detector's inputs.

pub mod histogram;
pub mod sliding_window;

pub use histogram::LatencyHistogram;
pub use sliding_window::SlidingWindowCounter;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Per-worker counters, owned by the worker and shared read-only with the
/// metrics service for snapshotting (§4.9 thread dump / per-worker metrics).
#[derive(Default)]
pub struct WorkerCounters {
    pub jobs_processed: AtomicU64,
    pub total_busy_ns: AtomicU64,
    pub total_idle_ns: AtomicU64,
}

impl WorkerCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(WorkerCounters::default())
    }

    pub fn utilization(&self) -> f64 {
        let busy = self.total_busy_ns.load(Ordering::Relaxed) as f64;
        let idle = self.total_idle_ns.load(Ordering::Relaxed) as f64;
        if busy + idle == 0.0 {
            0.0
        } else {
            busy / (busy + idle)
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct WorkerMetricsSnapshot {
    pub worker_id: usize,
    pub jobs_processed: u64,
    pub busy_ns: u64,
    pub idle_ns: u64,
    pub utilization: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

/// Frozen, consistent view of the pool's metrics at one instant (§3).
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_submitted: u64,
    pub tasks_executed: u64,
    pub tasks_failed: u64,
    pub enqueue_latency: Percentiles,
    pub execution_latency: Percentiles,
    pub wait_time: Percentiles,
    pub throughput_one_sec: f64,
    pub throughput_one_min: f64,
    pub queue_depth_current: usize,
    pub queue_depth_peak: usize,
    pub queue_depth_avg: f64,
    pub worker_utilization: f64,
    pub active_workers: usize,
    pub per_worker: Vec<WorkerMetricsSnapshot>,
    pub timestamp_unix_ms: u128,
}

impl MetricsSnapshot {
    /// `to_json` per §6/§8: all keys under `tasks`, `latency`, `throughput`,
    /// `queue`, `workers`, `timestamp` must round-trip through `serde_json`.
    pub fn to_json(&self, pretty: bool) -> Result<String, serde_json::Error> {
        let value = serde_json::json!({
            "tasks": {
                "submitted": self.tasks_submitted,
                "executed": self.tasks_executed,
                "failed": self.tasks_failed,
            },
            "latency": {
                "enqueue": { "p50": self.enqueue_latency.p50, "p90": self.enqueue_latency.p90, "p99": self.enqueue_latency.p99 },
                "execution": { "p50": self.execution_latency.p50, "p90": self.execution_latency.p90, "p99": self.execution_latency.p99 },
                "wait": { "p50": self.wait_time.p50, "p90": self.wait_time.p90, "p99": self.wait_time.p99 },
            },
            "throughput": {
                "one_sec": self.throughput_one_sec,
                "one_min": self.throughput_one_min,
            },
            "queue": {
                "current": self.queue_depth_current,
                "peak": self.queue_depth_peak,
                "avg": self.queue_depth_avg,
            },
            "workers": {
                "utilization": self.worker_utilization,
                "active": self.active_workers,
                "per_worker": self.per_worker,
            },
            "timestamp": self.timestamp_unix_ms,
        });
        if pretty {
            serde_json::to_string_pretty(&value)
        } else {
            serde_json::to_string(&value)
        }
    }

    /// Prometheus/OpenMetrics text exposition (§6), canonical names prefixed
    /// by `prefix`. Latencies are reported in seconds per Prometheus
    /// convention even though the histogram itself tracks nanoseconds.
    pub fn to_prometheus(&self, prefix: &str, labels: &[(&str, &str)]) -> String {
        let label_str = if labels.is_empty() {
            String::new()
        } else {
            let joined: Vec<String> = labels.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect();
            format!("{{{}}}", joined.join(","))
        };
        let with_extra = |extra: &str| -> String {
            if labels.is_empty() {
                format!("{{{extra}}}")
            } else {
                let joined: Vec<String> = labels.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect();
                format!("{{{},{extra}}}", joined.join(","))
            }
        };
        let ns_to_sec = |ns: f64| ns / 1_000_000_000.0;
        let mut out = String::new();
        out.push_str(&format!(
            "{prefix}_tasks_submitted_total{label_str} {}\n",
            self.tasks_submitted
        ));
        out.push_str(&format!(
            "{prefix}_tasks_executed_total{label_str} {}\n",
            self.tasks_executed
        ));
        out.push_str(&format!(
            "{prefix}_tasks_failed_total{label_str} {}\n",
            self.tasks_failed
        ));
        for (kind, p) in [
            ("enqueue", &self.enqueue_latency),
            ("execution", &self.execution_latency),
            ("wait", &self.wait_time),
        ] {
            for (q, v) in [("p50", p.p50), ("p90", p.p90), ("p99", p.p99)] {
                out.push_str(&format!(
                    "{prefix}_latency_seconds{} {}\n",
                    with_extra(&format!("kind=\"{kind}\",quantile=\"{q}\"")),
                    ns_to_sec(v)
                ));
            }
        }
        out.push_str(&format!(
            "{prefix}_throughput_per_second{} {}\n",
            with_extra("window=\"1s\""),
            self.throughput_one_sec
        ));
        out.push_str(&format!(
            "{prefix}_throughput_per_second{} {}\n",
            with_extra("window=\"1m\""),
            self.throughput_one_min
        ));
        for (stat, v) in [
            ("current", self.queue_depth_current as f64),
            ("peak", self.queue_depth_peak as f64),
            ("avg", self.queue_depth_avg),
        ] {
            out.push_str(&format!(
                "{prefix}_queue_depth{} {}\n",
                with_extra(&format!("stat=\"{stat}\"")),
                v
            ));
        }
        out.push_str(&format!(
            "{prefix}_worker_utilization{label_str} {}\n",
            self.worker_utilization
        ));
        out.push_str(&format!(
            "{prefix}_active_workers{label_str} {}\n",
            self.active_workers
        ));
        out
    }
}

/// Aggregates basic counters, three latency histograms, two throughput
/// windows, per-worker counters and queue-depth tracking (§4.9 "enhanced
/// metrics"). Owned by the pool as `Arc<MetricsService>` and shared with
/// every worker -- workers never see the pool itself, only this service
/// (§9 "cyclic ownership").
pub struct MetricsService {
    tasks_submitted: AtomicU64,
    tasks_executed: AtomicU64,
    tasks_failed: AtomicU64,
    pub enqueue_latency: LatencyHistogram,
    pub execution_latency: LatencyHistogram,
    pub wait_time: LatencyHistogram,
    throughput_1s: SlidingWindowCounter,
    throughput_60s: SlidingWindowCounter,
    queue_current: AtomicUsize,
    queue_peak: AtomicUsize,
    queue_sum: AtomicU64,
    queue_samples: AtomicU64,
    workers: Mutex<Vec<Arc<WorkerCounters>>>,
}

impl MetricsService {
    pub fn new() -> Arc<Self> {
        Arc::new(MetricsService {
            tasks_submitted: AtomicU64::new(0),
            tasks_executed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            enqueue_latency: LatencyHistogram::new(),
            execution_latency: LatencyHistogram::new(),
            wait_time: LatencyHistogram::new(),
            throughput_1s: SlidingWindowCounter::new(Duration::from_secs(1)),
            throughput_60s: SlidingWindowCounter::new(Duration::from_secs(60)),
            queue_current: AtomicUsize::new(0),
            queue_peak: AtomicUsize::new(0),
            queue_sum: AtomicU64::new(0),
            queue_samples: AtomicU64::new(0),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn register_worker(&self, counters: Arc<WorkerCounters>) {
        self.workers.lock().unwrap().push(counters);
    }

    pub fn record_submitted(&self, enqueue_latency_ns: u64) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        self.enqueue_latency.record(enqueue_latency_ns);
    }

    pub fn record_completed(&self, success: bool, execution_ns: u64, wait_ns: u64) {
        if success {
            self.tasks_executed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.execution_latency.record(execution_ns);
        self.wait_time.record(wait_ns);
        self.throughput_1s.increment();
        self.throughput_60s.increment();
    }

    pub fn record_queue_depth(&self, depth: usize) {
        self.queue_current.store(depth, Ordering::Relaxed);
        self.queue_peak.fetch_max(depth, Ordering::Relaxed);
        self.queue_sum.fetch_add(depth as u64, Ordering::Relaxed);
        self.queue_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tasks_submitted(&self) -> u64 {
        self.tasks_submitted.load(Ordering::Relaxed)
    }

    pub fn tasks_executed(&self) -> u64 {
        self.tasks_executed.load(Ordering::Relaxed)
    }

    pub fn tasks_failed(&self) -> u64 {
        self.tasks_failed.load(Ordering::Relaxed)
    }

    pub fn queue_depth_current(&self) -> usize {
        self.queue_current.load(Ordering::Relaxed)
    }

    /// Brief coordination point: a snapshot only ever locks the per-worker
    /// vector, never the hot counter/histogram path (§4.9).
    pub fn snapshot(&self) -> MetricsSnapshot {
        let workers = self.workers.lock().unwrap();
        let per_worker: Vec<WorkerMetricsSnapshot> = workers
            .iter()
            .enumerate()
            .map(|(i, w)| WorkerMetricsSnapshot {
                worker_id: i,
                jobs_processed: w.jobs_processed.load(Ordering::Relaxed),
                busy_ns: w.total_busy_ns.load(Ordering::Relaxed),
                idle_ns: w.total_idle_ns.load(Ordering::Relaxed),
                utilization: w.utilization(),
            })
            .collect();
        let aggregate_utilization = if per_worker.is_empty() {
            0.0
        } else {
            per_worker.iter().map(|w| w.utilization).sum::<f64>() / per_worker.len() as f64
        };
        let queue_samples = self.queue_samples.load(Ordering::Relaxed);
        let queue_depth_avg = if queue_samples == 0 {
            0.0
        } else {
            self.queue_sum.load(Ordering::Relaxed) as f64 / queue_samples as f64
        };
        MetricsSnapshot {
            tasks_submitted: self.tasks_submitted(),
            tasks_executed: self.tasks_executed(),
            tasks_failed: self.tasks_failed(),
            enqueue_latency: Percentiles {
                p50: self.enqueue_latency.percentile(0.50),
                p90: self.enqueue_latency.percentile(0.90),
                p99: self.enqueue_latency.percentile(0.99),
            },
            execution_latency: Percentiles {
                p50: self.execution_latency.percentile(0.50),
                p90: self.execution_latency.percentile(0.90),
                p99: self.execution_latency.percentile(0.99),
            },
            wait_time: Percentiles {
                p50: self.wait_time.percentile(0.50),
                p90: self.wait_time.percentile(0.90),
                p99: self.wait_time.percentile(0.99),
            },
            throughput_one_sec: self.throughput_1s.rate_per_second(),
            throughput_one_min: self.throughput_60s.rate_per_second(),
            queue_depth_current: self.queue_current.load(Ordering::Relaxed),
            queue_depth_peak: self.queue_peak.load(Ordering::Relaxed),
            queue_depth_avg,
            worker_utilization: aggregate_utilization,
            active_workers: per_worker.len(),
            per_worker,
            timestamp_unix_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis(),
        }
    }
}

impl Default for MetricsService {
    fn default() -> Self {
        MetricsService {
            tasks_submitted: AtomicU64::new(0),
            tasks_executed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            enqueue_latency: LatencyHistogram::new(),
            execution_latency: LatencyHistogram::new(),
            wait_time: LatencyHistogram::new(),
            throughput_1s: SlidingWindowCounter::new(Duration::from_secs(1)),
            throughput_60s: SlidingWindowCounter::new(Duration::from_secs(60)),
            queue_current: AtomicUsize::new(0),
            queue_peak: AtomicUsize::new(0),
            queue_sum: AtomicU64::new(0),
            queue_samples: AtomicU64::new(0),
            workers: Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_contains_all_documented_keys() {
        let service = MetricsService::new();
        service.record_submitted(1_000);
        service.record_completed(true, 5_000, 2_000);
        let json = service.snapshot().to_json(false).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        for key in ["tasks", "latency", "throughput", "queue", "workers", "timestamp"] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
        assert!(value["tasks"]["submitted"].is_number());
    }

    #[test]
    fn prometheus_export_uses_prefix_and_labels() {
        let service = MetricsService::new();
        let text = service
            .snapshot()
            .to_prometheus("myprefix", &[("service", "taskloom")]);
        assert!(text.contains("myprefix_tasks_submitted_total{service=\"taskloom\"}"));
        assert!(text.contains("myprefix_worker_utilization"));
    }

    #[test]
    fn queue_depth_tracks_current_peak_and_avg() {
        let service = MetricsService::new();
        service.record_queue_depth(5);
        service.record_queue_depth(10);
        service.record_queue_depth(2);
        let snap = service.snapshot();
        assert_eq!(snap.queue_depth_current, 2);
        assert_eq!(snap.queue_depth_peak, 10);
        assert!((snap.queue_depth_avg - (17.0 / 3.0)).abs() < 1e-9);
    }
}
