//! Diagnostics (§4.9): per-worker thread dumps, aggregated health checks,
//! and bottleneck classification over a `MetricsSnapshot`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::job::JobInfo;
use crate::metrics::MetricsSnapshot;
use crate::pool::{PoolState, ThreadPool};
use crate::worker::WorkerState;

/// One worker's state at the moment `thread_dump` was taken.
#[derive(Clone, Debug)]
pub struct WorkerDump {
    pub worker_id: usize,
    pub state: WorkerState,
    pub current_job: Option<JobInfo>,
    pub jobs_completed: u64,
    pub busy_ns: u64,
    pub idle_ns: u64,
    pub utilization: f64,
}

/// Snapshots every worker's lifecycle state and current job in one pass.
/// Unlike `MetricsService::snapshot`, this takes the pool's worker list lock
/// (not just the metrics one), so it is diagnostic-path only -- never called
/// from job submission or execution.
pub fn thread_dump(pool: &ThreadPool) -> Vec<WorkerDump> {
    pool.workers()
        .iter()
        .map(|w| {
            let counters = w.counters();
            let busy_ns = counters.total_busy_ns.load(std::sync::atomic::Ordering::Relaxed);
            let idle_ns = counters.total_idle_ns.load(std::sync::atomic::Ordering::Relaxed);
            WorkerDump {
                worker_id: w.id,
                state: w.state(),
                current_job: w.current_job(),
                jobs_completed: w.jobs_processed(),
                busy_ns,
                idle_ns,
                utilization: if busy_ns + idle_ns == 0 {
                    0.0
                } else {
                    busy_ns as f64 / (busy_ns + idle_ns) as f64
                },
            }
        })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    /// No health signal could be obtained for this component. Ordered as
    /// the worst outcome: an aggregate health check should not report
    /// "Healthy" just because a component failed to report at all.
    Unknown,
}

#[derive(Clone, Debug)]
pub struct ComponentHealth {
    pub name: String,
    pub state: HealthState,
    pub message: Option<String>,
}

impl ComponentHealth {
    pub fn new(name: impl Into<String>, state: HealthState) -> Self {
        ComponentHealth { name: name.into(), state, message: None }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

pub type HealthCheckFn = Arc<dyn Fn() -> ComponentHealth + Send + Sync>;

/// Registry of user-supplied component health checks (e.g. "downstream
/// database reachable"), combined with the pool's own built-in worker
/// health when `pool_health` runs.
#[derive(Default)]
pub struct HealthRegistry {
    checks: Mutex<Vec<(String, HealthCheckFn)>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        HealthRegistry { checks: Mutex::new(Vec::new()) }
    }

    pub fn register(&self, name: impl Into<String>, check: HealthCheckFn) {
        self.checks.lock().unwrap().push((name.into(), check));
    }

    fn run_all(&self) -> Vec<ComponentHealth> {
        self.checks
            .lock()
            .unwrap()
            .iter()
            .map(|(name, check)| {
                let mut result = check();
                result.name = name.clone();
                result
            })
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct HealthReport {
    pub overall: HealthState,
    pub components: Vec<ComponentHealth>,
    pub pool_state: PoolState,
    pub healthy: bool,
}

fn worker_component_health(pool: &ThreadPool) -> ComponentHealth {
    let total = pool.worker_count();
    if total == 0 {
        return ComponentHealth::new("workers", HealthState::Unknown)
            .with_message("no workers registered");
    }
    let active = pool.active_worker_count();
    let idle = pool.idle_worker_count();
    let stuck = total.saturating_sub(active + idle);
    if stuck > 0 {
        ComponentHealth::new("workers", HealthState::Unhealthy)
            .with_message(format!("{stuck} of {total} workers in an unexpected state"))
    } else if pool.state() == PoolState::Running && active == total && idle == 0 && total > 1 {
        // Every worker simultaneously busy is not itself unhealthy, but
        // flag it as degraded: there's no slack for new submissions.
        ComponentHealth::new("workers", HealthState::Degraded)
            .with_message("all workers are currently busy")
    } else {
        ComponentHealth::new("workers", HealthState::Healthy)
    }
}

/// Combines the pool's built-in worker health with every registered
/// component check. Overall is the worst of all components (§4.9); the
/// pool itself is healthy iff overall is `Healthy` or `Degraded` and the
/// pool is `Running`.
pub fn pool_health(pool: &ThreadPool, registry: &HealthRegistry) -> HealthReport {
    let mut components = registry.run_all();
    components.push(worker_component_health(pool));
    let overall = components
        .iter()
        .map(|c| c.state)
        .max()
        .unwrap_or(HealthState::Unknown);
    let healthy = matches!(overall, HealthState::Healthy | HealthState::Degraded)
        && pool.state() == PoolState::Running;
    HealthReport { overall, components, pool_state: pool.state(), healthy }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BottleneckType {
    QueueFull,
    SlowConsumer,
    WorkerStarvation,
    UnevenDistribution,
    LockContention,
    MemoryPressure,
    None,
}

#[derive(Clone, Copy, Debug)]
pub struct BottleneckConfig {
    pub queue_saturation_high: f64,
    pub wait_time_threshold_ms: f64,
    pub utilization_high_threshold: f64,
    pub variance_high: f64,
    /// Consecutive observations of "queue empty, every worker idle" before
    /// `WorkerStarvation` is reported, to avoid flagging the normal
    /// momentary lull between bursts.
    pub sustained_idle_samples: u32,
    /// Queue capacity used to compute `queue_saturation` when the active
    /// queue is unbounded. `None` falls back to a worker-count-scaled
    /// heuristic.
    pub queue_capacity_hint: Option<usize>,
}

impl Default for BottleneckConfig {
    fn default() -> Self {
        BottleneckConfig {
            queue_saturation_high: 0.90,
            wait_time_threshold_ms: 100.0,
            utilization_high_threshold: 0.85,
            variance_high: 0.25,
            sustained_idle_samples: 3,
            queue_capacity_hint: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BottleneckReport {
    pub has_bottleneck: bool,
    pub bottleneck_type: BottleneckType,
    pub total_workers: usize,
    pub idle_workers: usize,
    pub queue_depth: usize,
    pub queue_saturation: f64,
    pub worker_utilization: f64,
    pub avg_wait_time_ms: f64,
    pub utilization_variance: f64,
    pub recommendations: Vec<String>,
}

impl BottleneckReport {
    /// `1` if either `queue_saturation` or `worker_utilization` is `>= 0.5`,
    /// `2` if `>= 0.8`, `3` if `>= 0.95`; `0` otherwise (§4.9).
    pub fn severity(&self) -> u8 {
        let worst = self.queue_saturation.max(self.worker_utilization);
        if worst >= 0.95 {
            3
        } else if worst >= 0.8 {
            2
        } else if worst >= 0.5 {
            1
        } else {
            0
        }
    }

    pub fn requires_immediate_action(&self) -> bool {
        self.severity() == 3
    }
}

fn utilization_variance(per_worker_utilization: &[f64]) -> f64 {
    if per_worker_utilization.len() < 2 {
        return 0.0;
    }
    let mean = per_worker_utilization.iter().sum::<f64>() / per_worker_utilization.len() as f64;
    let var = per_worker_utilization
        .iter()
        .map(|u| (u - mean).powi(2))
        .sum::<f64>()
        / per_worker_utilization.len() as f64;
    var.min(1.0)
}

/// Tracks the consecutive-sample state `WorkerStarvation` needs across
/// calls; a single snapshot can't tell a momentary lull from sustained
/// starvation.
pub struct BottleneckDetector {
    config: BottleneckConfig,
    consecutive_idle_samples: Mutex<u32>,
}

impl BottleneckDetector {
    pub fn new(config: BottleneckConfig) -> Self {
        BottleneckDetector { config, consecutive_idle_samples: Mutex::new(0) }
    }

    /// Classifies the current state from `snapshot`, first-match-wins per
    /// §4.9. `steal_retry_rate` (stealer contention, if work stealing is in
    /// use) and `memory_pressure` (reported externally -- this crate has no
    /// internal way to observe process memory) are optional external
    /// signals the caller supplies.
    pub fn detect(
        &self,
        snapshot: &MetricsSnapshot,
        steal_retry_rate: Option<f64>,
        memory_pressure: bool,
    ) -> BottleneckReport {
        let total_workers = snapshot.per_worker.len();
        let idle_workers = snapshot
            .per_worker
            .iter()
            .filter(|w| w.utilization < 0.01)
            .count();
        let queue_capacity = self
            .config
            .queue_capacity_hint
            .unwrap_or_else(|| (total_workers.max(1) * 64).max(snapshot.queue_depth_peak));
        let queue_saturation = if queue_capacity == 0 {
            0.0
        } else {
            (snapshot.queue_depth_current as f64 / queue_capacity as f64).min(1.0)
        };
        let avg_wait_time_ms = snapshot.wait_time.p90 / 1_000_000.0;
        let variance = utilization_variance(
            &snapshot.per_worker.iter().map(|w| w.utilization).collect::<Vec<_>>(),
        );

        let sustained_starved = if snapshot.queue_depth_current == 0
            && total_workers > 0
            && idle_workers == total_workers
        {
            let mut count = self.consecutive_idle_samples.lock().unwrap();
            *count += 1;
            *count >= self.config.sustained_idle_samples
        } else {
            *self.consecutive_idle_samples.lock().unwrap() = 0;
            false
        };

        let bottleneck_type = if queue_saturation >= self.config.queue_saturation_high {
            BottleneckType::QueueFull
        } else if avg_wait_time_ms >= self.config.wait_time_threshold_ms
            && snapshot.worker_utilization >= self.config.utilization_high_threshold
        {
            BottleneckType::SlowConsumer
        } else if sustained_starved {
            BottleneckType::WorkerStarvation
        } else if variance >= self.config.variance_high {
            BottleneckType::UnevenDistribution
        } else if steal_retry_rate.map(|rate| rate > 0.5).unwrap_or(false) {
            BottleneckType::LockContention
        } else if memory_pressure {
            BottleneckType::MemoryPressure
        } else {
            BottleneckType::None
        };

        let recommendations = recommend(bottleneck_type);
        BottleneckReport {
            has_bottleneck: bottleneck_type != BottleneckType::None,
            bottleneck_type,
            total_workers,
            idle_workers,
            queue_depth: snapshot.queue_depth_current,
            queue_saturation,
            worker_utilization: snapshot.worker_utilization,
            avg_wait_time_ms,
            utilization_variance: variance,
            recommendations,
        }
    }
}

fn recommend(kind: BottleneckType) -> Vec<String> {
    match kind {
        BottleneckType::QueueFull => vec![
            "increase queue capacity or enable an overflow policy".to_string(),
            "add workers to drain the backlog faster".to_string(),
        ],
        BottleneckType::SlowConsumer => vec![
            "profile job execution time; jobs are taking longer than the submission rate allows"
                .to_string(),
        ],
        BottleneckType::WorkerStarvation => {
            vec!["scale down idle workers or pause the submission source".to_string()]
        }
        BottleneckType::UnevenDistribution => vec![
            "review work-stealing victim selection policy; load is not balancing across workers"
                .to_string(),
        ],
        BottleneckType::LockContention => {
            vec!["switch the queue to the adaptive or lock-free variant".to_string()]
        }
        BottleneckType::MemoryPressure => {
            vec!["reduce queue depth or job payload size".to_string()]
        }
        BottleneckType::None => Vec::new(),
    }
}

/// Blocks up to `timeout` polling `pool_health` until it reports healthy, or
/// returns the last unhealthy report. Convenience for readiness probes.
pub fn wait_until_healthy(
    pool: &ThreadPool,
    registry: &HealthRegistry,
    timeout: Duration,
    poll_interval: Duration,
) -> HealthReport {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let report = pool_health(pool, registry);
        if report.healthy || std::time::Instant::now() >= deadline {
            return report;
        }
        std::thread::sleep(poll_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Percentiles, WorkerMetricsSnapshot};

    fn snapshot_with(
        queue_depth: usize,
        utilizations: Vec<f64>,
        wait_p90_ns: f64,
    ) -> MetricsSnapshot {
        let per_worker: Vec<WorkerMetricsSnapshot> = utilizations
            .into_iter()
            .enumerate()
            .map(|(i, u)| WorkerMetricsSnapshot {
                worker_id: i,
                jobs_processed: 0,
                busy_ns: 0,
                idle_ns: 0,
                utilization: u,
            })
            .collect();
        let avg_utilization = if per_worker.is_empty() {
            0.0
        } else {
            per_worker.iter().map(|w| w.utilization).sum::<f64>() / per_worker.len() as f64
        };
        MetricsSnapshot {
            tasks_submitted: 0,
            tasks_executed: 0,
            tasks_failed: 0,
            enqueue_latency: Percentiles { p50: 0.0, p90: 0.0, p99: 0.0 },
            execution_latency: Percentiles { p50: 0.0, p90: 0.0, p99: 0.0 },
            wait_time: Percentiles { p50: 0.0, p90: wait_p90_ns, p99: 0.0 },
            throughput_one_sec: 0.0,
            throughput_one_min: 0.0,
            queue_depth_current: queue_depth,
            queue_depth_peak: queue_depth,
            queue_depth_avg: queue_depth as f64,
            worker_utilization: avg_utilization,
            active_workers: per_worker.len(),
            per_worker,
            timestamp_unix_ms: 0,
        }
    }

    #[test]
    fn classifies_queue_full() {
        let detector = BottleneckDetector::new(BottleneckConfig {
            queue_capacity_hint: Some(100),
            ..BottleneckConfig::default()
        });
        let snapshot = snapshot_with(95, vec![0.5, 0.5], 0.0);
        let report = detector.detect(&snapshot, None, false);
        assert_eq!(report.bottleneck_type, BottleneckType::QueueFull);
        assert!(report.has_bottleneck);
    }

    #[test]
    fn classifies_slow_consumer() {
        let detector = BottleneckDetector::new(BottleneckConfig {
            queue_capacity_hint: Some(1000),
            ..BottleneckConfig::default()
        });
        let snapshot = snapshot_with(10, vec![0.9, 0.9], 200_000_000.0);
        let report = detector.detect(&snapshot, None, false);
        assert_eq!(report.bottleneck_type, BottleneckType::SlowConsumer);
    }

    #[test]
    fn worker_starvation_requires_sustained_samples() {
        let detector = BottleneckDetector::new(BottleneckConfig {
            sustained_idle_samples: 3,
            ..BottleneckConfig::default()
        });
        let snapshot = snapshot_with(0, vec![0.0, 0.0], 0.0);
        assert_eq!(detector.detect(&snapshot, None, false).bottleneck_type, BottleneckType::None);
        assert_eq!(detector.detect(&snapshot, None, false).bottleneck_type, BottleneckType::None);
        assert_eq!(
            detector.detect(&snapshot, None, false).bottleneck_type,
            BottleneckType::WorkerStarvation
        );
    }

    #[test]
    fn classifies_uneven_distribution() {
        let detector = BottleneckDetector::new(BottleneckConfig::default());
        let snapshot = snapshot_with(0, vec![0.9, 0.9, 0.05, 0.05], 0.0);
        let report = detector.detect(&snapshot, None, false);
        assert_eq!(report.bottleneck_type, BottleneckType::UnevenDistribution);
    }

    #[test]
    fn severity_thresholds() {
        let report = BottleneckReport {
            has_bottleneck: true,
            bottleneck_type: BottleneckType::QueueFull,
            total_workers: 4,
            idle_workers: 0,
            queue_depth: 10,
            queue_saturation: 0.96,
            worker_utilization: 0.1,
            avg_wait_time_ms: 0.0,
            utilization_variance: 0.0,
            recommendations: Vec::new(),
        };
        assert_eq!(report.severity(), 3);
        assert!(report.requires_immediate_action());
    }

    #[test]
    fn health_overall_is_worst_of_components() {
        let registry = HealthRegistry::new();
        registry.register("db", Arc::new(|| ComponentHealth::new("db", HealthState::Unhealthy)));
        let pool = crate::pool::simple_pool(2);
        pool.start().unwrap();
        let report = pool_health(&pool, &registry);
        assert_eq!(report.overall, HealthState::Unhealthy);
        assert!(!report.healthy);
        pool.stop(false).unwrap();
    }
}
