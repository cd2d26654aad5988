//! Autoscaler (§4.8): a background monitor thread samples pool metrics on a
//! fixed interval, keeps a bounded history, and in `Automatic` mode applies
//! scale-up/scale-down decisions to the pool through `add_workers_internal`
//! / `remove_workers_internal`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::context::{LogLevel, ThreadContext};
use crate::pool::{AutoscalingPoolPolicy, ThreadPool};

const MODULE: &str = "autoscaler";
const MAX_HISTORY: usize = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalingMode {
    /// The autoscaler applies its own decisions to the pool.
    Automatic,
    /// The autoscaler only samples and records history; `decide()` is
    /// available for a host to call explicitly, but `tick` never mutates
    /// the pool on its own.
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalingAmount {
    Additive(usize),
    Multiplicative,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalingDirection {
    Up,
    Down,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalingReason {
    HighUtilization,
    QueueDepthPerWorker,
    WaitLatencyP95,
    PendingJobsAbsolute,
    LowUtilizationAndQueueDepth,
}

pub type ScalingCallback = Arc<dyn Fn(ScalingDirection, ScalingReason, usize, usize) + Send + Sync>;

#[derive(Clone, Copy, Debug)]
pub struct ScaleUpConfig {
    pub utilization_threshold: f64,
    pub queue_depth_threshold: f64,
    pub latency_threshold_ms: f64,
    pub pending_jobs_threshold: usize,
    pub amount: ScalingAmount,
    pub factor: f64,
    pub cooldown: Duration,
}

impl Default for ScaleUpConfig {
    fn default() -> Self {
        ScaleUpConfig {
            utilization_threshold: 0.80,
            queue_depth_threshold: 4.0,
            latency_threshold_ms: 50.0,
            pending_jobs_threshold: 256,
            amount: ScalingAmount::Additive(1),
            factor: 1.5,
            cooldown: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ScaleDownConfig {
    pub utilization_threshold: f64,
    pub queue_depth_threshold: f64,
    pub amount: ScalingAmount,
    pub factor: f64,
    pub cooldown: Duration,
}

impl Default for ScaleDownConfig {
    fn default() -> Self {
        ScaleDownConfig {
            utilization_threshold: 0.20,
            queue_depth_threshold: 0.5,
            amount: ScalingAmount::Additive(1),
            factor: 0.75,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct AutoscalerConfig {
    pub mode: ScalingMode,
    pub min_workers: usize,
    pub max_workers: usize,
    pub sample_interval: Duration,
    pub samples_for_decision: usize,
    pub scale_up: ScaleUpConfig,
    pub scale_down: ScaleDownConfig,
    pub scaling_callback: Option<ScalingCallback>,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        AutoscalerConfig {
            mode: ScalingMode::Automatic,
            min_workers: 1,
            max_workers: num_cpus::get().max(1) * 4,
            sample_interval: Duration::from_millis(500),
            samples_for_decision: 5,
            scale_up: ScaleUpConfig::default(),
            scale_down: ScaleDownConfig::default(),
            scaling_callback: None,
        }
    }
}

/// One observation of pool state, taken from a `MetricsSnapshot` plus the
/// current worker count.
#[derive(Clone, Copy, Debug)]
struct Sample {
    utilization: f64,
    queue_depth: usize,
    queue_depth_per_worker: f64,
    wait_p95_ms: f64,
    worker_count: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScalingDecision {
    pub direction: ScalingDirection,
    pub reason: ScalingReason,
    pub from: usize,
    pub to: usize,
}

/// Samples `ThreadPool` metrics on a timer and, in `Automatic` mode, drives
/// `ThreadPool::add_workers_internal` / `remove_workers_internal` to keep the
/// worker count matched to load (§4.8).
pub struct Autoscaler {
    config: AutoscalerConfig,
    history: Mutex<VecDeque<Sample>>,
    last_scale_up: Mutex<Instant>,
    last_scale_down: Mutex<Instant>,
    stop_requested: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    context: ThreadContext,
}

impl Autoscaler {
    pub fn new(config: AutoscalerConfig, context: ThreadContext) -> Arc<Self> {
        let epoch = Instant::now() - Duration::from_secs(3600);
        Arc::new(Autoscaler {
            config,
            history: Mutex::new(VecDeque::with_capacity(MAX_HISTORY)),
            last_scale_up: Mutex::new(epoch),
            last_scale_down: Mutex::new(epoch),
            stop_requested: AtomicBool::new(false),
            thread: Mutex::new(None),
            context,
        })
    }

    /// Wraps this autoscaler as a `PoolPolicy` so a host driving
    /// `ThreadPool::run_tick_hooks()` manually (no background thread) still
    /// gets sampling and scaling on every tick.
    pub fn policy(self: &Arc<Self>) -> AutoscalingPoolPolicy {
        let this = Arc::clone(self);
        AutoscalingPoolPolicy::new(move |pool| this.tick(pool))
    }

    fn sample(&self, pool: &ThreadPool) -> Sample {
        let snapshot = pool.metrics().snapshot();
        let worker_count = pool.worker_count().max(1);
        Sample {
            utilization: snapshot.worker_utilization,
            queue_depth: snapshot.queue_depth_current,
            queue_depth_per_worker: snapshot.queue_depth_current as f64 / worker_count as f64,
            wait_p95_ms: pool.metrics().wait_time.percentile(0.95) / 1_000_000.0,
            worker_count,
        }
    }

    fn push_sample(&self, sample: Sample) {
        let mut history = self.history.lock().unwrap();
        if history.len() == MAX_HISTORY {
            history.pop_front();
        }
        history.push_back(sample);
    }

    fn averaged(&self) -> Option<(f64, f64, f64, usize, usize)> {
        let history = self.history.lock().unwrap();
        let n = self.config.samples_for_decision.min(history.len());
        if n == 0 {
            return None;
        }
        let recent = history.iter().rev().take(n);
        let mut utilization_sum = 0.0;
        let mut qdpw_sum = 0.0;
        let mut wait_sum = 0.0;
        let mut queue_depth_sum = 0usize;
        let mut current_workers = 0usize;
        let mut count = 0usize;
        for s in recent {
            utilization_sum += s.utilization;
            qdpw_sum += s.queue_depth_per_worker;
            wait_sum += s.wait_p95_ms;
            queue_depth_sum += s.queue_depth;
            current_workers = s.worker_count;
            count += 1;
        }
        Some((
            utilization_sum / count as f64,
            qdpw_sum / count as f64,
            wait_sum / count as f64,
            queue_depth_sum / count,
            current_workers,
        ))
    }

    /// Evaluates the triggers against the averaged recent history and
    /// returns a clamped, cooldown-gated decision, if any. Exposed for hosts
    /// that sample via `tick()`/`policy()` and want to apply decisions
    /// themselves without the background thread from `start()`.
    pub fn decide(&self) -> Option<ScalingDecision> {
        let (utilization, qdpw, wait_p95_ms, queue_depth, current) = self.averaged()?;

        let up = &self.config.scale_up;
        let scale_up_reason = if utilization > up.utilization_threshold {
            Some(ScalingReason::HighUtilization)
        } else if qdpw > up.queue_depth_threshold {
            Some(ScalingReason::QueueDepthPerWorker)
        } else if wait_p95_ms > up.latency_threshold_ms {
            Some(ScalingReason::WaitLatencyP95)
        } else if queue_depth > up.pending_jobs_threshold {
            Some(ScalingReason::PendingJobsAbsolute)
        } else {
            None
        };

        if let Some(reason) = scale_up_reason {
            if self.last_scale_up.lock().unwrap().elapsed() >= up.cooldown {
                let target = clamp_target(
                    scaled_up(current, up.amount, up.factor),
                    self.config.min_workers,
                    self.config.max_workers,
                );
                if target > current {
                    return Some(ScalingDecision {
                        direction: ScalingDirection::Up,
                        reason,
                        from: current,
                        to: target,
                    });
                }
            }
            return None;
        }

        let down = &self.config.scale_down;
        if utilization < down.utilization_threshold && qdpw < down.queue_depth_threshold {
            if self.last_scale_down.lock().unwrap().elapsed() >= down.cooldown {
                let target = clamp_target(
                    scaled_down(current, down.amount, down.factor),
                    self.config.min_workers,
                    self.config.max_workers,
                );
                if target < current {
                    return Some(ScalingDecision {
                        direction: ScalingDirection::Down,
                        reason: ScalingReason::LowUtilizationAndQueueDepth,
                        from: current,
                        to: target,
                    });
                }
            }
        }
        None
    }

    /// Applies a previously computed decision to `pool` and fires the
    /// scaling callback. Public so a host sampling via `tick()`/`decide()`
    /// without the background thread can still apply decisions itself.
    pub fn apply(&self, pool: &Arc<ThreadPool>, decision: ScalingDecision) {
        let result = match decision.direction {
            ScalingDirection::Up => pool.add_workers_internal(decision.to - decision.from),
            ScalingDirection::Down => pool.remove_workers_internal(decision.from - decision.to),
        };
        match result {
            Ok(_) => {
                let now = Instant::now();
                match decision.direction {
                    ScalingDirection::Up => *self.last_scale_up.lock().unwrap() = now,
                    ScalingDirection::Down => *self.last_scale_down.lock().unwrap() = now,
                }
                self.context.log(
                    LogLevel::Info,
                    &format!(
                        "autoscaler: {:?} {} -> {} ({:?})",
                        decision.direction, decision.from, decision.to, decision.reason
                    ),
                );
                if let Some(cb) = &self.config.scaling_callback {
                    cb(decision.direction, decision.reason, decision.from, decision.to);
                }
            }
            Err(err) => {
                self.context
                    .log(LogLevel::Warning, &format!("autoscaler adjustment failed: {err}"));
            }
        }
    }

    /// Samples the pool and records history. Used by the `PoolPolicy`
    /// forward (`policy()`) for hosts that drive `run_tick_hooks()`
    /// themselves instead of `start()`'s background thread -- `on_tick`
    /// only hands back `&ThreadPool`, so applying a decision (which needs
    /// `Arc<ThreadPool>` for `add_workers_internal`) is left to
    /// `tick_owned`, called from the background thread spawned by
    /// `start()`. `decide()` remains available for a host to poll and
    /// apply manually from this sampling alone.
    pub fn tick(&self, pool: &ThreadPool) {
        self.push_sample(self.sample(pool));
    }

    fn tick_owned(&self, pool: &Arc<ThreadPool>) {
        self.push_sample(self.sample(pool));
        if self.config.mode == ScalingMode::Manual {
            return;
        }
        if let Some(decision) = self.decide() {
            self.apply(pool, decision);
        }
    }

    pub fn history(&self) -> Vec<(f64, f64, f64, usize)> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .map(|s| (s.utilization, s.queue_depth_per_worker, s.wait_p95_ms, s.queue_depth))
            .collect()
    }

    /// Spawns the background monitor thread, which owns `pool` for the
    /// lifetime of the autoscaler and drives both sampling and (in
    /// `Automatic` mode) scaling directly.
    pub fn start(self: &Arc<Self>, pool: Arc<ThreadPool>) {
        let mut guard = self.thread.lock().unwrap();
        if guard.is_some() {
            return;
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        let this = Arc::clone(self);
        let interval = self.config.sample_interval;
        let handle = thread::Builder::new()
            .name("taskloom-autoscaler".to_string())
            .spawn(move || {
                while !this.stop_requested.load(Ordering::SeqCst) {
                    thread::sleep(interval);
                    if this.stop_requested.load(Ordering::SeqCst) {
                        break;
                    }
                    use crate::pool::PoolState;
                    if pool.state() != PoolState::Running {
                        continue;
                    }
                    this.tick_owned(&pool);
                }
            })
            .expect("failed to spawn autoscaler monitor thread");
        *guard = Some(handle);
    }

    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn scaled_up(current: usize, amount: ScalingAmount, factor: f64) -> usize {
    match amount {
        ScalingAmount::Additive(n) => current + n,
        ScalingAmount::Multiplicative => ((current as f64 * factor).ceil() as usize).max(current + 1),
    }
}

fn scaled_down(current: usize, amount: ScalingAmount, factor: f64) -> usize {
    match amount {
        ScalingAmount::Additive(n) => current.saturating_sub(n),
        ScalingAmount::Multiplicative => {
            let target = (current as f64 * factor).floor() as usize;
            target.min(current.saturating_sub(1))
        }
    }
}

fn clamp_target(target: usize, min_workers: usize, max_workers: usize) -> usize {
    target.clamp(min_workers.max(0), max_workers.max(min_workers))
}

impl Drop for Autoscaler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> AutoscalerConfig {
        AutoscalerConfig {
            mode: ScalingMode::Automatic,
            min_workers: 1,
            max_workers: 16,
            sample_interval: Duration::from_millis(10),
            samples_for_decision: 1,
            scale_up: ScaleUpConfig {
                utilization_threshold: 0.5,
                ..ScaleUpConfig::default()
            },
            scale_down: ScaleDownConfig::default(),
            scaling_callback: None,
        }
    }

    fn push(autoscaler: &Autoscaler, utilization: f64, qdpw: f64, wait_ms: f64, queue_depth: usize, workers: usize) {
        autoscaler.push_sample(Sample {
            utilization,
            queue_depth,
            queue_depth_per_worker: qdpw,
            wait_p95_ms: wait_ms,
            worker_count: workers,
        });
    }

    #[test]
    fn scales_up_on_high_utilization() {
        let autoscaler = Autoscaler::new(cfg(), ThreadContext::default());
        push(&autoscaler, 0.95, 0.0, 0.0, 0, 4);
        let decision = autoscaler.decide().unwrap();
        assert_eq!(decision.direction, ScalingDirection::Up);
        assert_eq!(decision.reason, ScalingReason::HighUtilization);
        assert_eq!(decision.to, 5);
    }

    #[test]
    fn scales_down_only_when_all_triggers_match() {
        let autoscaler = Autoscaler::new(cfg(), ThreadContext::default());
        push(&autoscaler, 0.05, 0.0, 0.0, 0, 4);
        let decision = autoscaler.decide().unwrap();
        assert_eq!(decision.direction, ScalingDirection::Down);
        assert_eq!(decision.to, 3);
    }

    #[test]
    fn no_scale_down_if_queue_depth_per_worker_high() {
        let autoscaler = Autoscaler::new(cfg(), ThreadContext::default());
        push(&autoscaler, 0.05, 10.0, 0.0, 40, 4);
        assert!(autoscaler.decide().is_none());
    }

    #[test]
    fn cooldown_blocks_consecutive_scale_ups() {
        let autoscaler = Autoscaler::new(cfg(), ThreadContext::default());
        push(&autoscaler, 0.95, 0.0, 0.0, 0, 4);
        assert!(autoscaler.decide().is_some());
        *autoscaler.last_scale_up.lock().unwrap() = Instant::now();
        push(&autoscaler, 0.95, 0.0, 0.0, 0, 5);
        assert!(autoscaler.decide().is_none());
    }

    #[test]
    fn target_is_clamped_to_max_workers() {
        let mut config = cfg();
        config.max_workers = 4;
        let autoscaler = Autoscaler::new(config, ThreadContext::default());
        push(&autoscaler, 0.95, 0.0, 0.0, 0, 4);
        assert!(autoscaler.decide().is_none());
    }

    #[test]
    fn history_is_bounded() {
        let autoscaler = Autoscaler::new(cfg(), ThreadContext::default());
        for _ in 0..(MAX_HISTORY + 10) {
            push(&autoscaler, 0.1, 0.0, 0.0, 0, 4);
        }
        assert_eq!(autoscaler.history.lock().unwrap().len(), MAX_HISTORY);
    }
}
