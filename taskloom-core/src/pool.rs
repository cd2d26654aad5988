//! Thread pool core (§4.4): owns workers and the primary queue, enforces
//! lifecycle transitions, and dispatches `PoolPolicy` hooks.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::circuit_breaker::CircuitBreaker;
use crate::context::{LogLevel, ThreadContext};
use crate::error::{ErrorCode, ErrorInfo};
use crate::job::Job;
use crate::metrics::MetricsService;
use crate::queue::{mutex_queue::MutexQueue, Queue};
use crate::stealer::Stealer;
use crate::worker::{Worker, WorkerHooks};

const MODULE: &str = "pool";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    Init = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl PoolState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PoolState::Init,
            1 => PoolState::Running,
            2 => PoolState::Stopping,
            _ => PoolState::Stopped,
        }
    }
}

fn pool_not_running() -> ErrorInfo {
    ErrorInfo::new(ErrorCode::ThreadNotRunning, MODULE, "pool is not running")
}

/// A hook point invoked by the pool once per submitted job and on every
/// monitoring tick. Represented as a trait object rather than a tagged enum
/// (§9 "plugin policies"): hook dispatch is not on the hottest per-job path
/// (dequeuing/stealing is), so dynamic composition from the builder
/// outweighs the cost of a vtable call per submission.
pub trait PoolPolicy: Send + Sync {
    /// Called once per submitted job, before it reaches the queue.
    /// Returning `Err` rejects the submission outright (the circuit
    /// breaker's only use of this); returning `Ok(job)` lets it proceed,
    /// optionally wrapped via `Job::wrap` so the policy can observe its
    /// eventual outcome.
    fn on_submit(&self, _pool: &ThreadPool, job: Job) -> Result<Job, ErrorInfo> {
        Ok(job)
    }
    fn on_tick(&self, _pool: &ThreadPool) {}
}

/// Rejects submissions while the breaker is open (or its half-open trial
/// budget is exhausted) and feeds each admitted job's actual outcome back
/// into it via `Job::wrap`, so the guard acquired at submission is recorded
/// exactly once, by whichever worker ends up running the job.
pub struct CircuitBreakerPolicy {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerPolicy {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        CircuitBreakerPolicy { breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

impl PoolPolicy for CircuitBreakerPolicy {
    fn on_submit(&self, _pool: &ThreadPool, job: Job) -> Result<Job, ErrorInfo> {
        let guard = self.breaker.allow_request()?;
        Ok(job.wrap(move |result| match result {
            Ok(()) => guard.mark_success(),
            Err(err) => guard.mark_failure(err),
        }))
    }
}

/// Forwards autoscaler ticks; the autoscaler itself owns the sampling
/// thread and history, this policy only plugs it into the pool's tick hook.
pub struct AutoscalingPoolPolicy {
    tick: Box<dyn Fn(&ThreadPool) + Send + Sync>,
}

impl AutoscalingPoolPolicy {
    pub fn new(tick: impl Fn(&ThreadPool) + Send + Sync + 'static) -> Self {
        AutoscalingPoolPolicy { tick: Box::new(tick) }
    }
}

impl PoolPolicy for AutoscalingPoolPolicy {
    fn on_tick(&self, pool: &ThreadPool) {
        (self.tick)(pool)
    }
}

/// Installs per-worker deques and a stealer, replacing the default global
/// queue path (§4.4).
pub struct WorkStealingPoolPolicy {
    pub stealer: Arc<Stealer>,
}

impl WorkStealingPoolPolicy {
    pub fn new(stealer: Arc<Stealer>) -> Self {
        WorkStealingPoolPolicy { stealer }
    }
}

impl PoolPolicy for WorkStealingPoolPolicy {}

struct NoHooks;

impl WorkerHooks for NoHooks {}

/// Owns workers and the primary queue; enforces the `Init -> Running ->
/// Stopping -> Stopped` lifecycle (§4.4).
pub struct ThreadPool {
    state: AtomicU8,
    state_mutex: Mutex<()>,
    queue: Arc<dyn Queue>,
    workers: Mutex<Vec<Arc<Worker>>>,
    context: ThreadContext,
    metrics: Arc<MetricsService>,
    policies: Vec<Box<dyn PoolPolicy>>,
    worker_count: usize,
    min_workers: usize,
    next_worker_id: AtomicUsize,
}

impl ThreadPool {
    /// Construct a pool in the `Init` state. This is the low-level
    /// constructor the `taskloom` facade's `ThreadPoolBuilder` calls after
    /// resolving its configuration into a concrete queue/context/policy
    /// set; most callers want the builder instead.
    pub fn new(
        worker_count: usize,
        min_workers: usize,
        queue: Arc<dyn Queue>,
        context: ThreadContext,
        metrics: Arc<MetricsService>,
        policies: Vec<Box<dyn PoolPolicy>>,
    ) -> Arc<Self> {
        Arc::new(ThreadPool {
            state: AtomicU8::new(PoolState::Init as u8),
            state_mutex: Mutex::new(()),
            queue,
            workers: Mutex::new(Vec::new()),
            context,
            metrics,
            policies,
            worker_count,
            min_workers,
            next_worker_id: AtomicUsize::new(0),
        })
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn metrics(&self) -> &Arc<MetricsService> {
        &self.metrics
    }

    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    pub fn active_worker_count(&self) -> usize {
        use crate::worker::WorkerState;
        self.workers
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.state() == WorkerState::Working)
            .count()
    }

    pub fn idle_worker_count(&self) -> usize {
        use crate::worker::WorkerState;
        self.workers
            .lock()
            .unwrap()
            .iter()
            .filter(|w| matches!(w.state(), WorkerState::Waiting | WorkerState::Created))
            .count()
    }

    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.workers.lock().unwrap().clone()
    }

    pub fn policies(&self) -> &[Box<dyn PoolPolicy>] {
        &self.policies
    }

    /// Spawns `worker_count` worker threads. `Init -> Running`; any other
    /// current state is a no-op error.
    pub fn start(self: &Arc<Self>) -> Result<(), ErrorInfo> {
        let _lock = self.state_mutex.lock().unwrap();
        if self.state() != PoolState::Init {
            return Err(ErrorInfo::new(
                ErrorCode::ThreadAlreadyRunning,
                MODULE,
                "pool has already been started",
            ));
        }
        let mut workers = self.workers.lock().unwrap();
        for _ in 0..self.worker_count {
            let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
            let hooks: Arc<dyn WorkerHooks> = Arc::new(NoHooks);
            let worker = Worker::new(
                id,
                Arc::clone(&self.queue),
                self.context.clone(),
                Arc::clone(&self.metrics),
                hooks,
            );
            worker.start()?;
            workers.push(worker);
        }
        drop(workers);
        self.state.store(PoolState::Running as u8, Ordering::Release);
        self.context.log(LogLevel::Info, "pool started");
        Ok(())
    }

    /// Enqueues `job` via the configured queue/overflow policy and records
    /// submission metrics. Only valid while `Running`.
    pub fn submit(&self, mut job: Job) -> Result<(), ErrorInfo> {
        if self.state() != PoolState::Running {
            return Err(pool_not_running());
        }
        let start = Instant::now();
        for policy in &self.policies {
            job = policy.on_submit(self, job)?;
        }
        self.queue.enqueue(job)?;
        self.metrics.record_submitted(start.elapsed().as_nanos() as u64);
        self.metrics.record_queue_depth(self.queue.size());
        Ok(())
    }

    /// `Running -> Stopping -> Stopped`. Concurrent callers linearize on a
    /// CAS over the state; everyone but the winner returns `Ok` (idempotent,
    /// §8: "`stop()` applied twice returns `Ok` the second time").
    pub fn stop(&self, immediate: bool) -> Result<(), ErrorInfo> {
        if self
            .state
            .compare_exchange(
                PoolState::Running as u8,
                PoolState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(());
        }
        self.queue.stop();
        let workers = self.workers.lock().unwrap().clone();
        for worker in &workers {
            worker.stop(immediate)?;
        }
        self.state.store(PoolState::Stopped as u8, Ordering::Release);
        self.context.log(LogLevel::Info, "pool stopped");
        Ok(())
    }

    /// Autoscale-down: stops and joins up to `n` idle workers (LIFO), never
    /// dropping below `min_workers` nor stopping the last worker while
    /// running unless `min_workers == 0`.
    pub fn remove_workers_internal(&self, n: usize) -> Result<usize, ErrorInfo> {
        use crate::worker::WorkerState;
        let mut workers = self.workers.lock().unwrap();
        let mut removed = 0;
        while removed < n {
            if workers.len() <= self.min_workers {
                break;
            }
            if workers.len() <= 1 && self.state() == PoolState::Running && self.min_workers > 0 {
                break;
            }
            let idle_idx = workers
                .iter()
                .enumerate()
                .rev()
                .find(|(_, w)| w.state() == WorkerState::Waiting)
                .map(|(i, _)| i);
            let Some(idx) = idle_idx else { break };
            let worker = workers.remove(idx);
            worker.stop(false)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Autoscale-up: spawns `n` additional workers sharing the pool's queue.
    pub fn add_workers_internal(self: &Arc<Self>, n: usize) -> Result<usize, ErrorInfo> {
        let mut workers = self.workers.lock().unwrap();
        let mut added = 0;
        for _ in 0..n {
            let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
            let hooks: Arc<dyn WorkerHooks> = Arc::new(NoHooks);
            let worker = Worker::new(
                id,
                Arc::clone(&self.queue),
                self.context.clone(),
                Arc::clone(&self.metrics),
                hooks,
            );
            worker.start()?;
            workers.push(worker);
            added += 1;
        }
        Ok(added)
    }

    pub fn run_tick_hooks(&self) {
        for policy in &self.policies {
            policy.on_tick(self);
        }
    }
}

/// Builds a pool with a plain mutex queue and no extra policies; the
/// full-featured construction path lives in the `taskloom` facade's
/// `ThreadPoolBuilder` (§6).
pub fn simple_pool(worker_count: usize) -> Arc<ThreadPool> {
    ThreadPool::new(
        worker_count,
        0,
        Arc::new(MutexQueue::new()),
        ThreadContext::default(),
        MetricsService::new(),
        Vec::new(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    #[test]
    fn submits_and_runs_jobs_to_completion() {
        let pool = simple_pool(4);
        pool.start().unwrap();
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..1000 {
            let counter = Arc::clone(&counter);
            pool.submit(Job::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 1000 && Instant::now() < deadline {
            thread_sleep();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1000);
        pool.stop(false).unwrap();
    }

    #[test]
    fn submit_after_stop_is_rejected() {
        let pool = simple_pool(2);
        pool.start().unwrap();
        pool.stop(false).unwrap();
        assert!(pool.submit(Job::new(|| Ok(()))).is_err());
    }

    #[test]
    fn stop_twice_is_idempotent() {
        let pool = simple_pool(2);
        pool.start().unwrap();
        pool.stop(false).unwrap();
        assert!(pool.stop(false).is_ok());
    }

    #[test]
    fn start_twice_fails() {
        let pool = simple_pool(2);
        pool.start().unwrap();
        assert!(pool.start().is_err());
        pool.stop(false).unwrap();
    }

    fn thread_sleep() {
        std::thread::sleep(Duration::from_millis(5));
    }
}

