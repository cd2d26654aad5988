//! Worker lifecycle and the work loop (§4.1).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::context::{LogLevel, ThreadContext};
use crate::error::{ErrorCode, ErrorInfo};
use crate::job::{CancellationToken, Job, JobInfo};
use crate::metrics::{MetricsService, WorkerCounters};
use crate::queue::{DequeueOutcome, Queue};

const MODULE: &str = "worker";
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 11;
const BACKOFF_CAP_MS: u64 = 10_000;
/// Poll interval used when the active queue doesn't support a blocking wait
/// (e.g. the work-stealing adapter) and no explicit wake interval is set.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Created = 0,
    Waiting = 1,
    Working = 2,
    Stopping = 3,
    Stopped = 4,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Created,
            1 => WorkerState::Waiting,
            2 => WorkerState::Working,
            3 => WorkerState::Stopping,
            _ => WorkerState::Stopped,
        }
    }
}

/// Hooks the owning pool installs so the worker's loop can invoke
/// pool-level policies without holding a back-reference to the pool itself
/// (§9 "cyclic ownership": workers hold `Arc<MetricsService>`, not the pool).
pub trait WorkerHooks: Send + Sync {
    fn before_start(&self, _worker_id: usize) {}
    fn after_stop(&self, _worker_id: usize) {}
    /// Extra predicate beyond "stop requested and queue empty" that can keep
    /// a worker alive (used by periodic/aging-style workers). Plain pools
    /// never need this and can rely on the default.
    fn should_continue_work(&self, _worker_id: usize) -> bool {
        false
    }
    fn on_job_complete(&self, _worker_id: usize, _success: bool, _duration: Duration) {}
}

/// A no-op `WorkerHooks` for standalone worker tests / simple pools.
pub struct NoopHooks;
impl WorkerHooks for NoopHooks {}

/// Long-lived OS thread that repeatedly dequeues and executes jobs.
pub struct Worker {
    pub id: usize,
    queue: Mutex<Arc<dyn Queue>>,
    context: ThreadContext,
    metrics: Arc<MetricsService>,
    hooks: Arc<dyn WorkerHooks>,
    counters: Arc<WorkerCounters>,
    state: AtomicU8,
    stop_requested: AtomicBool,
    immediate_stop: AtomicBool,
    wake_interval: Mutex<Option<Duration>>,
    current_job_token: Mutex<Option<Arc<CancellationToken>>>,
    current_job_info: Mutex<Option<JobInfo>>,
    max_consecutive_failures: u32,
    failure_count: AtomicU32,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: Arc<dyn Queue>,
        context: ThreadContext,
        metrics: Arc<MetricsService>,
        hooks: Arc<dyn WorkerHooks>,
    ) -> Arc<Self> {
        let counters = WorkerCounters::new();
        metrics.register_worker(Arc::clone(&counters));
        Arc::new(Worker {
            id,
            queue: Mutex::new(queue),
            context,
            metrics,
            hooks,
            counters,
            state: AtomicU8::new(WorkerState::Created as u8),
            stop_requested: AtomicBool::new(false),
            immediate_stop: AtomicBool::new(false),
            wake_interval: Mutex::new(None),
            current_job_token: Mutex::new(None),
            current_job_info: Mutex::new(None),
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            failure_count: AtomicU32::new(0),
            thread: Mutex::new(None),
        })
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: WorkerState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn jobs_processed(&self) -> u64 {
        self.counters.jobs_processed.load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> &Arc<WorkerCounters> {
        &self.counters
    }

    pub fn current_job(&self) -> Option<JobInfo> {
        self.current_job_info.lock().unwrap().clone()
    }

    pub fn set_wake_interval(&self, interval: Option<Duration>) {
        *self.wake_interval.lock().unwrap() = interval;
    }

    pub fn is_immediate_stop(&self) -> bool {
        self.immediate_stop.load(Ordering::SeqCst)
    }

    /// Replace this worker's queue without racing an in-flight `do_work`.
    /// The read side (`do_work`) clones the `Arc<dyn Queue>` under the same
    /// mutex before using it, so the old queue stays alive for the
    /// duration of any dequeue/execute already started on it.
    pub fn set_queue(&self, new_queue: Arc<dyn Queue>) {
        *self.queue.lock().unwrap() = new_queue;
    }

    fn active_queue(&self) -> Arc<dyn Queue> {
        Arc::clone(&self.queue.lock().unwrap())
    }

    /// Spawn the OS thread running the work loop. Fails if the previous
    /// thread spawned by this worker has not been joined yet.
    pub fn start(self: &Arc<Self>) -> Result<(), ErrorInfo> {
        let mut thread_guard = self.thread.lock().unwrap();
        if thread_guard.is_some() {
            return Err(ErrorInfo::new(
                ErrorCode::ThreadAlreadyRunning,
                MODULE,
                format!("worker {} is already running", self.id),
            ));
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        self.immediate_stop.store(false, Ordering::SeqCst);
        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("taskloom-worker-{}", self.id))
            .spawn(move || this.run())
            .map_err(|e| {
                ErrorInfo::new(
                    ErrorCode::ResourceAllocationFailed,
                    MODULE,
                    format!("failed to spawn worker thread: {e}"),
                )
            })?;
        *thread_guard = Some(handle);
        Ok(())
    }

    /// Request cooperative shutdown and join. Calling this from inside the
    /// worker's own thread would deadlock on the join, so it is rejected.
    pub fn stop(&self, immediate: bool) -> Result<(), ErrorInfo> {
        if thread::current().name() == Some(&format!("taskloom-worker-{}", self.id)) {
            return Err(ErrorInfo::new(
                ErrorCode::InvalidArgument,
                MODULE,
                "worker.stop() cannot be called from within its own thread",
            ));
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        if immediate {
            self.immediate_stop.store(true, Ordering::SeqCst);
            if let Some(token) = self.current_job_token.lock().unwrap().as_ref() {
                token.cancel();
            }
            self.active_queue().clear();
        } else if let Some(token) = self.current_job_token.lock().unwrap().as_ref() {
            // Non-immediate stop still cancels the in-flight job's token so
            // cooperative jobs can observe it; the queue is left to drain.
            token.cancel();
        }
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }

    fn run(self: Arc<Self>) {
        self.hooks.before_start(self.id);
        loop {
            self.set_state(WorkerState::Waiting);
            let should_stop = self.stop_requested.load(Ordering::SeqCst)
                && !self.hooks.should_continue_work(self.id);
            if should_stop {
                self.set_state(WorkerState::Stopping);
                break;
            }

            self.set_state(WorkerState::Working);
            let idle_start = Instant::now();
            match self.do_work() {
                WorkOutcome::Ran { idle_ns } => {
                    self.counters
                        .total_idle_ns
                        .fetch_add(idle_ns, Ordering::Relaxed);
                }
                WorkOutcome::NoWork => {
                    let idle_for = self.poll_interval();
                    thread::sleep(idle_for);
                    self.counters
                        .total_idle_ns
                        .fetch_add(idle_start.elapsed().as_nanos() as u64, Ordering::Relaxed);
                }
                WorkOutcome::QueueStopped => {
                    if !self.hooks.should_continue_work(self.id) {
                        self.set_state(WorkerState::Stopping);
                        break;
                    }
                }
            }
        }
        self.hooks.after_stop(self.id);
        self.set_state(WorkerState::Stopped);
    }

    fn poll_interval(&self) -> Duration {
        self.wake_interval
            .lock()
            .unwrap()
            .unwrap_or(DEFAULT_POLL_INTERVAL)
    }

    /// Dequeue and execute one job (if any), catching panics at the worker
    /// boundary (§7) and applying exponential-backoff failure containment
    /// (§4.1).
    fn do_work(&self) -> WorkOutcome {
        let queue = self.active_queue();
        match queue.dequeue() {
            DequeueOutcome::Job(job) => {
                self.execute(job);
                WorkOutcome::Ran { idle_ns: 0 }
            }
            DequeueOutcome::Empty => WorkOutcome::NoWork,
            DequeueOutcome::Stopped => WorkOutcome::QueueStopped,
        }
    }

    fn execute(&self, job: Job) {
        let wait_ns = job.metadata.submitted_at.elapsed().as_nanos() as u64;
        *self.current_job_token.lock().unwrap() = Some(Arc::clone(&job.cancellation));
        *self.current_job_info.lock().unwrap() = Some(JobInfo::from_job(&job));

        let start = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| job.run()));
        let duration = start.elapsed();

        *self.current_job_token.lock().unwrap() = None;
        *self.current_job_info.lock().unwrap() = None;

        let success = matches!(result, Ok(Ok(())));
        self.counters.jobs_processed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_busy_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        self.metrics
            .record_completed(success, duration.as_nanos() as u64, wait_ns);
        self.hooks.on_job_complete(self.id, success, duration);

        match result {
            Ok(Ok(())) => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
            Ok(Err(err)) => {
                self.context
                    .log(LogLevel::Warning, &format!("job failed: {err}"));
                self.on_job_failure();
            }
            Err(panic) => {
                let message = panic_message(&panic);
                self.context
                    .log(LogLevel::Error, &format!("job panicked: {message}"));
                self.on_job_failure();
            }
        }
    }

    fn on_job_failure(&self) {
        let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.max_consecutive_failures {
            self.context.log(
                LogLevel::Critical,
                &format!(
                    "worker {} exiting after {} consecutive job failures",
                    self.id, failures
                ),
            );
            self.stop_requested.store(true, Ordering::SeqCst);
        } else {
            let backoff_ms = (100u64.saturating_mul(1u64 << (failures.saturating_sub(1))))
                .min(BACKOFF_CAP_MS);
            thread::sleep(Duration::from_millis(backoff_ms));
        }
    }
}

enum WorkOutcome {
    Ran { idle_ns: u64 },
    NoWork,
    QueueStopped,
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MutexQueue;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn executes_submitted_jobs() {
        let queue: Arc<dyn Queue> = Arc::new(MutexQueue::new());
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            queue
                .enqueue(Job::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
                .unwrap();
        }
        let worker = Worker::new(
            0,
            queue,
            ThreadContext::new(),
            MetricsService::new(),
            Arc::new(NoopHooks),
        );
        worker.start().unwrap();
        // Give the worker a moment to drain the 5 jobs, then stop.
        thread::sleep(Duration::from_millis(50));
        worker.stop(false).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(worker.jobs_processed(), 5);
    }

    #[test]
    fn start_twice_without_join_fails() {
        let queue: Arc<dyn Queue> = Arc::new(MutexQueue::new());
        let worker = Worker::new(
            0,
            queue,
            ThreadContext::new(),
            MetricsService::new(),
            Arc::new(NoopHooks),
        );
        worker.start().unwrap();
        assert!(worker.start().is_err());
        worker.stop(false).unwrap();
    }

    #[test]
    fn stop_from_own_thread_is_rejected() {
        use std::sync::atomic::AtomicBool;
        let queue: Arc<dyn Queue> = Arc::new(MutexQueue::new());
        let worker = Worker::new(
            0,
            Arc::clone(&queue),
            ThreadContext::new(),
            MetricsService::new(),
            Arc::new(NoopHooks),
        );
        let rejected = Arc::new(AtomicBool::new(false));
        let rejected2 = Arc::clone(&rejected);
        let worker_for_job = Arc::clone(&worker);
        queue
            .enqueue(Job::new(move || {
                rejected2.store(worker_for_job.stop(false).is_err(), Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        worker.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        worker.stop(false).unwrap();
        assert!(rejected.load(Ordering::SeqCst));
    }

    #[test]
    fn panicking_job_is_caught_and_counted_as_failure() {
        let queue: Arc<dyn Queue> = Arc::new(MutexQueue::new());
        queue
            .enqueue(Job::new(|| panic!("boom")))
            .unwrap();
        let worker = Worker::new(
            0,
            queue,
            ThreadContext::new(),
            MetricsService::new(),
            Arc::new(NoopHooks),
        );
        worker.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        worker.stop(false).unwrap();
        assert_eq!(worker.jobs_processed(), 1);
    }
}
