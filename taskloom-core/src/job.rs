//! Jobs and cooperative cancellation.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::error::ErrorInfo;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque, unique job identifier assigned at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    fn next() -> Self {
        JobId(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Shared cancellation state, optionally linked to a parent token so that a
/// parent's `cancel()` propagates to every child.
///
/// `cancel()` flips `is_cancelled` exactly once (first caller wins the CAS)
/// and then runs every callback registered up to that point, in
/// registration order. Callbacks registered afterwards run immediately
/// inline with `register_callback`.
pub struct CancellationToken {
    is_cancelled: AtomicBool,
    callbacks: Mutex<Option<Vec<Box<dyn FnOnce() + Send>>>>,
}

impl CancellationToken {
    pub fn new() -> Arc<Self> {
        Arc::new(CancellationToken {
            is_cancelled: AtomicBool::new(false),
            callbacks: Mutex::new(Some(Vec::new())),
        })
    }

    /// Create a child token: cancelling `parent`, now or later, cancels the
    /// child, but not vice versa. The parent holds only a `Weak` back-edge
    /// (via the callback closure) so the link can't leak an `Arc` cycle.
    pub fn child_of(parent: &Arc<CancellationToken>) -> Arc<Self> {
        let child = Arc::new(CancellationToken {
            is_cancelled: AtomicBool::new(parent.is_cancelled()),
            callbacks: Mutex::new(Some(Vec::new())),
        });
        let weak_child = Arc::downgrade(&child);
        parent.register_callback(move || {
            if let Some(child) = weak_child.upgrade() {
                child.cancel();
            }
        });
        child
    }

    pub fn is_cancelled(&self) -> bool {
        self.is_cancelled.load(Ordering::SeqCst)
    }

    /// Register a callback to run when this token (or any ancestor) is
    /// cancelled. If already cancelled, runs `f` immediately on the calling
    /// thread instead of queuing it.
    pub fn register_callback(self: &Arc<Self>, f: impl FnOnce() + Send + 'static) {
        let mut guard = self.callbacks.lock().unwrap();
        match guard.as_mut() {
            Some(list) if !self.is_cancelled() => list.push(Box::new(f)),
            _ => {
                drop(guard);
                f();
            }
        }
    }

    /// Transition to cancelled exactly once; invoke every callback
    /// registered so far, in order, then drain the list so later
    /// registrations run immediately instead of accumulating forever.
    pub fn cancel(self: &Arc<Self>) {
        if self
            .is_cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let callbacks = self.callbacks.lock().unwrap().take().unwrap_or_default();
        for cb in callbacks {
            cb();
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Metadata tracked alongside every job for diagnostics and metrics.
#[derive(Clone, Debug)]
pub struct JobMetadata {
    pub submitted_at: Instant,
    pub started_at: Option<Instant>,
    pub attempt: u32,
}

impl JobMetadata {
    fn new() -> Self {
        JobMetadata {
            submitted_at: Instant::now(),
            started_at: None,
            attempt: 0,
        }
    }
}

type JobFn = Box<dyn FnOnce() -> Result<(), ErrorInfo> + Send>;

/// A unit of scheduled work.
///
/// Owned exclusively by a queue between `enqueue` and `dequeue`, then
/// exclusively by the worker that dequeued it until execution completes.
pub struct Job {
    pub id: JobId,
    pub name: Option<String>,
    pub cancellation: Arc<CancellationToken>,
    pub metadata: JobMetadata,
    func: Option<JobFn>,
}

impl Job {
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce() -> Result<(), ErrorInfo> + Send + 'static,
    {
        Job {
            id: JobId::next(),
            name: None,
            cancellation: CancellationToken::new(),
            metadata: JobMetadata::new(),
            func: Some(Box::new(func)),
        }
    }

    pub fn named<F>(name: impl Into<String>, func: F) -> Self
    where
        F: FnOnce() -> Result<(), ErrorInfo> + Send + 'static,
    {
        let mut job = Job::new(func);
        job.name = Some(name.into());
        job
    }

    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancellation = token;
        self
    }

    /// Wrap this job's closure so `after` observes its `Result` once it
    /// finishes running, without changing when or how it runs. Used by
    /// policies (the circuit breaker) that need to react to a job's actual
    /// outcome regardless of which worker ends up executing it or how long
    /// it sits queued first -- a pool-level "on completion" hook can't do
    /// that without either a dequeue-time hook on every `Queue`
    /// implementation or correlating hook calls by job id; wrapping the
    /// closure needs neither.
    pub fn wrap(mut self, after: impl FnOnce(&Result<(), ErrorInfo>) + Send + 'static) -> Self {
        let inner = self.func.take().expect("Job::wrap called after run");
        self.func = Some(Box::new(move || {
            let result = inner();
            after(&result);
            result
        }));
        self
    }

    /// Consume and run the job's closure. Panics inside `func` are the
    /// caller's responsibility to catch (the worker does so at its
    /// boundary via `std::panic::catch_unwind`).
    pub fn run(mut self) -> Result<(), ErrorInfo> {
        self.metadata.started_at = Some(Instant::now());
        self.metadata.attempt += 1;
        let func = self.func.take().expect("Job::run called twice");
        func()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// A job carrying a user-defined, totally ordered priority tag `P`.
pub struct TypedJob<P> {
    pub job: Job,
    pub priority: P,
}

impl<P> TypedJob<P> {
    pub fn new(job: Job, priority: P) -> Self {
        TypedJob { job, priority }
    }
}

/// An aging typed job additionally tracks the boost applied by the priority
/// aging thread, per §4.5.
pub struct AgingTypedJob<P> {
    pub job: Job,
    pub original_priority: P,
    pub current_boost: f64,
    pub max_boost: f64,
    pub enqueue_time: Instant,
}

impl<P> AgingTypedJob<P> {
    pub fn new(job: Job, priority: P, max_boost: f64) -> Self {
        AgingTypedJob {
            job,
            original_priority: priority,
            current_boost: 0.0,
            max_boost,
            enqueue_time: Instant::now(),
        }
    }

    pub fn apply_boost(&mut self, boost: f64) {
        self.current_boost = boost.min(self.max_boost).max(0.0);
    }
}

/// Lightweight snapshot of a job used by diagnostics/starvation callbacks,
/// decoupled from the job's execution closure so it can be cloned and sent
/// across threads freely.
#[derive(Clone, Debug)]
pub struct JobInfo {
    pub id: JobId,
    pub name: Option<String>,
    pub submitted_at: Instant,
    pub waited: std::time::Duration,
}

impl JobInfo {
    pub fn from_job(job: &Job) -> Self {
        JobInfo {
            id: job.id,
            name: job.name.clone(),
            submitted_at: job.metadata.submitted_at,
            waited: job.metadata.submitted_at.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn cancel_runs_registered_callbacks_once_in_order() {
        let token = CancellationToken::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            token.register_callback(move || order.lock().unwrap().push(i));
        }
        token.cancel();
        token.cancel(); // second call is a no-op
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn callback_registered_after_cancel_runs_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        token.register_callback(move || ran2.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn child_token_is_cancelled_when_parent_cancels_later() {
        let parent = CancellationToken::new();
        let child = CancellationToken::child_of(&parent);
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn child_created_from_an_already_cancelled_parent_starts_cancelled() {
        let parent = CancellationToken::new();
        parent.cancel();
        let child = CancellationToken::child_of(&parent);
        assert!(child.is_cancelled());
    }

    #[test]
    fn wrap_observes_the_result_after_the_inner_closure_runs() {
        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        let job = Job::new(|| Ok(())).wrap(move |result| {
            *seen2.lock().unwrap() = Some(result.is_ok());
        });
        job.run().unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(true));
    }

    #[test]
    fn job_runs_closure_exactly_once() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter2 = Arc::clone(&counter);
        let job = Job::new(move || {
            counter2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        job.run().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
