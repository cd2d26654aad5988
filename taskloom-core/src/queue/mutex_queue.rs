//! Mutex/condition-variable backed FIFO queue (`job_queue`, §4.2.1).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::ErrorInfo;
use crate::job::Job;

use super::{queue_stopped, Capabilities, DequeueOutcome, Queue};

struct Inner {
    jobs: VecDeque<Job>,
}

/// Standard blocking FIFO queue. `dequeue` parks on a condition variable
/// until a job arrives or `stop()` wakes every waiter.
pub struct MutexQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    stopped: AtomicBool,
}

impl MutexQueue {
    pub fn new() -> Self {
        MutexQueue {
            inner: Mutex::new(Inner {
                jobs: VecDeque::new(),
            }),
            not_empty: Condvar::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Block until a job is available, `stop()` is called, or `timeout`
    /// elapses (whichever first). Used by the mutex-mode path of the
    /// adaptive queue and by workers configured with a wake interval.
    pub fn dequeue_timeout(&self, timeout: Duration) -> DequeueOutcome {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(job) = guard.jobs.pop_front() {
                return DequeueOutcome::Job(job);
            }
            if self.stopped.load(Ordering::SeqCst) {
                return DequeueOutcome::Stopped;
            }
            let (g, timeout_result) = self.not_empty.wait_timeout(guard, timeout).unwrap();
            guard = g;
            if timeout_result.timed_out() && guard.jobs.is_empty() {
                return DequeueOutcome::Empty;
            }
        }
    }
}

impl Default for MutexQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue for MutexQueue {
    fn enqueue(&self, job: Job) -> Result<(), ErrorInfo> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(queue_stopped());
        }
        let mut guard = self.inner.lock().unwrap();
        // Re-check under the lock: a racing stop() may have landed between
        // our relaxed-ish load above and acquiring the mutex.
        if self.stopped.load(Ordering::SeqCst) {
            return Err(queue_stopped());
        }
        guard.jobs.push_back(job);
        drop(guard);
        self.not_empty.notify_one();
        Ok(())
    }

    fn dequeue(&self) -> DequeueOutcome {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(job) = guard.jobs.pop_front() {
                return DequeueOutcome::Job(job);
            }
            if self.stopped.load(Ordering::SeqCst) {
                return DequeueOutcome::Stopped;
            }
            guard = self.not_empty.wait(guard).unwrap();
        }
    }

    fn try_dequeue(&self) -> DequeueOutcome {
        let mut guard = self.inner.lock().unwrap();
        if let Some(job) = guard.jobs.pop_front() {
            DequeueOutcome::Job(job)
        } else if self.stopped.load(Ordering::SeqCst) {
            DequeueOutcome::Stopped
        } else {
            DequeueOutcome::Empty
        }
    }

    fn size(&self) -> usize {
        self.inner.lock().unwrap().jobs.len()
    }

    fn clear(&self) {
        self.inner.lock().unwrap().jobs.clear();
    }

    fn stop(&self) {
        // `notify_all` happens exactly once in practice: subsequent calls
        // still wake (spuriously harmless) waiters but the bool-swap is
        // what makes repeated `stop()` idempotent for callers (§8).
        self.stopped.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock().unwrap();
        self.not_empty.notify_all();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            exact_size: true,
            atomic_empty_check: true,
            lock_free: false,
            wait_free: false,
            supports_batch: true,
            supports_blocking_wait: true,
            supports_stop: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_then_dequeue_returns_same_identity() {
        let q = MutexQueue::new();
        let job = Job::new(|| Ok(()));
        let id = job.id;
        q.enqueue(job).unwrap();
        match q.dequeue() {
            DequeueOutcome::Job(j) => assert_eq!(j.id, id),
            _ => panic!("expected job"),
        }
    }

    #[test]
    fn enqueue_after_stop_fails() {
        let q = MutexQueue::new();
        q.stop();
        assert!(q.enqueue(Job::new(|| Ok(()))).is_err());
    }

    #[test]
    fn double_stop_is_idempotent() {
        let q = MutexQueue::new();
        q.stop();
        q.stop();
        assert!(q.is_stopped());
    }

    #[test]
    fn try_dequeue_empty_returns_empty_not_stopped() {
        let q = MutexQueue::new();
        assert!(matches!(q.try_dequeue(), DequeueOutcome::Empty));
    }
}
