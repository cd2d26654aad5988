//! Policy-parameterized queue template (§4.2.4): a queue assembled from a
//! `(SyncPolicy, BoundPolicy, OverflowPolicy)` triple, validated at
//! construction time so invalid combinations (e.g. lock-free sync with a
//! blocking overflow policy) never reach a caller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{ErrorCode, ErrorInfo};
use crate::job::Job;

use super::adaptive::{AdaptiveQueue, AdaptiveQueueConfig};
use super::lockfree_mpmc::LockFreeQueue;
use super::{queue_full, queue_stopped, Capabilities, DequeueOutcome, Queue};

const MODULE: &str = "queue::policy";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPolicy {
    MutexSync,
    LockFreeSync,
    AdaptiveSync,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundPolicy {
    Unbounded,
    Bounded(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    Reject,
    Block,
    DropOldest,
    DropNewest,
    Timeout(Duration),
}

/// Rejects combinations that cannot be implemented soundly, per §4.2.4:
/// neither `LockFreeSync` nor `AdaptiveSync` has a mutex to park a blocked
/// enqueuer on at the moment of the check (`AdaptiveSync` may be running in
/// lock-free mode at exactly that moment), so both reject a blocking
/// overflow policy the same way.
pub fn validate(sync: SyncPolicy, bound: BoundPolicy, overflow: OverflowPolicy) -> Result<(), ErrorInfo> {
    let blocking_overflow = matches!(overflow, OverflowPolicy::Block | OverflowPolicy::Timeout(_));
    if sync != SyncPolicy::MutexSync && blocking_overflow {
        return Err(ErrorInfo::new(
            ErrorCode::InvalidArgument,
            MODULE,
            "LockFreeSync/AdaptiveSync cannot be combined with a blocking overflow policy (Block/Timeout)",
        ));
    }
    if bound == BoundPolicy::Unbounded && blocking_overflow {
        return Err(ErrorInfo::new(
            ErrorCode::InvalidArgument,
            MODULE,
            "Block/Timeout overflow policies require a Bounded capacity",
        ));
    }
    Ok(())
}

/// The `MutexSync` storage: a plain `VecDeque` behind a mutex, with separate
/// condvars for "not empty" and "not full" so `Block`/`Timeout` overflow can
/// park an enqueuer.
struct MutexStorage {
    inner: Mutex<VecDeque<Job>>,
    not_empty: Condvar,
    not_full: Condvar,
    stopped: AtomicBool,
}

/// Which concrete queue backs a [`PolicyQueue`], selected by its
/// [`SyncPolicy`] at construction. `LockFreeSync` and `AdaptiveSync` reuse
/// the crate's own [`LockFreeQueue`]/[`AdaptiveQueue`] rather than
/// reimplementing lock-free enqueue/dequeue a second time here.
enum Storage {
    Mutex(MutexStorage),
    LockFree(LockFreeQueue),
    Adaptive(AdaptiveQueue),
}

/// A queue whose synchronization, capacity and overflow behavior are
/// selected independently. `MutexSync` supports every overflow policy,
/// including `Block`/`Timeout`; `LockFreeSync`/`AdaptiveSync` are
/// non-blocking by construction (`validate` rejects pairing them with a
/// blocking overflow policy), so their bound check against the underlying
/// queue's (possibly approximate) `size()` is best-effort rather than
/// linearizable, same as the lock-free queue they're built on.
pub struct PolicyQueue {
    storage: Storage,
    bound: BoundPolicy,
    overflow: OverflowPolicy,
}

impl PolicyQueue {
    pub fn new(sync: SyncPolicy, bound: BoundPolicy, overflow: OverflowPolicy) -> Result<Self, ErrorInfo> {
        validate(sync, bound, overflow)?;
        let storage = match sync {
            SyncPolicy::MutexSync => Storage::Mutex(MutexStorage {
                inner: Mutex::new(VecDeque::new()),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                stopped: AtomicBool::new(false),
            }),
            SyncPolicy::LockFreeSync => Storage::LockFree(LockFreeQueue::new()),
            SyncPolicy::AdaptiveSync => {
                Storage::Adaptive(AdaptiveQueue::new(AdaptiveQueueConfig::default()))
            }
        };
        Ok(PolicyQueue { storage, bound, overflow })
    }

    fn capacity(&self) -> Option<usize> {
        match self.bound {
            BoundPolicy::Unbounded => None,
            BoundPolicy::Bounded(n) => Some(n),
        }
    }

    fn is_full(&self, size: usize) -> bool {
        matches!(self.capacity(), Some(cap) if size >= cap)
    }

    fn enqueue_mutex(&self, m: &MutexStorage, job: Job) -> Result<(), ErrorInfo> {
        if m.stopped.load(Ordering::SeqCst) {
            return Err(queue_stopped());
        }
        let mut guard = m.inner.lock().unwrap();
        if !self.is_full(guard.len()) {
            guard.push_back(job);
            drop(guard);
            m.not_empty.notify_one();
            return Ok(());
        }
        match self.overflow {
            OverflowPolicy::Reject => Err(queue_full()),
            OverflowPolicy::DropNewest => Ok(()),
            OverflowPolicy::DropOldest => {
                guard.pop_front();
                guard.push_back(job);
                drop(guard);
                m.not_empty.notify_one();
                Ok(())
            }
            OverflowPolicy::Block => loop {
                if m.stopped.load(Ordering::SeqCst) {
                    return Err(queue_stopped());
                }
                if !self.is_full(guard.len()) {
                    guard.push_back(job);
                    drop(guard);
                    m.not_empty.notify_one();
                    return Ok(());
                }
                guard = m.not_full.wait(guard).unwrap();
            },
            OverflowPolicy::Timeout(d) => {
                let deadline = Instant::now() + d;
                loop {
                    if m.stopped.load(Ordering::SeqCst) {
                        return Err(queue_stopped());
                    }
                    if !self.is_full(guard.len()) {
                        guard.push_back(job);
                        drop(guard);
                        m.not_empty.notify_one();
                        return Ok(());
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(queue_full());
                    }
                    let (g, _) = m.not_full.wait_timeout(guard, deadline - now).unwrap();
                    guard = g;
                }
            }
        }
    }

    /// Shared by the `LockFreeSync`/`AdaptiveSync` branches: `validate`
    /// already guarantees `overflow` is never `Block`/`Timeout` here.
    fn enqueue_nonblocking(&self, q: &dyn Queue, job: Job) -> Result<(), ErrorInfo> {
        if q.is_stopped() {
            return Err(queue_stopped());
        }
        if !self.is_full(q.size()) {
            return q.enqueue(job);
        }
        match self.overflow {
            OverflowPolicy::Reject => Err(queue_full()),
            OverflowPolicy::DropNewest => Ok(()),
            OverflowPolicy::DropOldest => {
                let _ = q.try_dequeue();
                q.enqueue(job)
            }
            OverflowPolicy::Block | OverflowPolicy::Timeout(_) => {
                unreachable!("validate() rejects blocking overflow for non-MutexSync")
            }
        }
    }
}

impl Queue for PolicyQueue {
    fn enqueue(&self, job: Job) -> Result<(), ErrorInfo> {
        match &self.storage {
            Storage::Mutex(m) => self.enqueue_mutex(m, job),
            Storage::LockFree(q) => self.enqueue_nonblocking(q, job),
            Storage::Adaptive(q) => self.enqueue_nonblocking(q, job),
        }
    }

    fn dequeue(&self) -> DequeueOutcome {
        match &self.storage {
            Storage::Mutex(m) => {
                let mut guard = m.inner.lock().unwrap();
                loop {
                    if let Some(job) = guard.pop_front() {
                        drop(guard);
                        m.not_full.notify_one();
                        return DequeueOutcome::Job(job);
                    }
                    if m.stopped.load(Ordering::SeqCst) {
                        return DequeueOutcome::Stopped;
                    }
                    guard = m.not_empty.wait(guard).unwrap();
                }
            }
            Storage::LockFree(q) => q.dequeue(),
            Storage::Adaptive(q) => q.dequeue(),
        }
    }

    fn try_dequeue(&self) -> DequeueOutcome {
        match &self.storage {
            Storage::Mutex(m) => {
                let mut guard = m.inner.lock().unwrap();
                if let Some(job) = guard.pop_front() {
                    drop(guard);
                    m.not_full.notify_one();
                    DequeueOutcome::Job(job)
                } else if m.stopped.load(Ordering::SeqCst) {
                    DequeueOutcome::Stopped
                } else {
                    DequeueOutcome::Empty
                }
            }
            Storage::LockFree(q) => q.try_dequeue(),
            Storage::Adaptive(q) => q.try_dequeue(),
        }
    }

    fn size(&self) -> usize {
        match &self.storage {
            Storage::Mutex(m) => m.inner.lock().unwrap().len(),
            Storage::LockFree(q) => q.size(),
            Storage::Adaptive(q) => q.size(),
        }
    }

    fn clear(&self) {
        match &self.storage {
            Storage::Mutex(m) => {
                let mut guard = m.inner.lock().unwrap();
                guard.clear();
                drop(guard);
                m.not_full.notify_all();
            }
            Storage::LockFree(q) => q.clear(),
            Storage::Adaptive(q) => q.clear(),
        }
    }

    fn stop(&self) {
        match &self.storage {
            Storage::Mutex(m) => {
                m.stopped.store(true, Ordering::SeqCst);
                let _guard = m.inner.lock().unwrap();
                m.not_empty.notify_all();
                m.not_full.notify_all();
            }
            Storage::LockFree(q) => q.stop(),
            Storage::Adaptive(q) => q.stop(),
        }
    }

    fn is_stopped(&self) -> bool {
        match &self.storage {
            Storage::Mutex(m) => m.stopped.load(Ordering::SeqCst),
            Storage::LockFree(q) => q.is_stopped(),
            Storage::Adaptive(q) => q.is_stopped(),
        }
    }

    fn capabilities(&self) -> Capabilities {
        match &self.storage {
            Storage::Mutex(_) => Capabilities {
                exact_size: true,
                atomic_empty_check: true,
                lock_free: false,
                wait_free: false,
                supports_batch: true,
                supports_blocking_wait: true,
                supports_stop: true,
            },
            Storage::LockFree(q) => q.capabilities(),
            Storage::Adaptive(q) => q.capabilities(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_lockfree_with_blocking_overflow() {
        assert!(validate(SyncPolicy::LockFreeSync, BoundPolicy::Bounded(4), OverflowPolicy::Block).is_err());
    }

    #[test]
    fn rejects_adaptive_with_blocking_overflow() {
        assert!(validate(SyncPolicy::AdaptiveSync, BoundPolicy::Bounded(4), OverflowPolicy::Block).is_err());
    }

    #[test]
    fn reject_overflow_returns_queue_full() {
        let q = PolicyQueue::new(SyncPolicy::MutexSync, BoundPolicy::Bounded(1), OverflowPolicy::Reject).unwrap();
        q.enqueue(Job::new(|| Ok(()))).unwrap();
        assert!(q.enqueue(Job::new(|| Ok(()))).is_err());
        assert_eq!(q.size(), 1);
    }

    #[test]
    fn drop_oldest_keeps_size_and_drops_oldest() {
        let q = PolicyQueue::new(SyncPolicy::MutexSync, BoundPolicy::Bounded(2), OverflowPolicy::DropOldest).unwrap();
        let first = Job::new(|| Ok(()));
        let first_id = first.id;
        q.enqueue(first).unwrap();
        q.enqueue(Job::new(|| Ok(()))).unwrap();
        let third = Job::new(|| Ok(()));
        let third_id = third.id;
        q.enqueue(third).unwrap();
        assert_eq!(q.size(), 2);
        match q.try_dequeue() {
            DequeueOutcome::Job(j) => assert_ne!(j.id, first_id),
            _ => panic!("expected job"),
        }
        match q.try_dequeue() {
            DequeueOutcome::Job(j) => assert_eq!(j.id, third_id),
            _ => panic!("expected job"),
        }
    }

    #[test]
    fn drop_newest_silently_succeeds_without_storing() {
        let q = PolicyQueue::new(SyncPolicy::MutexSync, BoundPolicy::Bounded(1), OverflowPolicy::DropNewest).unwrap();
        q.enqueue(Job::new(|| Ok(()))).unwrap();
        q.enqueue(Job::new(|| Ok(()))).unwrap();
        assert_eq!(q.size(), 1);
    }

    #[test]
    fn lockfree_sync_reports_lock_free_capability_and_runs_jobs() {
        let q = PolicyQueue::new(SyncPolicy::LockFreeSync, BoundPolicy::Unbounded, OverflowPolicy::Reject).unwrap();
        assert!(q.capabilities().lock_free);
        q.enqueue(Job::new(|| Ok(()))).unwrap();
        q.enqueue(Job::new(|| Ok(()))).unwrap();
        assert!(matches!(q.try_dequeue(), DequeueOutcome::Job(_)));
        assert!(matches!(q.try_dequeue(), DequeueOutcome::Job(_)));
        assert!(matches!(q.try_dequeue(), DequeueOutcome::Empty));
    }

    #[test]
    fn lockfree_sync_rejects_at_capacity() {
        let q = PolicyQueue::new(SyncPolicy::LockFreeSync, BoundPolicy::Bounded(1), OverflowPolicy::Reject).unwrap();
        q.enqueue(Job::new(|| Ok(()))).unwrap();
        assert!(q.enqueue(Job::new(|| Ok(()))).is_err());
    }

    #[test]
    fn adaptive_sync_runs_jobs_through_the_adaptive_queue() {
        let q = PolicyQueue::new(SyncPolicy::AdaptiveSync, BoundPolicy::Unbounded, OverflowPolicy::Reject).unwrap();
        for _ in 0..8 {
            q.enqueue(Job::new(|| Ok(()))).unwrap();
        }
        let mut drained = 0;
        while matches!(q.try_dequeue(), DequeueOutcome::Job(_)) {
            drained += 1;
        }
        assert_eq!(drained, 8);
    }
}
