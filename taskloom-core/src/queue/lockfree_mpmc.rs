//! Michael-Scott lock-free MPMC queue with hazard-pointer reclamation
//! (§4.2.2).
//!
//! Redesign applied per the design notes: the node's payload is written
//! *before* it is linked into the list, not after. The reference
//! implementation this behavior was distilled from links first and writes
//! the payload second, leaving a window where a concurrent dequeuer that
//! observes the new link could read a torn/uninitialized payload on
//! weakly-ordered targets. Here the payload is `Some(job)` at construction
//! time, so any reader that can see the node at all sees a complete node.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::error::ErrorInfo;
use crate::hazard::{global_domain, HazardDomain};
use crate::job::Job;

use super::{queue_stopped, resource_limit_reached, Capabilities, DequeueOutcome, Queue};

/// Bounded retry budget for the enqueue/dequeue CAS loops, to turn
/// pathological livelock into a reported `ResourceLimitReached` instead of
/// an unbounded spin.
const MAX_RETRIES: u32 = 50_000;

struct Node {
    // `None` only for the permanent dummy head sentinel.
    data: Option<Job>,
    next: AtomicPtr<Node>,
}

impl Node {
    fn dummy() -> *mut Node {
        Box::into_raw(Box::new(Node {
            data: None,
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    fn with_payload(job: Job) -> *mut Node {
        Box::into_raw(Box::new(Node {
            data: Some(job),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

unsafe fn drop_node(p: *mut ()) {
    drop(Box::from_raw(p as *mut Node));
}

pub struct LockFreeQueue {
    head: AtomicPtr<Node>,
    tail: AtomicPtr<Node>,
    len: AtomicUsize,
    stopped: std::sync::atomic::AtomicBool,
    domain: &'static HazardDomain,
}

unsafe impl Send for LockFreeQueue {}
unsafe impl Sync for LockFreeQueue {}

impl LockFreeQueue {
    pub fn new() -> Self {
        let dummy = Node::dummy();
        LockFreeQueue {
            head: AtomicPtr::new(dummy),
            tail: AtomicPtr::new(dummy),
            len: AtomicUsize::new(0),
            stopped: std::sync::atomic::AtomicBool::new(false),
            domain: global_domain(),
        }
    }

    /// Build a chain of `jobs.len()` nodes and splice the whole chain onto
    /// the tail with a single CAS (§4.2.2 batch enqueue).
    pub fn enqueue_batch(&self, jobs: Vec<Job>) -> Result<(), ErrorInfo> {
        if jobs.is_empty() {
            return Ok(());
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(queue_stopped());
        }
        let mut head_node: *mut Node = ptr::null_mut();
        let mut tail_node: *mut Node = ptr::null_mut();
        let count = jobs.len();
        for job in jobs {
            let n = Node::with_payload(job);
            if head_node.is_null() {
                head_node = n;
            } else {
                unsafe { (*tail_node).next.store(n, Ordering::Release) };
            }
            tail_node = n;
        }

        let mut retries = 0u32;
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if tail == self.tail.load(Ordering::Acquire) {
                if next.is_null() {
                    if unsafe { &(*tail).next }
                        .compare_exchange(
                            ptr::null_mut(),
                            head_node,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        let _ = self.tail.compare_exchange(
                            tail,
                            tail_node,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                        self.len.fetch_add(count, Ordering::Relaxed);
                        return Ok(());
                    }
                } else {
                    let _ =
                        self.tail
                            .compare_exchange(tail, next, Ordering::AcqRel, Ordering::Acquire);
                }
            }
            retries += 1;
            if retries > MAX_RETRIES {
                return Err(resource_limit_reached(
                    "enqueue_batch exceeded maximum CAS retries",
                ));
            }
            std::hint::spin_loop();
        }
    }
}

impl Default for LockFreeQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue for LockFreeQueue {
    fn enqueue(&self, job: Job) -> Result<(), ErrorInfo> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(queue_stopped());
        }
        // Payload is fully initialized before the node is ever linked.
        let new_node = Node::with_payload(job);

        let mut retries = 0u32;
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if tail == self.tail.load(Ordering::Acquire) {
                if next.is_null() {
                    if unsafe { &(*tail).next }
                        .compare_exchange(
                            ptr::null_mut(),
                            new_node,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        let _ = self.tail.compare_exchange(
                            tail,
                            new_node,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                        self.len.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                } else {
                    let _ =
                        self.tail
                            .compare_exchange(tail, next, Ordering::AcqRel, Ordering::Acquire);
                }
            }
            retries += 1;
            if retries > MAX_RETRIES {
                unsafe { drop_node(new_node as *mut ()) };
                return Err(resource_limit_reached("enqueue exceeded maximum CAS retries"));
            }
            std::hint::spin_loop();
        }
    }

    fn dequeue(&self) -> DequeueOutcome {
        // This queue never blocks (`supports_blocking_wait=false`); callers
        // needing to wait should pair it with a condvar at a higher layer
        // (the adaptive queue does this during mode transitions).
        self.try_dequeue()
    }

    fn try_dequeue(&self) -> DequeueOutcome {
        let mut retries = 0u32;
        loop {
            let head = self.head.load(Ordering::Acquire);
            let _guard = self.domain.protect(head as *mut ());
            // Re-validate after protecting: head may have been retired
            // between the first load and the hazard publication.
            if head != self.head.load(Ordering::Acquire) {
                retries += 1;
                if retries > MAX_RETRIES {
                    return DequeueOutcome::Empty;
                }
                continue;
            }
            let tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            if head == tail {
                if next.is_null() {
                    return if self.stopped.load(Ordering::SeqCst) {
                        DequeueOutcome::Stopped
                    } else {
                        DequeueOutcome::Empty
                    };
                }
                let _ =
                    self.tail
                        .compare_exchange(tail, next, Ordering::AcqRel, Ordering::Acquire);
                continue;
            }
            if next.is_null() {
                // Lost race: another thread dequeued past us.
                continue;
            }
            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.len.fetch_sub(1, Ordering::Relaxed);
                let data = unsafe { (*next).data.take() };
                unsafe { self.domain.retire(head as *mut (), drop_node) };
                return match data {
                    Some(job) => DequeueOutcome::Job(job),
                    None => DequeueOutcome::Empty,
                };
            }
            retries += 1;
            if retries > MAX_RETRIES {
                return DequeueOutcome::Empty;
            }
            std::hint::spin_loop();
        }
    }

    fn size(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    fn clear(&self) {
        while let DequeueOutcome::Job(_) = self.try_dequeue() {}
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            exact_size: false,
            atomic_empty_check: false,
            lock_free: true,
            wait_free: false,
            supports_batch: true,
            supports_blocking_wait: false,
            supports_stop: true,
        }
    }
}

impl Drop for LockFreeQueue {
    fn drop(&mut self) {
        self.clear();
        let head = self.head.load(Ordering::Relaxed);
        if !head.is_null() {
            unsafe { drop(Box::from_raw(head)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_then_dequeue_returns_same_identity() {
        let q = LockFreeQueue::new();
        let job = Job::new(|| Ok(()));
        let id = job.id;
        q.enqueue(job).unwrap();
        match q.try_dequeue() {
            DequeueOutcome::Job(j) => assert_eq!(j.id, id),
            _ => panic!("expected job"),
        }
    }

    #[test]
    fn fifo_order_preserved_single_producer() {
        let q = LockFreeQueue::new();
        let ids: Vec<_> = (0..50)
            .map(|_| {
                let job = Job::new(|| Ok(()));
                let id = job.id;
                q.enqueue(job).unwrap();
                id
            })
            .collect();
        for expected in ids {
            match q.try_dequeue() {
                DequeueOutcome::Job(j) => assert_eq!(j.id, expected),
                _ => panic!("expected job"),
            }
        }
    }

    #[test]
    fn stop_rejects_further_enqueue() {
        let q = LockFreeQueue::new();
        q.stop();
        assert!(q.enqueue(Job::new(|| Ok(()))).is_err());
    }

    #[test]
    fn concurrent_producers_consumers_preserve_count() {
        use std::sync::Arc;
        use std::thread;

        let q = Arc::new(LockFreeQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        q.enqueue(Job::new(|| Ok(()))).unwrap();
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        let mut count = 0;
        while let DequeueOutcome::Job(_) = q.try_dequeue() {
            count += 1;
        }
        assert_eq!(count, 4000);
    }
}
