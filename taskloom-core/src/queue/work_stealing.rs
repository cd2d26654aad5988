//! Per-worker `Queue` adapter over a Chase-Lev deque and a `Stealer` (§4.3),
//! with a shared injector queue for jobs submitted from outside any worker
//! thread -- grounded on the teacher's own split between a worker's local
//! deque and its `injected_jobs` queue for externally-submitted work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::ErrorInfo;
use crate::job::Job;
use crate::stealer::Stealer;

use super::chase_lev::ChaseLevDeque;
use super::{queue_stopped, Capabilities, DequeueOutcome, Queue};

/// The queue a work-stealing worker actually dequeues from: its own deque
/// first (LIFO, cache-hot), then a steal attempt against a sibling, then the
/// shared injector queue that external `ThreadPool::submit` calls land on.
pub struct WorkStealingQueue {
    own: Arc<ChaseLevDeque>,
    stealer: Arc<Stealer>,
    injector: Arc<dyn Queue>,
    worker_id: usize,
    stopped: AtomicBool,
}

impl WorkStealingQueue {
    pub fn new(
        own: Arc<ChaseLevDeque>,
        stealer: Arc<Stealer>,
        injector: Arc<dyn Queue>,
        worker_id: usize,
    ) -> Self {
        WorkStealingQueue { own, stealer, injector, worker_id, stopped: AtomicBool::new(false) }
    }
}

impl Queue for WorkStealingQueue {
    /// Jobs submitted directly against a worker's own queue handle (rather
    /// than the pool's shared injector) go straight onto its local deque --
    /// this is the path a job uses to spawn follow-up work from inside
    /// itself, cheaply, without touching the injector.
    fn enqueue(&self, job: Job) -> Result<(), ErrorInfo> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(queue_stopped());
        }
        self.own.push(job);
        Ok(())
    }

    fn dequeue(&self) -> DequeueOutcome {
        self.try_dequeue()
    }

    fn try_dequeue(&self) -> DequeueOutcome {
        if let Some(job) = self.own.pop() {
            return DequeueOutcome::Job(job);
        }
        if let Some(job) = self.stealer.steal_for(self.worker_id) {
            return DequeueOutcome::Job(job);
        }
        match self.injector.try_dequeue() {
            DequeueOutcome::Job(job) => DequeueOutcome::Job(job),
            DequeueOutcome::Empty => {
                if self.stopped.load(Ordering::SeqCst) {
                    DequeueOutcome::Stopped
                } else {
                    DequeueOutcome::Empty
                }
            }
            DequeueOutcome::Stopped => DequeueOutcome::Stopped,
        }
    }

    fn size(&self) -> usize {
        self.own.len() + self.injector.size()
    }

    fn clear(&self) {
        while self.own.pop().is_some() {}
        self.injector.clear();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::mutex_queue::MutexQueue;
    use crate::stealer::{StealerConfig, Topology};

    fn harness(n: usize) -> (Vec<Arc<ChaseLevDeque>>, Arc<Stealer>, Arc<dyn Queue>) {
        let deques: Vec<Arc<ChaseLevDeque>> = (0..n).map(|_| Arc::new(ChaseLevDeque::new())).collect();
        let stealer = Arc::new(Stealer::new(deques.clone(), StealerConfig::default(), Topology::single_node(n)));
        let injector: Arc<dyn Queue> = Arc::new(MutexQueue::new());
        (deques, stealer, injector)
    }

    #[test]
    fn dequeues_own_deque_before_stealing() {
        let (deques, stealer, injector) = harness(2);
        deques[0].push(Job::new(|| Ok(())));
        let q = WorkStealingQueue::new(Arc::clone(&deques[0]), stealer, injector, 0);
        assert!(matches!(q.try_dequeue(), DequeueOutcome::Job(_)));
    }

    #[test]
    fn falls_back_to_stealing_then_injector() {
        let (deques, stealer, injector) = harness(2);
        deques[1].push(Job::new(|| Ok(())));
        let q = WorkStealingQueue::new(Arc::clone(&deques[0]), Arc::clone(&stealer), Arc::clone(&injector), 0);
        assert!(matches!(q.try_dequeue(), DequeueOutcome::Job(_)));
        assert!(matches!(q.try_dequeue(), DequeueOutcome::Empty));
        injector.enqueue(Job::new(|| Ok(()))).unwrap();
        assert!(matches!(q.try_dequeue(), DequeueOutcome::Job(_)));
    }

    #[test]
    fn stop_propagates_once_everything_drained() {
        let (deques, stealer, injector) = harness(2);
        let q = WorkStealingQueue::new(Arc::clone(&deques[0]), stealer, injector, 0);
        q.stop();
        assert!(matches!(q.try_dequeue(), DequeueOutcome::Stopped));
    }
}
