//! The job queue family: a blocking mutex queue, a lock-free MPMC queue, a
//! per-worker Chase-Lev work-stealing deque, a policy-parameterized
//! template over the two, and an adaptive wrapper that switches between
//! mutex and lock-free implementations under measured contention.

pub mod adaptive;
pub mod chase_lev;
pub mod lockfree_mpmc;
pub mod mutex_queue;
pub mod policy;
pub mod work_stealing;

pub use adaptive::{AdaptiveQueue, AdaptiveQueueConfig};
pub use chase_lev::ChaseLevDeque;
pub use lockfree_mpmc::LockFreeQueue;
pub use mutex_queue::MutexQueue;
pub use policy::{BoundPolicy, OverflowPolicy, PolicyQueue, SyncPolicy};
pub use work_stealing::WorkStealingQueue;

use crate::error::{ErrorCode, ErrorInfo};
use crate::job::Job;

const MODULE: &str = "queue";

/// Outcome of a non-blocking dequeue attempt.
pub enum DequeueOutcome {
    Job(Job),
    Empty,
    Stopped,
}

/// All-boolean capability record a queue implementation exposes so callers
/// (and the policy template's invalid-combination check) can reason about
/// what guarantees a given queue actually provides.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub exact_size: bool,
    pub atomic_empty_check: bool,
    pub lock_free: bool,
    pub wait_free: bool,
    pub supports_batch: bool,
    pub supports_blocking_wait: bool,
    pub supports_stop: bool,
}

/// Common surface implemented by every concrete queue in this module.
///
/// `enqueue`/`dequeue` return `Result`/`DequeueOutcome` rather than panicking
/// so callers can treat `QueueStopped`/`QueueFull`/`Empty` as ordinary
/// control flow (§7: `QueueStopped` is an expected business error).
pub trait Queue: Send + Sync {
    fn enqueue(&self, job: Job) -> Result<(), ErrorInfo>;
    fn dequeue(&self) -> DequeueOutcome;
    fn try_dequeue(&self) -> DequeueOutcome;
    fn size(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.size() == 0
    }
    fn clear(&self);
    fn stop(&self);
    fn is_stopped(&self) -> bool;
    fn capabilities(&self) -> Capabilities;
}

pub(crate) fn queue_stopped() -> ErrorInfo {
    ErrorInfo::new(ErrorCode::QueueStopped, MODULE, "queue has been stopped")
}

pub(crate) fn queue_full() -> ErrorInfo {
    ErrorInfo::new(ErrorCode::QueueFull, MODULE, "queue is at capacity")
}

pub(crate) fn resource_limit_reached(detail: &str) -> ErrorInfo {
    ErrorInfo::new(ErrorCode::ResourceLimitReached, MODULE, detail.to_string())
}
