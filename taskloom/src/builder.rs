//! `ThreadPoolBuilder`: the single fluent entry point assembling a
//! `taskloom_core::pool::ThreadPool` out of the primitives that crate
//! exposes separately -- queue, context, circuit breaker, autoscaler,
//! work-stealing, diagnostics, extra policies.
//!
//! Grounded on `rayon-core::registry::Registry::new`: the builder is
//! consumed by value, its configuration read out of `self` field by field
//! rather than through `get_*`/`take_*` accessors (this builder has no
//! separate "already consumed" state to guard against, since `build` takes
//! `self`), and fallible construction returns `Result` rather than
//! panicking.

use std::sync::Arc;

use taskloom_core::pool::{CircuitBreakerPolicy, PoolPolicy, ThreadPool as CoreThreadPool};
use taskloom_core::queue::{
    AdaptiveQueue, AdaptiveQueueConfig, BoundPolicy, ChaseLevDeque, LockFreeQueue, MutexQueue,
    OverflowPolicy, PolicyQueue, SyncPolicy, WorkStealingQueue,
};
use taskloom_core::{
    Autoscaler, AutoscalerConfig, CircuitBreaker, CircuitBreakerConfig, ErrorInfo, MetricsService,
    Queue, Stealer, StealerConfig, ThreadContext, Topology,
};

use crate::handle::ThreadPool;

/// Which concrete [`Queue`] implementation `ThreadPoolBuilder::with_queue_adapter`
/// selects. Use `ThreadPoolBuilder::with_queue` instead to supply a fully
/// custom implementation.
pub enum QueueKind {
    /// `MutexQueue`: a plain blocking FIFO behind a `Mutex` + `Condvar`.
    Mutex,
    /// `LockFreeQueue`: the Michael-Scott MPMC queue.
    LockFree,
    /// `PolicyQueue`: the policy-parameterized template over sync/bound/overflow.
    Policy {
        sync: SyncPolicy,
        bound: BoundPolicy,
        overflow: OverflowPolicy,
    },
    /// `AdaptiveQueue`: switches between mutex and lock-free under measured contention.
    Adaptive(AdaptiveQueueConfig),
}

impl Default for QueueKind {
    fn default() -> Self {
        QueueKind::Mutex
    }
}

/// Builds a [`ThreadPool`](crate::ThreadPool).
///
/// ```no_run
/// use taskloom::ThreadPoolBuilder;
///
/// let pool = ThreadPoolBuilder::new()
///     .with_workers(8)
///     .with_work_stealing(Default::default())
///     .build_and_start()
///     .unwrap();
/// ```
#[derive(Default)]
pub struct ThreadPoolBuilder {
    workers: Option<usize>,
    min_workers: usize,
    context: Option<ThreadContext>,
    queue_kind: QueueKind,
    queue_custom: Option<Arc<dyn Queue>>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    autoscaling: Option<AutoscalerConfig>,
    work_stealing: Option<StealerConfig>,
    topology: Option<Topology>,
    diagnostics: bool,
    enhanced_metrics: bool,
    extra_policies: Vec<Box<dyn PoolPolicy>>,
}

impl ThreadPoolBuilder {
    pub fn new() -> Self {
        ThreadPoolBuilder::default()
    }

    /// Number of worker threads. Defaults to the number of logical CPUs.
    pub fn with_workers(mut self, n: usize) -> Self {
        self.workers = Some(n);
        self
    }

    /// Floor the autoscaler (or manual `remove_workers_internal` calls)
    /// won't shrink below. Defaults to 0.
    pub fn with_min_workers(mut self, n: usize) -> Self {
        self.min_workers = n;
        self
    }

    /// Injects a logger/monitoring seam. Without this, the pool defaults to
    /// `ThreadContext::default()`, which installs a `LogBridge` so
    /// lifecycle events still reach whatever `log` backend the host
    /// process initialized.
    pub fn with_context(mut self, context: ThreadContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Supplies a fully custom queue implementation, bypassing `QueueKind`.
    pub fn with_queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue_custom = Some(queue);
        self
    }

    /// Selects one of the built-in queue implementations. Ignored if
    /// `.with_queue(..)` was also called.
    pub fn with_queue_adapter(mut self, kind: QueueKind) -> Self {
        self.queue_kind = kind;
        self
    }

    /// Wraps job submission and completion in a circuit breaker: once
    /// `config.failure_threshold` consecutive failures land (or the
    /// failure rate over `config.window_size` crosses
    /// `config.failure_rate_threshold`), submissions are rejected with
    /// `ErrorCode::CircuitOpen` until `config.open_duration` elapses.
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Enables the background autoscaler: it samples utilization, queue
    /// depth and p95 wait latency on `config.sample_interval` and, in
    /// `ScalingMode::Automatic`, grows or shrinks the worker count within
    /// `[config.min_workers, config.max_workers]`.
    pub fn with_autoscaling(mut self, config: AutoscalerConfig) -> Self {
        self.autoscaling = Some(config);
        self
    }

    /// Enables work stealing: each worker gets its own Chase-Lev deque, and
    /// a single `Stealer` shared across the pool arbitrates steals between
    /// them per `config`'s victim-selection and backoff policy. The pool's
    /// primary queue keeps serving as the injector for externally
    /// submitted jobs.
    pub fn with_work_stealing(mut self, config: StealerConfig) -> Self {
        self.work_stealing = Some(config);
        self
    }

    /// NUMA/affinity topology used by work stealing's victim selection.
    /// Defaults to `Topology::single_node(worker_count)` if work stealing
    /// is enabled and this is never called. Ignored otherwise.
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Installs a `HealthRegistry` and `BottleneckDetector` alongside the
    /// built pool, reachable via `ThreadPool::health`/`::bottleneck_report`.
    /// Without this, those methods return `None`.
    pub fn with_diagnostics(mut self) -> Self {
        self.diagnostics = true;
        self
    }

    /// Records that the caller wants to rely on the pool's full metrics
    /// pipeline (latency histograms, throughput windows, per-worker
    /// counters). Every pool already carries `MetricsService` unconditionally;
    /// this flag is a documented marker surfaced through
    /// `ThreadPool::has_enhanced_metrics`, not a separate code path.
    pub fn with_enhanced_metrics(mut self) -> Self {
        self.enhanced_metrics = true;
        self
    }

    /// Attaches an additional `PoolPolicy` hook, beyond whatever the other
    /// `with_*` methods install.
    pub fn with_policy(mut self, policy: Box<dyn PoolPolicy>) -> Self {
        self.extra_policies.push(policy);
        self
    }

    fn resolve_queue(&mut self) -> Result<Arc<dyn Queue>, ErrorInfo> {
        if let Some(custom) = self.queue_custom.take() {
            return Ok(custom);
        }
        let queue: Arc<dyn Queue> = match std::mem::take(&mut self.queue_kind) {
            QueueKind::Mutex => Arc::new(MutexQueue::new()),
            QueueKind::LockFree => Arc::new(LockFreeQueue::new()),
            QueueKind::Policy { sync, bound, overflow } => {
                Arc::new(PolicyQueue::new(sync, bound, overflow)?)
            }
            QueueKind::Adaptive(config) => Arc::new(AdaptiveQueue::new(config)),
        };
        Ok(queue)
    }

    /// Assembles the configured pool without starting its worker threads.
    pub fn build(mut self) -> Result<ThreadPool, ErrorInfo> {
        let worker_count = self.workers.unwrap_or_else(|| num_cpus::get().max(1));
        let context = self.context.take().unwrap_or_default();
        let metrics = MetricsService::new();
        let queue = self.resolve_queue()?;

        let mut policies = std::mem::take(&mut self.extra_policies);

        let circuit_breaker = self.circuit_breaker.take().map(|config| {
            let breaker = Arc::new(CircuitBreaker::new(config));
            policies.push(Box::new(CircuitBreakerPolicy::new(Arc::clone(&breaker))) as Box<dyn PoolPolicy>);
            breaker
        });

        let autoscaler = self
            .autoscaling
            .take()
            .map(|config| Autoscaler::new(config, context.clone()));

        // Per-worker deques and the shared `Stealer` are built now (the
        // worker count is already fixed); wiring each worker's queue over
        // to a `WorkStealingQueue` happens in `ThreadPool::start`, after
        // the pool has actually spawned its workers.
        let stealer_setup = self.work_stealing.take().map(|config| {
            let deques: Vec<Arc<ChaseLevDeque>> =
                (0..worker_count).map(|_| Arc::new(ChaseLevDeque::new())).collect();
            let topology = self
                .topology
                .take()
                .unwrap_or_else(|| Topology::single_node(worker_count));
            let stealer = Arc::new(Stealer::new(deques.clone(), config, topology));
            (deques, stealer)
        });
        let stealer = stealer_setup.as_ref().map(|(_, stealer)| Arc::clone(stealer));
        let deques = stealer_setup.map(|(deques, _)| deques);

        let health_registry = self.diagnostics.then(|| {
            Arc::new(taskloom_core::HealthRegistry::new())
        });
        let bottleneck_detector = self.diagnostics.then(|| {
            Arc::new(taskloom_core::BottleneckDetector::new(
                taskloom_core::BottleneckConfig::default(),
            ))
        });

        let inner = CoreThreadPool::new(worker_count, self.min_workers, queue, context, metrics, policies);

        Ok(ThreadPool {
            inner,
            circuit_breaker,
            autoscaler,
            stealer,
            health_registry,
            bottleneck_detector,
            enhanced_metrics: self.enhanced_metrics,
            deques,
        })
    }

    /// `build()` followed by `ThreadPool::start()`: spawns the worker
    /// threads (and the autoscaler's sampling thread, if configured) and
    /// wires work-stealing queues in, if configured.
    pub fn build_and_start(self) -> Result<ThreadPool, ErrorInfo> {
        let pool = self.build()?;
        pool.start()?;
        Ok(pool)
    }
}

pub(crate) fn wire_work_stealing(
    pool: &CoreThreadPool,
    deques: &[Arc<ChaseLevDeque>],
    stealer: &Arc<Stealer>,
) {
    let injector = Arc::clone(pool.queue());
    for worker in pool.workers() {
        if let Some(own) = deques.get(worker.id) {
            let queue = WorkStealingQueue::new(Arc::clone(own), Arc::clone(stealer), Arc::clone(&injector), worker.id);
            worker.set_queue(Arc::new(queue));
        }
    }
}
