//! The handle `ThreadPoolBuilder::build` hands back: a thin, cheaply
//! cloneable wrapper around `taskloom_core::pool::ThreadPool` plus whatever
//! optional collaborators (circuit breaker, autoscaler, stealer, health
//! registry) the builder wired in, grounded on the teacher's own
//! `rayon::ThreadPool` -- a small `Arc<Registry>` wrapper exposing
//! `install`/`join`/`broadcast` rather than the registry's full internals.

use std::sync::Arc;

use taskloom_core::pool::ThreadPool as CoreThreadPool;
use taskloom_core::queue::ChaseLevDeque;
use taskloom_core::{
    pool_health, thread_dump, Autoscaler, BottleneckDetector, BottleneckReport, CircuitBreaker,
    ErrorInfo, HealthRegistry, HealthReport, Job, MetricsService, PoolState, Stealer, WorkerDump,
};

use crate::builder::wire_work_stealing;

/// A running (or not-yet-started) pool of worker threads, built by
/// [`crate::ThreadPoolBuilder`].
///
/// Cloning a `ThreadPool` clones the handle, not the pool: every clone
/// shares the same workers, queue and metrics.
#[derive(Clone)]
pub struct ThreadPool {
    pub(crate) inner: Arc<CoreThreadPool>,
    pub(crate) circuit_breaker: Option<Arc<CircuitBreaker>>,
    pub(crate) autoscaler: Option<Arc<Autoscaler>>,
    pub(crate) stealer: Option<Arc<Stealer>>,
    pub(crate) health_registry: Option<Arc<HealthRegistry>>,
    pub(crate) bottleneck_detector: Option<Arc<BottleneckDetector>>,
    pub(crate) enhanced_metrics: bool,
    pub(crate) deques: Option<Vec<Arc<ChaseLevDeque>>>,
}

impl ThreadPool {
    /// Spawns the worker threads (`Init -> Running`) and, if the builder was
    /// given an autoscaling policy, starts its background sampling thread.
    pub fn start(&self) -> Result<(), ErrorInfo> {
        self.inner.start()?;
        if let (Some(deques), Some(stealer)) = (&self.deques, &self.stealer) {
            wire_work_stealing(&self.inner, deques, stealer);
        }
        if let Some(autoscaler) = &self.autoscaler {
            autoscaler.start(Arc::clone(&self.inner));
        }
        Ok(())
    }

    /// Enqueues `job`. Only valid once the pool is `Running`.
    pub fn submit(&self, job: Job) -> Result<(), ErrorInfo> {
        self.inner.submit(job)
    }

    /// `Running -> Stopping -> Stopped`, joining every worker thread.
    /// Stops the autoscaler's background thread first, if any, so it can't
    /// race a worker count already being torn down.
    pub fn stop(&self, immediate: bool) -> Result<(), ErrorInfo> {
        if let Some(autoscaler) = &self.autoscaler {
            autoscaler.stop();
        }
        self.inner.stop(immediate)
    }

    pub fn state(&self) -> PoolState {
        self.inner.state()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.worker_count()
    }

    pub fn active_worker_count(&self) -> usize {
        self.inner.active_worker_count()
    }

    pub fn idle_worker_count(&self) -> usize {
        self.inner.idle_worker_count()
    }

    pub fn metrics(&self) -> &Arc<MetricsService> {
        self.inner.metrics()
    }

    /// The circuit breaker the pool was built with, if `.with_circuit_breaker(..)` was set.
    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.circuit_breaker.as_ref()
    }

    /// The autoscaler the pool was built with, if `.with_autoscaling(..)` was set.
    pub fn autoscaler(&self) -> Option<&Arc<Autoscaler>> {
        self.autoscaler.as_ref()
    }

    /// The work-stealing coordinator the pool was built with, if
    /// `.with_work_stealing(..)` was set.
    pub fn stealer(&self) -> Option<&Arc<Stealer>> {
        self.stealer.as_ref()
    }

    /// Whether `.with_enhanced_metrics()` was set on the builder. Every pool
    /// always carries the full `MetricsService` (histograms, throughput
    /// windows, per-worker counters); this flag records the caller's intent
    /// to rely on it rather than toggling a different code path.
    pub fn has_enhanced_metrics(&self) -> bool {
        self.enhanced_metrics
    }

    /// Aggregate health across built-in worker checks and any checks
    /// registered on the `HealthRegistry` installed by `.with_diagnostics()`.
    /// `None` if `.with_diagnostics()` was never called.
    pub fn health(&self) -> Option<HealthReport> {
        self.health_registry
            .as_ref()
            .map(|registry| pool_health(&self.inner, registry))
    }

    /// Per-worker diagnostic snapshot (state, current job, utilization).
    pub fn thread_dump(&self) -> Vec<WorkerDump> {
        thread_dump(&self.inner)
    }

    /// Classifies the pool's current bottleneck, if `.with_diagnostics()`
    /// was set. `steal_retry_rate` is computed automatically from the
    /// pool's own `Stealer` when work stealing is configured; pass
    /// `memory_pressure` in from an external source (this crate has no way
    /// to observe process memory itself).
    pub fn bottleneck_report(&self, memory_pressure: bool) -> Option<BottleneckReport> {
        let detector = self.bottleneck_detector.as_ref()?;
        let steal_retry_rate = self.stealer.as_ref().map(|s| {
            let stats = s.stats();
            if stats.attempts == 0 {
                0.0
            } else {
                stats.failures as f64 / stats.attempts as f64
            }
        });
        Some(detector.detect(&self.metrics().snapshot(), steal_retry_rate, memory_pressure))
    }

    /// Low-level access to the wrapped `taskloom-core` pool, for callers that
    /// need an API this facade doesn't expose a shortcut for.
    pub fn inner(&self) -> &Arc<CoreThreadPool> {
        &self.inner
    }
}
