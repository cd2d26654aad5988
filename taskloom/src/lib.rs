//! `taskloom`: the public facade over `taskloom-core`.
//!
//! `taskloom-core` is a toolbox of independent primitives -- workers, the
//! queue family, work-stealing, the circuit breaker, the autoscaler,
//! metrics/diagnostics. This crate wires them together behind a single
//! fluent entry point, [`ThreadPoolBuilder`], the way the teacher's own
//! facade sits in front of `rayon-core`'s `Registry`.
//!
//! ```no_run
//! use taskloom::ThreadPoolBuilder;
//! use taskloom_core::Job;
//!
//! let pool = ThreadPoolBuilder::new()
//!     .with_workers(4)
//!     .build_and_start()
//!     .expect("pool should start");
//!
//! pool.submit(Job::new(|| Ok(()))).unwrap();
//! pool.stop(false).unwrap();
//! ```

mod builder;
mod handle;

pub use builder::{QueueKind, ThreadPoolBuilder};
pub use handle::ThreadPool;

// Re-export the building blocks a caller needs to configure a builder or to
// hold onto a handle returned by one, so `taskloom::Job`, `taskloom::Queue`,
// `taskloom::CircuitBreakerConfig` and friends work without also depending
// on `taskloom-core` directly.
pub use taskloom_core::{
    AgingConfig, AgingTypedQueue, Autoscaler, AutoscalerConfig, BoostCurve, BottleneckConfig,
    BottleneckDetector, BottleneckReport, BottleneckType, CancellationToken, Capabilities,
    CircuitBreaker, CircuitBreakerConfig, CircuitState, ComponentHealth, DequeueOutcome,
    ErrorCode, ErrorInfo, HealthRegistry, HealthReport, HealthState, ILogger, IMonitoring, Job,
    JobId, JobInfo, Lifetime, LogBridge, LogLevel, MetricsService, MetricsSnapshot, PoolPolicy,
    PoolState, Queue, Result, ScaleDownConfig, ScaleUpConfig, ScalingAmount, ScalingCallback,
    ScalingDecision, ScalingDirection, ScalingMode, ScalingReason, ServiceContainer, Stealer,
    StealerConfig, ThreadContext, TokenBucket, Topology, TypedJob, TypedQueue,
    VictimSelectionPolicy, WorkerDump, WorkerHooks, WorkerState,
};

/// The policy an autoscaler is configured with. A plain alias over
/// [`taskloom_core::AutoscalerConfig`] under the name `ThreadPoolBuilder::with_autoscaling`
/// uses in its own documentation.
pub type AutoscalingPolicy = taskloom_core::AutoscalerConfig;

/// Per-worker work-stealing tuning passed to `ThreadPoolBuilder::with_work_stealing`.
/// A plain alias over [`taskloom_core::StealerConfig`]: every worker in a
/// pool shares one `Stealer`, so there is one policy for the whole pool
/// rather than a policy per worker.
pub type WorkerPolicy = taskloom_core::StealerConfig;
