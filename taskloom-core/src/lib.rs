//! `taskloom-core`: the scheduling runtime underneath the `taskloom` facade
//! crate. Workers, the job-queue family, work-stealing, the thread-pool
//! lifecycle, typed/aging priority queues, resilience primitives (circuit
//! breaker, token bucket), the autoscaler, and metrics/diagnostics all live
//! here; `taskloom` wires them together behind `ThreadPoolBuilder`.

pub mod autoscaler;
pub mod circuit_breaker;
pub mod container;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod hazard;
pub mod job;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod stealer;
pub mod token_bucket;
pub mod typed_pool;
pub mod worker;

pub use autoscaler::{
    Autoscaler, AutoscalerConfig, ScaleDownConfig, ScaleUpConfig, ScalingAmount, ScalingCallback,
    ScalingDecision, ScalingDirection, ScalingMode, ScalingReason,
};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerGuard, CircuitState};
pub use container::{Lifetime, ServiceContainer};
pub use context::{ILogger, IMonitoring, LogBridge, LogLevel, ThreadContext};
pub use diagnostics::{
    pool_health, thread_dump, BottleneckConfig, BottleneckDetector, BottleneckReport,
    BottleneckType, ComponentHealth, HealthRegistry, HealthReport, HealthState, WorkerDump,
};
pub use error::{ErrorCode, ErrorInfo, Result};
pub use hazard::{global_domain, HazardDomain};
pub use job::{CancellationToken, Job, JobId, JobInfo, TypedJob};
pub use metrics::{MetricsService, MetricsSnapshot};
pub use pool::{CircuitBreakerPolicy, PoolPolicy, PoolState, ThreadPool, WorkStealingPoolPolicy};
pub use queue::{Capabilities, DequeueOutcome, Queue, WorkStealingQueue};
pub use stealer::{Stealer, StealerConfig, Topology, VictimSelectionPolicy};
pub use token_bucket::TokenBucket;
pub use typed_pool::{AgingConfig, AgingTypedQueue, BoostCurve, TypedQueue};
pub use worker::{Worker, WorkerHooks, WorkerState};
