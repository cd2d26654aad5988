//! `ThreadContext`: the injected logger/monitoring seam (§6, §4.10).
//!
//! Structured logging and monitoring are external collaborators per §1; this
//! crate only specifies the interfaces (`ILogger`, `IMonitoring`) and a
//! default `ILogger` implementation (`LogBridge`) that forwards to the `log`
//! facade crate, so a host application wiring `env_logger` or any other
//! `log`-compatible backend gets useful output without extra glue -- the
//! same role the teacher's injected `Logger` plays in `registry.rs`.

use std::sync::Arc;

/// Severity ordering mirrors `log::Level` but is spelled out here because it
/// is part of this crate's own public contract (§6), independent of which
/// logging backend a caller wires in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warning = 3,
    Error = 4,
    Critical = 5,
    Off = 6,
}

/// A source location attached to a log event, for callers that want it.
#[derive(Clone, Copy, Debug)]
pub struct SourceLocation {
    pub file: &'static str,
    pub line: u32,
}

/// The logging seam a `ThreadContext` carries. Implementations must be
/// `Send + Sync` since worker threads, the autoscaler thread and the aging
/// thread all log independently.
pub trait ILogger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str, location: Option<SourceLocation>);
    fn is_enabled(&self, level: LogLevel) -> bool;
    fn set_level(&self, level: LogLevel);
    fn flush(&self);
}

/// Bridges `ILogger` onto the `log` crate's global macros/facade, so any
/// `log::Log` backend a host process installs (`env_logger`, `tracing-log`,
/// ...) receives this crate's lifecycle events for free.
pub struct LogBridge {
    min_level: std::sync::atomic::AtomicU8,
}

impl LogBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(LogBridge {
            min_level: std::sync::atomic::AtomicU8::new(LogLevel::Trace as u8),
        })
    }

    fn to_log_level(level: LogLevel) -> Option<log::Level> {
        match level {
            LogLevel::Trace => Some(log::Level::Trace),
            LogLevel::Debug => Some(log::Level::Debug),
            LogLevel::Info => Some(log::Level::Info),
            LogLevel::Warning => Some(log::Level::Warn),
            LogLevel::Error | LogLevel::Critical => Some(log::Level::Error),
            LogLevel::Off => None,
        }
    }
}

impl Default for LogBridge {
    fn default() -> Self {
        LogBridge {
            min_level: std::sync::atomic::AtomicU8::new(LogLevel::Trace as u8),
        }
    }
}

impl ILogger for LogBridge {
    fn log(&self, level: LogLevel, message: &str, location: Option<SourceLocation>) {
        if !self.is_enabled(level) {
            return;
        }
        if let Some(log_level) = Self::to_log_level(level) {
            match location {
                Some(loc) => log::log!(log_level, "{} ({}:{})", message, loc.file, loc.line),
                None => log::log!(log_level, "{}", message),
            }
        }
    }

    fn is_enabled(&self, level: LogLevel) -> bool {
        level as u8 >= self.min_level.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn set_level(&self, level: LogLevel) {
        self.min_level
            .store(level as u8, std::sync::atomic::Ordering::Relaxed);
    }

    fn flush(&self) {
        // The `log` facade has no flush hook of its own; backends that
        // buffer (e.g. file appenders) are responsible for their own
        // flushing policy.
    }
}

/// A point-in-time snapshot of system/pool/worker metrics handed to an
/// injected monitoring sink. Kept intentionally loose (`serde_json::Value`)
/// since the concrete shape is owned by `MetricsSnapshot` (see `metrics`);
/// this type is only the transport across the `IMonitoring` seam.
pub type MonitoringPayload = serde_json::Value;

/// The monitoring seam a `ThreadContext` carries. An external collaborator
/// per §1/§6; this crate defines only the interface.
pub trait IMonitoring: Send + Sync {
    fn update_system_metrics(&self, payload: MonitoringPayload);
    fn update_pool_metrics(&self, payload: MonitoringPayload);
    fn update_worker_metrics(&self, worker_id: usize, payload: MonitoringPayload);
    fn snapshot(&self) -> MonitoringPayload;
}

/// Value type bundling the optional logger/monitoring handles a pool is
/// built with. Cheap to clone (both fields are `Arc`s).
#[derive(Clone)]
pub struct ThreadContext {
    pub logger: Option<Arc<dyn ILogger>>,
    pub monitoring: Option<Arc<dyn IMonitoring>>,
}

impl ThreadContext {
    pub fn new() -> Self {
        ThreadContext {
            logger: None,
            monitoring: None,
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn ILogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_monitoring(mut self, monitoring: Arc<dyn IMonitoring>) -> Self {
        self.monitoring = Some(monitoring);
        self
    }

    pub(crate) fn log(&self, level: LogLevel, message: &str) {
        if let Some(logger) = &self.logger {
            logger.log(level, message, None);
        }
    }
}

impl Default for ThreadContext {
    /// Installs a `LogBridge` so a pool built without an explicit context
    /// still forwards lifecycle events to whatever `log` backend the host
    /// process has initialized.
    fn default() -> Self {
        ThreadContext {
            logger: Some(LogBridge::new()),
            monitoring: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_bridge_respects_level() {
        let bridge = LogBridge::new();
        bridge.set_level(LogLevel::Error);
        assert!(!bridge.is_enabled(LogLevel::Info));
        assert!(bridge.is_enabled(LogLevel::Critical));
    }

    #[test]
    fn default_context_installs_log_bridge() {
        let ctx = ThreadContext::default();
        assert!(ctx.logger.is_some());
    }
}
