use std::fmt;

/// Stable, user-facing error codes.
///
/// The string form (via `Display`) is considered part of the public contract;
/// the discriminant values are not.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCode {
    Success,
    UnknownError,
    InvalidArgument,
    OperationTimeout,
    OperationCanceled,
    ResourceAllocationFailed,
    ResourceLimitReached,
    IoError,
    ThreadAlreadyRunning,
    ThreadNotRunning,
    MutexError,
    QueueStopped,
    QueueEmpty,
    QueueFull,
    JobInvalid,
    JobExecutionFailed,
    CircuitOpen,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Success => "Success",
            ErrorCode::UnknownError => "UnknownError",
            ErrorCode::InvalidArgument => "InvalidArgument",
            ErrorCode::OperationTimeout => "OperationTimeout",
            ErrorCode::OperationCanceled => "OperationCanceled",
            ErrorCode::ResourceAllocationFailed => "ResourceAllocationFailed",
            ErrorCode::ResourceLimitReached => "ResourceLimitReached",
            ErrorCode::IoError => "IOError",
            ErrorCode::ThreadAlreadyRunning => "ThreadAlreadyRunning",
            ErrorCode::ThreadNotRunning => "ThreadNotRunning",
            ErrorCode::MutexError => "MutexError",
            ErrorCode::QueueStopped => "QueueStopped",
            ErrorCode::QueueEmpty => "QueueEmpty",
            ErrorCode::QueueFull => "QueueFull",
            ErrorCode::JobInvalid => "JobInvalid",
            ErrorCode::JobExecutionFailed => "JobExecutionFailed",
            ErrorCode::CircuitOpen => "CircuitOpen",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value-typed error: `{code, message, module}`.
///
/// Every fallible operation in this crate returns `Result<T, ErrorInfo>`.
/// Errors are values, never panics or unwinds, except at the job-execution
/// boundary where a panicking job closure is caught and turned into a
/// `JobExecutionFailed` by the worker.
#[derive(Clone, Debug)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    pub module: &'static str,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, module: &'static str, message: impl Into<String>) -> Self {
        ErrorInfo {
            code,
            message: message.into(),
            module,
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.module, self.code, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

pub type Result<T> = std::result::Result<T, ErrorInfo>;
