//! Circuit breaker (§4.6): `Closed -> Open -> HalfOpen -> Closed`, with a
//! single `state_mutex` serializing transitions and a lock-free fast path
//! for `allow_request()` while `Closed`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{ErrorCode, ErrorInfo};

const MODULE: &str = "circuit_breaker";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }
}

pub type FailurePredicate = Arc<dyn Fn(&ErrorInfo) -> bool + Send + Sync>;
pub type StateChangeCallback = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

#[derive(Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub minimum_requests: u32,
    pub failure_rate_threshold: f64,
    pub window_size: usize,
    pub open_duration: Duration,
    pub half_open_max_requests: u32,
    pub half_open_success_threshold: u32,
    /// Classifies an error as a non-failure (e.g. expected business errors)
    /// when it returns `false`.
    pub failure_predicate: Option<FailurePredicate>,
    pub state_change_callback: Option<StateChangeCallback>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            minimum_requests: 10,
            failure_rate_threshold: 0.5,
            window_size: 100,
            open_duration: Duration::from_secs(30),
            half_open_max_requests: 1,
            half_open_success_threshold: 1,
            failure_predicate: None,
            state_change_callback: None,
        }
    }
}

impl std::fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("minimum_requests", &self.minimum_requests)
            .field("failure_rate_threshold", &self.failure_rate_threshold)
            .field("window_size", &self.window_size)
            .field("open_duration", &self.open_duration)
            .field("half_open_max_requests", &self.half_open_max_requests)
            .field("half_open_success_threshold", &self.half_open_success_threshold)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CircuitBreakerStats {
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
}

fn circuit_open() -> ErrorInfo {
    ErrorInfo::new(ErrorCode::CircuitOpen, MODULE, "circuit breaker is open")
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    state_mutex: Mutex<()>,
    state_change_time: Mutex<Instant>,
    consecutive_failures: AtomicU32,
    half_open_requests: AtomicU32,
    half_open_successes: AtomicU32,
    window: Mutex<VecDeque<bool>>,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    total_rejected: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let window_size = config.window_size;
        CircuitBreaker {
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            state_mutex: Mutex::new(()),
            state_change_time: Mutex::new(Instant::now()),
            consecutive_failures: AtomicU32::new(0),
            half_open_requests: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            window: Mutex::new(VecDeque::with_capacity(window_size)),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }

    fn transition(&self, to: CircuitState) {
        let from = self.state();
        if from == to {
            return;
        }
        self.state.store(to as u8, Ordering::Release);
        *self.state_change_time.lock().unwrap() = Instant::now();
        if to == CircuitState::HalfOpen {
            self.half_open_requests.store(0, Ordering::SeqCst);
            self.half_open_successes.store(0, Ordering::SeqCst);
        }
        if to == CircuitState::Closed {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            self.window.lock().unwrap().clear();
        }
        if let Some(cb) = &self.config.state_change_callback {
            cb(from, to);
        }
    }

    /// Returns `Ok(guard)` if the request may proceed, `Err(CircuitOpen)`
    /// otherwise. The guard records the outcome on drop (default: failure)
    /// unless `mark_success`/`mark_failure` is called explicitly. Takes
    /// `self` as `&Arc<Self>` (rather than `&self`) so the returned guard
    /// owns a clone of the breaker instead of borrowing it -- callers like
    /// `CircuitBreakerPolicy::on_submit` hand the guard into `Job::wrap`,
    /// which needs to carry it past the end of the call that created it.
    pub fn allow_request(self: &Arc<Self>) -> Result<CircuitBreakerGuard, ErrorInfo> {
        match self.state() {
            CircuitState::Closed => {
                self.total_requests.fetch_add(1, Ordering::Relaxed);
                Ok(CircuitBreakerGuard { breaker: Arc::clone(self), recorded: false })
            }
            CircuitState::Open => {
                let elapsed = self.state_change_time.lock().unwrap().elapsed();
                if elapsed >= self.config.open_duration {
                    let _lock = self.state_mutex.lock().unwrap();
                    // Re-check under the lock: another caller may have
                    // already flipped us to HalfOpen.
                    if self.state() == CircuitState::Open {
                        self.transition(CircuitState::HalfOpen);
                    }
                    drop(_lock);
                    self.try_enter_half_open()
                } else {
                    self.total_rejected.fetch_add(1, Ordering::Relaxed);
                    Err(circuit_open())
                }
            }
            CircuitState::HalfOpen => self.try_enter_half_open(),
        }
    }

    fn try_enter_half_open(self: &Arc<Self>) -> Result<CircuitBreakerGuard, ErrorInfo> {
        let current = self
            .half_open_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n < self.config.half_open_max_requests {
                    Some(n + 1)
                } else {
                    None
                }
            });
        if current.is_ok() {
            self.total_requests.fetch_add(1, Ordering::Relaxed);
            Ok(CircuitBreakerGuard { breaker: Arc::clone(self), recorded: false })
        } else {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            Err(circuit_open())
        }
    }

    fn classify(&self, err: Option<&ErrorInfo>) -> bool {
        match (err, &self.config.failure_predicate) {
            (Some(e), Some(pred)) => pred(e),
            (Some(_), None) => true,
            (None, _) => true,
        }
    }

    fn record_success(&self) {
        match self.state() {
            CircuitState::HalfOpen => {
                let successes = self.half_open_successes.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.half_open_success_threshold {
                    let _lock = self.state_mutex.lock().unwrap();
                    self.transition(CircuitState::Closed);
                }
            }
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.push_window(true);
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, err: Option<&ErrorInfo>) {
        if !self.classify(err) {
            self.record_success();
            return;
        }
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        match self.state() {
            CircuitState::HalfOpen => {
                let _lock = self.state_mutex.lock().unwrap();
                self.transition(CircuitState::Open);
            }
            CircuitState::Closed => {
                let consecutive = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                let (total, failures) = self.push_window(false);
                let rate_tripped = total >= self.config.minimum_requests as usize
                    && failures as f64 / total as f64 >= self.config.failure_rate_threshold;
                if consecutive >= self.config.failure_threshold || rate_tripped {
                    let _lock = self.state_mutex.lock().unwrap();
                    self.transition(CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Push an outcome into the ring buffer, evicting the oldest entry once
    /// `window_size` is exceeded. Returns `(total, failures)` after the push.
    fn push_window(&self, success: bool) -> (usize, usize) {
        let mut window = self.window.lock().unwrap();
        if window.len() >= self.config.window_size {
            window.pop_front();
        }
        window.push_back(success);
        let failures = window.iter().filter(|s| !**s).count();
        (window.len(), failures)
    }
}

/// Move-only RAII guard. Rust's ownership model makes the C++ "no-op when
/// moved-from" requirement automatic: a moved guard simply no longer
/// exists at its old binding, so there is nothing for that binding's drop
/// glue to run.
pub struct CircuitBreakerGuard {
    breaker: Arc<CircuitBreaker>,
    recorded: bool,
}

impl CircuitBreakerGuard {
    pub fn mark_success(mut self) {
        self.breaker.record_success();
        self.recorded = true;
    }

    pub fn mark_failure(mut self, err: &ErrorInfo) {
        self.breaker.record_failure(Some(err));
        self.recorded = true;
    }
}

impl Drop for CircuitBreakerGuard {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.record_failure(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_failure_opens_circuit_with_threshold_one() {
        let cb = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        }));
        cb.allow_request().unwrap().mark_failure(&ErrorInfo::new(
            ErrorCode::UnknownError,
            "test",
            "boom",
        ));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.allow_request().is_err());
    }

    #[test]
    fn half_open_success_closes_circuit() {
        let cb = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            open_duration: Duration::from_millis(10),
            half_open_success_threshold: 1,
            ..Default::default()
        }));
        cb.allow_request().unwrap().mark_failure(&ErrorInfo::new(
            ErrorCode::UnknownError,
            "test",
            "boom",
        ));
        assert_eq!(cb.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(20));
        let guard = cb.allow_request().unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        guard.mark_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_circuit() {
        let cb = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            open_duration: Duration::from_millis(10),
            ..Default::default()
        }));
        cb.allow_request().unwrap().mark_failure(&ErrorInfo::new(
            ErrorCode::UnknownError,
            "test",
            "boom",
        ));
        std::thread::sleep(Duration::from_millis(20));
        let guard = cb.allow_request().unwrap();
        guard.mark_failure(&ErrorInfo::new(ErrorCode::UnknownError, "test", "still broken"));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn guard_dropped_without_marking_counts_as_failure() {
        let cb = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        }));
        {
            let _guard = cb.allow_request().unwrap();
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn failure_predicate_can_classify_error_as_non_failure() {
        let cb = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            failure_predicate: Some(Arc::new(|e: &ErrorInfo| e.code != ErrorCode::QueueStopped)),
            ..Default::default()
        }));
        cb.allow_request().unwrap().mark_failure(&ErrorInfo::new(
            ErrorCode::QueueStopped,
            "test",
            "expected",
        ));
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
