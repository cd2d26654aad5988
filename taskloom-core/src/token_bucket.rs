//! Token-bucket rate limiter (§4.7). Capacity and refill rate are tracked as
//! fixed-point integers (`PRECISION_FACTOR`) so the bucket can live entirely
//! in a pair of atomics without a lock on the hot path.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{ErrorCode, ErrorInfo};

const MODULE: &str = "token_bucket";

/// Tokens are stored as `actual_tokens * PRECISION_FACTOR` so that
/// sub-token refill rates (e.g. 0.5 tokens/ms) don't get lost to integer
/// truncation between refills.
const PRECISION_FACTOR: i64 = 1000;

fn rate_limited() -> ErrorInfo {
    ErrorInfo::new(ErrorCode::ResourceLimitReached, MODULE, "rate limit exceeded")
}

pub struct TokenBucket {
    capacity: i64,
    refill_per_ns: f64,
    tokens: AtomicI64,
    last_refill_ns: AtomicU64,
    start: Instant,
}

impl TokenBucket {
    /// `capacity` tokens, refilled continuously at `rate_per_sec` tokens/sec.
    pub fn new(capacity: u32, rate_per_sec: f64) -> Self {
        let capacity_fp = capacity as i64 * PRECISION_FACTOR;
        TokenBucket {
            capacity: capacity_fp,
            refill_per_ns: rate_per_sec * PRECISION_FACTOR as f64 / 1e9,
            tokens: AtomicI64::new(capacity_fp),
            last_refill_ns: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    fn now_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    /// Applies accrued refill since the last call, capped at `capacity`.
    /// CAS-looped so concurrent refills don't double-credit tokens.
    fn refill(&self) {
        let now = self.now_ns();
        let last = self.last_refill_ns.load(Ordering::Acquire);
        if now <= last {
            return;
        }
        if self
            .last_refill_ns
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let elapsed_ns = (now - last) as f64;
        let accrued = (elapsed_ns * self.refill_per_ns) as i64;
        if accrued <= 0 {
            return;
        }
        let mut current = self.tokens.load(Ordering::Acquire);
        loop {
            let updated = (current + accrued).min(self.capacity);
            match self.tokens.compare_exchange_weak(
                current,
                updated,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Attempts to take `count` tokens without blocking.
    pub fn try_acquire(&self, count: u32) -> Result<(), ErrorInfo> {
        self.refill();
        let need = count as i64 * PRECISION_FACTOR;
        let mut current = self.tokens.load(Ordering::Acquire);
        loop {
            if current < need {
                return Err(rate_limited());
            }
            match self.tokens.compare_exchange_weak(
                current,
                current - need,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Retries `try_acquire` with capped exponential backoff until `timeout`
    /// elapses.
    pub fn try_acquire_for(&self, count: u32, timeout: Duration) -> Result<(), ErrorInfo> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Duration::from_micros(50);
        loop {
            match self.try_acquire(count) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(err);
                    }
                    let remaining = deadline - now;
                    thread::sleep(backoff.min(remaining));
                    backoff = (backoff * 2).min(Duration::from_millis(10));
                }
            }
        }
    }

    /// Estimated wait before `count` tokens would be available, given the
    /// current fill level and refill rate. `Duration::ZERO` if already
    /// available; `Duration::MAX` if the rate is zero and the deficit can
    /// never be made up (§4.7).
    pub fn time_until_available(&self, count: u32) -> Duration {
        self.refill();
        let need = count as i64 * PRECISION_FACTOR;
        let current = self.tokens.load(Ordering::Acquire);
        if current >= need {
            return Duration::ZERO;
        }
        if self.refill_per_ns <= 0.0 {
            return Duration::MAX;
        }
        let deficit = (need - current) as f64;
        let ns = deficit / self.refill_per_ns;
        Duration::from_nanos(ns.max(0.0) as u64)
    }

    pub fn available_tokens(&self) -> u32 {
        self.refill();
        (self.tokens.load(Ordering::Acquire) / PRECISION_FACTOR).max(0) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_up_to_capacity_then_rejects() {
        let bucket = TokenBucket::new(5, 1.0);
        for _ in 0..5 {
            bucket.try_acquire(1).unwrap();
        }
        assert!(bucket.try_acquire(1).is_err());
    }

    #[test]
    fn refills_over_time() {
        let bucket = TokenBucket::new(1, 1000.0);
        bucket.try_acquire(1).unwrap();
        assert!(bucket.try_acquire(1).is_err());
        thread::sleep(Duration::from_millis(20));
        bucket.try_acquire(1).unwrap();
    }

    #[test]
    fn try_acquire_for_blocks_until_refilled() {
        let bucket = TokenBucket::new(1, 500.0);
        bucket.try_acquire(1).unwrap();
        let start = Instant::now();
        bucket.try_acquire_for(1, Duration::from_millis(100)).unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn time_until_available_is_zero_when_tokens_present() {
        let bucket = TokenBucket::new(5, 1.0);
        assert_eq!(bucket.time_until_available(1), Duration::ZERO);
    }

    #[test]
    fn time_until_available_is_positive_when_empty() {
        let bucket = TokenBucket::new(1, 1.0);
        bucket.try_acquire(1).unwrap();
        assert!(bucket.time_until_available(1) > Duration::ZERO);
    }

    #[test]
    fn time_until_available_is_infinite_for_a_zero_rate_bucket() {
        let bucket = TokenBucket::new(1, 0.0);
        bucket.try_acquire(1).unwrap();
        assert_eq!(bucket.time_until_available(1), Duration::MAX);
    }
}
