//! Sliding-window throughput counter (§4.9): a fixed array of sub-buckets
//! partitioning a window `W`, used for the 1s/60s throughput gauges.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Number of sub-buckets a window is divided into. Higher resolution costs
/// more memory and a slightly wider zeroing pass per `increment`.
const DEFAULT_SUB_BUCKETS: usize = 10;

pub struct SlidingWindowCounter {
    window: Duration,
    sub_bucket: Duration,
    buckets: Vec<AtomicU64>,
    start: Instant,
    current_slot: Mutex<usize>,
}

impl SlidingWindowCounter {
    pub fn new(window: Duration) -> Self {
        Self::with_resolution(window, DEFAULT_SUB_BUCKETS)
    }

    pub fn with_resolution(window: Duration, sub_buckets: usize) -> Self {
        let sub_buckets = sub_buckets.max(1);
        SlidingWindowCounter {
            window,
            sub_bucket: window / sub_buckets as u32,
            buckets: (0..sub_buckets).map(|_| AtomicU64::new(0)).collect(),
            start: Instant::now(),
            current_slot: Mutex::new(0),
        }
    }

    fn slot_for(&self, now: Instant) -> usize {
        let elapsed = now.duration_since(self.start).as_nanos();
        let sub_ns = self.sub_bucket.as_nanos().max(1);
        ((elapsed / sub_ns) % self.buckets.len() as u128) as usize
    }

    /// Zero every sub-bucket that has gone stale since the last update, then
    /// bump the current one.
    pub fn increment(&self) {
        self.increment_by(1);
    }

    pub fn increment_by(&self, n: u64) {
        let now = Instant::now();
        let slot = self.slot_for(now);
        let mut last = self.current_slot.lock().unwrap();
        if *last != slot {
            let k = self.buckets.len();
            let mut s = (*last + 1) % k;
            // Bound the zeroing pass to a full lap so a very stale counter
            // doesn't spin forever; a full lap already zeros everything.
            let mut steps = 0;
            while s != slot && steps < k {
                self.buckets[s].store(0, Ordering::Relaxed);
                s = (s + 1) % k;
                steps += 1;
            }
            self.buckets[slot].store(0, Ordering::Relaxed);
            *last = slot;
        }
        self.buckets[slot].fetch_add(n, Ordering::Relaxed);
    }

    /// Total increments observed within the last `window`, divided by the
    /// window length in seconds.
    pub fn rate_per_second(&self) -> f64 {
        let total: u64 = self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum();
        total as f64 / self.window.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_within_window_are_reflected_in_rate() {
        let c = SlidingWindowCounter::new(Duration::from_secs(1));
        for _ in 0..10 {
            c.increment();
        }
        assert!(c.rate_per_second() > 0.0);
    }

    #[test]
    fn stale_buckets_reset_to_zero() {
        let c = SlidingWindowCounter::with_resolution(Duration::from_millis(50), 5);
        c.increment_by(100);
        std::thread::sleep(Duration::from_millis(60));
        c.increment();
        // After a full window elapses, the old burst should no longer
        // dominate the rate.
        assert!(c.rate_per_second() < 100.0 / 0.05);
    }
}
