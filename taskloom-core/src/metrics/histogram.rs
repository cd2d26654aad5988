//! HDR-style latency histogram (§4.9): 64 logarithmic buckets covering
//! `[0, 2^63)` nanoseconds.

use std::sync::atomic::{AtomicU64, Ordering};

const BUCKETS: usize = 64;

/// Bucket `0` covers `[0, 1)`; bucket `i >= 1` covers `[2^(i-1), 2^i)`.
/// This is exactly `64 - leading_zeros(ns)`, which also happens to put
/// `ns == 0` in bucket 0 for free (`leading_zeros(0) == 64`).
fn bucket_index(ns: u64) -> usize {
    let idx = (64 - ns.leading_zeros()) as usize;
    idx.min(BUCKETS - 1)
}

fn bucket_bounds(i: usize) -> (f64, f64) {
    if i == 0 {
        (0.0, 1.0)
    } else {
        (2f64.powi(i as i32 - 1), 2f64.powi(i as i32))
    }
}

/// Lock-free, atomics-only latency histogram. All bucket/count/sum updates
/// use relaxed or fetch-add ordering: this crate's concurrency model treats
/// metrics counters as "accuracy not causality" (§5).
pub struct LatencyHistogram {
    buckets: [AtomicU64; BUCKETS],
    total_count: AtomicU64,
    total_sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        LatencyHistogram {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            total_count: AtomicU64::new(0),
            total_sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    pub fn record(&self, ns: u64) {
        let idx = bucket_index(ns);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.total_sum.fetch_add(ns, Ordering::Relaxed);
        fetch_min(&self.min, ns);
        fetch_max(&self.max, ns);
    }

    pub fn count(&self) -> u64 {
        self.total_count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.total_sum.load(Ordering::Relaxed)
    }

    pub fn min(&self) -> u64 {
        let v = self.min.load(Ordering::Relaxed);
        if v == u64::MAX {
            0
        } else {
            v
        }
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() as f64 / count as f64
        }
    }

    /// `p` in `[0.0, 1.0]`. Walks buckets by cumulative count until the
    /// target rank is reached, then linearly interpolates within that
    /// bucket's `[lower, upper)` range.
    pub fn percentile(&self, p: f64) -> f64 {
        let total = self.count();
        if total == 0 {
            return 0.0;
        }
        let target = (p.clamp(0.0, 1.0) * total as f64).ceil() as u64;
        let mut cumulative = 0u64;
        for i in 0..BUCKETS {
            let count = self.buckets[i].load(Ordering::Relaxed);
            if count == 0 {
                continue;
            }
            let next_cumulative = cumulative + count;
            if next_cumulative >= target.max(1) {
                let (lower, upper) = bucket_bounds(i);
                let rank_within = (target - cumulative).max(1) as f64;
                let fraction = rank_within / count as f64;
                return lower + fraction * (upper - lower);
            }
            cumulative = next_cumulative;
        }
        bucket_bounds(BUCKETS - 1).1
    }

    pub fn reset(&self) {
        for b in &self.buckets {
            b.store(0, Ordering::Relaxed);
        }
        self.total_count.store(0, Ordering::Relaxed);
        self.total_sum.store(0, Ordering::Relaxed);
        self.min.store(u64::MAX, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

fn fetch_min(cell: &AtomicU64, value: u64) {
    let mut current = cell.load(Ordering::Relaxed);
    while value < current {
        match cell.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

fn fetch_max(cell: &AtomicU64, value: u64) {
    let mut current = cell.load(Ordering::Relaxed);
    while value > current {
        match cell.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_goes_in_bucket_zero() {
        assert_eq!(bucket_index(0), 0);
    }

    #[test]
    fn max_value_goes_in_last_bucket() {
        assert_eq!(bucket_index((1u64 << 63) - 1), 63);
    }

    #[test]
    fn sum_of_bucket_counts_equals_total() {
        let h = LatencyHistogram::new();
        for ns in [0, 1, 3, 100, 1_000_000, u64::MAX / 2] {
            h.record(ns);
        }
        let total: u64 = h.buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum();
        assert_eq!(total, h.count());
        assert_eq!(h.count(), 6);
    }

    #[test]
    fn percentile_of_uniform_samples_is_reasonable() {
        let h = LatencyHistogram::new();
        for ns in 1..=1000u64 {
            h.record(ns * 1000);
        }
        let p50 = h.percentile(0.5);
        let p99 = h.percentile(0.99);
        assert!(p50 > 0.0 && p50 < p99);
    }

    #[test]
    fn min_and_max_track_extremes() {
        let h = LatencyHistogram::new();
        h.record(500);
        h.record(10);
        h.record(9000);
        assert_eq!(h.min(), 10);
        assert_eq!(h.max(), 9000);
    }
}
