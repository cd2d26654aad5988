//! Work-stealing scheduler (§4.3): victim selection over a set of per-worker
//! Chase-Lev deques, with pluggable backoff between failed steal attempts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::job::Job;
use crate::queue::ChaseLevDeque;

pub type NodeId = usize;

/// Which node each worker index belongs to. Defaults to a single node
/// containing every worker; real NUMA discovery is out of scope (§4.3).
#[derive(Clone, Debug)]
pub struct Topology {
    node_of: Vec<NodeId>,
}

impl Topology {
    pub fn single_node(worker_count: usize) -> Self {
        Topology { node_of: vec![0; worker_count] }
    }

    pub fn new(node_of: Vec<NodeId>) -> Self {
        Topology { node_of }
    }

    pub fn node_of(&self, worker_id: usize) -> NodeId {
        self.node_of.get(worker_id).copied().unwrap_or(0)
    }

    pub fn worker_count(&self) -> usize {
        self.node_of.len()
    }
}

/// Per-pair rolling affinity scores updated on successful steals, backing
/// `VictimSelectionPolicy::LocalityAware`.
pub struct AffinityTracker {
    scores: Mutex<Vec<Vec<f64>>>,
}

impl AffinityTracker {
    pub fn new(worker_count: usize) -> Self {
        AffinityTracker {
            scores: Mutex::new(vec![vec![0.0; worker_count]; worker_count]),
        }
    }

    pub fn record_success(&self, thief: usize, victim: usize) {
        let mut scores = self.scores.lock().unwrap();
        if let Some(row) = scores.get_mut(thief) {
            if let Some(cell) = row.get_mut(victim) {
                *cell = *cell * 0.9 + 1.0;
            }
        }
    }

    pub fn score(&self, thief: usize, victim: usize) -> f64 {
        self.scores
            .lock()
            .unwrap()
            .get(thief)
            .and_then(|row| row.get(victim).copied())
            .unwrap_or(0.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VictimSelectionPolicy {
    Random,
    RoundRobin,
    Adaptive,
    NumaAware,
    LocalityAware,
    Hierarchical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackoffStrategy {
    None,
    LinearBackoff,
    ExponentialBackoff,
}

#[derive(Clone, Debug)]
pub struct StealerConfig {
    pub policy: VictimSelectionPolicy,
    pub min_batch: usize,
    pub max_batch: usize,
    pub backoff: BackoffStrategy,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Cross-node steal score multiplier for `NumaAware` (< 1.0 penalises).
    pub cross_node_penalty: f64,
    /// Top-K victims considered by `Adaptive`.
    pub adaptive_top_k: usize,
}

impl Default for StealerConfig {
    fn default() -> Self {
        StealerConfig {
            policy: VictimSelectionPolicy::Random,
            min_batch: 1,
            max_batch: 32,
            backoff: BackoffStrategy::ExponentialBackoff,
            initial_backoff: Duration::from_micros(50),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
            cross_node_penalty: 0.25,
            adaptive_top_k: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StealerStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub same_node_steals: u64,
    pub cross_node_steals: u64,
    pub batch_steals: u64,
    pub total_jobs_stolen: u64,
    pub total_steal_time_ns: u64,
    pub total_backoff_time_ns: u64,
}

#[derive(Default)]
struct AtomicStealerStats {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    same_node_steals: AtomicU64,
    cross_node_steals: AtomicU64,
    batch_steals: AtomicU64,
    total_jobs_stolen: AtomicU64,
    total_steal_time_ns: AtomicU64,
    total_backoff_time_ns: AtomicU64,
}

impl AtomicStealerStats {
    fn snapshot(&self) -> StealerStats {
        StealerStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            same_node_steals: self.same_node_steals.load(Ordering::Relaxed),
            cross_node_steals: self.cross_node_steals.load(Ordering::Relaxed),
            batch_steals: self.batch_steals.load(Ordering::Relaxed),
            total_jobs_stolen: self.total_jobs_stolen.load(Ordering::Relaxed),
            total_steal_time_ns: self.total_steal_time_ns.load(Ordering::Relaxed),
            total_backoff_time_ns: self.total_backoff_time_ns.load(Ordering::Relaxed),
        }
    }
}

pub struct Stealer {
    deques: Vec<Arc<ChaseLevDeque>>,
    config: StealerConfig,
    topology: Topology,
    affinity: AffinityTracker,
    round_robin_cursor: AtomicU64,
    stats: AtomicStealerStats,
}

impl Stealer {
    pub fn new(deques: Vec<Arc<ChaseLevDeque>>, config: StealerConfig, topology: Topology) -> Self {
        let worker_count = deques.len();
        Stealer {
            deques,
            config,
            topology,
            affinity: AffinityTracker::new(worker_count),
            round_robin_cursor: AtomicU64::new(0),
            stats: AtomicStealerStats::default(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.deques.len()
    }

    pub fn stats(&self) -> StealerStats {
        self.stats.snapshot()
    }

    fn candidates(&self, thief_id: usize) -> Vec<usize> {
        (0..self.deques.len()).filter(|&id| id != thief_id).collect()
    }

    fn pick_victim(&self, thief_id: usize) -> Option<usize> {
        let mut candidates = self.candidates(thief_id);
        if candidates.is_empty() {
            return None;
        }
        match self.config.policy {
            VictimSelectionPolicy::Random => {
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                Some(candidates[idx])
            }
            VictimSelectionPolicy::RoundRobin => {
                let cursor = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed);
                let idx = (cursor as usize) % candidates.len();
                Some(candidates[idx])
            }
            VictimSelectionPolicy::Adaptive => {
                candidates.sort_by_key(|&id| std::cmp::Reverse(self.deques[id].len()));
                let top_k = self.config.adaptive_top_k.min(candidates.len()).max(1);
                let idx = rand::thread_rng().gen_range(0..top_k);
                Some(candidates[idx])
            }
            VictimSelectionPolicy::NumaAware => {
                let home = self.topology.node_of(thief_id);
                let mut best: Option<(usize, f64)> = None;
                for &id in &candidates {
                    let size = self.deques[id].len() as f64;
                    let penalty = if self.topology.node_of(id) == home {
                        1.0
                    } else {
                        self.config.cross_node_penalty
                    };
                    let score = size * penalty;
                    if best.map_or(true, |(_, best_score)| score > best_score) {
                        best = Some((id, score));
                    }
                }
                best.map(|(id, _)| id)
            }
            VictimSelectionPolicy::LocalityAware => {
                candidates
                    .into_iter()
                    .max_by(|&a, &b| {
                        self.affinity
                            .score(thief_id, a)
                            .partial_cmp(&self.affinity.score(thief_id, b))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
            }
            VictimSelectionPolicy::Hierarchical => {
                let home = self.topology.node_of(thief_id);
                let (mut same_node, mut other_node): (Vec<usize>, Vec<usize>) =
                    candidates.into_iter().partition(|&id| self.topology.node_of(id) == home);
                let mut rng = rand::thread_rng();
                shuffle(&mut same_node, &mut rng);
                shuffle(&mut other_node, &mut rng);
                same_node.into_iter().chain(other_node).next()
            }
        }
    }

    fn batch_size_for(&self, victim_size: usize) -> usize {
        let adaptive = (victim_size / 2).max(self.config.min_batch);
        adaptive.min(self.config.max_batch)
    }

    /// Attempts a single steal against a victim chosen by the configured
    /// policy. Returns `None` if no candidate yielded a job.
    pub fn steal_for(&self, thief_id: usize) -> Option<Job> {
        self.steal_batch_for(thief_id, 1).into_iter().next()
    }

    /// Attempts to steal up to `max` jobs in one victim lookup.
    pub fn steal_batch_for(&self, thief_id: usize, max: usize) -> Vec<Job> {
        self.stats.attempts.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let Some(victim_id) = self.pick_victim(thief_id) else {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            return Vec::new();
        };
        let victim = &self.deques[victim_id];
        let batch = self.batch_size_for(victim.len()).min(max.max(1));
        let mut stolen = Vec::with_capacity(batch);
        for _ in 0..batch {
            match victim.steal() {
                Some(job) => stolen.push(job),
                None => break,
            }
        }
        if stolen.is_empty() {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            return stolen;
        }
        self.stats.successes.fetch_add(1, Ordering::Relaxed);
        self.stats.total_jobs_stolen.fetch_add(stolen.len() as u64, Ordering::Relaxed);
        if stolen.len() > 1 {
            self.stats.batch_steals.fetch_add(1, Ordering::Relaxed);
        }
        if self.topology.node_of(thief_id) == self.topology.node_of(victim_id) {
            self.stats.same_node_steals.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.cross_node_steals.fetch_add(1, Ordering::Relaxed);
        }
        self.affinity.record_success(thief_id, victim_id);
        self.stats
            .total_steal_time_ns
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        stolen
    }

    /// Sleeps according to the configured backoff strategy for the given
    /// number of consecutive failed attempts, returning the slept duration.
    pub fn backoff(&self, consecutive_failures: u32) -> Duration {
        let duration = match self.config.backoff {
            BackoffStrategy::None => return Duration::ZERO,
            BackoffStrategy::LinearBackoff => {
                self.config.initial_backoff * consecutive_failures.max(1)
            }
            BackoffStrategy::ExponentialBackoff => {
                let factor = self.config.multiplier.powi(consecutive_failures.saturating_sub(1) as i32);
                Duration::from_nanos((self.config.initial_backoff.as_nanos() as f64 * factor) as u64)
            }
        }
        .min(self.config.max_backoff);
        thread::sleep(duration);
        self.stats
            .total_backoff_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        duration
    }
}

fn shuffle<T>(items: &mut [T], rng: &mut impl Rng) {
    for i in (1..items.len()).rev() {
        let j = rng.gen_range(0..=i);
        items.swap(i, j);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;

    fn deques(n: usize) -> Vec<Arc<ChaseLevDeque>> {
        (0..n).map(|_| Arc::new(ChaseLevDeque::new())).collect()
    }

    #[test]
    fn steals_a_job_pushed_onto_another_workers_deque() {
        let ds = deques(4);
        ds[1].push(Job::new(|| Ok(())));
        let stealer = Stealer::new(ds, StealerConfig::default(), Topology::single_node(4));
        let job = stealer.steal_for(0);
        assert!(job.is_some());
        assert_eq!(stealer.stats().successes, 1);
    }

    #[test]
    fn returns_none_when_all_other_deques_are_empty() {
        let ds = deques(3);
        let stealer = Stealer::new(ds, StealerConfig::default(), Topology::single_node(3));
        assert!(stealer.steal_for(0).is_none());
        assert_eq!(stealer.stats().failures, 1);
    }

    #[test]
    fn round_robin_policy_cycles_through_candidates() {
        // thief 0's candidates are workers 1 and 2, in that order. Tag each
        // victim's only job by name so the steal order proves the cursor
        // actually advances round-robin rather than, say, always picking
        // the same candidate.
        let ds = deques(3);
        ds[1].push(Job::named("from-1", || Ok(())));
        ds[2].push(Job::named("from-2", || Ok(())));
        let config = StealerConfig { policy: VictimSelectionPolicy::RoundRobin, ..Default::default() };
        let stealer = Stealer::new(ds, config, Topology::single_node(3));

        let first = stealer.steal_for(0).expect("candidate 1 should have a job");
        assert_eq!(first.name.as_deref(), Some("from-1"));
        let second = stealer.steal_for(0).expect("candidate 2 should have a job");
        assert_eq!(second.name.as_deref(), Some("from-2"));
    }

    #[test]
    fn numa_aware_prefers_same_node_victim() {
        let ds = deques(3);
        ds[1].push(Job::new(|| Ok(())));
        ds[2].push(Job::new(|| Ok(())));
        let topology = Topology::new(vec![0, 1, 0]);
        let config = StealerConfig { policy: VictimSelectionPolicy::NumaAware, ..Default::default() };
        let stealer = Stealer::new(ds, config, topology);
        let job = stealer.steal_for(0);
        assert!(job.is_some());
        assert_eq!(stealer.stats().same_node_steals, 1);
    }

    #[test]
    fn hierarchical_exhausts_same_node_before_other_nodes() {
        let ds = deques(3);
        ds[2].push(Job::new(|| Ok(())));
        let topology = Topology::new(vec![0, 0, 1]);
        let config = StealerConfig { policy: VictimSelectionPolicy::Hierarchical, ..Default::default() };
        let stealer = Stealer::new(ds, config, topology);
        let job = stealer.steal_for(0);
        assert!(job.is_some());
        assert_eq!(stealer.stats().cross_node_steals, 1);
    }

    #[test]
    fn backoff_none_sleeps_for_zero_duration() {
        let ds = deques(2);
        let config = StealerConfig { backoff: BackoffStrategy::None, ..Default::default() };
        let stealer = Stealer::new(ds, config, Topology::single_node(2));
        assert_eq!(stealer.backoff(3), Duration::ZERO);
    }
}
