//! Worker selection strategies.
//!
//! Given the eligible candidates for a capability, pick the worker to
//! dispatch to. Ties break lexicographically by worker id so selection is
//! deterministic under test. Strategies select among idle workers;
//! `LeastLoaded` alone may queue behind a busy worker when no idle candidate
//! exists, since transport queues absorb the backlog.

use crate::error::{Error, Result};
use crate::pool::{WorkerRecord, WorkerStatus};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalancerStrategy {
    #[default]
    RoundRobin,
    LeastLoaded,
    Random,
    CapabilityBest,
    LatencyBased,
    WeightedRoundRobin,
}

impl std::str::FromStr for BalancerStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "round-robin" => Ok(BalancerStrategy::RoundRobin),
            "least-loaded" => Ok(BalancerStrategy::LeastLoaded),
            "random" => Ok(BalancerStrategy::Random),
            "capability-best" => Ok(BalancerStrategy::CapabilityBest),
            "latency-based" => Ok(BalancerStrategy::LatencyBased),
            "weighted-round-robin" => Ok(BalancerStrategy::WeightedRoundRobin),
            other => Err(Error::invalid_config(format!("unknown balancer strategy '{other}'"))),
        }
    }
}

/// Stateful selector. Round-robin cursors and weighted deficit counters are
/// keyed by capability so unrelated task types rotate independently.
pub struct LoadBalancer {
    strategy: BalancerStrategy,
    cursors: Mutex<HashMap<String, usize>>,
    deficits: Mutex<HashMap<String, HashMap<String, i64>>>,
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer").field("strategy", &self.strategy).finish()
    }
}

impl LoadBalancer {
    pub fn new(strategy: BalancerStrategy) -> Self {
        Self { strategy, cursors: Mutex::default(), deficits: Mutex::default() }
    }

    pub fn strategy(&self) -> BalancerStrategy {
        self.strategy
    }

    /// Pick a worker id for `capability` among `candidates`.
    pub fn select(&self, capability: &str, candidates: &[WorkerRecord]) -> Result<String> {
        if candidates.is_empty() {
            return Err(Error::no_eligible_worker(format!(
                "no worker advertises capability '{capability}'"
            )));
        }

        let mut pool: Vec<&WorkerRecord> =
            candidates.iter().filter(|w| w.status == WorkerStatus::Idle).collect();
        if pool.is_empty() {
            if self.strategy == BalancerStrategy::LeastLoaded {
                // Queue behind whoever is least loaded.
                pool = candidates
                    .iter()
                    .filter(|w| w.status != WorkerStatus::Offline && w.status != WorkerStatus::Draining)
                    .collect();
            }
            if pool.is_empty() {
                return Err(Error::no_eligible_worker(format!(
                    "no idle worker for capability '{capability}'"
                )));
            }
        }
        pool.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

        let selected = match self.strategy {
            BalancerStrategy::RoundRobin => self.round_robin(capability, &pool),
            BalancerStrategy::LeastLoaded => Self::least_loaded(&pool),
            BalancerStrategy::Random => Self::random(&pool),
            BalancerStrategy::CapabilityBest => Self::capability_best(&pool),
            BalancerStrategy::LatencyBased => Self::latency_based(&pool),
            BalancerStrategy::WeightedRoundRobin => self.weighted_round_robin(capability, &pool),
        };
        Ok(selected)
    }

    fn round_robin(&self, capability: &str, pool: &[&WorkerRecord]) -> String {
        let mut cursors = self.cursors.lock().unwrap_or_else(|p| p.into_inner());
        let cursor = cursors.entry(capability.to_string()).or_insert(0);
        let picked = pool[*cursor % pool.len()].worker_id.clone();
        *cursor = cursor.wrapping_add(1);
        picked
    }

    fn least_loaded(pool: &[&WorkerRecord]) -> String {
        // Load is the occupied slot; candidates are pre-sorted so min_by_key
        // keeps the lexicographically first among ties.
        pool.iter()
            .min_by_key(|w| u8::from(w.current_task.is_some()))
            .expect("pool is non-empty")
            .worker_id
            .clone()
    }

    fn random(pool: &[&WorkerRecord]) -> String {
        let index = rand::thread_rng().gen_range(0..pool.len());
        pool[index].worker_id.clone()
    }

    fn capability_best(pool: &[&WorkerRecord]) -> String {
        // Weight by success rate scaled by how closely the worker's
        // capability set matches; specialists beat generalists.
        let weights: Vec<f64> = pool
            .iter()
            .map(|w| {
                let breadth = w.capabilities.len().max(1) as f64;
                (w.stats.success_rate() / breadth).max(0.0)
            })
            .collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return pool[0].worker_id.clone();
        }
        let mut roll = rand::thread_rng().gen_range(0.0..total);
        for (worker, weight) in pool.iter().zip(&weights) {
            if roll < *weight {
                return worker.worker_id.clone();
            }
            roll -= weight;
        }
        pool[pool.len() - 1].worker_id.clone()
    }

    fn latency_based(pool: &[&WorkerRecord]) -> String {
        pool.iter()
            .min_by_key(|w| w.stats.p95_latency())
            .expect("pool is non-empty")
            .worker_id
            .clone()
    }

    fn weighted_round_robin(&self, capability: &str, pool: &[&WorkerRecord]) -> String {
        let slowest = pool
            .iter()
            .map(|w| w.stats.mean_latency())
            .max()
            .unwrap_or(Duration::ZERO)
            .as_micros()
            .max(1) as f64;
        let weights: Vec<i64> = pool
            .iter()
            .map(|w| {
                let normalised = (w.stats.mean_latency().as_micros() as f64 / slowest) * 10.0;
                ((10.0 - normalised) as i64).max(1)
            })
            .collect();
        let total: i64 = weights.iter().sum();

        let mut deficits = self.deficits.lock().unwrap_or_else(|p| p.into_inner());
        let counters = deficits.entry(capability.to_string()).or_default();
        counters.retain(|id, _| pool.iter().any(|w| w.worker_id == *id));

        let mut best: Option<(&WorkerRecord, i64)> = None;
        for (worker, weight) in pool.iter().zip(&weights) {
            let counter = counters.entry(worker.worker_id.clone()).or_insert(0);
            *counter += weight;
            match best {
                Some((_, best_deficit)) if *counter <= best_deficit => {}
                _ => best = Some((worker, *counter)),
            }
        }
        let (picked, _) = best.expect("pool is non-empty");
        *counters.get_mut(&picked.worker_id).expect("counter just inserted") -= total;
        picked.worker_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::pool::WorkerStatsTracker;
    use std::collections::BTreeSet;

    fn worker(id: &str, status: WorkerStatus) -> WorkerRecord {
        WorkerRecord {
            worker_id: id.to_string(),
            capabilities: BTreeSet::from(["echo".to_string()]),
            status,
            last_heartbeat_millis: 0,
            registered_at_millis: 0,
            current_task: if status == WorkerStatus::Busy { Some("t".to_string()) } else { None },
            stats: WorkerStatsTracker::default(),
        }
    }

    fn worker_with_latency(id: &str, mean_millis: u64) -> WorkerRecord {
        let mut record = worker(id, WorkerStatus::Idle);
        for _ in 0..40 {
            record.stats.record(Duration::from_millis(mean_millis), true);
        }
        record
    }

    #[test]
    fn empty_candidates_is_no_eligible_worker() {
        let balancer = LoadBalancer::new(BalancerStrategy::RoundRobin);
        let err = balancer.select("echo", &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoEligibleWorker);
    }

    #[test]
    fn round_robin_cycles_deterministically() {
        let balancer = LoadBalancer::new(BalancerStrategy::RoundRobin);
        let candidates = vec![
            worker("w1", WorkerStatus::Idle),
            worker("w2", WorkerStatus::Idle),
            worker("w3", WorkerStatus::Idle),
        ];
        let picks: Vec<String> =
            (0..6).map(|_| balancer.select("echo", &candidates).unwrap()).collect();
        assert_eq!(picks, vec!["w1", "w2", "w3", "w1", "w2", "w3"]);
    }

    #[test]
    fn round_robin_cursors_are_per_capability() {
        let balancer = LoadBalancer::new(BalancerStrategy::RoundRobin);
        let candidates = vec![worker("w1", WorkerStatus::Idle), worker("w2", WorkerStatus::Idle)];
        assert_eq!(balancer.select("echo", &candidates).unwrap(), "w1");
        assert_eq!(balancer.select("summarize", &candidates).unwrap(), "w1");
        assert_eq!(balancer.select("echo", &candidates).unwrap(), "w2");
    }

    #[test]
    fn busy_workers_are_skipped() {
        let balancer = LoadBalancer::new(BalancerStrategy::RoundRobin);
        let candidates = vec![worker("w1", WorkerStatus::Busy), worker("w2", WorkerStatus::Idle)];
        for _ in 0..3 {
            assert_eq!(balancer.select("echo", &candidates).unwrap(), "w2");
        }
    }

    #[test]
    fn all_busy_errors_except_least_loaded() {
        let candidates = vec![worker("w1", WorkerStatus::Busy), worker("w2", WorkerStatus::Busy)];
        let strict = LoadBalancer::new(BalancerStrategy::RoundRobin);
        assert_eq!(
            strict.select("echo", &candidates).unwrap_err().kind(),
            ErrorKind::NoEligibleWorker
        );

        let queueing = LoadBalancer::new(BalancerStrategy::LeastLoaded);
        assert_eq!(queueing.select("echo", &candidates).unwrap(), "w1");
    }

    #[test]
    fn least_loaded_prefers_free_slot_then_id() {
        let balancer = LoadBalancer::new(BalancerStrategy::LeastLoaded);
        let candidates = vec![
            worker("w1", WorkerStatus::Idle),
            worker("w2", WorkerStatus::Idle),
            worker("w3", WorkerStatus::Busy),
        ];
        assert_eq!(balancer.select("echo", &candidates).unwrap(), "w1");
    }

    #[test]
    fn random_only_picks_idle_workers() {
        let balancer = LoadBalancer::new(BalancerStrategy::Random);
        let candidates = vec![
            worker("w1", WorkerStatus::Busy),
            worker("w2", WorkerStatus::Idle),
            worker("w3", WorkerStatus::Draining),
        ];
        for _ in 0..20 {
            assert_eq!(balancer.select("echo", &candidates).unwrap(), "w2");
        }
    }

    #[test]
    fn latency_based_picks_fastest() {
        let balancer = LoadBalancer::new(BalancerStrategy::LatencyBased);
        let candidates = vec![
            worker_with_latency("w1", 300),
            worker_with_latency("w2", 50),
            worker_with_latency("w3", 150),
        ];
        assert_eq!(balancer.select("echo", &candidates).unwrap(), "w2");
    }

    #[test]
    fn latency_based_ties_break_by_id() {
        let balancer = LoadBalancer::new(BalancerStrategy::LatencyBased);
        let candidates = vec![worker("w2", WorkerStatus::Idle), worker("w1", WorkerStatus::Idle)];
        assert_eq!(balancer.select("echo", &candidates).unwrap(), "w1");
    }

    #[test]
    fn capability_best_prefers_specialists() {
        let balancer = LoadBalancer::new(BalancerStrategy::CapabilityBest);
        let mut generalist = worker("w-gen", WorkerStatus::Idle);
        generalist.capabilities =
            ["echo", "llm", "rag", "tools"].iter().map(|s| s.to_string()).collect();
        let specialist = worker("w-spec", WorkerStatus::Idle);

        let mut spec_wins = 0;
        for _ in 0..200 {
            if balancer.select("echo", &[generalist.clone(), specialist.clone()]).unwrap()
                == "w-spec"
            {
                spec_wins += 1;
            }
        }
        // 4x the weight: the specialist should win the clear majority.
        assert!(spec_wins > 120, "specialist won only {spec_wins}/200");
    }

    #[test]
    fn weighted_round_robin_favours_fast_workers() {
        let balancer = LoadBalancer::new(BalancerStrategy::WeightedRoundRobin);
        let candidates = vec![
            worker_with_latency("w-fast", 10),
            worker_with_latency("w-slow", 1000),
        ];
        let mut fast = 0;
        for _ in 0..100 {
            if balancer.select("echo", &candidates).unwrap() == "w-fast" {
                fast += 1;
            }
        }
        // Weight ~10 vs 1: the fast worker takes roughly 90% of picks.
        assert!(fast > 75, "fast worker picked only {fast}/100");
        assert!(fast < 100, "slow worker must still be served");
    }

    #[test]
    fn strategy_parses_from_config_strings() {
        assert_eq!(
            "weighted-round-robin".parse::<BalancerStrategy>().unwrap(),
            BalancerStrategy::WeightedRoundRobin
        );
        assert!("best-effort".parse::<BalancerStrategy>().is_err());
    }
}
