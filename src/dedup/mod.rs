//! Message/task idempotency: a Bloom filter fronting an authoritative store.
//!
//! The filter answers "definitely unseen" without touching the store; the
//! store arbitrates atomically when the filter reports a possible hit. A
//! periodic sweep evicts expired records and rebuilds the filter so the
//! false-positive rate stays bounded as entries churn.

mod memory;

pub use memory::InMemoryDedupStore;

use crate::error::{Error, Result};
use async_trait::async_trait;
use bloomfilter::Bloom;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Authoritative idempotency store. Backends: in-memory map, stream-broker
/// key TTL (`drover-redis`), relational table (`drover-postgres`).
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically record `id` unless a live record exists. Returns `true`
    /// when the id was newly recorded, `false` on a confirmed duplicate.
    async fn insert_if_absent(&self, id: &str, ttl: Duration) -> Result<bool>;

    /// Authoritative membership probe.
    async fn contains(&self, id: &str) -> Result<bool>;

    /// Drop expired records, returning how many were evicted.
    async fn remove_expired(&self) -> Result<usize>;

    /// Ids of all live records; feeds the filter rebuild.
    async fn live_ids(&self) -> Result<Vec<String>>;

    async fn len(&self) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    FirstSeen,
    Duplicate,
}

/// Dedup configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    pub enabled: bool,
    /// How long a record suppresses duplicates.
    pub ttl: Duration,
    /// Sizing hint for the Bloom filter.
    pub expected_entries: usize,
    /// Target false-positive rate, kept under 1%.
    pub false_positive_rate: f64,
    /// Sweep cadence for eviction + filter rebuild.
    pub sweep_interval: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(3600),
            expected_entries: 100_000,
            false_positive_rate: 0.01,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl DedupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(Error::invalid_config("dedup ttl must be > 0"));
        }
        if self.expected_entries == 0 {
            return Err(Error::invalid_config("dedup expected_entries must be > 0"));
        }
        if !(0.0..1.0).contains(&self.false_positive_rate) || self.false_positive_rate <= 0.0 {
            return Err(Error::invalid_config("dedup false_positive_rate must be in (0, 1)"));
        }
        Ok(())
    }
}

/// Bloom-fronted deduplicator shared by the coordinator and workers.
pub struct Deduplicator {
    config: DedupConfig,
    filter: RwLock<Bloom<str>>,
    store: Arc<dyn DedupStore>,
}

impl std::fmt::Debug for Deduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator").field("config", &self.config).finish()
    }
}

impl Deduplicator {
    pub fn new(config: DedupConfig, store: Arc<dyn DedupStore>) -> Result<Self> {
        config.validate()?;
        let filter = Bloom::new_for_fp_rate(config.expected_entries, config.false_positive_rate);
        Ok(Self { config, filter: RwLock::new(filter), store })
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    pub fn sweep_interval(&self) -> Duration {
        self.config.sweep_interval
    }

    /// Record `id` if unseen. Concurrent callers with the same id are
    /// arbitrated by the store: exactly one observes [`DedupOutcome::FirstSeen`].
    pub async fn check_and_record(&self, id: &str) -> Result<DedupOutcome> {
        let possibly_seen = self.filter.read().unwrap_or_else(|p| p.into_inner()).check(id);
        if !possibly_seen {
            self.filter.write().unwrap_or_else(|p| p.into_inner()).set(id);
        }
        // The store insert doubles as the authoritative probe on a filter hit.
        let newly_recorded = self.store.insert_if_absent(id, self.config.ttl).await?;
        Ok(if newly_recorded { DedupOutcome::FirstSeen } else { DedupOutcome::Duplicate })
    }

    /// Read-only duplicate probe. The filter short-circuits the definite-miss
    /// case; only a possible hit reaches the store.
    pub async fn is_duplicate(&self, id: &str) -> Result<bool> {
        let possibly_seen = self.filter.read().unwrap_or_else(|p| p.into_inner()).check(id);
        if !possibly_seen {
            return Ok(false);
        }
        self.store.contains(id).await
    }

    /// Evict expired records and rebuild the filter from the survivors.
    pub async fn sweep(&self) -> Result<usize> {
        let evicted = self.store.remove_expired().await?;
        if evicted > 0 {
            let live = self.store.live_ids().await?;
            let mut fresh =
                Bloom::new_for_fp_rate(self.config.expected_entries, self.config.false_positive_rate);
            for id in &live {
                fresh.set(id.as_str());
            }
            *self.filter.write().unwrap_or_else(|p| p.into_inner()) = fresh;
            tracing::debug!(evicted, live = live.len(), "dedup sweep rebuilt filter");
        }
        Ok(evicted)
    }

    /// Periodic sweeper; runs until the returned handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let dedup = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(dedup.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = dedup.sweep().await {
                    tracing::warn!(error = %err, "dedup sweep failed");
                }
            }
        })
    }
}
