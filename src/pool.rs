//! Worker pool: lifecycle, heartbeats, capability index, per-worker stats.
//!
//! The pool is bookkeeping only; worker loops live in [`crate::worker`] and
//! report in through these APIs. Reads dominate (every dispatch consults the
//! capability index), so state sits behind a reader-writer lock.

use crate::clock::{Clock, MonotonicClock};
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
    Draining,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Offline => "offline",
            WorkerStatus::Draining => "draining",
        }
    }

    /// Whether new tasks may be routed to a worker in this status.
    pub fn accepts_work(self) -> bool {
        matches!(self, WorkerStatus::Idle)
    }
}

const LATENCY_SAMPLE_WINDOW: usize = 100;
const LATENCY_EMA_ALPHA: f64 = 0.2;
/// Below this many samples, p95 falls back to the mean.
pub const P95_MIN_SAMPLES: usize = 30;

/// Running latency/outcome statistics for one worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStatsTracker {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    ema_micros: Option<f64>,
    samples_micros: Vec<u64>,
}

impl WorkerStatsTracker {
    pub fn record(&mut self, latency: Duration, success: bool) {
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        let micros = latency.as_micros() as u64;
        self.ema_micros = Some(match self.ema_micros {
            Some(prev) => prev + LATENCY_EMA_ALPHA * (micros as f64 - prev),
            None => micros as f64,
        });
        if self.samples_micros.len() == LATENCY_SAMPLE_WINDOW {
            self.samples_micros.remove(0);
        }
        self.samples_micros.push(micros);
    }

    pub fn mean_latency(&self) -> Duration {
        Duration::from_micros(self.ema_micros.unwrap_or(0.0) as u64)
    }

    /// 95th percentile over the sample window; falls back to the mean when
    /// fewer than [`P95_MIN_SAMPLES`] samples exist.
    pub fn p95_latency(&self) -> Duration {
        if self.samples_micros.len() < P95_MIN_SAMPLES {
            return self.mean_latency();
        }
        let mut sorted = self.samples_micros.clone();
        sorted.sort_unstable();
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        Duration::from_micros(sorted[rank.min(sorted.len()) - 1])
    }

    pub fn sample_count(&self) -> usize {
        self.samples_micros.len()
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            return 1.0;
        }
        self.tasks_completed as f64 / total as f64
    }
}

/// Pool-owned record of one worker. Mutated only through pool APIs.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub capabilities: BTreeSet<String>,
    pub status: WorkerStatus,
    pub last_heartbeat_millis: u64,
    pub registered_at_millis: u64,
    pub current_task: Option<String>,
    pub stats: WorkerStatsTracker,
}

impl WorkerRecord {
    pub fn can_run(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }
}

/// A worker that lapsed past the heartbeat threshold, with the task it was
/// holding (to be re-queued by the caller).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LapsedWorker {
    pub worker_id: String,
    pub in_flight_task: Option<String>,
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct PoolConfig {
    pub heartbeat_interval: Duration,
    /// Heartbeat lapses after `heartbeat_interval * offline_multiplier`.
    pub offline_multiplier: u32,
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            offline_multiplier: 3,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(Error::invalid_config("pool heartbeat_interval must be > 0"));
        }
        if self.offline_multiplier == 0 {
            return Err(Error::invalid_config("pool offline_multiplier must be > 0"));
        }
        Ok(())
    }

    pub fn offline_after(&self) -> Duration {
        self.heartbeat_interval * self.offline_multiplier
    }
}

/// Summary the autoscaler and `/metrics` sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub offline: usize,
    pub draining: usize,
    /// busy / (idle + busy); 0 when no live workers.
    pub utilisation: f64,
}

#[derive(Default)]
struct PoolInner {
    workers: HashMap<String, WorkerRecord>,
    capability_index: HashMap<String, BTreeSet<String>>,
}

impl PoolInner {
    fn index_worker(&mut self, record: &WorkerRecord) {
        for capability in &record.capabilities {
            self.capability_index
                .entry(capability.clone())
                .or_default()
                .insert(record.worker_id.clone());
        }
    }

    fn unindex_worker(&mut self, record: &WorkerRecord) {
        for capability in &record.capabilities {
            if let Some(ids) = self.capability_index.get_mut(capability) {
                ids.remove(&record.worker_id);
                if ids.is_empty() {
                    self.capability_index.remove(capability);
                }
            }
        }
    }
}

pub struct WorkerPool {
    config: PoolConfig,
    inner: RwLock<PoolInner>,
    clock: Arc<dyn Clock>,
    /// Notified whenever membership or availability changes; dispatch retries
    /// wait on this instead of polling.
    changed: Notify,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("stats", &self.stats()).finish()
    }
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            inner: RwLock::new(PoolInner::default()),
            clock: Arc::new(MonotonicClock::default()),
            changed: Notify::new(),
        })
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Resolves on the next membership/availability change.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    pub fn register(&self, worker_id: &str, capabilities: BTreeSet<String>) -> Result<()> {
        let now = self.clock.now_millis();
        {
            let mut inner = self.write();
            if inner.workers.contains_key(worker_id) {
                return Err(Error::already_exists(format!(
                    "worker '{worker_id}' already registered"
                )));
            }
            let record = WorkerRecord {
                worker_id: worker_id.to_string(),
                capabilities,
                status: WorkerStatus::Idle,
                last_heartbeat_millis: now,
                registered_at_millis: now,
                current_task: None,
                stats: WorkerStatsTracker::default(),
            };
            inner.index_worker(&record);
            inner.workers.insert(worker_id.to_string(), record);
        }
        tracing::info!(worker_id, "worker registered");
        self.changed.notify_waiters();
        Ok(())
    }

    pub fn deregister(&self, worker_id: &str) -> Result<WorkerRecord> {
        let removed = {
            let mut inner = self.write();
            let record = inner
                .workers
                .remove(worker_id)
                .ok_or_else(|| Error::not_found(format!("worker '{worker_id}' not registered")))?;
            inner.unindex_worker(&record);
            record
        };
        tracing::info!(worker_id, "worker deregistered");
        self.changed.notify_waiters();
        Ok(removed)
    }

    /// Stop routing new tasks to the worker; it finishes its current task.
    pub fn drain(&self, worker_id: &str) -> Result<()> {
        self.update(worker_id, |record| {
            if record.status != WorkerStatus::Offline {
                record.status = WorkerStatus::Draining;
            }
        })
    }

    pub fn heartbeat(&self, worker_id: &str) -> Result<()> {
        let now = self.clock.now_millis();
        self.update(worker_id, |record| {
            record.last_heartbeat_millis = now;
            // A lapsed worker that reports in again comes back as idle.
            if record.status == WorkerStatus::Offline {
                record.status =
                    if record.current_task.is_some() { WorkerStatus::Busy } else { WorkerStatus::Idle };
            }
        })
    }

    pub fn mark_busy(&self, worker_id: &str, task_id: &str) -> Result<()> {
        let mut assigned = false;
        self.update(worker_id, |record| {
            if record.status.accepts_work() {
                record.status = WorkerStatus::Busy;
                record.current_task = Some(task_id.to_string());
                assigned = true;
            }
        })?;
        if assigned {
            Ok(())
        } else {
            Err(Error::no_eligible_worker(format!("worker '{worker_id}' is not idle")))
        }
    }

    /// Worker-side acknowledgement that `task_id` is executing. A no-op when
    /// the dispatcher already reserved the slot for this task; otherwise the
    /// slot is claimed if free.
    pub fn begin_task(&self, worker_id: &str, task_id: &str) -> Result<()> {
        let mut accepted = false;
        self.update(worker_id, |record| {
            if record.current_task.as_deref() == Some(task_id) {
                // Pre-assigned by the dispatcher. A drain that landed in
                // between stays in effect; the task still runs.
                if record.status == WorkerStatus::Idle {
                    record.status = WorkerStatus::Busy;
                }
                accepted = true;
            } else if record.status.accepts_work() && record.current_task.is_none() {
                record.status = WorkerStatus::Busy;
                record.current_task = Some(task_id.to_string());
                accepted = true;
            }
        })?;
        if accepted {
            Ok(())
        } else {
            Err(Error::no_eligible_worker(format!(
                "worker '{worker_id}' cannot accept task '{task_id}'"
            )))
        }
    }

    /// Free the worker's slot without recording an outcome (cancelled or
    /// abandoned task).
    pub fn release_task(&self, worker_id: &str) -> Result<()> {
        self.update(worker_id, |record| {
            record.current_task = None;
            if record.status == WorkerStatus::Busy {
                record.status = WorkerStatus::Idle;
            }
        })
    }

    /// Record a finished task and free the worker's slot.
    pub fn finish_task(&self, worker_id: &str, latency: Duration, success: bool) -> Result<()> {
        self.update(worker_id, |record| {
            record.current_task = None;
            record.stats.record(latency, success);
            match record.status {
                WorkerStatus::Busy => record.status = WorkerStatus::Idle,
                // Draining workers stop here; Offline stays offline.
                WorkerStatus::Draining | WorkerStatus::Offline | WorkerStatus::Idle => {}
            }
        })
    }

    pub fn get(&self, worker_id: &str) -> Option<WorkerRecord> {
        self.read().workers.get(worker_id).cloned()
    }

    pub fn workers(&self) -> Vec<WorkerRecord> {
        let mut records: Vec<WorkerRecord> = self.read().workers.values().cloned().collect();
        records.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        records
    }

    /// Workers whose capability set covers `required`, sorted by id. Offline
    /// workers are excluded; idle/busy/draining filtering is the balancer's
    /// concern.
    pub fn candidates(&self, required: &BTreeSet<String>) -> Vec<WorkerRecord> {
        let inner = self.read();
        let mut ids: Option<BTreeSet<String>> = None;
        for capability in required {
            match inner.capability_index.get(capability) {
                None => return Vec::new(),
                Some(workers) => {
                    ids = Some(match ids {
                        None => workers.clone(),
                        Some(existing) => existing.intersection(workers).cloned().collect(),
                    });
                }
            }
        }
        let selected: Vec<WorkerRecord> = match ids {
            Some(ids) => ids.iter().filter_map(|id| inner.workers.get(id)).cloned().collect(),
            // No required capabilities: every worker qualifies.
            None => {
                let mut all: Vec<WorkerRecord> = inner.workers.values().cloned().collect();
                all.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
                all
            }
        };
        selected.into_iter().filter(|record| record.status != WorkerStatus::Offline).collect()
    }

    /// Mark workers whose heartbeat lapsed as offline and hand back their
    /// in-flight tasks for re-queueing.
    pub fn check_heartbeats(&self) -> Vec<LapsedWorker> {
        let now = self.clock.now_millis();
        let threshold = self.config.offline_after().as_millis() as u64;
        let mut lapsed = Vec::new();
        {
            let mut inner = self.write();
            for record in inner.workers.values_mut() {
                if record.status == WorkerStatus::Offline {
                    continue;
                }
                if now.saturating_sub(record.last_heartbeat_millis) > threshold {
                    record.status = WorkerStatus::Offline;
                    lapsed.push(LapsedWorker {
                        worker_id: record.worker_id.clone(),
                        in_flight_task: record.current_task.take(),
                    });
                }
            }
        }
        if !lapsed.is_empty() {
            for worker in &lapsed {
                tracing::warn!(worker_id = %worker.worker_id, "worker heartbeat lapsed; marked offline");
            }
            self.changed.notify_waiters();
        }
        lapsed
    }

    /// Mark every worker draining; used during shutdown.
    pub fn drain_all(&self) {
        {
            let mut inner = self.write();
            for record in inner.workers.values_mut() {
                if record.status != WorkerStatus::Offline {
                    record.status = WorkerStatus::Draining;
                }
            }
        }
        self.changed.notify_waiters();
    }

    /// True once no worker holds an in-flight task.
    pub fn is_quiesced(&self) -> bool {
        self.read().workers.values().all(|record| record.current_task.is_none())
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.read();
        let mut stats = PoolStats { total: inner.workers.len(), ..PoolStats::default() };
        for record in inner.workers.values() {
            match record.status {
                WorkerStatus::Idle => stats.idle += 1,
                WorkerStatus::Busy => stats.busy += 1,
                WorkerStatus::Offline => stats.offline += 1,
                WorkerStatus::Draining => stats.draining += 1,
            }
        }
        let live = stats.idle + stats.busy;
        stats.utilisation = if live == 0 { 0.0 } else { stats.busy as f64 / live as f64 };
        stats
    }

    pub fn len(&self) -> usize {
        self.read().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().workers.is_empty()
    }

    fn update<F>(&self, worker_id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut WorkerRecord),
    {
        {
            let mut inner = self.write();
            let record = inner
                .workers
                .get_mut(worker_id)
                .ok_or_else(|| Error::not_found(format!("worker '{worker_id}' not registered")))?;
            mutate(record);
        }
        self.changed.notify_waiters();
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PoolInner> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PoolInner> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorKind;

    fn caps(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn pool() -> WorkerPool {
        WorkerPool::new(PoolConfig::default()).unwrap()
    }

    #[test]
    fn register_and_candidates_by_capability() {
        let pool = pool();
        pool.register("w1", caps(&["echo", "llm"])).unwrap();
        pool.register("w2", caps(&["echo"])).unwrap();

        let both = pool.candidates(&caps(&["echo"]));
        assert_eq!(both.len(), 2);

        let llm_only = pool.candidates(&caps(&["echo", "llm"]));
        assert_eq!(llm_only.len(), 1);
        assert_eq!(llm_only[0].worker_id, "w1");

        assert!(pool.candidates(&caps(&["gpu"])).is_empty());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let pool = pool();
        pool.register("w1", caps(&["echo"])).unwrap();
        assert_eq!(
            pool.register("w1", caps(&["echo"])).unwrap_err().kind(),
            ErrorKind::AlreadyExists
        );
    }

    #[test]
    fn deregister_rebuilds_capability_index() {
        let pool = pool();
        pool.register("w1", caps(&["echo"])).unwrap();
        pool.deregister("w1").unwrap();
        assert!(pool.candidates(&caps(&["echo"])).is_empty());
        assert_eq!(pool.deregister("w1").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn busy_workers_do_not_accept_work() {
        let pool = pool();
        pool.register("w1", caps(&["echo"])).unwrap();
        pool.mark_busy("w1", "t1").unwrap();
        assert_eq!(
            pool.mark_busy("w1", "t2").unwrap_err().kind(),
            ErrorKind::NoEligibleWorker
        );

        pool.finish_task("w1", Duration::from_millis(10), true).unwrap();
        pool.mark_busy("w1", "t2").unwrap();
    }

    #[test]
    fn draining_worker_finishes_then_stays_drained() {
        let pool = pool();
        pool.register("w1", caps(&["echo"])).unwrap();
        pool.mark_busy("w1", "t1").unwrap();
        pool.drain("w1").unwrap();
        pool.finish_task("w1", Duration::from_millis(5), true).unwrap();

        let record = pool.get("w1").unwrap();
        assert_eq!(record.status, WorkerStatus::Draining);
        assert!(record.current_task.is_none());
        assert!(pool.mark_busy("w1", "t2").is_err());
    }

    #[test]
    fn heartbeat_lapse_marks_offline_and_returns_task() {
        let clock = ManualClock::new();
        let config = PoolConfig {
            heartbeat_interval: Duration::from_secs(10),
            offline_multiplier: 3,
            ..PoolConfig::default()
        };
        let pool = WorkerPool::new(config).unwrap().with_clock(clock.clone());
        pool.register("w1", caps(&["echo"])).unwrap();
        pool.register("w2", caps(&["echo"])).unwrap();
        pool.mark_busy("w1", "t1").unwrap();

        clock.advance(Duration::from_secs(20));
        pool.heartbeat("w2").unwrap();
        clock.advance(Duration::from_secs(15)); // w1 silent for 35s > 30s

        let lapsed = pool.check_heartbeats();
        assert_eq!(
            lapsed,
            vec![LapsedWorker {
                worker_id: "w1".to_string(),
                in_flight_task: Some("t1".to_string())
            }]
        );
        assert_eq!(pool.get("w1").unwrap().status, WorkerStatus::Offline);
        assert_eq!(pool.get("w2").unwrap().status, WorkerStatus::Idle);

        // Offline workers are not candidates.
        assert_eq!(pool.candidates(&caps(&["echo"])).len(), 1);

        // A late heartbeat brings the worker back.
        pool.heartbeat("w1").unwrap();
        assert_eq!(pool.get("w1").unwrap().status, WorkerStatus::Idle);
    }

    #[test]
    fn stats_compute_utilisation() {
        let pool = pool();
        for id in ["w1", "w2", "w3", "w4"] {
            pool.register(id, caps(&["echo"])).unwrap();
        }
        pool.mark_busy("w1", "t1").unwrap();
        pool.mark_busy("w2", "t2").unwrap();
        pool.drain("w3").unwrap();

        let stats = pool.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.busy, 2);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.draining, 1);
        assert!((stats.utilisation - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn latency_stats_track_mean_and_p95() {
        let mut tracker = WorkerStatsTracker::default();
        for _ in 0..10 {
            tracker.record(Duration::from_millis(100), true);
        }
        // Under the sample minimum: p95 falls back to the mean.
        assert_eq!(tracker.p95_latency(), tracker.mean_latency());

        for n in 0..40 {
            let latency = if n < 38 { 100 } else { 500 };
            tracker.record(Duration::from_millis(latency), true);
        }
        assert!(tracker.sample_count() >= P95_MIN_SAMPLES);
        assert!(tracker.p95_latency() >= Duration::from_millis(100));
        assert_eq!(tracker.tasks_completed, 50);
    }

    #[test]
    fn success_rate_counts_failures() {
        let mut tracker = WorkerStatsTracker::default();
        assert_eq!(tracker.success_rate(), 1.0);
        tracker.record(Duration::from_millis(1), true);
        tracker.record(Duration::from_millis(1), true);
        tracker.record(Duration::from_millis(1), false);
        assert!((tracker.success_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn changed_wakes_on_registration() {
        let pool = Arc::new(pool());
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.changed().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.register("w1", caps(&["echo"])).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("changed() must wake")
            .unwrap();
    }

    #[test]
    fn drain_all_quiesces_when_tasks_finish() {
        let pool = pool();
        pool.register("w1", caps(&["echo"])).unwrap();
        pool.mark_busy("w1", "t1").unwrap();
        pool.drain_all();
        assert!(!pool.is_quiesced());
        pool.finish_task("w1", Duration::from_millis(2), true).unwrap();
        assert!(pool.is_quiesced());
    }
}
