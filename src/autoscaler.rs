//! Threshold-based fleet autoscaling with distinct up/down cooldowns.
//!
//! The autoscaler holds a non-owning handle to the pool plus a factory
//! callback that binds new workers to the same transport and ledger. It never
//! owns workers; scale-down drains through the pool and the worker loop exits
//! on its own.

use crate::callbacks::{CallbackManager, RuntimeEvent};
use crate::clock::{Clock, MonotonicClock};
use crate::error::{Error, Result};
use crate::ledger::Ledger;
use crate::pool::{WorkerPool, WorkerStatus};
use crate::task::{TaskFilter, TaskState};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Produces a new worker bound to the runtime's transport/ledger, returning
/// its id. Supplied at construction; the autoscaler records factory failures
/// but does not retry inline.
pub type WorkerFactory = Arc<dyn Fn() -> BoxFuture<'static, Result<String>> + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscalerConfig {
    pub enabled: bool,
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_up_step: usize,
    pub scale_down_step: usize,
    /// Rule 1: pending tasks must exceed this...
    pub scale_up_queue_threshold: usize,
    /// ...and utilisation must exceed this.
    pub scale_up_util_threshold: f64,
    /// Rule 2: utilisation must drop below this...
    pub scale_down_util_threshold: f64,
    /// ...with more than this many idle workers.
    pub scale_down_idle_threshold: usize,
    pub cooldown_up: Duration,
    pub cooldown_down: Duration,
    pub evaluation_interval: Duration,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_workers: 1,
            max_workers: 16,
            scale_up_step: 2,
            scale_down_step: 1,
            scale_up_queue_threshold: 4,
            scale_up_util_threshold: 0.7,
            scale_down_util_threshold: 0.3,
            scale_down_idle_threshold: 2,
            cooldown_up: Duration::from_secs(60),
            cooldown_down: Duration::from_secs(120),
            evaluation_interval: Duration::from_secs(30),
        }
    }
}

impl AutoscalerConfig {
    /// Slow to grow, high thresholds, slow to shrink.
    pub fn conservative() -> Self {
        Self {
            scale_up_step: 1,
            scale_up_queue_threshold: 10,
            scale_up_util_threshold: 0.85,
            scale_down_util_threshold: 0.15,
            cooldown_up: Duration::from_secs(180),
            cooldown_down: Duration::from_secs(300),
            ..Self::default()
        }
    }

    /// Fast to grow on modest backlog.
    pub fn aggressive() -> Self {
        Self {
            scale_up_step: 4,
            scale_up_queue_threshold: 2,
            scale_up_util_threshold: 0.5,
            cooldown_up: Duration::from_secs(20),
            cooldown_down: Duration::from_secs(60),
            ..Self::default()
        }
    }

    /// Shrinks quickly once load drops.
    pub fn cost_optimised() -> Self {
        Self {
            scale_down_step: 2,
            scale_down_util_threshold: 0.4,
            scale_down_idle_threshold: 1,
            cooldown_down: Duration::from_secs(30),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::invalid_config("autoscaler max_workers must be > 0"));
        }
        if self.min_workers > self.max_workers {
            return Err(Error::invalid_config("autoscaler min_workers exceeds max_workers"));
        }
        if self.scale_up_step == 0 || self.scale_down_step == 0 {
            return Err(Error::invalid_config("autoscaler steps must be > 0"));
        }
        if self.evaluation_interval.is_zero() {
            return Err(Error::invalid_config("autoscaler evaluation_interval must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.scale_up_util_threshold)
            || !(0.0..=1.0).contains(&self.scale_down_util_threshold)
        {
            return Err(Error::invalid_config("autoscaler utilisation thresholds must be in [0, 1]"));
        }
        Ok(())
    }
}

/// One observation of the system, fed to the decision rules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoscalerSample {
    pub pending_tasks: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub utilisation: f64,
    pub pool_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Up(usize),
    Down(usize),
    Hold,
}

/// Pure decision function: rules evaluated top to bottom, first match wins.
pub fn decide(
    config: &AutoscalerConfig,
    sample: &AutoscalerSample,
    up_cooldown_elapsed: bool,
    down_cooldown_elapsed: bool,
) -> ScaleDecision {
    if sample.pending_tasks > config.scale_up_queue_threshold
        && sample.utilisation > config.scale_up_util_threshold
        && up_cooldown_elapsed
    {
        let headroom = config.max_workers.saturating_sub(sample.pool_size);
        let step = config.scale_up_step.min(headroom);
        if step > 0 {
            return ScaleDecision::Up(step);
        }
    }
    if sample.utilisation < config.scale_down_util_threshold
        && sample.idle_workers > config.scale_down_idle_threshold
        && down_cooldown_elapsed
    {
        let slack = sample.pool_size.saturating_sub(config.min_workers);
        let step = config.scale_down_step.min(slack);
        if step > 0 {
            return ScaleDecision::Down(step);
        }
    }
    ScaleDecision::Hold
}

/// Operator-visible autoscaler state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AutoscalerStatus {
    pub last_decision: Option<String>,
    pub last_error: Option<String>,
    pub scale_ups: u64,
    pub scale_downs: u64,
    pub factory_failures: u64,
}

pub struct Autoscaler {
    config: AutoscalerConfig,
    pool: Arc<WorkerPool>,
    ledger: Arc<dyn Ledger>,
    factory: WorkerFactory,
    callbacks: Arc<CallbackManager>,
    clock: Arc<dyn Clock>,
    state: Mutex<ScalerState>,
}

#[derive(Default)]
struct ScalerState {
    last_scale_up_millis: Option<u64>,
    last_scale_down_millis: Option<u64>,
    status: AutoscalerStatus,
}

impl Autoscaler {
    pub fn new(
        config: AutoscalerConfig,
        pool: Arc<WorkerPool>,
        ledger: Arc<dyn Ledger>,
        factory: WorkerFactory,
        callbacks: Arc<CallbackManager>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            pool,
            ledger,
            factory,
            callbacks,
            clock: Arc::new(MonotonicClock::default()),
            state: Mutex::new(ScalerState::default()),
        })
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &AutoscalerConfig {
        &self.config
    }

    pub fn status(&self) -> AutoscalerStatus {
        self.lock().status.clone()
    }

    pub async fn health(&self) -> Result<()> {
        Ok(())
    }

    /// Sample queue depth and pool state.
    pub async fn sample(&self) -> Result<AutoscalerSample> {
        let pending = self
            .ledger
            .list_tasks(&TaskFilter {
                status: Some(TaskState::Pending),
                limit: self.config.scale_up_queue_threshold.saturating_mul(4).max(64),
                ..TaskFilter::default()
            })
            .await?
            .len();
        let stats = self.pool.stats();
        Ok(AutoscalerSample {
            pending_tasks: pending,
            idle_workers: stats.idle,
            busy_workers: stats.busy,
            utilisation: stats.utilisation,
            pool_size: stats.total - stats.offline,
        })
    }

    /// One evaluation pass: sample, decide, apply.
    pub async fn evaluate(&self) -> Result<ScaleDecision> {
        let sample = self.sample().await?;
        let now = self.clock.now_millis();
        let decision = {
            let state = self.lock();
            let up_ok = cooldown_elapsed(state.last_scale_up_millis, self.config.cooldown_up, now);
            let down_ok =
                cooldown_elapsed(state.last_scale_down_millis, self.config.cooldown_down, now);
            decide(&self.config, &sample, up_ok, down_ok)
        };

        match decision {
            ScaleDecision::Up(count) => self.scale_up(count, now).await,
            ScaleDecision::Down(count) => self.scale_down(count, now),
            ScaleDecision::Hold => {}
        }
        self.lock().status.last_decision = Some(format!("{decision:?}"));
        Ok(decision)
    }

    async fn scale_up(&self, count: usize, now: u64) {
        let mut spawned = 0usize;
        for _ in 0..count {
            match (self.factory)().await {
                Ok(worker_id) => {
                    spawned += 1;
                    tracing::info!(worker_id, "autoscaler added worker");
                }
                Err(err) => {
                    tracing::error!(error = %err, "worker factory failed");
                    let mut state = self.lock();
                    state.status.factory_failures += 1;
                    state.status.last_error = Some(err.to_string());
                    break;
                }
            }
        }
        if spawned > 0 {
            {
                let mut state = self.lock();
                state.last_scale_up_millis = Some(now);
                state.status.scale_ups += 1;
            }
            self.callbacks
                .emit(RuntimeEvent::ScaledUp { added: spawned, pool_size: self.pool.len() })
                .await;
        }
    }

    fn scale_down(&self, count: usize, now: u64) {
        let victims = self.scale_down_victims(count);
        if victims.is_empty() {
            return;
        }
        for worker_id in &victims {
            if let Err(err) = self.pool.drain(worker_id) {
                tracing::warn!(worker_id, error = %err, "failed to drain worker");
            } else {
                tracing::info!(worker_id, "autoscaler draining worker");
            }
        }
        {
            let mut state = self.lock();
            state.last_scale_down_millis = Some(now);
            state.status.scale_downs += 1;
        }
        let removed = victims.len();
        let pool_size = self.pool.len();
        let callbacks = self.callbacks.clone();
        tokio::spawn(async move {
            callbacks.emit(RuntimeEvent::ScaledDown { removed, pool_size }).await;
        });
    }

    /// Drainable (idle) workers first, fewest tasks processed, oldest
    /// registration breaking ties; then busy low-throughput workers.
    fn scale_down_victims(&self, count: usize) -> Vec<String> {
        let mut workers = self.pool.workers();
        workers.retain(|w| matches!(w.status, WorkerStatus::Idle | WorkerStatus::Busy));
        workers.sort_by_key(|w| {
            (
                w.current_task.is_some(), // idle first
                w.stats.tasks_completed + w.stats.tasks_failed,
                w.registered_at_millis,
                w.worker_id.clone(),
            )
        });
        workers.into_iter().take(count).map(|w| w.worker_id).collect()
    }

    /// Periodic evaluation loop; aborts with the returned handle.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scaler = Arc::clone(self);
        tokio::spawn(async move {
            if !scaler.config.enabled {
                return;
            }
            let mut ticker = tokio::time::interval(scaler.config.evaluation_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = scaler.evaluate().await {
                    tracing::warn!(error = %err, "autoscaler evaluation failed");
                }
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScalerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn cooldown_elapsed(last: Option<u64>, cooldown: Duration, now: u64) -> bool {
    match last {
        None => true,
        Some(at) => now.saturating_sub(at) >= cooldown.as_millis() as u64,
    }
}
