//! Composition root: builds every component from [`RuntimeConfig`], owns
//! them, and runs the ordered shutdown.
//!
//! Nothing in the crate is a process-wide singleton; the `Runtime` is the
//! sole owner and everything else holds non-owning `Arc` handles.

use crate::autoscaler::{Autoscaler, AutoscalerStatus, WorkerFactory};
use crate::balancer::LoadBalancer;
use crate::callbacks::{Callback, CallbackManager, RuntimeEvent, TracingCallback};
use crate::config::{DedupBackend, RuntimeConfig};
use crate::coordinator::{Coordinator, CoordinatorConfig};
use crate::dedup::{DedupStore, Deduplicator, InMemoryDedupStore};
use crate::error::{Error, ErrorKind, Result};
use crate::handler::HandlerRegistry;
use crate::http::MetricsRenderer;
use crate::ledger::{AgentStateRecord, InMemoryLedger, Ledger, LedgerKind};
use crate::pool::WorkerPool;
use crate::task::TaskState;
use crate::transport::{Transport, TransportFactory};
use crate::worker::{Worker, WorkerConfig, WorkerHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

/// Map a runtime result to a process exit code for embedding binaries:
/// 0 clean, 1 configuration error, 2 fatal shutdown failure.
pub fn exit_code(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) if err.has_kind(ErrorKind::InvalidConfig) => 1,
        Err(_) => 2,
    }
}

pub struct RuntimeBuilder {
    config: RuntimeConfig,
    handlers: HandlerRegistry,
    callbacks: Vec<Arc<dyn Callback>>,
    transport_factory: TransportFactory,
    ledger_override: Option<Arc<dyn Ledger>>,
    dedup_store_override: Option<Arc<dyn DedupStore>>,
    metrics_renderer: Option<Arc<dyn MetricsRenderer>>,
}

impl RuntimeBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            handlers: HandlerRegistry::new(),
            callbacks: Vec::new(),
            transport_factory: TransportFactory::new(),
            ledger_override: None,
            dedup_store_override: None,
            metrics_renderer: None,
        }
    }

    /// Handlers every worker in this runtime serves.
    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn callback(mut self, callback: Arc<dyn Callback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    /// Register broker-backed transport builders from companion crates.
    pub fn transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = factory;
        self
    }

    /// Supply the relational ledger from `drover-postgres`.
    pub fn ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger_override = Some(ledger);
        self
    }

    /// Supply a broker/relational dedup store from a companion crate.
    pub fn dedup_store(mut self, store: Arc<dyn DedupStore>) -> Self {
        self.dedup_store_override = Some(store);
        self
    }

    pub fn metrics_renderer(mut self, renderer: Arc<dyn MetricsRenderer>) -> Self {
        self.metrics_renderer = Some(renderer);
        self
    }

    pub async fn build(self) -> Result<Arc<Runtime>> {
        self.config.validate()?;
        let config = self.config;

        let transport: Arc<dyn Transport> = self.transport_factory.build(&config.transport)?;

        let ledger: Arc<dyn Ledger> = match (config.ledger.kind, self.ledger_override) {
            (LedgerKind::InMemory, Some(ledger)) => ledger,
            (LedgerKind::InMemory, None) => Arc::new(InMemoryLedger::new()),
            (LedgerKind::Relational, Some(ledger)) => ledger,
            (LedgerKind::Hybrid, Some(durable)) => {
                Arc::new(crate::ledger::HybridLedger::new(durable))
            }
            (LedgerKind::Relational | LedgerKind::Hybrid, None) => {
                return Err(Error::invalid_config(
                    "relational ledger is provided by the drover-postgres crate; pass it via RuntimeBuilder::ledger",
                ))
            }
        };

        let dedup = if config.dedup_enabled {
            let store: Arc<dyn DedupStore> = match (config.dedup_backend, self.dedup_store_override)
            {
                (_, Some(store)) => store,
                (DedupBackend::InMemory, None) => Arc::new(InMemoryDedupStore::new()),
                (DedupBackend::StreamBroker, None) => {
                    return Err(Error::invalid_config(
                        "stream-broker dedup store is provided by the drover-redis crate",
                    ))
                }
                (DedupBackend::Relational, None) => {
                    return Err(Error::invalid_config(
                        "relational dedup store is provided by the drover-postgres crate",
                    ))
                }
            };
            Some(Arc::new(Deduplicator::new(config.dedup.clone(), store)?))
        } else {
            None
        };

        let pool = Arc::new(WorkerPool::new(config.pool.clone())?);
        let balancer = Arc::new(LoadBalancer::new(config.balancer));

        let callbacks = Arc::new(CallbackManager::new());
        callbacks.register(Arc::new(TracingCallback));
        for callback in self.callbacks {
            callbacks.register(callback);
        }

        let coordinator_config = CoordinatorConfig {
            default_task_deadline: config.resilience.default_task_deadline,
            default_max_attempts: config.max_attempts,
            dispatch_retry_timeout: config.dispatch_retry_timeout,
            ..CoordinatorConfig::default()
        };
        let coordinator = Coordinator::start(
            coordinator_config,
            transport.clone(),
            ledger.clone(),
            pool.clone(),
            balancer.clone(),
            dedup.clone(),
            callbacks.clone(),
        )
        .await?;

        let runtime = Arc::new(Runtime {
            config,
            transport,
            ledger,
            pool,
            balancer,
            dedup,
            callbacks,
            coordinator,
            handlers: self.handlers,
            autoscaler: Mutex::new(None),
            metrics_renderer: Mutex::new(self.metrics_renderer),
            background: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            shutdown_result: tokio::sync::OnceCell::new(),
        });

        runtime.start_background().await?;
        Ok(runtime)
    }
}

pub struct Runtime {
    config: RuntimeConfig,
    transport: Arc<dyn Transport>,
    ledger: Arc<dyn Ledger>,
    pool: Arc<WorkerPool>,
    balancer: Arc<LoadBalancer>,
    dedup: Option<Arc<Deduplicator>>,
    callbacks: Arc<CallbackManager>,
    coordinator: Arc<Coordinator>,
    handlers: HandlerRegistry,
    autoscaler: Mutex<Option<Arc<Autoscaler>>>,
    metrics_renderer: Mutex<Option<Arc<dyn MetricsRenderer>>>,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    workers: Mutex<Vec<WorkerHandle>>,
    shutting_down: AtomicBool,
    shutdown_result: tokio::sync::OnceCell<std::result::Result<(), String>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("transport", &self.config.transport.kind)
            .field("pool", &self.pool.stats())
            .finish()
    }
}

impl Runtime {
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    /// Build a runtime straight from `DROVER_*` environment variables.
    pub async fn from_env() -> Result<Arc<Self>> {
        RuntimeBuilder::new(RuntimeConfig::from_env()?).build().await
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn callbacks(&self) -> &Arc<CallbackManager> {
        &self.callbacks
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn autoscaler_status(&self) -> Option<AutoscalerStatus> {
        self.autoscaler
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|scaler| scaler.status())
    }

    pub fn metrics_renderer(&self) -> Option<Arc<dyn MetricsRenderer>> {
        self.metrics_renderer.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn set_metrics_renderer(&self, renderer: Arc<dyn MetricsRenderer>) {
        *self.metrics_renderer.lock().unwrap_or_else(|p| p.into_inner()) = Some(renderer);
    }

    pub fn is_ready(&self) -> bool {
        !self.shutting_down.load(Ordering::Acquire)
    }

    /// Composed component health.
    pub async fn health(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::closed("runtime is shutting down"));
        }
        self.transport.health().await?;
        self.ledger.health().await?;
        let scaler = self.autoscaler.lock().unwrap_or_else(|p| p.into_inner()).clone();
        if let Some(scaler) = scaler {
            scaler.health().await?;
        }
        Ok(())
    }

    /// Spawn one worker serving the runtime's handler registry.
    pub async fn spawn_worker(&self) -> Result<String> {
        if self.handlers.is_empty() {
            return Err(Error::invalid_config("runtime has no handlers to run workers with"));
        }
        let worker_config = WorkerConfig {
            worker_id: None,
            heartbeat_interval: self.config.pool.heartbeat_interval,
            default_task_deadline: self.config.resilience.default_task_deadline,
            handler_retry: self.config.resilience.retry_policy()?,
            breaker: self.config.resilience.breaker_config(),
            rate_limit: self.config.resilience.rate_limit.clone(),
        };
        let worker = Worker::new(
            worker_config,
            self.handlers.clone(),
            self.transport.clone(),
            self.ledger.clone(),
            self.pool.clone(),
            self.callbacks.clone(),
            self.dedup.clone(),
        )?;
        let handle = worker.start().await?;
        let worker_id = handle.worker_id.clone();
        self.workers.lock().unwrap_or_else(|p| p.into_inner()).push(handle);
        Ok(worker_id)
    }

    async fn start_background(self: &Arc<Self>) -> Result<()> {
        // Seed the fleet at the configured floor.
        if !self.handlers.is_empty() {
            for _ in 0..self.config.autoscaler.min_workers {
                self.spawn_worker().await?;
            }
        }

        let mut background = Vec::new();

        // Heartbeat monitor: requeue tasks of lapsed workers.
        background.push(tokio::spawn(Arc::clone(self).monitor_heartbeats()));

        if let Some(dedup) = &self.dedup {
            background.push(dedup.spawn_sweeper());
        }

        if self.config.autoscaler.enabled && !self.handlers.is_empty() {
            let factory: WorkerFactory = {
                let runtime = Arc::clone(self);
                Arc::new(move || {
                    let runtime = runtime.clone();
                    Box::pin(async move { runtime.spawn_worker().await })
                })
            };
            let scaler = Arc::new(Autoscaler::new(
                self.config.autoscaler.clone(),
                self.pool.clone(),
                self.ledger.clone(),
                factory,
                self.callbacks.clone(),
            )?);
            background.push(scaler.spawn());
            *self.autoscaler.lock().unwrap_or_else(|p| p.into_inner()) = Some(scaler);
        }

        if self.config.http.enabled {
            let addr: std::net::SocketAddr = self
                .config
                .http
                .addr
                .parse()
                .map_err(|_| Error::invalid_config(format!("bad http addr '{}'", self.config.http.addr)))?;
            let runtime = Arc::clone(self);
            background.push(tokio::spawn(async move {
                let shutdown = {
                    let runtime = runtime.clone();
                    async move {
                        while runtime.is_ready() {
                            tokio::time::sleep(Duration::from_millis(250)).await;
                        }
                    }
                };
                if let Err(err) = crate::http::serve(addr, runtime, shutdown).await {
                    tracing::error!(error = %err, "ops endpoint failed");
                }
            }));
        }

        self.background.lock().unwrap_or_else(|p| p.into_inner()).extend(background);
        Ok(())
    }

    async fn monitor_heartbeats(self: Arc<Self>) {
        let interval = self.config.pool.heartbeat_interval;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            for lapsed in self.pool.check_heartbeats() {
                self.callbacks
                    .emit(RuntimeEvent::WorkerOffline { worker_id: lapsed.worker_id.clone() })
                    .await;
                let _ = self
                    .ledger
                    .upsert_agent_state(AgentStateRecord {
                        agent_id: lapsed.worker_id.clone(),
                        capabilities: Default::default(),
                        status: "offline".to_string(),
                        last_heartbeat: SystemTime::now(),
                        stats: serde_json::Value::Null,
                    })
                    .await;
                if let Some(task_id) = lapsed.in_flight_task {
                    self.requeue_task(&task_id).await;
                }
            }
        }
    }

    /// Return an offline worker's in-flight task to the queue, giving up once
    /// its attempt budget is spent.
    async fn requeue_task(&self, task_id: &str) {
        let task = match self.ledger.get_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(task_id, error = %err, "requeue lookup failed");
                return;
            }
        };
        if task.status.is_terminal() {
            return;
        }
        let attempts = task.attempts + 1;
        let patch = if attempts < task.max_attempts {
            crate::ledger::TaskPatch::status(TaskState::Pending).with_attempts(attempts)
        } else {
            crate::ledger::TaskPatch::failed(crate::task::TaskFailure {
                kind: ErrorKind::NoEligibleWorker,
                message: "worker lost and attempt budget exhausted".to_string(),
                attempts,
                last_attempt_at: SystemTime::now(),
                underlying: None,
                backtrace: None,
            })
        };
        match self.ledger.update_task(task_id, patch).await {
            Ok(updated) => {
                tracing::info!(task_id, status = %updated.status, attempts, "task requeued after worker loss");
                let _ = self
                    .ledger
                    .append_progress(crate::task::ProgressEntry::now(
                        task_id,
                        updated.status,
                        "worker went offline",
                    ))
                    .await;
            }
            Err(err) => tracing::warn!(task_id, error = %err, "requeue update failed"),
        }
    }

    /// Ordered shutdown: stop intake, drain workers (bounded), flush dedup
    /// and ledger, close the transport. Idempotent: later calls observe the
    /// first call's outcome.
    pub async fn shutdown(&self) -> Result<()> {
        let outcome = self
            .shutdown_result
            .get_or_init(|| async {
                self.shutdown_once().await.map_err(|err| err.to_string())
            })
            .await;
        outcome.clone().map_err(Error::internal)
    }

    async fn shutdown_once(&self) -> Result<()> {
        self.shutting_down.store(true, Ordering::Release);
        tracing::info!("runtime shutting down");

        // Drain: workers finish their current task and exit.
        self.pool.drain_all();
        let drained = crate::timeout::with_timeout(Some(self.config.pool.shutdown_timeout), async {
            loop {
                if self.pool.is_quiesced() {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!("shutdown timeout elapsed with tasks in flight; forcing termination");
            for handle in self.workers.lock().unwrap_or_else(|p| p.into_inner()).iter() {
                handle.abort();
            }
        }

        for handle in self.background.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            handle.abort();
        }
        // The factory closure holds a runtime handle; drop it so the Arc web
        // unwinds.
        *self.autoscaler.lock().unwrap_or_else(|p| p.into_inner()) = None;

        if let Some(dedup) = &self.dedup {
            let _ = dedup.sweep().await;
        }
        self.coordinator.close().await;
        self.ledger.close().await?;
        self.transport.close().await?;
        tracing::info!("runtime shut down");
        Ok(())
    }

    /// Run until SIGINT/SIGTERM, then shut down in order.
    pub async fn run_until_signal(self: Arc<Self>) -> Result<()> {
        wait_for_signal().await;
        self.shutdown().await
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = interrupt.recv() => tracing::info!("SIGINT received"),
        _ = terminate.recv() => tracing::info!("SIGTERM received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
