//! Worker: a long-lived strand consuming tasks that match its capabilities.
//!
//! Each worker subscribes to its own transport queue, heartbeats through the
//! pool, and executes handlers inside the resilience envelope
//! `Timeout ⊃ Retry ⊃ CircuitBreaker ⊃ RateLimiter ⊃ handler` (breakers and
//! limiters are keyed by task type, so all workers calling the same
//! collaborator share state through their registries). Handler panics are
//! recovered and returned as structured failures carrying the captured stack
//! trace; they never take the loop down.

use crate::breaker_registry::BreakerRegistry;
use crate::callbacks::{boundary_span, CallbackManager, RuntimeEvent};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::dedup::{DedupOutcome, Deduplicator};
use crate::error::{Error, ErrorKind, Result};
use crate::handler::HandlerRegistry;
use crate::ledger::{Ledger, TaskPatch};
use crate::message::{ControlCommand, Message, MessageType, TaskResultPayload};
use crate::pool::WorkerPool;
use crate::rate_limit::{LimiterPolicy, LimiterRegistry};
use crate::retry::RetryPolicy;
use crate::sleeper::InstantSleeper;
use crate::task::{ProgressEntry, Task, TaskFailure, TaskState};
use crate::timeout::with_timeout;
use crate::transport::Transport;
use futures::FutureExt;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

thread_local! {
    /// Backtrace captured by the panic hook, consumed by the catch_unwind
    /// arm in `run_handler`. The unwind is caught on the thread that
    /// panicked, so a thread-local hands it over safely.
    static LAST_PANIC_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a backtrace-capturing hook in front of the existing panic hook.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            LAST_PANIC_BACKTRACE.with(|slot| {
                *slot.borrow_mut() = Some(Backtrace::force_capture().to_string());
            });
            previous(info);
        }));
    });
}

fn take_panic_backtrace() -> Option<String> {
    LAST_PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take())
}

#[derive(Clone)]
pub struct WorkerConfig {
    /// Generated (`worker-<uuid>`) when absent.
    pub worker_id: Option<String>,
    pub heartbeat_interval: Duration,
    /// Deadline applied when a task carries none of its own.
    pub default_task_deadline: Option<Duration>,
    /// Retry policy for handler invocations.
    pub handler_retry: RetryPolicy,
    /// Template for the per-task-type breakers.
    pub breaker: CircuitBreakerConfig,
    /// Per-task-type rate limiting for handlers calling quota-bound
    /// collaborators. `None` disables limiting.
    pub rate_limit: Option<LimiterPolicy>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            heartbeat_interval: Duration::from_secs(10),
            default_task_deadline: Some(Duration::from_secs(300)),
            // Handler retries stay inside the worker; dispatch-level retry is
            // the coordinator's job.
            handler_retry: RetryPolicy::builder()
                .max_attempts(1)
                .expect("1 attempt is valid")
                .sleeper(InstantSleeper)
                .build(),
            breaker: CircuitBreakerConfig::default(),
            rate_limit: None,
        }
    }
}

struct InFlight {
    abort: tokio::task::AbortHandle,
}

/// Handle to a spawned worker loop.
pub struct WorkerHandle {
    pub worker_id: String,
    join: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    /// Wait for the loop to exit (it exits on transport close, drain, or a
    /// shutdown control message).
    pub async fn join(self) -> Result<()> {
        self.join
            .await
            .map_err(|err| Error::internal(format!("worker loop panicked: {err}")))
    }

    pub fn abort(&self) {
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

pub struct Worker {
    id: String,
    config: WorkerConfig,
    handlers: HandlerRegistry,
    transport: Arc<dyn Transport>,
    ledger: Arc<dyn Ledger>,
    pool: Arc<WorkerPool>,
    callbacks: Arc<CallbackManager>,
    breakers: BreakerRegistry,
    limiters: Option<LimiterRegistry>,
    dedup: Option<Arc<Deduplicator>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WorkerConfig,
        handlers: HandlerRegistry,
        transport: Arc<dyn Transport>,
        ledger: Arc<dyn Ledger>,
        pool: Arc<WorkerPool>,
        callbacks: Arc<CallbackManager>,
        dedup: Option<Arc<Deduplicator>>,
    ) -> Result<Self> {
        if handlers.is_empty() {
            return Err(Error::invalid_config("worker needs at least one handler"));
        }
        config.breaker.validate()?;
        let id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));
        // Surface breaker transitions through the observability fan-out.
        let mut breaker_config = config.breaker.clone();
        let chained_hook = breaker_config.on_state_change.take();
        let hook_callbacks = callbacks.clone();
        breaker_config.on_state_change = Some(Arc::new(move |name: &str, from, to| {
            if let Some(hook) = &chained_hook {
                hook(name, from, to);
            }
            let callbacks = hook_callbacks.clone();
            let event = RuntimeEvent::BreakerTransition { breaker: name.to_string(), from, to };
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { callbacks.emit(event).await });
            }
        }));
        let breakers = BreakerRegistry::new(breaker_config);
        let limiters = config.rate_limit.clone().map(LimiterRegistry::new);
        Ok(Self {
            id,
            config,
            handlers,
            transport,
            ledger,
            pool,
            callbacks,
            breakers,
            limiters,
            dedup,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register with the pool, subscribe to the transport, and spawn the
    /// receive loop.
    pub async fn start(self) -> Result<WorkerHandle> {
        install_panic_hook();
        let capabilities = self.handlers.capabilities();
        self.pool.register(&self.id, capabilities)?;
        self.transport
            .subscribe(&self.id, &[MessageType::Task, MessageType::Control, MessageType::Broadcast])
            .await?;
        self.callbacks.emit(RuntimeEvent::WorkerRegistered { worker_id: self.id.clone() }).await;

        let worker_id = self.id.clone();
        let worker = Arc::new(self);
        let join = tokio::spawn(async move { worker.run().await });
        Ok(WorkerHandle { worker_id, join })
    }

    async fn run(self: Arc<Self>) {
        tracing::info!(worker_id = %self.id, "worker loop started");
        loop {
            match with_timeout(
                Some(self.config.heartbeat_interval),
                self.transport.receive(&self.id, 8),
            )
            .await
            {
                Ok(batch) => {
                    for message in batch {
                        self.callbacks
                            .emit(RuntimeEvent::MessageReceived {
                                message_type: message.message_type,
                                by: self.id.clone(),
                            })
                            .await;
                        if self.dispatch(message).await {
                            self.finish().await;
                            return;
                        }
                    }
                }
                Err(err) if err.kind() == ErrorKind::Timeout => {
                    // Quiet interval: heartbeat and check for drain.
                    if let Err(err) = self.pool.heartbeat(&self.id) {
                        tracing::warn!(worker_id = %self.id, error = %err, "heartbeat failed");
                    }
                    self.mirror_agent_state().await;
                    if self.should_exit() {
                        self.finish().await;
                        return;
                    }
                }
                Err(err) if err.kind() == ErrorKind::Closed => {
                    tracing::info!(worker_id = %self.id, "transport closed; worker exiting");
                    self.finish().await;
                    return;
                }
                Err(err) => {
                    tracing::error!(worker_id = %self.id, error = %err, "receive failed");
                    self.finish().await;
                    return;
                }
            }
        }
    }

    /// Returns true when the loop should exit.
    async fn dispatch(self: &Arc<Self>, message: Message) -> bool {
        match message.message_type {
            MessageType::Task => {
                self.clone().handle_task_message(message).await;
                false
            }
            MessageType::Control => match message.decode_json::<ControlCommand>() {
                Ok(ControlCommand::Cancel { task_id }) => {
                    self.cancel_task(&task_id);
                    false
                }
                Ok(ControlCommand::Drain) => {
                    let _ = self.pool.drain(&self.id);
                    self.should_exit()
                }
                Ok(ControlCommand::Shutdown) => true,
                Err(err) => {
                    tracing::warn!(worker_id = %self.id, error = %err, "malformed control message");
                    false
                }
            },
            MessageType::Broadcast => {
                tracing::debug!(worker_id = %self.id, from = %message.from, "broadcast received");
                false
            }
            other => {
                tracing::debug!(worker_id = %self.id, message_type = other.as_str(), "ignoring message");
                false
            }
        }
    }

    /// A draining worker exits once its slot is free.
    fn should_exit(&self) -> bool {
        match self.pool.get(&self.id) {
            Some(record) => {
                record.status == crate::pool::WorkerStatus::Draining
                    && record.current_task.is_none()
                    && self.in_flight.lock().unwrap_or_else(|p| p.into_inner()).is_empty()
            }
            // Deregistered out from under us.
            None => true,
        }
    }

    /// Mirror this worker's observed state into the ledger for operators.
    async fn mirror_agent_state(&self) {
        let Some(record) = self.pool.get(&self.id) else { return };
        let stats = serde_json::json!({
            "tasks_completed": record.stats.tasks_completed,
            "tasks_failed": record.stats.tasks_failed,
            "mean_latency_ms": record.stats.mean_latency().as_millis() as u64,
            "p95_latency_ms": record.stats.p95_latency().as_millis() as u64,
        });
        let state = crate::ledger::AgentStateRecord {
            agent_id: self.id.clone(),
            capabilities: record.capabilities,
            status: record.status.as_str().to_string(),
            last_heartbeat: std::time::SystemTime::now(),
            stats,
        };
        if let Err(err) = self.ledger.upsert_agent_state(state).await {
            tracing::debug!(worker_id = %self.id, error = %err, "agent state upsert failed");
        }
    }

    async fn finish(&self) {
        match self.pool.deregister(&self.id) {
            Ok(_) => {
                self.callbacks
                    .emit(RuntimeEvent::WorkerDrained { worker_id: self.id.clone() })
                    .await;
            }
            Err(_) => { /* already removed */ }
        }
        let _ = self.transport.unsubscribe(&self.id).await;
        tracing::info!(worker_id = %self.id, "worker loop stopped");
    }

    async fn handle_task_message(self: Arc<Self>, message: Message) {
        let reply_to = message.from.clone();
        let message_id = message.id.clone();
        let task: Task = match message.decode_json() {
            Ok(task) => task,
            Err(err) => {
                tracing::warn!(worker_id = %self.id, error = %err, "malformed task message");
                return;
            }
        };

        // Transport replays: the same message id within TTL executes at most
        // once. The coordinator's own timeout covers the lost-result case.
        if let Some(dedup) = &self.dedup {
            match dedup.check_and_record(&format!("msg:{message_id}")).await {
                Ok(DedupOutcome::Duplicate) => {
                    tracing::debug!(worker_id = %self.id, task_id = %task.id, "duplicate task message skipped");
                    return;
                }
                Ok(DedupOutcome::FirstSeen) => {}
                Err(err) => {
                    tracing::warn!(worker_id = %self.id, error = %err, "dedup check failed; executing anyway");
                }
            }
        }

        if let Err(err) = self.pool.begin_task(&self.id, &task.id) {
            // Draining or already occupied: bounce the task back.
            let failure = TaskFailure::from_error(
                &Error::with_source(
                    ErrorKind::NoEligibleWorker,
                    format!("worker '{}' cannot accept task", self.id),
                    err,
                )
                .retryable(),
                task.attempts,
            );
            self.send_result(&reply_to, TaskResultPayload::failure(&task.id, &self.id, failure))
                .await;
            return;
        }

        let span = boundary_span("worker", "execute_task");
        span.record("task_id", task.id.as_str());
        span.record("worker_id", self.id.as_str());

        let worker = self.clone();
        let task_id = task.id.clone();
        let execution = tokio::spawn(
            async move {
                worker.execute(reply_to, task).await;
            }
            .instrument(span),
        );
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(task_id.clone(), InFlight { abort: execution.abort_handle() });
        // Entry removal is ordered after the insert above even when the
        // handler finishes first.
        let reaper = self.clone();
        tokio::spawn(async move {
            let _ = execution.await;
            reaper.in_flight.lock().unwrap_or_else(|p| p.into_inner()).remove(&task_id);
        });
    }

    async fn execute(self: Arc<Self>, reply_to: String, task: Task) {
        let started = Instant::now();
        let _ = self
            .ledger
            .update_task(&task.id, TaskPatch::status(TaskState::Running).with_started_now())
            .await;
        let _ = self
            .ledger
            .append_progress(
                ProgressEntry::now(&task.id, TaskState::Running, "handler started")
                    .by_worker(&self.id),
            )
            .await;
        self.callbacks
            .emit(RuntimeEvent::TaskStarted {
                task_id: task.id.clone(),
                worker_id: self.id.clone(),
            })
            .await;

        let outcome = self.run_handler(&task).await;
        let latency = started.elapsed();
        let attempts = task.attempts + 1;

        let payload = match outcome {
            Ok(value) => {
                let _ = self
                    .ledger
                    .append_progress(
                        ProgressEntry::now(&task.id, TaskState::Completed, "handler finished")
                            .by_worker(&self.id),
                    )
                    .await;
                self.callbacks
                    .emit(RuntimeEvent::TaskCompleted {
                        task_id: task.id.clone(),
                        worker_id: self.id.clone(),
                        latency,
                    })
                    .await;
                TaskResultPayload::success(&task.id, &self.id, value, attempts)
            }
            Err(err) => {
                let _ = self
                    .ledger
                    .append_progress(
                        ProgressEntry::now(
                            &task.id,
                            TaskState::Failed,
                            format!("handler failed: {err}"),
                        )
                        .by_worker(&self.id),
                    )
                    .await;
                self.callbacks.emit(RuntimeEvent::task_failed(&task.id, &err)).await;
                TaskResultPayload::failure(&task.id, &self.id, TaskFailure::from_error(&err, attempts))
            }
        };

        let success = payload.error.is_none();
        if let Err(err) = self.pool.finish_task(&self.id, latency, success) {
            tracing::warn!(worker_id = %self.id, error = %err, "failed to release worker slot");
        }
        self.send_result(&reply_to, payload).await;
    }

    /// Handler invocation inside the resilience envelope
    /// (`Timeout ⊃ Retry ⊃ Breaker ⊃ RateLimiter ⊃ handler`), with panic
    /// recovery at the innermost layer.
    async fn run_handler(&self, task: &Task) -> Result<serde_json::Value> {
        let handler = self.handlers.resolve(task)?;
        let breaker = self.breakers.get_or_create(&task.task_type)?;
        let limiter = match &self.limiters {
            Some(registry) => Some(registry.get_or_create(&task.task_type)?),
            None => None,
        };
        let deadline = task.deadline.or(self.config.default_task_deadline);

        with_timeout(
            deadline,
            self.config.handler_retry.execute(|| {
                let handler = handler.clone();
                let breaker = breaker.clone();
                let limiter = limiter.clone();
                let task = task.clone();
                async move {
                    breaker
                        .execute(|| async {
                            if let Some(limiter) = &limiter {
                                limiter.wait().await;
                            }
                            match AssertUnwindSafe(handler.handle_task(&task)).catch_unwind().await
                            {
                                Ok(result) => result,
                                Err(panic) => {
                                    let text = panic_text(panic.as_ref());
                                    // The hook captured the stack on this
                                    // thread just before the unwind.
                                    let backtrace = take_panic_backtrace();
                                    tracing::error!(
                                        task_id = %task.id,
                                        panic = %text,
                                        "handler panicked"
                                    );
                                    let mut err = Error::new(
                                        ErrorKind::Panic,
                                        format!("handler panicked: {text}"),
                                    )
                                    .permanent();
                                    if let Some(backtrace) = backtrace {
                                        err = err.with_backtrace(backtrace);
                                    }
                                    Err(err)
                                }
                            }
                        })
                        .await
                }
            }),
        )
        .await
    }

    fn cancel_task(&self, task_id: &str) {
        let aborted = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
            match in_flight.remove(task_id) {
                Some(entry) => {
                    entry.abort.abort();
                    true
                }
                None => false,
            }
        };
        if aborted {
            tracing::info!(worker_id = %self.id, task_id, "task cancelled");
            // The aborted strand cannot clean up after itself.
            if let Err(err) = self.pool.release_task(&self.id) {
                tracing::warn!(worker_id = %self.id, error = %err, "release after cancel failed");
            }
        }
    }

    async fn send_result(&self, reply_to: &str, payload: TaskResultPayload) {
        let message = match Message::with_json(&self.id, reply_to, MessageType::Result, &payload) {
            Ok(message) => message.with_key(payload.task_id.clone()),
            Err(err) => {
                tracing::error!(worker_id = %self.id, error = %err, "failed to encode result");
                return;
            }
        };
        self.callbacks
            .emit(RuntimeEvent::MessageSent {
                message_type: MessageType::Result,
                to: reply_to.to_string(),
            })
            .await;
        if let Err(err) = self.transport.send(message).await {
            tracing::error!(worker_id = %self.id, error = %err, "failed to send result");
        }
    }
}

fn panic_text(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
