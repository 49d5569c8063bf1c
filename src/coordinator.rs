//! Coordinator: the single entry point for task submission.
//!
//! Stateless beyond references to the pool, ledger, transport, balancer,
//! dedup store, and resilience primitives. Each submission persists the task,
//! waits out its dependencies, picks a worker, dispatches over the transport
//! inside a resilience envelope, and awaits the result message under the
//! task's deadline.

use crate::balancer::LoadBalancer;
use crate::breaker_registry::BreakerRegistry;
use crate::callbacks::{boundary_span, CallbackManager, RuntimeEvent};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::dedup::{DedupOutcome, Deduplicator};
use crate::envelope::ResilienceEnvelope;
use crate::error::{Error, ErrorKind, Result};
use crate::ledger::{Ledger, TaskPatch};
use crate::message::{ControlCommand, Message, MessageType, TaskResultPayload};
use crate::pool::WorkerPool;
use crate::retry::RetryPolicy;
use crate::task::{ProgressEntry, Task, TaskFailure, TaskRequest, TaskState};
use crate::timeout::with_timeout;
use crate::transport::Transport;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::oneshot;
use tracing::Instrument;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Agent id the coordinator subscribes under.
    pub agent_id: String,
    /// Applied when a request carries no deadline. `None` disables the
    /// default entirely.
    pub default_task_deadline: Option<Duration>,
    pub default_max_attempts: u32,
    /// How long dispatch waits for an eligible worker to appear.
    pub dispatch_retry_timeout: Duration,
    pub dependency_poll_interval: Duration,
    /// Upper bound on dependency waiting for tasks without a deadline.
    pub dependency_wait_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            agent_id: "coordinator".to_string(),
            default_task_deadline: Some(Duration::from_secs(300)),
            default_max_attempts: 3,
            dispatch_retry_timeout: Duration::from_secs(30),
            dependency_poll_interval: Duration::from_millis(200),
            dependency_wait_timeout: Duration::from_secs(300),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent_id.is_empty() {
            return Err(Error::invalid_config("coordinator agent_id must be set"));
        }
        if self.default_max_attempts == 0 {
            return Err(Error::invalid_config("coordinator default_max_attempts must be > 0"));
        }
        if self.dispatch_retry_timeout.is_zero() {
            return Err(Error::invalid_config("coordinator dispatch_retry_timeout must be > 0"));
        }
        if self.dependency_poll_interval.is_zero() {
            return Err(Error::invalid_config("coordinator dependency_poll_interval must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkflowMode {
    /// The first fatal failure is propagated as the workflow's error.
    /// Descendants of the failed task cascade to `Cancelled` through their
    /// own dependency wait; independent branches still run to completion.
    #[default]
    FailFast,
    /// Same cascade, but the workflow itself reports partial success instead
    /// of an error.
    Resilient,
}

/// Per-task outcomes of a workflow submission.
#[derive(Debug, Default)]
pub struct WorkflowReport {
    pub completed: HashMap<String, serde_json::Value>,
    pub failed: HashMap<String, Error>,
}

type Waiters = Mutex<HashMap<String, Vec<oneshot::Sender<TaskResultPayload>>>>;

pub struct Coordinator {
    config: CoordinatorConfig,
    transport: Arc<dyn Transport>,
    ledger: Arc<dyn Ledger>,
    pool: Arc<WorkerPool>,
    balancer: Arc<LoadBalancer>,
    dedup: Option<Arc<Deduplicator>>,
    callbacks: Arc<CallbackManager>,
    send_envelope: ResilienceEnvelope,
    waiters: Waiters,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator").field("agent_id", &self.config.agent_id).finish()
    }
}

impl Coordinator {
    /// Subscribe to the transport and spawn the result-reader strand.
    pub async fn start(
        config: CoordinatorConfig,
        transport: Arc<dyn Transport>,
        ledger: Arc<dyn Ledger>,
        pool: Arc<WorkerPool>,
        balancer: Arc<LoadBalancer>,
        dedup: Option<Arc<Deduplicator>>,
        callbacks: Arc<CallbackManager>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        transport
            .subscribe(&config.agent_id, &[MessageType::Result, MessageType::Progress])
            .await?;

        // Outbound sends share one breaker: a dead broker should fail fast
        // for every submission, not per-task.
        let breakers = BreakerRegistry::new(CircuitBreakerConfig::default());
        let send_envelope = ResilienceEnvelope::builder()
            .retry(
                RetryPolicy::builder()
                    .max_attempts(3)
                    .expect("static attempt count")
                    .backoff(crate::backoff::Backoff::exponential(Duration::from_millis(50)))
                    .build(),
            )
            .breaker(breakers.get_or_create("transport-send")?)
            .build();

        let coordinator = Arc::new(Self {
            config,
            transport,
            ledger,
            pool,
            balancer,
            dedup,
            callbacks,
            send_envelope,
            waiters: Mutex::default(),
            reader: Mutex::new(None),
        });

        let reader = tokio::spawn(Arc::clone(&coordinator).read_results());
        *coordinator.reader.lock().unwrap_or_else(|p| p.into_inner()) = Some(reader);
        Ok(coordinator)
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    /// Submit a task and wait for its result.
    pub async fn execute(self: &Arc<Self>, request: TaskRequest) -> Result<serde_json::Value> {
        let mut request = request;
        if request.deadline.is_none() {
            request.deadline = self.config.default_task_deadline;
        }
        let task = request.into_task(self.config.default_max_attempts);
        task.validate()?;

        let span = boundary_span("coordinator", "execute");
        span.record("task_id", task.id.as_str());
        self.execute_task(task).instrument(span).await
    }

    async fn execute_task(self: &Arc<Self>, task: Task) -> Result<serde_json::Value> {
        // Idempotent resubmission: a duplicate id returns the stored result
        // (or joins the in-flight submission).
        if let Some(dedup) = &self.dedup {
            if dedup.check_and_record(&task.id).await? == DedupOutcome::Duplicate {
                return self.join_duplicate(&task.id, task.deadline).await;
            }
        }

        self.ledger.create_task(task.clone()).await?;
        self.ledger
            .append_progress(ProgressEntry::now(&task.id, TaskState::Pending, "submitted"))
            .await?;
        self.callbacks
            .emit(RuntimeEvent::TaskSubmitted {
                task_id: task.id.clone(),
                task_type: task.task_type.clone(),
            })
            .await;

        if !task.dependencies.is_empty() {
            self.wait_for_dependencies(&task).await?;
        }

        let worker_id = match self.dispatch(&task).await {
            Ok(worker_id) => worker_id,
            Err(err) => {
                self.fail_task(&task.id, &err, task.attempts).await;
                return Err(err);
            }
        };

        // Register the waiter before the send so a fast worker cannot win the
        // race against it.
        let receiver = self.add_waiter(&task.id);

        if let Err(err) = self.send_task(&worker_id, &task).await {
            self.remove_waiters(&task.id);
            let _ = self.pool.release_task(&worker_id);
            self.fail_task(&task.id, &err, task.attempts).await;
            return Err(err);
        }

        self.await_result(task, worker_id, receiver).await
    }

    /// Later submissions with an already-seen id wait on the same outcome.
    async fn join_duplicate(
        self: &Arc<Self>,
        task_id: &str,
        deadline: Option<Duration>,
    ) -> Result<serde_json::Value> {
        let wait_deadline = Instant::now()
            + deadline.unwrap_or(self.config.dependency_wait_timeout);
        loop {
            if let Some(existing) = self.ledger.get_task(task_id).await? {
                match existing.status {
                    TaskState::Completed => {
                        return Ok(existing.result.unwrap_or(serde_json::Value::Null));
                    }
                    TaskState::Failed | TaskState::Cancelled => {
                        return Err(failure_to_error(&existing));
                    }
                    _ => {
                        // In flight: join the waiters. Re-check after
                        // registering, as the result may have landed between
                        // the status read and the registration.
                        let receiver = self.add_waiter(task_id);
                        if let Some(settled) = self.ledger.get_task(task_id).await? {
                            if settled.status.is_terminal() {
                                self.remove_waiters(task_id);
                                return match settled.status {
                                    TaskState::Completed => {
                                        Ok(settled.result.unwrap_or(serde_json::Value::Null))
                                    }
                                    _ => Err(failure_to_error(&settled)),
                                };
                            }
                        }
                        let remaining = wait_deadline.saturating_duration_since(Instant::now());
                        let payload =
                            with_timeout(Some(remaining), async {
                                receiver.await.map_err(|_| {
                                    Error::closed("coordinator shut down while waiting")
                                })
                            })
                            .await?;
                        return payload_to_result(payload);
                    }
                }
            }
            // The winning submission recorded the dedup entry but has not
            // written the ledger row yet.
            if Instant::now() >= wait_deadline {
                return Err(Error::timeout(format!(
                    "duplicate submission '{task_id}' never materialised"
                )));
            }
            tokio::time::sleep(self.config.dependency_poll_interval).await;
        }
    }

    async fn wait_for_dependencies(&self, task: &Task) -> Result<()> {
        let wait_deadline =
            Instant::now() + task.deadline.unwrap_or(self.config.dependency_wait_timeout);
        let mut remaining: HashSet<String> = task.dependencies.iter().cloned().collect();
        while !remaining.is_empty() {
            let mut satisfied = Vec::new();
            for dep_id in &remaining {
                match self.ledger.get_task(dep_id).await? {
                    Some(dep) => match dep.status {
                        TaskState::Completed => satisfied.push(dep_id.clone()),
                        TaskState::Failed | TaskState::Cancelled => {
                            let err = Error::new(
                                ErrorKind::DependencyFailed,
                                format!("dependency '{dep_id}' ended {}", dep.status),
                            );
                            self.cancel_with_note(&task.id, &err).await;
                            return Err(err);
                        }
                        _ => {}
                    },
                    None => {
                        // Not created yet; keep polling until the bound.
                    }
                }
            }
            for dep_id in satisfied {
                remaining.remove(&dep_id);
            }
            if remaining.is_empty() {
                break;
            }
            if Instant::now() >= wait_deadline {
                let err =
                    Error::timeout(format!("dependencies of '{}' did not complete", task.id));
                self.fail_task(&task.id, &err, task.attempts).await;
                return Err(err);
            }
            tokio::time::sleep(self.config.dependency_poll_interval).await;
        }
        Ok(())
    }

    /// Pick a worker, retrying while the pool changes shape, bounded by
    /// `dispatch_retry_timeout`.
    async fn dispatch(&self, task: &Task) -> Result<String> {
        let capability_key = task
            .required_capabilities
            .iter()
            .next()
            .cloned()
            .unwrap_or_else(|| task.task_type.clone());
        let deadline = Instant::now() + self.config.dispatch_retry_timeout;
        loop {
            let candidates = self.pool.candidates(&task.required_capabilities);
            match self.balancer.select(&capability_key, &candidates) {
                Ok(worker_id) => {
                    // The reservation can race a competing submission; losing
                    // just means another lap.
                    if self.pool.mark_busy(&worker_id, &task.id).is_ok() {
                        return Ok(worker_id);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NoEligibleWorker => {
                    if Instant::now() >= deadline {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
            if Instant::now() >= deadline {
                return Err(Error::no_eligible_worker(format!(
                    "dispatch of '{}' timed out waiting for a worker",
                    task.id
                )));
            }
            tokio::select! {
                _ = self.pool.changed() => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }

    async fn send_task(&self, worker_id: &str, task: &Task) -> Result<()> {
        self.ledger.update_task(&task.id, TaskPatch::status(TaskState::Assigned)).await?;
        self.ledger
            .append_progress(
                ProgressEntry::now(&task.id, TaskState::Assigned, "dispatched")
                    .by_worker(worker_id),
            )
            .await?;
        self.callbacks
            .emit(RuntimeEvent::TaskAssigned {
                task_id: task.id.clone(),
                worker_id: worker_id.to_string(),
            })
            .await;

        let message =
            Message::with_json(&self.config.agent_id, worker_id, MessageType::Task, task)?
                .with_key(task.id.clone());
        self.send_envelope
            .execute(|| {
                let message = message.clone();
                async move { self.transport.send(message).await }
            })
            .await?;
        self.callbacks
            .emit(RuntimeEvent::MessageSent {
                message_type: MessageType::Task,
                to: worker_id.to_string(),
            })
            .await;
        Ok(())
    }

    async fn await_result(
        self: &Arc<Self>,
        task: Task,
        worker_id: String,
        receiver: oneshot::Receiver<TaskResultPayload>,
    ) -> Result<serde_json::Value> {
        let outcome = with_timeout(task.deadline, async {
            receiver
                .await
                .map_err(|_| Error::closed("coordinator shut down while awaiting result"))
        })
        .await;

        match outcome {
            Ok(payload) => {
                match &payload.error {
                    None => {
                        let result = payload.result.clone().unwrap_or(serde_json::Value::Null);
                        self.record_terminal(
                            &task.id,
                            TaskPatch::completed(result.clone()).with_attempts(payload.attempts),
                        )
                        .await;
                        let _ = self
                            .ledger
                            .append_progress(
                                ProgressEntry::now(&task.id, TaskState::Completed, "result received")
                                    .by_worker(&payload.worker_id),
                            )
                            .await;
                        Ok(result)
                    }
                    Some(failure) => {
                        // A cancellation wake-up arrives as a synthesized
                        // failure payload; the ledger row is already terminal
                        // then, and record_terminal tolerates it.
                        if failure.kind != ErrorKind::Cancelled {
                            self.record_terminal(
                                &task.id,
                                TaskPatch::failed(failure.clone()).with_attempts(payload.attempts),
                            )
                            .await;
                            let _ = self
                                .ledger
                                .append_progress(
                                    ProgressEntry::now(
                                        &task.id,
                                        TaskState::Failed,
                                        failure.message.clone(),
                                    )
                                    .by_worker(&payload.worker_id),
                                )
                                .await;
                        }
                        let mut err = Error::new(failure.kind, failure.message.clone());
                        if let Some(backtrace) = &failure.backtrace {
                            err = err.with_backtrace(backtrace.clone());
                        }
                        self.callbacks.emit(RuntimeEvent::task_failed(&task.id, &err)).await;
                        Err(err)
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::Timeout => {
                self.remove_waiters(&task.id);
                let timeout_err = Error::with_source(
                    ErrorKind::Timeout,
                    format!("task '{}' missed its deadline", task.id),
                    err,
                );
                self.fail_task(&task.id, &timeout_err, task.attempts + 1).await;
                // Tell the worker to stop burning its slot on us.
                self.send_cancel(&worker_id, &task.id).await;
                Err(timeout_err)
            }
            Err(err) => {
                self.remove_waiters(&task.id);
                self.fail_task(&task.id, &err, task.attempts).await;
                Err(err)
            }
        }
    }

    /// Submit a dependency-ordered set of tasks.
    pub async fn execute_workflow(
        self: &Arc<Self>,
        requests: Vec<TaskRequest>,
        mode: WorkflowMode,
    ) -> Result<WorkflowReport> {
        let mut prepared = Vec::with_capacity(requests.len());
        let mut ids = HashSet::new();
        for mut request in requests {
            if request.id.is_none() {
                request.id = Some(uuid::Uuid::new_v4().to_string());
            }
            let id = request.id.clone().expect("id just ensured");
            if !ids.insert(id.clone()) {
                return Err(Error::invalid_input(format!("duplicate workflow task id '{id}'")));
            }
            prepared.push((id, request));
        }
        validate_dag(&prepared)?;

        let mut join_set = tokio::task::JoinSet::new();
        for (id, request) in prepared {
            let coordinator = Arc::clone(self);
            join_set.spawn(async move {
                let outcome = coordinator.execute(request).await;
                (id, outcome)
            });
        }

        // No explicit cancellation fan-out here: descendants of a failed task
        // cancel themselves when their dependency wait observes the terminal
        // state, and that cascade carries the DependencyFailed note.
        // Independent branches keep running in either mode.
        let mut report = WorkflowReport::default();
        let mut first_error: Option<Error> = None;
        while let Some(joined) = join_set.join_next().await {
            let (id, outcome) = joined
                .map_err(|err| Error::internal(format!("workflow task panicked: {err}")))?;
            match outcome {
                Ok(value) => {
                    report.completed.insert(id, value);
                }
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err.clone());
                    }
                    report.failed.insert(id, err);
                }
            }
        }

        match (mode, first_error) {
            (WorkflowMode::FailFast, Some(err)) => {
                Err(Error::with_source(ErrorKind::DependencyFailed, "workflow aborted", err))
            }
            _ => Ok(report),
        }
    }

    /// Cancel a submission: control-message the assigned worker, mark the
    /// ledger row, wake the submitter.
    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        let task = match self.ledger.get_task(task_id).await? {
            Some(task) => task,
            None => return Err(Error::not_found(format!("task '{task_id}' not found"))),
        };
        if task.status.is_terminal() {
            return Ok(false);
        }

        // The pool knows which worker holds the task, if any.
        let assignee = self
            .pool
            .workers()
            .into_iter()
            .find(|record| record.current_task.as_deref() == Some(task_id))
            .map(|record| record.worker_id);
        if let Some(worker_id) = &assignee {
            self.send_cancel(worker_id, task_id).await;
        }

        if let Err(err) =
            self.ledger.update_task(task_id, TaskPatch::status(TaskState::Cancelled)).await
        {
            // Lost the race with a terminal result.
            tracing::debug!(task_id, error = %err, "cancel raced completion");
            return Ok(false);
        }
        let _ = self
            .ledger
            .append_progress(ProgressEntry::now(task_id, TaskState::Cancelled, "cancelled"))
            .await;
        self.callbacks.emit(RuntimeEvent::TaskCancelled { task_id: task_id.to_string() }).await;

        let failure = TaskFailure {
            kind: ErrorKind::Cancelled,
            message: "task cancelled".to_string(),
            attempts: task.attempts,
            last_attempt_at: SystemTime::now(),
            underlying: None,
            backtrace: None,
        };
        self.complete_waiters(
            task_id,
            TaskResultPayload::failure(task_id, assignee.as_deref().unwrap_or(""), failure),
        );
        Ok(true)
    }

    /// Composed health of the coordinator's collaborators.
    pub async fn health(&self) -> Result<()> {
        self.transport.health().await?;
        self.ledger.health().await?;
        Ok(())
    }

    /// Stop the reader strand and fail all outstanding waiters.
    pub async fn close(&self) {
        if let Some(reader) = self.reader.lock().unwrap_or_else(|p| p.into_inner()).take() {
            reader.abort();
        }
        let drained: Vec<(String, Vec<oneshot::Sender<TaskResultPayload>>)> = {
            let mut waiters = self.waiters.lock().unwrap_or_else(|p| p.into_inner());
            waiters.drain().collect()
        };
        for (task_id, senders) in drained {
            let failure = TaskFailure {
                kind: ErrorKind::Closed,
                message: "coordinator closed".to_string(),
                attempts: 0,
                last_attempt_at: SystemTime::now(),
                underlying: None,
                backtrace: None,
            };
            for sender in senders {
                let _ = sender.send(TaskResultPayload::failure(&task_id, "", failure.clone()));
            }
        }
    }

    async fn read_results(self: Arc<Self>) {
        loop {
            match self.transport.receive(&self.config.agent_id, 16).await {
                Ok(batch) => {
                    for message in batch {
                        self.callbacks
                            .emit(RuntimeEvent::MessageReceived {
                                message_type: message.message_type,
                                by: self.config.agent_id.clone(),
                            })
                            .await;
                        match message.message_type {
                            MessageType::Result => {
                                match message.decode_json::<TaskResultPayload>() {
                                    Ok(payload) => {
                                        self.complete_waiters(&payload.task_id.clone(), payload)
                                    }
                                    Err(err) => {
                                        tracing::warn!(error = %err, "malformed result message")
                                    }
                                }
                            }
                            MessageType::Progress => {
                                if let Ok(entry) = message.decode_json::<ProgressEntry>() {
                                    let _ = self.ledger.append_progress(entry).await;
                                }
                            }
                            other => {
                                tracing::debug!(
                                    message_type = other.as_str(),
                                    "coordinator ignoring message"
                                );
                            }
                        }
                    }
                }
                Err(err) if err.kind() == ErrorKind::Closed => break,
                Err(err) => {
                    tracing::error!(error = %err, "coordinator receive failed");
                    break;
                }
            }
        }
    }

    fn add_waiter(&self, task_id: &str) -> oneshot::Receiver<TaskResultPayload> {
        let (sender, receiver) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(task_id.to_string())
            .or_default()
            .push(sender);
        receiver
    }

    fn remove_waiters(&self, task_id: &str) {
        self.waiters.lock().unwrap_or_else(|p| p.into_inner()).remove(task_id);
    }

    fn complete_waiters(&self, task_id: &str, payload: TaskResultPayload) {
        let senders = self
            .waiters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(task_id)
            .unwrap_or_default();
        for sender in senders {
            let _ = sender.send(payload.clone());
        }
    }

    /// Terminal ledger write that tolerates losing the race to another
    /// terminal transition (e.g. a cancel landing just before the result).
    async fn record_terminal(&self, task_id: &str, patch: TaskPatch) {
        match self.ledger.update_task(task_id, patch).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::InvalidInput => {
                tracing::debug!(task_id, error = %err, "terminal update lost the race");
            }
            Err(err) => {
                tracing::warn!(task_id, error = %err, "terminal ledger update failed");
            }
        }
    }

    async fn fail_task(&self, task_id: &str, err: &Error, attempts: u32) {
        let failure = TaskFailure::from_error(err, attempts);
        if let Err(update_err) =
            self.ledger.update_task(task_id, TaskPatch::failed(failure)).await
        {
            tracing::warn!(task_id, error = %update_err, "failed to record task failure");
        }
        let _ = self
            .ledger
            .append_progress(ProgressEntry::now(task_id, TaskState::Failed, err.to_string()))
            .await;
        self.callbacks.emit(RuntimeEvent::task_failed(task_id, err)).await;
    }

    async fn cancel_with_note(&self, task_id: &str, err: &Error) {
        if self
            .ledger
            .update_task(task_id, TaskPatch::status(TaskState::Cancelled))
            .await
            .is_ok()
        {
            let _ = self
                .ledger
                .append_progress(ProgressEntry::now(task_id, TaskState::Cancelled, err.to_string()))
                .await;
            self.callbacks
                .emit(RuntimeEvent::TaskCancelled { task_id: task_id.to_string() })
                .await;
        }
    }

    async fn send_cancel(&self, worker_id: &str, task_id: &str) {
        let command = ControlCommand::Cancel { task_id: task_id.to_string() };
        match Message::with_json(&self.config.agent_id, worker_id, MessageType::Control, &command) {
            Ok(message) => {
                if let Err(err) = self.transport.send(message).await {
                    tracing::warn!(worker_id, task_id, error = %err, "failed to send cancel");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to encode cancel"),
        }
    }
}

fn payload_to_result(payload: TaskResultPayload) -> Result<serde_json::Value> {
    match payload.error {
        None => Ok(payload.result.unwrap_or(serde_json::Value::Null)),
        Some(failure) => Err(failure_error(&failure)),
    }
}

fn failure_error(failure: &TaskFailure) -> Error {
    let err = Error::new(failure.kind, failure.message.clone());
    match &failure.backtrace {
        Some(backtrace) => err.with_backtrace(backtrace.clone()),
        None => err,
    }
}

fn failure_to_error(task: &Task) -> Error {
    match &task.error {
        Some(failure) => failure_error(failure),
        None => Error::new(
            ErrorKind::Cancelled,
            format!("task '{}' ended {}", task.id, task.status),
        ),
    }
}

/// Reject duplicate ids and cycles among workflow members. External
/// dependencies (tasks already in the ledger) are ignored here.
fn validate_dag(prepared: &[(String, TaskRequest)]) -> Result<()> {
    let members: HashSet<&str> = prepared.iter().map(|(id, _)| id.as_str()).collect();
    let edges: HashMap<&str, Vec<&str>> = prepared
        .iter()
        .map(|(id, request)| {
            (
                id.as_str(),
                request
                    .dependencies
                    .iter()
                    .map(String::as_str)
                    .filter(|dep| members.contains(dep))
                    .collect(),
            )
        })
        .collect();

    // Kahn's algorithm: anything left after peeling is a cycle.
    let mut in_degree: HashMap<&str, usize> = members.iter().map(|id| (*id, 0)).collect();
    for (id, deps) in &edges {
        *in_degree.get_mut(id).expect("member present") += deps.len();
    }
    let mut queue: Vec<&str> =
        in_degree.iter().filter(|(_, d)| **d == 0).map(|(id, _)| *id).collect();
    let mut visited = 0usize;
    while let Some(next) = queue.pop() {
        visited += 1;
        for (id, deps) in &edges {
            if deps.contains(&next) {
                let degree = in_degree.get_mut(*id).expect("member present");
                *degree -= 1;
                if *degree == 0 {
                    queue.push(*id);
                }
            }
        }
    }
    if visited != members.len() {
        return Err(Error::invalid_input("workflow dependencies contain a cycle"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str, deps: &[&str]) -> (String, TaskRequest) {
        let mut req = TaskRequest::new("echo").id(id);
        for dep in deps {
            req = req.depends_on(*dep);
        }
        (id.to_string(), req)
    }

    #[test]
    fn dag_accepts_chains_and_diamonds() {
        let prepared = vec![
            request("a", &[]),
            request("b", &["a"]),
            request("c", &["a"]),
            request("d", &["b", "c"]),
        ];
        assert!(validate_dag(&prepared).is_ok());
    }

    #[test]
    fn dag_rejects_cycles() {
        let prepared = vec![request("a", &["b"]), request("b", &["a"])];
        assert_eq!(
            validate_dag(&prepared).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn dag_ignores_external_dependencies() {
        let prepared = vec![request("a", &["outside-the-workflow"])];
        assert!(validate_dag(&prepared).is_ok());
    }

    #[test]
    fn config_validation() {
        assert!(CoordinatorConfig::default().validate().is_ok());
        let bad = CoordinatorConfig { default_max_attempts: 0, ..Default::default() };
        assert!(bad.validate().is_err());
    }
}
