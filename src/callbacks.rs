//! Observability fan-out threaded through every subsystem.
//!
//! Components emit [`RuntimeEvent`]s into a [`CallbackManager`]; registered
//! callbacks (metrics exporters, log sinks, test collectors) consume them.
//! Emission is best-effort: the manager iterates a snapshot of the callback
//! list (so registration can race emission) and a panicking callback never
//! interrupts the caller.

use crate::circuit_breaker::CircuitState;
use crate::error::Error;
use crate::message::MessageType;
use crate::task::TaskState;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Everything observable in the runtime, in one tagged event.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    // Task lifecycle.
    TaskSubmitted { task_id: String, task_type: String },
    TaskAssigned { task_id: String, worker_id: String },
    TaskStarted { task_id: String, worker_id: String },
    TaskCompleted { task_id: String, worker_id: String, latency: Duration },
    TaskFailed { task_id: String, error: String },
    TaskCancelled { task_id: String },
    // Transport.
    MessageSent { message_type: MessageType, to: String },
    MessageReceived { message_type: MessageType, by: String },
    // Workers and scaling.
    WorkerRegistered { worker_id: String },
    WorkerOffline { worker_id: String },
    WorkerDrained { worker_id: String },
    ScaledUp { added: usize, pool_size: usize },
    ScaledDown { removed: usize, pool_size: usize },
    // Resilience.
    BreakerTransition { breaker: String, from: CircuitState, to: CircuitState },
    // Collaborator hooks consumed by chain/RAG layers.
    ChainStart { chain: String },
    ChainEnd { chain: String },
    ChainError { chain: String, error: String },
    LlmStart { provider: String },
    LlmEnd { provider: String, tokens_used: u32 },
    RetrieverStart { query: String },
    RetrieverEnd { query: String, documents: usize },
}

impl RuntimeEvent {
    /// Stable label used by metrics exporters.
    pub fn label(&self) -> &'static str {
        match self {
            RuntimeEvent::TaskSubmitted { .. } => "task_submitted",
            RuntimeEvent::TaskAssigned { .. } => "task_assigned",
            RuntimeEvent::TaskStarted { .. } => "task_started",
            RuntimeEvent::TaskCompleted { .. } => "task_completed",
            RuntimeEvent::TaskFailed { .. } => "task_failed",
            RuntimeEvent::TaskCancelled { .. } => "task_cancelled",
            RuntimeEvent::MessageSent { .. } => "message_sent",
            RuntimeEvent::MessageReceived { .. } => "message_received",
            RuntimeEvent::WorkerRegistered { .. } => "worker_registered",
            RuntimeEvent::WorkerOffline { .. } => "worker_offline",
            RuntimeEvent::WorkerDrained { .. } => "worker_drained",
            RuntimeEvent::ScaledUp { .. } => "scaled_up",
            RuntimeEvent::ScaledDown { .. } => "scaled_down",
            RuntimeEvent::BreakerTransition { .. } => "breaker_transition",
            RuntimeEvent::ChainStart { .. } => "chain_start",
            RuntimeEvent::ChainEnd { .. } => "chain_end",
            RuntimeEvent::ChainError { .. } => "chain_error",
            RuntimeEvent::LlmStart { .. } => "llm_start",
            RuntimeEvent::LlmEnd { .. } => "llm_end",
            RuntimeEvent::RetrieverStart { .. } => "retriever_start",
            RuntimeEvent::RetrieverEnd { .. } => "retriever_end",
        }
    }

    pub fn task_failed(task_id: impl Into<String>, error: &Error) -> Self {
        RuntimeEvent::TaskFailed { task_id: task_id.into(), error: error.to_string() }
    }
}

/// Consumer of runtime events. Implementations must be cheap or hand off to
/// their own buffering; emission happens on hot paths.
#[async_trait]
pub trait Callback: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &RuntimeEvent);
}

/// Snapshot-iterating fan-out of [`Callback`]s.
#[derive(Default)]
pub struct CallbackManager {
    callbacks: RwLock<Vec<Arc<dyn Callback>>>,
}

impl std::fmt::Debug for CallbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .callbacks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        f.debug_struct("CallbackManager").field("callbacks", &names).finish()
    }
}

impl CallbackManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: Arc<dyn Callback>) {
        self.callbacks.write().unwrap_or_else(|p| p.into_inner()).push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every registered callback. Iterates a snapshot so
    /// concurrent registration never deadlocks, and swallows callback panics.
    pub async fn emit(&self, event: RuntimeEvent) {
        let snapshot: Vec<Arc<dyn Callback>> =
            self.callbacks.read().unwrap_or_else(|p| p.into_inner()).clone();
        for callback in snapshot {
            let outcome = AssertUnwindSafe(callback.handle(&event)).catch_unwind().await;
            if outcome.is_err() {
                tracing::warn!(callback = callback.name(), event = event.label(), "callback panicked");
            }
        }
    }
}

/// Span covering one system-boundary operation, carrying the standard
/// attribute set. Unset attributes are recorded later via
/// [`tracing::Span::record`].
pub fn boundary_span(component: &'static str, operation: &'static str) -> tracing::Span {
    tracing::info_span!(
        "drover",
        component,
        operation,
        task_id = tracing::field::Empty,
        worker_id = tracing::field::Empty,
        capability = tracing::field::Empty,
    )
}

/// Logs every event through `tracing`; the default callback.
#[derive(Debug, Default, Clone)]
pub struct TracingCallback;

#[async_trait]
impl Callback for TracingCallback {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn handle(&self, event: &RuntimeEvent) {
        tracing::debug!(event = event.label(), detail = ?event, "runtime event");
    }
}

/// Collects events in memory; intended for tests.
#[derive(Debug, Default)]
pub struct MemoryCallback {
    events: std::sync::Mutex<Vec<RuntimeEvent>>,
}

impl MemoryCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.label()).collect()
    }
}

#[async_trait]
impl Callback for MemoryCallback {
    fn name(&self) -> &str {
        "memory"
    }

    async fn handle(&self, event: &RuntimeEvent) {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PanickingCallback;

    #[async_trait]
    impl Callback for PanickingCallback {
        fn name(&self) -> &str {
            "panics"
        }

        async fn handle(&self, _event: &RuntimeEvent) {
            panic!("observability must never take down the runtime");
        }
    }

    #[tokio::test]
    async fn events_fan_out_to_all_callbacks() {
        let manager = CallbackManager::new();
        let first = Arc::new(MemoryCallback::new());
        let second = Arc::new(MemoryCallback::new());
        manager.register(first.clone());
        manager.register(second.clone());

        manager
            .emit(RuntimeEvent::TaskSubmitted {
                task_id: "t1".to_string(),
                task_type: "echo".to_string(),
            })
            .await;

        assert_eq!(first.labels(), vec!["task_submitted"]);
        assert_eq!(second.labels(), vec!["task_submitted"]);
    }

    #[tokio::test]
    async fn panicking_callback_does_not_interrupt_others() {
        let manager = CallbackManager::new();
        let collector = Arc::new(MemoryCallback::new());
        manager.register(Arc::new(PanickingCallback));
        manager.register(collector.clone());

        manager.emit(RuntimeEvent::TaskCancelled { task_id: "t1".to_string() }).await;
        assert_eq!(collector.labels(), vec!["task_cancelled"]);
    }

    #[tokio::test]
    async fn emit_with_no_callbacks_is_cheap() {
        let manager = CallbackManager::new();
        assert!(manager.is_empty());
        manager.emit(RuntimeEvent::ChainStart { chain: "rag".to_string() }).await;
    }

    #[test]
    fn labels_are_stable() {
        let event = RuntimeEvent::ScaledUp { added: 2, pool_size: 4 };
        assert_eq!(event.label(), "scaled_up");
    }
}
