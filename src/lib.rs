#![forbid(unsafe_code)]

//! # Drover
//!
//! Distributed multi-agent orchestration core: accept task requests, route
//! them to capability-bearing workers over a pluggable transport, record
//! durable lifecycle state, wrap every outbound call in a resilience
//! envelope, and resize the worker fleet to load.
//!
//! ## Architecture
//!
//! - **Transport** — message bus with in-process, stream-broker
//!   (`drover-redis`) and partitioned-log (`drover-kafka`) backends.
//! - **Ledger** — durable task/progress store; in-memory here, relational in
//!   `drover-postgres`.
//! - **Coordinator / workers** — capability routing, per-task deadlines,
//!   structured failure, panic recovery.
//! - **Resilience** — rate limiters, circuit breakers, retry with jittered
//!   backoff, adaptive timeouts, composed as
//!   `Timeout ⊃ Retry ⊃ CircuitBreaker ⊃ RateLimiter`.
//! - **Autoscaler + balancer** — queue-depth/utilisation driven fleet sizing
//!   and six selection strategies.
//!
//! ## Quick start
//!
//! ```rust
//! use drover::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> drover::Result<()> {
//!     let mut config = RuntimeConfig::new();
//!     config.http.enabled = false;
//!     config.autoscaler.min_workers = 2;
//!
//!     let handlers = HandlerRegistry::new().with(
//!         "echo",
//!         Arc::new(FnHandler::new("echo", &["echo"], |task: Task| async move {
//!             Ok(json!({ "out": task.input.get("msg").cloned() }))
//!         })) as Arc<dyn TaskHandler>,
//!     );
//!
//!     let runtime = Runtime::builder(config).handlers(handlers).build().await?;
//!     let result = runtime
//!         .coordinator()
//!         .execute(TaskRequest::new("echo").capability("echo").input("msg", json!("hi")))
//!         .await?;
//!     assert_eq!(result, json!({ "out": "hi" }));
//!     runtime.shutdown().await
//! }
//! ```

pub mod autoscaler;
mod backoff;
mod balancer;
mod breaker_registry;
pub mod callbacks;
mod circuit_breaker;
mod clock;
pub mod config;
mod coordinator;
pub mod dedup;
mod envelope;
mod error;
pub mod handler;
pub mod http;
mod jitter;
pub mod ledger;
mod message;
mod pool;
mod rate_limit;
mod retry;
mod runtime;
mod sleeper;
mod task;
mod timeout;
pub mod transport;
mod worker;

// Re-exports
pub use backoff::Backoff;
pub use balancer::{BalancerStrategy, LoadBalancer};
pub use breaker_registry::BreakerRegistry;
pub use callbacks::{Callback, CallbackManager, MemoryCallback, RuntimeEvent, TracingCallback};
pub use circuit_breaker::{BreakerCounters, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{DedupBackend, HttpConfig, LedgerConfig, ResilienceConfig, RuntimeConfig};
pub use coordinator::{Coordinator, CoordinatorConfig, WorkflowMode, WorkflowReport};
pub use dedup::{DedupConfig, DedupOutcome, DedupStore, Deduplicator, InMemoryDedupStore};
pub use envelope::{EnvelopeBuilder, ResilienceEnvelope};
pub use error::{Error, ErrorKind, Result};
pub use handler::{
    CompletionRequest, CompletionResponse, Document, FnHandler, HandlerRegistry, LlmProvider,
    Retriever, TaskHandler, VectorStore,
};
pub use http::MetricsRenderer;
pub use jitter::Jitter;
pub use ledger::{
    AgentStateRecord, HybridLedger, InMemoryLedger, Ledger, LedgerKind, LedgerStats, TaskPatch,
};
pub use message::{
    ControlCommand, Message, MessageType, TaskResultPayload, TraceContext, BROADCAST_TARGET,
};
pub use pool::{
    LapsedWorker, PoolConfig, PoolStats, WorkerPool, WorkerRecord, WorkerStatsTracker,
    WorkerStatus,
};
pub use rate_limit::{LimiterPolicy, LimiterRegistry, RateLimiter, SlidingWindow, TokenBucket};
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use runtime::{exit_code, Runtime, RuntimeBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use task::{
    Priority, ProgressEntry, Task, TaskFailure, TaskFilter, TaskRequest, TaskState,
};
pub use timeout::{with_timeout, AdaptiveTimeout, TimeoutManager};
pub use transport::{
    InProcessTransport, Transport, TransportConfig, TransportFactory, TransportKind,
    TransportStats,
};
pub use worker::{Worker, WorkerConfig, WorkerHandle};

pub use autoscaler::{
    Autoscaler, AutoscalerConfig, AutoscalerSample, AutoscalerStatus, ScaleDecision, WorkerFactory,
};

pub mod prelude;
