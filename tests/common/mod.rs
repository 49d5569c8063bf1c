//! Shared fixtures for the integration suite.
#![allow(dead_code)] // each test binary uses a subset

use drover::prelude::*;
use drover::FnHandler;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Runtime config tuned for fast tests: no HTTP, quick heartbeats, autoscaler
/// off unless a test turns it on.
pub fn test_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::new();
    config.http.enabled = false;
    config.autoscaler.enabled = false;
    config.autoscaler.min_workers = 1;
    config.pool.heartbeat_interval = Duration::from_millis(50);
    config.pool.shutdown_timeout = Duration::from_secs(2);
    config.dispatch_retry_timeout = Duration::from_secs(5);
    config
}

/// Echo handler plus an invocation counter, for asserting at-most-once runs.
pub fn counting_echo_handlers() -> (HandlerRegistry, Arc<AtomicU32>) {
    let invocations = Arc::new(AtomicU32::new(0));
    let counter = invocations.clone();
    let handlers = HandlerRegistry::new().with(
        "echo",
        Arc::new(FnHandler::new("echo", &["echo"], move |task: Task| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"out": task.input.get("msg").cloned().unwrap_or(json!(null))}))
            }
        })) as Arc<dyn TaskHandler>,
    );
    (handlers, invocations)
}

/// Handler that sleeps, for deadline and autoscale tests.
pub fn slow_handlers(sleep: Duration) -> HandlerRegistry {
    HandlerRegistry::new().with(
        "slow",
        Arc::new(FnHandler::new("slow", &["slow"], move |_task: Task| async move {
            tokio::time::sleep(sleep).await;
            Ok(json!({"done": true}))
        })) as Arc<dyn TaskHandler>,
    )
}
