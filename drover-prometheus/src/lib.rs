//! Prometheus metrics for `drover`.
//! Bring your own `prometheus::Registry`; the callback registers and updates
//! counters/histograms, and [`PrometheusCallback`] doubles as the
//! `MetricsRenderer` behind `GET /metrics`.
//!
//! ```rust
//! use drover::{CallbackManager, MetricsRenderer, RuntimeEvent};
//! use drover_prometheus::PrometheusCallback;
//! use std::sync::Arc;
//!
//! # fn demo() -> Result<(), prometheus::Error> {
//! let metrics = Arc::new(PrometheusCallback::new(prometheus::Registry::new())?);
//! let callbacks = CallbackManager::new();
//! callbacks.register(metrics.clone());
//! let exposition = metrics.render();
//! # let _ = exposition; Ok(()) }
//! ```

use async_trait::async_trait;
use drover::{Callback, MetricsRenderer, RuntimeEvent};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct PrometheusCallback {
    registry: Arc<Registry>,
    events: IntCounterVec,
    task_latency: HistogramVec,
    pool_size: IntGaugeVec,
}

impl std::fmt::Debug for PrometheusCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusCallback").finish()
    }
}

impl PrometheusCallback {
    /// Register drover's metrics into the provided registry.
    ///
    /// # Errors
    /// Fails if a metric name is already registered.
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let events = IntCounterVec::new(
            Opts::new("drover_events_total", "Runtime events by label"),
            &["event"],
        )?;
        let task_latency = HistogramVec::new(
            HistogramOpts::new("drover_task_latency_seconds", "Completed task latency")
                .buckets(prometheus::exponential_buckets(0.005, 2.0, 12)?),
            &["worker"],
        )?;
        let pool_size = IntGaugeVec::new(
            Opts::new("drover_pool_size", "Worker pool size after scale events"),
            &["direction"],
        )?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(task_latency.clone()))?;
        registry.register(Box::new(pool_size.clone()))?;
        Ok(Self { registry, events, task_latency, pool_size })
    }

    /// Expose the registry for embedding scrapers.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[async_trait]
impl Callback for PrometheusCallback {
    fn name(&self) -> &str {
        "prometheus"
    }

    async fn handle(&self, event: &RuntimeEvent) {
        self.events.with_label_values(&[event.label()]).inc();
        match event {
            RuntimeEvent::TaskCompleted { worker_id, latency, .. } => {
                self.task_latency
                    .with_label_values(&[worker_id.as_str()])
                    .observe(latency.as_secs_f64());
            }
            RuntimeEvent::ScaledUp { pool_size, .. } => {
                self.pool_size.with_label_values(&["up"]).set(*pool_size as i64);
            }
            RuntimeEvent::ScaledDown { pool_size, .. } => {
                self.pool_size.with_label_values(&["down"]).set(*pool_size as i64);
            }
            _ => {}
        }
    }
}

impl MetricsRenderer for PrometheusCallback {
    fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %err, "metrics encoding failed");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn callback() -> PrometheusCallback {
        PrometheusCallback::new(Registry::new()).unwrap()
    }

    #[tokio::test]
    async fn events_become_counters() {
        let metrics = callback();
        metrics
            .handle(&RuntimeEvent::TaskSubmitted {
                task_id: "t1".to_string(),
                task_type: "echo".to_string(),
            })
            .await;
        metrics
            .handle(&RuntimeEvent::TaskCompleted {
                task_id: "t1".to_string(),
                worker_id: "w1".to_string(),
                latency: Duration::from_millis(12),
            })
            .await;

        let text = metrics.render();
        assert!(text.contains("drover_events_total"));
        assert!(text.contains("task_submitted"));
        assert!(text.contains("drover_task_latency_seconds"));
    }

    #[tokio::test]
    async fn scale_events_move_the_gauge() {
        let metrics = callback();
        metrics.handle(&RuntimeEvent::ScaledUp { added: 2, pool_size: 5 }).await;
        let text = metrics.render();
        assert!(text.contains("drover_pool_size"));
        assert!(text.contains('5'));
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let registry = Arc::new(Registry::new());
        assert!(PrometheusCallback::new(registry.clone()).is_ok());
        assert!(PrometheusCallback::new(registry).is_err());
    }
}
