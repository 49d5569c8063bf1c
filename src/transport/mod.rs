//! Pluggable message bus carrying tasks, results, progress, and control.
//!
//! The in-process backend lives here; stream-broker and partitioned-log
//! backends are provided by the `drover-redis` and `drover-kafka` companion
//! crates and plug in through [`TransportFactory::register`].

mod inprocess;

pub use inprocess::InProcessTransport;

use crate::error::{Error, ErrorKind, Result};
use crate::message::{Message, MessageType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Message bus interface every backend satisfies.
///
/// Delivery is at-most-once per receiver subscription; per-receiver ordering
/// is FIFO within a backend partition. Cancellation is cooperative: `receive`
/// suspends until messages arrive or the transport closes, and callers bound
/// it with their own deadline.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `message` to its receiver's queue.
    async fn send(&self, message: Message) -> Result<()>;

    /// Fan `message` out to every subscribed agent except the sender.
    async fn broadcast(&self, message: Message) -> Result<()>;

    /// Drain up to `max` messages for `agent_id`, suspending while empty.
    async fn receive(&self, agent_id: &str, max: usize) -> Result<Vec<Message>>;

    /// Create the agent's queue and set its message-type filter. Messages of
    /// unsubscribed types are not delivered.
    async fn subscribe(&self, agent_id: &str, types: &[MessageType]) -> Result<()>;

    /// Remove the agent's queue, dropping anything undelivered.
    async fn unsubscribe(&self, agent_id: &str) -> Result<()>;

    async fn health(&self) -> Result<()>;

    /// Idempotent; wakes all blocked receivers with [`ErrorKind::Closed`].
    async fn close(&self) -> Result<()>;

    fn stats(&self) -> TransportStats;
}

/// Counter snapshot every backend maintains.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportStats {
    pub sent: u64,
    pub received: u64,
    pub failed: u64,
    /// Exponential moving average of send latency.
    pub avg_send_latency: Duration,
}

/// Shared counter implementation for backends.
#[derive(Debug, Default)]
pub struct TransportMetrics {
    sent: AtomicU64,
    received: AtomicU64,
    failed: AtomicU64,
    latency_ema_micros: Mutex<Option<f64>>,
}

const LATENCY_EMA_ALPHA: f64 = 0.2;

impl TransportMetrics {
    pub fn record_send(&self, latency: Duration) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let mut ema = self.latency_ema_micros.lock().unwrap_or_else(|p| p.into_inner());
        let sample = latency.as_micros() as f64;
        *ema = Some(match *ema {
            Some(prev) => prev + LATENCY_EMA_ALPHA * (sample - prev),
            None => sample,
        });
    }

    pub fn record_received(&self, count: usize) {
        self.received.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStats {
        let ema = self.latency_ema_micros.lock().unwrap_or_else(|p| p.into_inner());
        TransportStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            avg_send_latency: Duration::from_micros(ema.unwrap_or(0.0) as u64),
        }
    }
}

/// Backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    #[default]
    InProcess,
    StreamBroker,
    PartitionedLog,
}

impl std::str::FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in-process" => Ok(TransportKind::InProcess),
            "stream-broker" => Ok(TransportKind::StreamBroker),
            "partitioned-log" => Ok(TransportKind::PartitionedLog),
            other => Err(Error::invalid_config(format!("unknown transport type '{other}'"))),
        }
    }
}

/// Backend-agnostic transport settings; backends validate the fields they use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// Per-agent queue bound (in-process) / stream MAXLEN (broker).
    pub queue_capacity: usize,
    /// Messages above this size are rejected with `PayloadTooLarge`.
    pub max_message_size: usize,
    /// Upper bound on messages returned per `receive` call.
    pub receive_batch: usize,
    /// Stream/topic name prefix for broker and log backends.
    pub stream_prefix: String,
    /// Broker endpoint (redis/kafka bootstrap), unused in-process.
    #[serde(default)]
    pub url: Option<String>,
    pub consumer_group: String,
    /// Partition count for the partitioned-log backend.
    pub partitions: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::InProcess,
            queue_capacity: 1024,
            max_message_size: 1 << 20,
            receive_batch: 16,
            stream_prefix: "drover".to_string(),
            url: None,
            consumer_group: "drover-workers".to_string(),
            partitions: 8,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::invalid_config("transport queue_capacity must be > 0"));
        }
        if self.max_message_size == 0 {
            return Err(Error::invalid_config("transport max_message_size must be > 0"));
        }
        if self.receive_batch == 0 {
            return Err(Error::invalid_config("transport receive_batch must be > 0"));
        }
        match self.kind {
            TransportKind::InProcess => Ok(()),
            TransportKind::StreamBroker | TransportKind::PartitionedLog => {
                if self.url.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::invalid_config(format!(
                        "transport kind {:?} requires a broker url",
                        self.kind
                    )));
                }
                if self.stream_prefix.is_empty() {
                    return Err(Error::invalid_config("transport stream_prefix must be set"));
                }
                if self.kind == TransportKind::PartitionedLog && self.partitions == 0 {
                    return Err(Error::invalid_config("transport partitions must be > 0"));
                }
                Ok(())
            }
        }
    }

    /// Reject payloads over the configured cap. Backends call this on every
    /// send/broadcast.
    pub fn check_payload(&self, message: &Message) -> Result<()> {
        if message.payload.len() > self.max_message_size {
            return Err(Error::payload_too_large(format!(
                "payload {} bytes exceeds cap {}",
                message.payload.len(),
                self.max_message_size
            )));
        }
        Ok(())
    }
}

type BackendBuilder = Arc<dyn Fn(&TransportConfig) -> Result<Arc<dyn Transport>> + Send + Sync>;

/// Builds a backend from configuration.
///
/// The in-process backend is always registered. Companion crates register the
/// broker-backed ones; selecting an unregistered backend is a configuration
/// error naming the missing crate.
#[derive(Clone)]
pub struct TransportFactory {
    builders: Arc<Mutex<HashMap<TransportKind, BackendBuilder>>>,
}

impl Default for TransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory {
    pub fn new() -> Self {
        let factory = Self { builders: Arc::default() };
        factory.register(TransportKind::InProcess, |config| {
            Ok(Arc::new(InProcessTransport::new(config.clone())?) as Arc<dyn Transport>)
        });
        factory
    }

    pub fn register<F>(&self, kind: TransportKind, builder: F)
    where
        F: Fn(&TransportConfig) -> Result<Arc<dyn Transport>> + Send + Sync + 'static,
    {
        self.builders
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(kind, Arc::new(builder));
    }

    pub fn build(&self, config: &TransportConfig) -> Result<Arc<dyn Transport>> {
        config.validate()?;
        let builder = {
            let builders = self.builders.lock().unwrap_or_else(|p| p.into_inner());
            builders.get(&config.kind).cloned()
        };
        match builder {
            Some(builder) => builder(config),
            None => Err(Error::new(
                ErrorKind::InvalidConfig,
                match config.kind {
                    TransportKind::StreamBroker => {
                        "stream-broker transport is provided by the drover-redis crate"
                    }
                    TransportKind::PartitionedLog => {
                        "partitioned-log transport is provided by the drover-kafka crate"
                    }
                    TransportKind::InProcess => "in-process transport is not registered",
                },
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_from_config_strings() {
        assert_eq!("in-process".parse::<TransportKind>().unwrap(), TransportKind::InProcess);
        assert_eq!(
            "stream-broker".parse::<TransportKind>().unwrap(),
            TransportKind::StreamBroker
        );
        assert_eq!(
            "partitioned-log".parse::<TransportKind>().unwrap(),
            TransportKind::PartitionedLog
        );
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn broker_kinds_require_url() {
        let config =
            TransportConfig { kind: TransportKind::StreamBroker, ..TransportConfig::default() };
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::InvalidConfig);

        let config = TransportConfig {
            kind: TransportKind::StreamBroker,
            url: Some("redis://localhost:6379".to_string()),
            ..TransportConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn payload_cap_is_enforced() {
        let config = TransportConfig { max_message_size: 4, ..TransportConfig::default() };
        let small = Message::new("a", "b", MessageType::Task, vec![1, 2]);
        assert!(config.check_payload(&small).is_ok());
        let large = Message::new("a", "b", MessageType::Task, vec![0; 5]);
        assert_eq!(
            config.check_payload(&large).unwrap_err().kind(),
            ErrorKind::PayloadTooLarge
        );
    }

    #[test]
    fn factory_builds_in_process_and_names_missing_crates() {
        let factory = TransportFactory::new();
        assert!(factory.build(&TransportConfig::default()).is_ok());

        let config = TransportConfig {
            kind: TransportKind::StreamBroker,
            url: Some("redis://localhost".to_string()),
            ..TransportConfig::default()
        };
        let err = match factory.build(&config) {
            Err(err) => err,
            Ok(_) => panic!("expected missing drover-redis crate to be reported"),
        };
        assert!(err.to_string().contains("drover-redis"));
    }

    #[test]
    fn metrics_snapshot_tracks_counters() {
        let metrics = TransportMetrics::default();
        metrics.record_send(Duration::from_micros(100));
        metrics.record_send(Duration::from_micros(200));
        metrics.record_received(3);
        metrics.record_failure();
        let stats = metrics.snapshot();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.received, 3);
        assert_eq!(stats.failed, 1);
        assert!(stats.avg_send_latency > Duration::from_micros(99));
    }
}
