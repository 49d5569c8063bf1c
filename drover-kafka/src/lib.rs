//! Partitioned-log (Kafka) backend for `drover` (companion crate).
//!
//! One topic per receiver named `{prefix}-{agent_id}`; the record key is the
//! message's conversation key (defaulting to the message id), so the default
//! partitioner gives FIFO per conversation. Payloads are the length-prefixed
//! JSON framing from [`drover::Message::encode_framed`]. Offsets are committed
//! periodically through the consumer group.
//!
//! The broker client is a native dependency, so it sits behind the `client`
//! feature; topic naming and wire helpers are always available.

use drover::{Message, Result};

/// Topic carrying messages for one receiver.
pub fn topic_for_agent(prefix: &str, agent_id: &str) -> String {
    format!("{prefix}-{agent_id}")
}

/// Record key for a message: the conversation key, else the message id.
pub fn record_key(message: &Message) -> String {
    message.partition_key().to_string()
}

/// Frame a message for the wire.
pub fn frame(message: &Message) -> Result<Vec<u8>> {
    message.encode_framed()
}

/// Decode a framed record payload.
pub fn unframe(payload: &[u8]) -> Result<Message> {
    Message::decode_framed(payload)
}

/// Guard for embedding code compiled without the broker client.
pub fn client_enabled() -> bool {
    cfg!(feature = "client")
}

#[cfg(not(feature = "client"))]
/// Without the `client` feature the factory registration is a configuration
/// error that names the missing feature.
pub fn register_partitioned_log(factory: &drover::TransportFactory) {
    factory.register(drover::TransportKind::PartitionedLog, |_config| {
        Err(drover::Error::invalid_config(
            "drover-kafka built without the `client` feature; enable it to use the partitioned-log transport",
        ))
    });
}

#[cfg(feature = "client")]
pub use client::{register_partitioned_log, KafkaTransport};

#[cfg(feature = "client")]
mod client {
    use super::{record_key, topic_for_agent};
    use async_trait::async_trait;
    use drover::transport::{
        Transport, TransportConfig, TransportFactory, TransportKind, TransportMetrics,
        TransportStats,
    };
    use drover::{Error, ErrorKind, Message, MessageType, Result};
    use rdkafka::config::ClientConfig;
    use rdkafka::consumer::{Consumer, StreamConsumer};
    use rdkafka::producer::{FutureProducer, FutureRecord};
    use rdkafka::Message as KafkaMessage;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    const SEND_TIMEOUT: Duration = Duration::from_secs(5);
    const POLL_TIMEOUT: Duration = Duration::from_millis(500);

    struct Subscription {
        consumer: Arc<StreamConsumer>,
        accepts: HashSet<MessageType>,
    }

    /// Partitioned-log transport over Kafka.
    pub struct KafkaTransport {
        config: TransportConfig,
        producer: FutureProducer,
        brokers: String,
        subs: Mutex<HashMap<String, Subscription>>,
        metrics: TransportMetrics,
        closed: AtomicBool,
    }

    impl KafkaTransport {
        pub fn connect(config: TransportConfig) -> Result<Self> {
            config.validate()?;
            let brokers = config
                .url
                .clone()
                .ok_or_else(|| Error::invalid_config("partitioned-log transport requires a url"))?;
            let producer: FutureProducer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("compression.type", "lz4")
                // Producer-side batching.
                .set("batch.num.messages", "512")
                .set("queue.buffering.max.ms", "5")
                .set("message.max.bytes", config.max_message_size.to_string())
                .create()
                .map_err(|err| Error::invalid_config(format!("kafka producer: {err}")))?;
            Ok(Self {
                config,
                producer,
                brokers,
                subs: Mutex::new(HashMap::new()),
                metrics: TransportMetrics::default(),
                closed: AtomicBool::new(false),
            })
        }

        fn ensure_open(&self) -> Result<()> {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::closed("transport is closed"));
            }
            Ok(())
        }

        fn build_consumer(&self, topic: &str) -> Result<StreamConsumer> {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &self.config.consumer_group)
                .set("auto.offset.reset", "latest")
                // Periodic offset commit.
                .set("enable.auto.commit", "true")
                .set("auto.commit.interval.ms", "5000")
                // Long-poll shaping.
                .set("fetch.min.bytes", "1")
                .set("fetch.wait.max.ms", "250")
                .create()
                .map_err(|err| Error::invalid_config(format!("kafka consumer: {err}")))?;
            consumer
                .subscribe(&[topic])
                .map_err(|err| Error::internal(format!("kafka subscribe: {err}")))?;
            Ok(consumer)
        }

        async fn produce(&self, topic: &str, message: &Message) -> Result<()> {
            let payload = super::frame(message)?;
            let key = record_key(message);
            let record = FutureRecord::to(topic).key(&key).payload(&payload);
            self.producer
                .send(record, SEND_TIMEOUT)
                .await
                .map_err(|(err, _)| {
                    Error::new(ErrorKind::Internal, format!("kafka produce: {err}"))
                })?;
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for KafkaTransport {
        async fn send(&self, message: Message) -> Result<()> {
            self.ensure_open()?;
            self.config.check_payload(&message).map_err(|err| {
                self.metrics.record_failure();
                err
            })?;
            let start = Instant::now();
            let topic = topic_for_agent(&self.config.stream_prefix, &message.to);
            match self.produce(&topic, &message).await {
                Ok(()) => {
                    self.metrics.record_send(start.elapsed());
                    Ok(())
                }
                Err(err) => {
                    self.metrics.record_failure();
                    Err(err)
                }
            }
        }

        async fn broadcast(&self, message: Message) -> Result<()> {
            self.ensure_open()?;
            self.config.check_payload(&message).map_err(|err| {
                self.metrics.record_failure();
                err
            })?;
            // Fan out to every locally subscribed agent's topic; a broker-side
            // broadcast topic would need its own consumer per agent anyway.
            let targets: Vec<String> = {
                let subs = self.subs.lock().unwrap_or_else(|p| p.into_inner());
                subs.iter()
                    .filter(|(agent, sub)| {
                        **agent != message.from && sub.accepts.contains(&message.message_type)
                    })
                    .map(|(agent, _)| agent.clone())
                    .collect()
            };
            let start = Instant::now();
            for agent in targets {
                let mut copy = message.clone();
                copy.to = agent.clone();
                let topic = topic_for_agent(&self.config.stream_prefix, &agent);
                if let Err(err) = self.produce(&topic, &copy).await {
                    self.metrics.record_failure();
                    tracing::warn!(agent, error = %err, "broadcast delivery failed");
                }
            }
            self.metrics.record_send(start.elapsed());
            Ok(())
        }

        async fn receive(&self, agent_id: &str, max: usize) -> Result<Vec<Message>> {
            let max = max.min(self.config.receive_batch).max(1);
            loop {
                self.ensure_open()?;
                let (consumer, accepts) = {
                    let subs = self.subs.lock().unwrap_or_else(|p| p.into_inner());
                    let sub = subs.get(agent_id).ok_or_else(|| {
                        Error::not_found(format!("agent '{agent_id}' is not subscribed"))
                    })?;
                    (sub.consumer.clone(), sub.accepts.clone())
                };

                let mut batch = Vec::new();
                while batch.len() < max {
                    match tokio::time::timeout(POLL_TIMEOUT, consumer.recv()).await {
                        Ok(Ok(record)) => {
                            let Some(payload) = record.payload() else { continue };
                            match super::unframe(payload) {
                                Ok(message) => {
                                    if accepts.contains(&message.message_type) {
                                        batch.push(message);
                                    }
                                }
                                Err(err) => {
                                    self.metrics.record_failure();
                                    tracing::warn!(error = %err, "dropping malformed record");
                                }
                            }
                        }
                        Ok(Err(err)) => {
                            return Err(Error::new(
                                ErrorKind::Internal,
                                format!("kafka consume: {err}"),
                            ));
                        }
                        // Poll window elapsed; return what we have.
                        Err(_) => break,
                    }
                }
                if !batch.is_empty() {
                    self.metrics.record_received(batch.len());
                    return Ok(batch);
                }
            }
        }

        async fn subscribe(&self, agent_id: &str, types: &[MessageType]) -> Result<()> {
            self.ensure_open()?;
            let topic = topic_for_agent(&self.config.stream_prefix, agent_id);
            let consumer = Arc::new(self.build_consumer(&topic)?);
            let accepts: HashSet<MessageType> = types.iter().copied().collect();
            self.subs
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(agent_id.to_string(), Subscription { consumer, accepts });
            Ok(())
        }

        async fn unsubscribe(&self, agent_id: &str) -> Result<()> {
            self.subs.lock().unwrap_or_else(|p| p.into_inner()).remove(agent_id);
            Ok(())
        }

        async fn health(&self) -> Result<()> {
            self.ensure_open()
        }

        async fn close(&self) -> Result<()> {
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            self.subs.lock().unwrap_or_else(|p| p.into_inner()).clear();
            Ok(())
        }

        fn stats(&self) -> TransportStats {
            self.metrics.snapshot()
        }
    }

    /// Register the partitioned-log builder on a [`TransportFactory`].
    pub fn register_partitioned_log(factory: &TransportFactory) {
        factory.register(TransportKind::PartitionedLog, |config| {
            Ok(Arc::new(KafkaTransport::connect(config.clone())?) as Arc<dyn Transport>)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover::MessageType;

    #[test]
    fn topics_follow_the_wire_contract() {
        assert_eq!(topic_for_agent("drover", "worker-1"), "drover-worker-1");
    }

    #[test]
    fn record_key_prefers_conversation_key() {
        let message = Message::new("a", "b", MessageType::Task, vec![]);
        assert_eq!(record_key(&message), message.id);
        let keyed = message.with_key("conversation-3");
        assert_eq!(record_key(&keyed), "conversation-3");
    }

    #[test]
    fn frame_round_trips() {
        let message = Message::new("a", "b", MessageType::Result, vec![1, 2, 3]);
        let framed = frame(&message).unwrap();
        assert_eq!(unframe(&framed).unwrap(), message);
    }
}
