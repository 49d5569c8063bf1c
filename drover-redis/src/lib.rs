//! Redis stream-broker backend for `drover` (companion crate).
//!
//! One append-only stream per receiver (`{prefix}:stream:{agent_id}`) with
//! MAXLEN trimming, consumer-group reads, and acknowledgement after
//! deserialisation. Broadcasts travel over a pub/sub channel keyed by the
//! consumer group; each subscriber runs a listener that feeds a local buffer
//! merged into `receive`.
//!
//! Register with the runtime via [`register_stream_broker`]:
//!
//! ```rust,no_run
//! use drover::{RuntimeConfig, Runtime, TransportFactory, TransportKind};
//!
//! # async fn demo() -> drover::Result<()> {
//! let factory = TransportFactory::new();
//! drover_redis::register_stream_broker(&factory);
//!
//! let mut config = RuntimeConfig::new();
//! config.transport.kind = TransportKind::StreamBroker;
//! config.transport.url = Some("redis://127.0.0.1:6379".to_string());
//! let runtime = Runtime::builder(config).transport_factory(factory).build().await?;
//! # let _ = runtime; Ok(()) }
//! ```

use async_trait::async_trait;
use drover::transport::{Transport, TransportConfig, TransportFactory, TransportKind, TransportMetrics, TransportStats};
use drover::{DedupStore, Error, ErrorKind, Message, MessageType, Result};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// How long one consumer-group read blocks before re-checking local state.
const READ_BLOCK_MILLIS: usize = 500;

/// Register the stream-broker builder on a [`TransportFactory`].
pub fn register_stream_broker(factory: &TransportFactory) {
    factory.register(TransportKind::StreamBroker, |config| {
        let config = config.clone();
        // The factory is synchronous; connection setup is deferred to first use.
        Ok(Arc::new(RedisTransport::connect_lazy(config)?) as Arc<dyn Transport>)
    });
}

fn map_redis_err(context: &str, err: redis::RedisError) -> Error {
    Error::new(ErrorKind::Internal, format!("{context}: {err}"))
}

struct Subscription {
    accepts: HashSet<MessageType>,
    broadcast_buffer: Arc<Mutex<VecDeque<Message>>>,
    listener: Option<tokio::task::JoinHandle<()>>,
}

/// Stream-broker transport backed by Redis streams + pub/sub.
pub struct RedisTransport {
    config: TransportConfig,
    client: redis::Client,
    manager: tokio::sync::OnceCell<ConnectionManager>,
    consumer: String,
    subs: Mutex<HashMap<String, Subscription>>,
    metrics: TransportMetrics,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTransport")
            .field("config", &self.config)
            .field("consumer", &self.consumer)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl RedisTransport {
    /// Validate configuration and prepare a client; the connection itself is
    /// established on first use.
    pub fn connect_lazy(config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let url = config
            .url
            .clone()
            .ok_or_else(|| Error::invalid_config("stream-broker transport requires a url"))?;
        let client = redis::Client::open(url.as_str())
            .map_err(|err| Error::invalid_config(format!("bad redis url: {err}")))?;
        Ok(Self {
            config,
            client,
            manager: tokio::sync::OnceCell::new(),
            consumer: format!("consumer-{}", Uuid::new_v4()),
            subs: Mutex::new(HashMap::new()),
            metrics: TransportMetrics::default(),
            closed: AtomicBool::new(false),
        })
    }

    fn stream_key(&self, agent_id: &str) -> String {
        format!("{}:stream:{agent_id}", self.config.stream_prefix)
    }

    fn broadcast_channel(&self) -> String {
        format!("{}:broadcast:{}", self.config.stream_prefix, self.config.consumer_group)
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                ConnectionManager::new(self.client.clone()).await
            })
            .await
            .map_err(|err| map_redis_err("redis connect", err))?;
        Ok(manager.clone())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::closed("transport is closed"));
        }
        Ok(())
    }

    fn is_subscribed(&self, agent_id: &str) -> bool {
        self.subs.lock().unwrap_or_else(|p| p.into_inner()).contains_key(agent_id)
    }

    fn accepts(&self, agent_id: &str, message_type: MessageType) -> Option<bool> {
        let subs = self.subs.lock().unwrap_or_else(|p| p.into_inner());
        subs.get(agent_id).map(|sub| sub.accepts.contains(&message_type))
    }

    async fn append(&self, agent_id: &str, message: &Message) -> Result<()> {
        let mut conn = self.connection().await?;
        let payload = message.encode()?;
        let key = self.stream_key(agent_id);
        let _: String = conn
            .xadd_maxlen(
                &key,
                StreamMaxlen::Approx(self.config.queue_capacity),
                "*",
                &[("message", payload.as_slice())],
            )
            .await
            .map_err(|err| map_redis_err("xadd", err))?;
        Ok(())
    }

    fn drain_broadcasts(&self, agent_id: &str, max: usize) -> Vec<Message> {
        let subs = self.subs.lock().unwrap_or_else(|p| p.into_inner());
        match subs.get(agent_id) {
            Some(sub) => {
                let mut buffer = sub.broadcast_buffer.lock().unwrap_or_else(|p| p.into_inner());
                let take = buffer.len().min(max);
                buffer.drain(..take).collect()
            }
            None => Vec::new(),
        }
    }

    async fn read_group(&self, agent_id: &str, max: usize) -> Result<Vec<Message>> {
        let key = self.stream_key(agent_id);
        let group = self.config.consumer_group.clone();
        let mut conn = self.connection().await?;
        let options = StreamReadOptions::default()
            .group(&group, &self.consumer)
            .count(max)
            .block(READ_BLOCK_MILLIS);
        let reply: StreamReadReply = conn
            .xread_options(&[key.as_str()], &[">"], &options)
            .await
            .map_err(|err| map_redis_err("xreadgroup", err))?;

        let mut messages = Vec::new();
        for stream in reply.keys {
            for entry in stream.ids {
                let decoded = entry
                    .map
                    .get("message")
                    .and_then(|value| match value {
                        redis::Value::Data(bytes) => Some(Message::decode(bytes)),
                        _ => None,
                    })
                    .unwrap_or_else(|| {
                        Err(Error::invalid_input("stream entry missing message field"))
                    });
                // Acknowledge after deserialisation, matched or not: a poison
                // entry must not be redelivered forever.
                let _: i64 = conn
                    .xack(&key, &group, &[entry.id.as_str()])
                    .await
                    .map_err(|err| map_redis_err("xack", err))?;
                match decoded {
                    Ok(message) => {
                        if self.accepts(agent_id, message.message_type).unwrap_or(false) {
                            messages.push(message);
                        }
                    }
                    Err(err) => {
                        self.metrics.record_failure();
                        tracing::warn!(error = %err, "dropping malformed stream entry");
                    }
                }
            }
        }
        Ok(messages)
    }

    fn spawn_broadcast_listener(
        &self,
        agent_id: String,
        buffer: Arc<Mutex<VecDeque<Message>>>,
        accepts: HashSet<MessageType>,
    ) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let channel = self.broadcast_channel();
        let capacity = self.config.queue_capacity;
        tokio::spawn(async move {
            let conn = match client.get_async_connection().await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::error!(error = %err, "broadcast listener failed to connect");
                    return;
                }
            };
            let mut pubsub = conn.into_pubsub();
            if let Err(err) = pubsub.subscribe(&channel).await {
                tracing::error!(error = %err, "broadcast subscribe failed");
                return;
            }
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(error = %err, "unreadable broadcast payload");
                        continue;
                    }
                };
                match Message::decode(&payload) {
                    Ok(mut message) => {
                        if message.from == agent_id || !accepts.contains(&message.message_type) {
                            continue;
                        }
                        message.to = agent_id.clone();
                        let mut buffer = buffer.lock().unwrap_or_else(|p| p.into_inner());
                        if buffer.len() >= capacity {
                            buffer.pop_front();
                        }
                        buffer.push_back(message);
                    }
                    Err(err) => tracing::warn!(error = %err, "malformed broadcast"),
                }
            }
        })
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn send(&self, message: Message) -> Result<()> {
        self.ensure_open()?;
        self.config.check_payload(&message).map_err(|err| {
            self.metrics.record_failure();
            err
        })?;
        let start = Instant::now();
        match self.append(&message.to, &message).await {
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
        let start = Instant::now();
        let mut conn = self.connection().await?;
        let payload = message.encode()?;
        let _: i64 = conn
            .publish(self.broadcast_channel(), payload)
            .await
            .map_err(|err| {
                self.metrics.record_failure();
                map_redis_err("publish", err)
            })?;
        self.metrics.record_send(start.elapsed());
        Ok(())
    }

    async fn receive(&self, agent_id: &str, max: usize) -> Result<Vec<Message>> {
        let max = max.min(self.config.receive_batch).max(1);
        loop {
            self.ensure_open()?;
            if !self.is_subscribed(agent_id) {
                return Err(Error::not_found(format!("agent '{agent_id}' is not subscribed")));
            }

            let mut batch = self.drain_broadcasts(agent_id, max);
            if batch.len() < max {
                let from_stream = self.read_group(agent_id, max - batch.len()).await?;
                batch.extend(from_stream);
            }
            if !batch.is_empty() {
                self.metrics.record_received(batch.len());
                return Ok(batch);
            }
            // The blocking read already paced us; loop to re-check state.
        }
    }

    async fn subscribe(&self, agent_id: &str, types: &[MessageType]) -> Result<()> {
        self.ensure_open()?;
        let mut conn = self.connection().await?;
        let key = self.stream_key(agent_id);
        // Idempotent group creation; BUSYGROUP means it already exists.
        let created: redis::RedisResult<String> =
            conn.xgroup_create_mkstream(&key, &self.config.consumer_group, "$").await;
        if let Err(err) = created {
            if !err.to_string().contains("BUSYGROUP") {
                return Err(map_redis_err("xgroup create", err));
            }
        }

        let accepts: HashSet<MessageType> = types.iter().copied().collect();
        let buffer = Arc::new(Mutex::new(VecDeque::new()));
        let listener = accepts.contains(&MessageType::Broadcast).then(|| {
            self.spawn_broadcast_listener(agent_id.to_string(), buffer.clone(), accepts.clone())
        });

        let mut subs = self.subs.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = subs.insert(
            agent_id.to_string(),
            Subscription { accepts, broadcast_buffer: buffer, listener },
        ) {
            if let Some(handle) = previous.listener {
                handle.abort();
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, agent_id: &str) -> Result<()> {
        let removed = self.subs.lock().unwrap_or_else(|p| p.into_inner()).remove(agent_id);
        if let Some(sub) = removed {
            if let Some(handle) = sub.listener {
                handle.abort();
            }
        }
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        self.ensure_open()?;
        let mut conn = self.connection().await?;
        let pong: String =
            redis::cmd("PING").query_async(&mut conn).await.map_err(|err| map_redis_err("ping", err))?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(Error::internal(format!("unexpected ping reply '{pong}'")))
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut subs = self.subs.lock().unwrap_or_else(|p| p.into_inner());
        for (_, sub) in subs.drain() {
            if let Some(handle) = sub.listener {
                handle.abort();
            }
        }
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.metrics.snapshot()
    }
}

/// Dedup store on Redis key TTLs: `SET NX EX` arbitrates, expiry evicts.
pub struct RedisDedupStore {
    prefix: String,
    manager: tokio::sync::OnceCell<ConnectionManager>,
    client: redis::Client,
}

impl RedisDedupStore {
    pub fn new(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|err| Error::invalid_config(format!("bad redis url: {err}")))?;
        Ok(Self {
            prefix: prefix.into(),
            manager: tokio::sync::OnceCell::new(),
            client,
        })
    }

    /// Share naming with a transport built from the same config.
    pub fn from_transport_config(config: &TransportConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| Error::invalid_config("dedup store requires a redis url"))?;
        Self::new(url, format!("{}:dedup:", config.stream_prefix))
    }

    fn key(&self, id: &str) -> String {
        format!("{}{id}", self.prefix)
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| async { ConnectionManager::new(self.client.clone()).await })
            .await
            .map_err(|err| map_redis_err("redis connect", err))?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn insert_if_absent(&self, id: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let outcome: Option<String> = redis::cmd("SET")
            .arg(self.key(id))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|err| map_redis_err("set nx", err))?;
        Ok(outcome.is_some())
    }

    async fn contains(&self, id: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let exists: bool = conn
            .exists(self.key(id))
            .await
            .map_err(|err| map_redis_err("exists", err))?;
        Ok(exists)
    }

    async fn remove_expired(&self) -> Result<usize> {
        // Redis evicts on TTL; nothing to sweep here.
        Ok(0)
    }

    async fn live_ids(&self) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", self.prefix);
        let mut ids = Vec::new();
        let mut iter: redis::AsyncIter<String> = conn
            .scan_match(pattern)
            .await
            .map_err(|err| map_redis_err("scan", err))?;
        while let Some(key) = iter.next_item().await {
            if let Some(id) = key.strip_prefix(&self.prefix) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.live_ids().await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> TransportConfig {
        TransportConfig {
            kind: TransportKind::StreamBroker,
            url: Some(url.to_string()),
            ..TransportConfig::default()
        }
    }

    #[test]
    fn stream_and_channel_naming() {
        let transport = RedisTransport::connect_lazy(config("redis://127.0.0.1:6379")).unwrap();
        assert_eq!(transport.stream_key("worker-1"), "drover:stream:worker-1");
        assert_eq!(transport.broadcast_channel(), "drover:broadcast:drover-workers");
    }

    #[test]
    fn missing_url_is_invalid_config() {
        let mut bad = config("redis://127.0.0.1:6379");
        bad.url = None;
        assert!(RedisTransport::connect_lazy(bad).is_err());
    }

    #[test]
    fn malformed_url_is_invalid_config() {
        let err = RedisTransport::connect_lazy(config("not a url")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn dedup_store_namespaces_keys() {
        let store = RedisDedupStore::new("redis://127.0.0.1:6379", "drover:dedup:").unwrap();
        assert_eq!(store.key("t1"), "drover:dedup:t1");
    }

    #[tokio::test]
    async fn factory_registration_builds_lazily() {
        let factory = TransportFactory::new();
        register_stream_broker(&factory);
        // No server required: the connection is deferred to first use.
        assert!(factory.build(&config("redis://127.0.0.1:6379")).is_ok());
    }
}
