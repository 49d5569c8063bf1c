//! In-process transport: bounded FIFO queues keyed by agent id.

use super::{Transport, TransportConfig, TransportMetrics, TransportStats};
use crate::error::{Error, Result};
use crate::message::{Message, MessageType};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Notify;

struct AgentQueue {
    messages: VecDeque<Message>,
    accepts: HashSet<MessageType>,
    notify: Arc<Notify>,
}

enum PollOutcome {
    Batch(Vec<Message>),
    Empty(Arc<Notify>),
}

impl AgentQueue {
    fn new(types: &[MessageType]) -> Self {
        Self {
            messages: VecDeque::new(),
            accepts: types.iter().copied().collect(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn accepts(&self, message_type: MessageType) -> bool {
        self.accepts.contains(&message_type)
    }
}

/// Single-node backend. Delivery order equals send order per
/// `(sender, receiver)` pair: one lock guards all queues, so enqueues from a
/// sender are serialized.
pub struct InProcessTransport {
    config: TransportConfig,
    queues: Mutex<HashMap<String, AgentQueue>>,
    closed: AtomicBool,
    metrics: TransportMetrics,
}

impl InProcessTransport {
    pub fn new(config: TransportConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            queues: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            metrics: TransportMetrics::default(),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::closed("transport is closed"));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, AgentQueue>> {
        self.queues.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn poll_queue(&self, agent_id: &str, max: usize) -> Result<PollOutcome> {
        self.ensure_open()?;
        let mut queues = self.lock();
        let queue = queues
            .get_mut(agent_id)
            .ok_or_else(|| Error::not_found(format!("agent '{agent_id}' is not subscribed")))?;
        if queue.messages.is_empty() {
            return Ok(PollOutcome::Empty(queue.notify.clone()));
        }
        let take = queue.messages.len().min(max);
        let batch: Vec<Message> = queue.messages.drain(..take).collect();
        self.metrics.record_received(batch.len());
        Ok(PollOutcome::Batch(batch))
    }

    fn enqueue(&self, queue: &mut AgentQueue, message: Message) -> Result<()> {
        if queue.messages.len() >= self.config.queue_capacity {
            return Err(Error::queue_full(format!(
                "queue for '{}' at capacity {}",
                message.to, self.config.queue_capacity
            )));
        }
        queue.messages.push_back(message);
        queue.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn send(&self, message: Message) -> Result<()> {
        self.ensure_open()?;
        self.config.check_payload(&message).map_err(|err| {
            self.metrics.record_failure();
            err
        })?;

        let start = Instant::now();
        let result = {
            let mut queues = self.lock();
            match queues.get_mut(&message.to) {
                None => Err(Error::not_found(format!("agent '{}' is not subscribed", message.to))),
                Some(queue) => {
                    if queue.accepts(message.message_type) {
                        self.enqueue(queue, message)
                    } else {
                        // Filtered out by the receiver's subscription; dropped,
                        // matching pub/sub delivery semantics.
                        tracing::debug!(
                            to = %message.to,
                            message_type = message.message_type.as_str(),
                            "dropping message filtered by subscription"
                        );
                        Ok(())
                    }
                }
            }
        };
        match result {
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
        let mut delivered = 0u64;
        {
            let mut queues = self.lock();
            for (agent_id, queue) in queues.iter_mut() {
                if agent_id == &message.from || !queue.accepts(message.message_type) {
                    continue;
                }
                let mut copy = message.clone();
                copy.to = agent_id.clone();
                // Full queues are skipped rather than failing the whole fan-out.
                if self.enqueue(queue, copy).is_ok() {
                    delivered += 1;
                } else {
                    self.metrics.record_failure();
                }
            }
        }
        tracing::trace!(delivered, message_type = message.message_type.as_str(), "broadcast");
        self.metrics.record_send(start.elapsed());
        Ok(())
    }

    async fn receive(&self, agent_id: &str, max: usize) -> Result<Vec<Message>> {
        let max = max.min(self.config.receive_batch).max(1);
        loop {
            let notify = match self.poll_queue(agent_id, max)? {
                PollOutcome::Batch(batch) => return Ok(batch),
                PollOutcome::Empty(notify) => notify,
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register interest before the re-check: close/unsubscribe wake
            // via notify_waiters, which stores no permit, so a wakeup between
            // the empty poll and the await would otherwise be lost.
            notified.as_mut().enable();
            if let PollOutcome::Batch(batch) = self.poll_queue(agent_id, max)? {
                return Ok(batch);
            }
            notified.await;
        }
    }

    async fn subscribe(&self, agent_id: &str, types: &[MessageType]) -> Result<()> {
        self.ensure_open()?;
        let mut queues = self.lock();
        match queues.get_mut(agent_id) {
            Some(queue) => {
                // Re-subscribe updates the filter, keeping queued messages.
                queue.accepts = types.iter().copied().collect();
            }
            None => {
                queues.insert(agent_id.to_string(), AgentQueue::new(types));
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, agent_id: &str) -> Result<()> {
        let removed = self.lock().remove(agent_id);
        if let Some(queue) = removed {
            // Wake any receiver blocked on the removed queue.
            queue.notify.notify_waiters();
        }
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let queues = self.lock();
        for queue in queues.values() {
            queue.notify.notify_waiters();
        }
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.metrics.snapshot()
    }
}
