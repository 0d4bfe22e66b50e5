//! # In-Memory Broker
//!
//! Process-local broker implementing the transport traits with AMQP-like
//! semantics: default-exchange routing by queue name, server-named exclusive
//! queues that disappear with their channel, unacked deliveries requeued as
//! redelivered when a channel goes away, and publishes to missing queues
//! silently dropped.
//!
//! The broker also exposes worker-side hooks (`take`, `reply`, `publish`) and
//! fault injection (`sever_connections`, `fail_next_connects`,
//! `fail_next_publishes`) so the coordinator can be exercised end to end
//! without a RabbitMQ server.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::messaging::errors::{BrokerError, BrokerResult};
use crate::messaging::transport::{
    BrokerChannel, BrokerConnector, Delivery, PublishProperties, QueueDeclaration,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct InMemoryQueue {
    messages: VecDeque<StoredMessage>,
    /// Channel id owning an exclusive queue
    exclusive_owner: Option<u64>,
    message_ttl_ms: Option<u32>,
    expires_ms: Option<u32>,
}

impl InMemoryQueue {
    fn arguments_match(&self, declaration: &QueueDeclaration) -> bool {
        self.message_ttl_ms == declaration.message_ttl_ms && self.expires_ms == declaration.expires_ms
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, InMemoryQueue>,
    /// (channel id, delivery tag) -> (queue, message)
    unacked: HashMap<(u64, u64), (String, StoredMessage)>,
}

impl BrokerState {
    /// Requeue a channel's unacked deliveries and drop its exclusive queues
    fn release_channel(&mut self, channel_id: u64) {
        let mut tags: Vec<(u64, u64)> = self
            .unacked
            .keys()
            .filter(|(owner, _)| *owner == channel_id)
            .copied()
            .collect();
        // Highest tag first so push_front restores the original order
        tags.sort_unstable_by(|a, b| b.1.cmp(&a.1));
        for key in tags {
            if let Some((queue, mut message)) = self.unacked.remove(&key) {
                if let Some(target) = self.queues.get_mut(&queue) {
                    message.redelivered = true;
                    target.messages.push_front(message);
                }
            }
        }

        self.queues
            .retain(|_, queue| queue.exclusive_owner != Some(channel_id));
    }

    fn release_all_channels(&mut self) {
        let owners: Vec<u64> = self.unacked.keys().map(|(owner, _)| *owner).collect();
        for owner in owners {
            self.release_channel(owner);
        }
        self.queues.retain(|_, queue| queue.exclusive_owner.is_none());
    }
}

#[derive(Debug, Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
    generation: AtomicU64,
    next_channel_id: AtomicU64,
    next_server_queue: AtomicU64,
    fail_connects: AtomicU32,
    fail_publishes: AtomicU32,
    connects: AtomicU64,
    acked: AtomicU64,
    rejected: AtomicU64,
}

/// A message taken off a queue by the worker-side hooks
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub queue: String,
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl BrokerMessage {
    /// Decode the body as JSON
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }

    /// `correlationId` carried in the body
    pub fn body_correlation_id(&self) -> Option<String> {
        self.json()?
            .get("correlationId")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Shared handle to one in-memory broker
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector opening channels on this broker
    pub fn connector(&self) -> InMemoryConnector {
        InMemoryConnector {
            broker: self.clone(),
        }
    }

    /// Publish as an external party (worker side); never subject to fault injection
    pub fn publish(&self, queue: &str, body: Vec<u8>, properties: &PublishProperties) -> bool {
        self.enqueue(queue, body, properties)
    }

    /// Publish a JSON body as an external party
    pub fn publish_json(&self, queue: &str, body: &Value) -> bool {
        let bytes = serde_json::to_vec(body).unwrap_or_default();
        self.enqueue(queue, bytes, &PublishProperties::persistent_json())
    }

    /// Reply to a request on its `reply_to` queue, echoing its correlation id
    /// as a message property. Returns false when the request had no reply_to
    /// or the reply queue no longer exists.
    pub fn reply(&self, request: &BrokerMessage, body: &Value) -> bool {
        let Some(reply_to) = request.reply_to.as_deref() else {
            return false;
        };
        let mut properties = PublishProperties::persistent_json();
        properties.correlation_id = request.correlation_id.clone();
        let bytes = serde_json::to_vec(body).unwrap_or_default();
        self.enqueue(reply_to, bytes, &properties)
    }

    /// Declare a durable queue as its owning worker would, with the worker's
    /// own `x-message-ttl`. A no-op when the queue already exists.
    pub fn declare_worker_queue(&self, queue: &str, message_ttl_ms: Option<u32>) {
        self.inner
            .state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| InMemoryQueue {
                message_ttl_ms,
                ..InMemoryQueue::default()
            });
    }

    /// Wait up to `timeout` for a message on `queue` and take it (auto-ack)
    pub async fn take(&self, queue: &str, timeout: Duration) -> Option<BrokerMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if let Some(message) = state
                    .queues
                    .get_mut(queue)
                    .and_then(|q| q.messages.pop_front())
                {
                    return Some(BrokerMessage {
                        queue: queue.to_string(),
                        body: message.body,
                        correlation_id: message.correlation_id,
                        reply_to: message.reply_to,
                    });
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    /// Drop every open connection, as a broker restart or network partition would
    pub fn sever_connections(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.state.lock().release_all_channels();
        self.inner.notify.notify_waiters();
        warn!("🔌 IN_MEMORY_BROKER: All connections severed");
    }

    /// Refuse the next `count` connection attempts
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.fail_connects.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` publishes made through a channel
    pub fn fail_next_publishes(&self, count: u32) {
        self.inner.fail_publishes.store(count, Ordering::SeqCst);
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.state.lock().queues.contains_key(queue)
    }

    /// Successful connection attempts so far
    pub fn connect_count(&self) -> u64 {
        self.inner.connects.load(Ordering::Relaxed)
    }

    pub fn acked_count(&self) -> u64 {
        self.inner.acked.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.inner.rejected.load(Ordering::Relaxed)
    }

    fn enqueue(&self, queue: &str, body: Vec<u8>, properties: &PublishProperties) -> bool {
        let delivered = {
            let mut state = self.inner.state.lock();
            match state.queues.get_mut(queue) {
                Some(target) => {
                    target.messages.push_back(StoredMessage {
                        body,
                        correlation_id: properties.correlation_id.clone(),
                        reply_to: properties.reply_to.clone(),
                        redelivered: false,
                    });
                    true
                }
                None => false,
            }
        };

        if delivered {
            self.inner.notify.notify_waiters();
        } else {
            debug!(queue = %queue, "Message published to missing queue dropped");
        }
        delivered
    }

    fn take_counter(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }
}

/// `BrokerConnector` for an `InMemoryBroker`
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerConnector for InMemoryConnector {
    async fn open(&self) -> BrokerResult<Box<dyn BrokerChannel>> {
        if InMemoryBroker::take_counter(&self.broker.inner.fail_connects) {
            return Err(BrokerError::connection("connection refused"));
        }

        let channel_id = self.broker.inner.next_channel_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.broker.inner.connects.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(InMemoryChannel {
            broker: self.broker.clone(),
            channel_id,
            generation: self.broker.generation(),
            closed: false,
            consuming: Vec::new(),
            next_tag: 0,
            cursor: 0,
        }))
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}

/// One channel on an `InMemoryBroker`
#[derive(Debug)]
pub struct InMemoryChannel {
    broker: InMemoryBroker,
    channel_id: u64,
    generation: u64,
    closed: bool,
    consuming: Vec<String>,
    next_tag: u64,
    /// Round-robin position across consumed queues
    cursor: usize,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::channel_closed())
        }
    }

    fn try_deliver(&mut self) -> Option<Delivery> {
        if self.consuming.is_empty() {
            return None;
        }

        let mut state = self.broker.inner.state.lock();
        let count = self.consuming.len();
        for offset in 0..count {
            let index = (self.cursor + offset) % count;
            let queue_name = &self.consuming[index];
            let Some(message) = state
                .queues
                .get_mut(queue_name)
                .and_then(|q| q.messages.pop_front())
            else {
                continue;
            };

            self.cursor = (index + 1) % count;
            self.next_tag += 1;
            let delivery = Delivery {
                delivery_tag: self.next_tag,
                queue: queue_name.clone(),
                correlation_id: message.correlation_id.clone(),
                redelivered: message.redelivered,
                body: message.body.clone(),
            };
            state
                .unacked
                .insert((self.channel_id, self.next_tag), (queue_name.clone(), message));
            return Some(delivery);
        }
        None
    }

    fn settle(&mut self, delivery_tag: u64) -> BrokerResult<()> {
        self.ensure_open()?;
        self.broker
            .inner
            .state
            .lock()
            .unacked
            .remove(&(self.channel_id, delivery_tag))
            .map(|_| ())
            .ok_or_else(|| BrokerError::acknowledgement(delivery_tag, "unknown delivery tag"))
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_queue(&mut self, declaration: &QueueDeclaration) -> BrokerResult<String> {
        self.ensure_open()?;

        let name = if declaration.is_server_named() {
            let n = self.broker.inner.next_server_queue.fetch_add(1, Ordering::SeqCst) + 1;
            format!("amq.gen-{n}")
        } else {
            declaration.name.clone()
        };

        let mut state = self.broker.inner.state.lock();
        match state.queues.get(&name) {
            Some(existing)
                if existing
                    .exclusive_owner
                    .is_some_and(|owner| owner != self.channel_id) =>
            {
                Err(BrokerError::queue_declaration(
                    name,
                    "RESOURCE_LOCKED: queue is exclusive to another connection",
                ))
            }
            Some(_) if declaration.passive => Ok(name),
            Some(existing) if !existing.arguments_match(declaration) => {
                Err(BrokerError::queue_declaration(
                    name,
                    "PRECONDITION_FAILED: inequivalent queue arguments",
                ))
            }
            Some(_) => Ok(name),
            None => {
                state.queues.insert(
                    name.clone(),
                    InMemoryQueue {
                        messages: VecDeque::new(),
                        exclusive_owner: declaration.exclusive.then_some(self.channel_id),
                        message_ttl_ms: declaration.message_ttl_ms,
                        expires_ms: declaration.expires_ms,
                    },
                );
                Ok(name)
            }
        }
    }

    async fn consume(&mut self, queue_name: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        if !self.broker.queue_exists(queue_name) {
            return Err(BrokerError::queue_not_found(queue_name));
        }
        if !self.consuming.iter().any(|q| q == queue_name) {
            self.consuming.push(queue_name.to_string());
        }
        Ok(())
    }

    async fn publish(
        &mut self,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        if InMemoryBroker::take_counter(&self.broker.inner.fail_publishes) {
            return Err(BrokerError::publish(routing_key, "publish nacked by broker"));
        }
        self.broker.enqueue(routing_key, body.to_vec(), properties);
        Ok(())
    }

    async fn next_delivery(&mut self, wait: Duration) -> BrokerResult<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            self.ensure_open()?;

            let inner = Arc::clone(&self.broker.inner);
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_deliver() {
                return Ok(Some(delivery));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> BrokerResult<()> {
        self.settle(delivery_tag)?;
        self.broker.inner.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn reject(&mut self, delivery_tag: u64) -> BrokerResult<()> {
        self.settle(delivery_tag)?;
        self.broker.inner.rejected.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed && self.generation == self.broker.generation()
    }

    async fn close(&mut self) -> BrokerResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.consuming.clear();
        self.broker.inner.state.lock().release_channel(self.channel_id);
        self.broker.inner.notify.notify_waiters();
        Ok(())
    }
}
