//! # Broker Transport Traits
//!
//! Provider-agnostic view of one broker connection and its channel. Only the
//! IoLoop ever holds a `BrokerChannel`; everything else talks to it through the
//! outbound job queue and the pending call table.

use std::time::Duration;

use async_trait::async_trait;

use super::errors::BrokerResult;

/// Queue declaration parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    /// Queue name; empty asks the broker to generate one
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// `x-message-ttl` argument
    pub message_ttl_ms: Option<u32>,
    /// `x-expires` argument
    pub expires_ms: Option<u32>,
    /// Look the queue up passively first and only create it when missing.
    /// An existing queue is used as-is, whatever its arguments.
    pub passive: bool,
}

impl QueueDeclaration {
    /// A durable, shared, named queue
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            message_ttl_ms: None,
            expires_ms: None,
            passive: false,
        }
    }

    /// A server-named, exclusive, auto-deleting reply queue
    pub fn exclusive_callback(expires_ms: Option<u32>) -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
            message_ttl_ms: None,
            expires_ms,
            passive: false,
        }
    }

    /// Set the per-message TTL for the queue
    pub fn with_message_ttl(mut self, message_ttl_ms: Option<u32>) -> Self {
        self.message_ttl_ms = message_ttl_ms;
        self
    }

    /// Reuse the queue if another party already declared it
    pub fn prefer_existing(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Whether the broker picks the queue name
    pub fn is_server_named(&self) -> bool {
        self.name.is_empty()
    }
}

/// Message properties attached to a publish
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub persistent: bool,
    pub content_type: Option<String>,
}

impl PublishProperties {
    /// Persistent JSON message
    pub fn persistent_json() -> Self {
        Self {
            persistent: true,
            content_type: Some("application/json".to_string()),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// An inbound message handed to the IoLoop
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped tag used for ack/reject
    pub delivery_tag: u64,
    /// Queue the message was consumed from
    pub queue: String,
    /// `correlation_id` message property, when the sender set one
    pub correlation_id: Option<String>,
    pub redelivered: bool,
    pub body: Vec<u8>,
}

/// Opens broker connections
///
/// Implementations establish one connection plus one channel per call to
/// `open`, with QoS/prefetch already applied.
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    /// Open a new connection and channel
    async fn open(&self) -> BrokerResult<Box<dyn BrokerChannel>>;

    /// Provider name for logging
    fn provider_name(&self) -> &'static str;
}

/// A single broker channel, driven by exactly one task
#[async_trait]
pub trait BrokerChannel: Send + 'static {
    /// Declare a queue (idempotent) and return its actual name
    async fn declare_queue(&mut self, declaration: &QueueDeclaration) -> BrokerResult<String>;

    /// Start consuming from a queue; deliveries surface via `next_delivery`
    async fn consume(&mut self, queue_name: &str) -> BrokerResult<()>;

    /// Publish to the default exchange with `routing_key` as the queue name
    async fn publish(
        &mut self,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> BrokerResult<()>;

    /// Wait up to `wait` for the next delivery from any consumed queue
    async fn next_delivery(&mut self, wait: Duration) -> BrokerResult<Option<Delivery>>;

    /// Acknowledge a delivery
    async fn ack(&mut self, delivery_tag: u64) -> BrokerResult<()>;

    /// Reject a delivery without requeueing it
    async fn reject(&mut self, delivery_tag: u64) -> BrokerResult<()>;

    /// Whether the connection and channel are still usable
    fn is_open(&self) -> bool;

    /// Close the channel and connection; safe to call more than once
    async fn close(&mut self) -> BrokerResult<()>;
}
