//! # Broker Error Types
//!
//! Transport-level errors raised by `BrokerChannel` implementations. The IoLoop
//! uses `is_transport_failure` to decide between failing a single job and
//! tearing the channel down for a reconnect.

use thiserror::Error;

/// Transport-level messaging errors
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    #[error("Broker connection error: {message}")]
    Connection { message: String },

    #[error("Broker channel is closed")]
    ChannelClosed,

    #[error("Queue declaration failed: {queue_name}: {message}")]
    QueueDeclaration { queue_name: String, message: String },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Consumer registration failed: {queue_name}: {message}")]
    Consume { queue_name: String, message: String },

    #[error("Publish failed: {routing_key}: {message}")]
    Publish { routing_key: String, message: String },

    #[error("Acknowledgement failed for delivery {delivery_tag}: {message}")]
    Acknowledgement { delivery_tag: u64, message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },
}

impl BrokerError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a channel closed error
    pub fn channel_closed() -> Self {
        Self::ChannelClosed
    }

    /// Create a queue declaration error
    pub fn queue_declaration(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueueDeclaration {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    /// Create a queue not found error
    pub fn queue_not_found(queue_name: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue_name: queue_name.into(),
        }
    }

    /// Create a consumer registration error
    pub fn consume(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Consume {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    /// Create a publish error
    pub fn publish(routing_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            routing_key: routing_key.into(),
            message: message.into(),
        }
    }

    /// Create an acknowledgement error
    pub fn acknowledgement(delivery_tag: u64, message: impl Into<String>) -> Self {
        Self::Acknowledgement {
            delivery_tag,
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Whether the channel itself is gone and must be re-established
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::ChannelClosed)
    }
}

/// Result type alias for transport operations
pub type BrokerResult<T> = Result<T, BrokerError>;
