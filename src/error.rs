//! # Coordinator Error Types
//!
//! The failure taxonomy callers of the coordinator can observe. Connection-level
//! problems are handled internally by reconnecting and only surface here when
//! startup retries are exhausted; call-level failures are returned to the caller
//! that issued the call; event-level anomalies never leave the router/handler.

use thiserror::Error;

use crate::config::ConfigurationError;
use crate::messaging::BrokerError;
use crate::state_machine::TaskStoreError;

/// Errors surfaced by the coordinator's public API
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Broker connection failed after {attempts} attempts: {message}")]
    Connect { attempts: u32, message: String },

    #[error("Transient broker error: {0}")]
    TransientBroker(#[from] BrokerError),

    #[error("Publish to {destination} failed: {message}")]
    PublishFailure {
        destination: String,
        message: String,
    },

    #[error("Call to {destination} timed out after {timeout_ms}ms (correlation id {correlation_id})")]
    CallTimeout {
        destination: String,
        correlation_id: String,
        timeout_ms: u64,
    },

    #[error("Malformed message: {message}")]
    MalformedMessage { message: String },

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("Unknown destination: {destination}")]
    UnknownDestination { destination: String },

    #[error("Invalid request payload: {message}")]
    InvalidPayload { message: String },

    #[error("Outbound job queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Broker connection is not available")]
    BrokerUnavailable,

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Task store error: {0}")]
    TaskStore(#[from] TaskStoreError),

    #[error("Coordinator is shutting down")]
    ShuttingDown,
}

impl CoordinatorError {
    /// Create a connect error once bounded retries are exhausted
    pub fn connect(attempts: u32, message: impl Into<String>) -> Self {
        Self::Connect {
            attempts,
            message: message.into(),
        }
    }

    /// Create a publish failure for a specific destination
    pub fn publish_failure(destination: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PublishFailure {
            destination: destination.into(),
            message: message.into(),
        }
    }

    /// Create a call timeout error
    pub fn call_timeout(
        destination: impl Into<String>,
        correlation_id: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Self {
        Self::CallTimeout {
            destination: destination.into(),
            correlation_id: correlation_id.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a malformed message error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage {
            message: message.into(),
        }
    }

    /// Create an invalid transition error
    pub fn invalid_transition(
        task_id: impl Into<String>,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        Self::InvalidTransition {
            task_id: task_id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Create an unknown destination error
    pub fn unknown_destination(destination: impl Into<String>) -> Self {
        Self::UnknownDestination {
            destination: destination.into(),
        }
    }

    /// Create an invalid payload error
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }

    /// True when the caller gave up waiting for a reply
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::CallTimeout { .. })
    }
}

/// Result type alias for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
