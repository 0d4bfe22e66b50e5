#![allow(clippy::doc_markdown)] // Allow technical terms like RabbitMQ, IoLoop in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Tasker RPC
//!
//! Request/reply coordination over a single message-broker channel, plus the
//! task status state machine fed by asynchronous worker progress events.
//!
//! ## Overview
//!
//! An AMQP channel may be driven by exactly one task, yet many concurrent
//! request handlers need to issue synchronous calls (publish, then wait with a
//! timeout for a correlated reply) and fire-and-forget dispatches against it.
//! Tasker RPC gives the channel to one `IoLoop` task and lets everything else
//! talk to it through a bounded job queue and a concurrent pending-call table.
//!
//! ## Architecture
//!
//! - **BrokerConnection**: bounded-retry connect, self-healing reconnect
//! - **IoLoop**: the only owner of the channel; inbound first, then the outbound backlog
//! - **PendingCallTable / Dispatcher**: `call` and `dispatch_async`
//! - **ResponseRouter**: resolves waiting calls, forwards status events
//! - **StatusEventHandler**: guarded, compare-and-set task status updates
//! - **HealthMonitor**: stale-connection reconnect and expired-call sweep
//!
//! ## Module Organization
//!
//! - [`broker`] - Connection lifecycle, topology, publish jobs and the IoLoop
//! - [`coordinator`] - Call surface, response routing, health, bootstrap
//! - [`state_machine`] - Task statuses, events, task stores
//! - [`messaging`] - Wire envelope and broker transports (RabbitMQ, in-memory)
//! - [`services`] - Typed clients for the crawl and inference workers
//! - [`config`] - Configuration management
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use serde_json::json;
//! use tasker_rpc::config::ConfigManager;
//! use tasker_rpc::coordinator::BrokerCoordinator;
//! use tasker_rpc::state_machine::InMemoryTaskStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! tasker_rpc::logging::init_structured_logging();
//! let manager = ConfigManager::load()?;
//!
//! let coordinator =
//!     BrokerCoordinator::start_rabbitmq(manager.config(), Arc::new(InMemoryTaskStore::new())).await?;
//!
//! let reply = coordinator
//!     .dispatcher()
//!     .call("crawl", json!({"action": "crawl_store", "storeId": 42}), Duration::from_secs(5))
//!     .await?;
//! println!("crawl reply: {reply}");
//!
//! coordinator.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod services;
pub mod state_machine;

pub use config::{ConfigManager, CoordinatorConfig};
pub use coordinator::{BrokerCoordinator, CoordinatorHealth, Dispatcher, PendingCallTable};
pub use error::{CoordinatorError, CoordinatorResult};
pub use messaging::{InMemoryBroker, RabbitMqConnector};
pub use services::{CrawlClient, InferenceClient};
pub use state_machine::{
    InMemoryTaskStore, StatusEventHandler, StatusUpdateEvent, TaskRecord, TaskStatus, TaskStore,
};
