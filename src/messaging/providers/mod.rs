//! # Broker Providers
//!
//! Concrete `BrokerConnector` implementations.

pub mod in_memory;
pub mod rabbitmq;

pub use in_memory::{BrokerMessage, InMemoryBroker, InMemoryConnector};
pub use rabbitmq::RabbitMqConnector;
