//! # Messaging Module
//!
//! Wire envelope, transport traits and broker providers. The `rabbitmq`
//! provider speaks AMQP 0.9.1 through lapin; the `in_memory` provider is a
//! process-local broker used by tests and embedders.

pub mod envelope;
pub mod errors;
pub mod providers;
pub mod transport;

pub use envelope::{InboundMessage, RequestEnvelope, LEGACY_STATUS_UPDATE_ACTION, STATUS_UPDATE_EVENT};
pub use errors::{BrokerError, BrokerResult};
pub use providers::{InMemoryBroker, InMemoryConnector, RabbitMqConnector};
pub use transport::{BrokerChannel, BrokerConnector, Delivery, PublishProperties, QueueDeclaration};
