//! # Queue Topology
//!
//! Which queues the coordinator publishes to and consumes from, derived from
//! the configured destinations. Declared on every (re)connect so a fresh
//! connection presents the same external contract as a cold start.

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::debug;

use crate::config::{CoordinatorConfig, ReplyConfig};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::messaging::{BrokerChannel, BrokerResult, QueueDeclaration};

/// Reply wiring of one destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyRoute {
    /// Durable response queue shared by every call; correlation id in the body
    SharedQueue { queue: String },
    /// The connection's exclusive callback queue; correlation id in properties
    CallbackQueue { expires_ms: Option<u32> },
}

/// Routing facts for one logical destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationRoute {
    pub name: String,
    pub request_queue: String,
    pub message_ttl_ms: Option<u32>,
    pub reply: ReplyRoute,
    pub default_timeout: Option<Duration>,
}

/// Result of declaring the topology on a channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclaredTopology {
    /// Server-assigned name of this connection's callback queue
    pub callback_queue: Option<String>,
    /// Queues with a consumer registered
    pub consumed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    destinations: Vec<DestinationRoute>,
}

impl Topology {
    pub fn new(destinations: Vec<DestinationRoute>) -> Self {
        Self { destinations }
    }

    pub fn from_config(config: &CoordinatorConfig) -> Self {
        let mut destinations: Vec<DestinationRoute> = config
            .destinations
            .iter()
            .map(|(name, destination)| DestinationRoute {
                name: name.clone(),
                request_queue: destination.request_queue.clone(),
                message_ttl_ms: destination.message_ttl_ms,
                reply: match &destination.reply {
                    ReplyConfig::SharedQueue { queue } => ReplyRoute::SharedQueue {
                        queue: queue.clone(),
                    },
                    ReplyConfig::CallbackQueue { expires_ms } => ReplyRoute::CallbackQueue {
                        expires_ms: *expires_ms,
                    },
                },
                default_timeout: destination.default_timeout_seconds.map(Duration::from_secs),
            })
            .collect();
        destinations.sort_by(|a, b| a.name.cmp(&b.name));
        Self { destinations }
    }

    pub fn destination(&self, name: &str) -> Option<&DestinationRoute> {
        self.destinations.iter().find(|d| d.name == name)
    }

    /// Look up a destination or fail with `UnknownDestination`
    pub fn route(&self, name: &str) -> CoordinatorResult<&DestinationRoute> {
        self.destination(name)
            .ok_or_else(|| CoordinatorError::unknown_destination(name))
    }

    pub fn destinations(&self) -> &[DestinationRoute] {
        &self.destinations
    }

    /// Whether any destination replies through the callback queue
    pub fn needs_callback_queue(&self) -> bool {
        self.destinations
            .iter()
            .any(|d| matches!(d.reply, ReplyRoute::CallbackQueue { .. }))
    }

    /// Distinct shared response queues, in a stable order
    pub fn shared_response_queues(&self) -> Vec<String> {
        self.destinations
            .iter()
            .filter_map(|d| match &d.reply {
                ReplyRoute::SharedQueue { queue } => Some(queue.clone()),
                ReplyRoute::CallbackQueue { .. } => None,
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Declare request queues, declare and consume response queues, and
    /// declare and consume the callback queue when one is needed
    pub async fn declare(&self, channel: &mut dyn BrokerChannel) -> BrokerResult<DeclaredTopology> {
        let mut declared = DeclaredTopology::default();

        for destination in &self.destinations {
            channel
                .declare_queue(
                    // Workers may own their request queue with different arguments
                    &QueueDeclaration::durable(&destination.request_queue)
                        .with_message_ttl(destination.message_ttl_ms)
                        .prefer_existing(),
                )
                .await?;
        }

        for queue in self.shared_response_queues() {
            channel.declare_queue(&QueueDeclaration::durable(&queue)).await?;
            channel.consume(&queue).await?;
            declared.consumed.push(queue);
        }

        if self.needs_callback_queue() {
            let expires_ms = self
                .destinations
                .iter()
                .filter_map(|d| match d.reply {
                    ReplyRoute::CallbackQueue { expires_ms } => expires_ms,
                    ReplyRoute::SharedQueue { .. } => None,
                })
                .max();
            let name = channel
                .declare_queue(&QueueDeclaration::exclusive_callback(expires_ms))
                .await?;
            channel.consume(&name).await?;
            declared.consumed.push(name.clone());
            declared.callback_queue = Some(name);
        }

        debug!(
            consumed = ?declared.consumed,
            callback_queue = ?declared.callback_queue,
            "🗺️ TOPOLOGY: Queues declared"
        );

        Ok(declared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{BrokerConnector, InMemoryBroker};

    #[test]
    fn test_default_topology() {
        let topology = Topology::from_config(&CoordinatorConfig::default());
        assert!(topology.needs_callback_queue());
        assert_eq!(topology.shared_response_queues(), vec!["crawling_response"]);

        let infer = topology.route("infer").unwrap();
        assert_eq!(infer.request_queue, "recipe_analysis_request");
        assert_eq!(infer.default_timeout, Some(Duration::from_secs(100)));

        assert!(matches!(
            topology.route("nope"),
            Err(CoordinatorError::UnknownDestination { .. })
        ));
    }

    #[tokio::test]
    async fn test_declare_on_in_memory_broker() {
        let broker = InMemoryBroker::new();
        let mut channel = broker.connector().open().await.unwrap();
        let topology = Topology::from_config(&CoordinatorConfig::default());

        let declared = topology.declare(channel.as_mut()).await.unwrap();

        assert!(broker.queue_exists("crawling_request"));
        assert!(broker.queue_exists("crawling_response"));
        assert!(broker.queue_exists("recipe_analysis_request"));
        let callback = declared.callback_queue.expect("callback queue");
        assert!(broker.queue_exists(&callback));
        assert_eq!(declared.consumed.len(), 2);
    }

    #[tokio::test]
    async fn test_declare_reuses_request_queue_owned_by_worker() {
        let broker = InMemoryBroker::new();
        // The inference worker created its queue without a message TTL
        broker.declare_worker_queue("recipe_analysis_request", None);
        let mut channel = broker.connector().open().await.unwrap();
        let topology = Topology::from_config(&CoordinatorConfig::default());

        let declared = topology.declare(channel.as_mut()).await.unwrap();

        assert!(declared.callback_queue.is_some());
        assert!(channel.is_open());
    }

    #[tokio::test]
    async fn test_shared_only_topology_has_no_callback_queue() {
        let broker = InMemoryBroker::new();
        let mut channel = broker.connector().open().await.unwrap();
        let topology = Topology::new(vec![DestinationRoute {
            name: "crawl".to_string(),
            request_queue: "req".to_string(),
            message_ttl_ms: None,
            reply: ReplyRoute::SharedQueue {
                queue: "resp".to_string(),
            },
            default_timeout: None,
        }]);

        let declared = topology.declare(channel.as_mut()).await.unwrap();
        assert_eq!(declared.callback_queue, None);
        assert_eq!(declared.consumed, vec!["resp".to_string()]);
    }
}
