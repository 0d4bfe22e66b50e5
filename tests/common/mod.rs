//! Shared harness: a coordinator running against the in-memory broker, plus
//! fake workers that answer requests the way the real workers do.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tasker_rpc::broker::BackoffStrategy;
use tasker_rpc::config::CoordinatorConfig;
use tasker_rpc::coordinator::BrokerCoordinator;
use tasker_rpc::messaging::InMemoryBroker;
use tasker_rpc::state_machine::InMemoryTaskStore;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const CRAWL_REQUESTS: &str = "crawling_request";
pub const CRAWL_RESPONSES: &str = "crawling_response";
pub const INFER_REQUESTS: &str = "recipe_analysis_request";

/// Default topology with test-friendly pacing
pub fn fast_config() -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.reconnect.max_attempts = 3;
    config.reconnect.strategy = BackoffStrategy::Fixed;
    config.reconnect.base_delay_ms = 10;
    config.reconnect.max_delay_ms = 10;
    config.reconnect.io_error_pause_ms = 20;
    config.io_loop.inbound_slice_ms = 20;
    config.io_loop.idle_sleep_ms = 1;
    config.health.interval_seconds = 1;
    config.health.stale_after_seconds = 3600;
    config.health.pending_grace_seconds = 1;
    config
}

pub struct Harness {
    pub broker: InMemoryBroker,
    pub coordinator: BrokerCoordinator,
    pub store: Arc<InMemoryTaskStore>,
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_with(fast_config()).await
    }

    pub async fn start_with(config: CoordinatorConfig) -> Self {
        let broker = InMemoryBroker::new();
        let store = Arc::new(InMemoryTaskStore::new());
        let coordinator =
            BrokerCoordinator::start(&config, Arc::new(broker.connector()), store.clone())
                .await
                .expect("coordinator starts against in-memory broker");
        Self {
            broker,
            coordinator,
            store,
        }
    }
}

/// Answer every request on `queue` with `respond(request)`, echoing the
/// correlation id in the body and in the message properties. Requests for
/// which `respond` returns `None` are swallowed.
pub fn spawn_worker<F>(broker: &InMemoryBroker, queue: &str, respond: F) -> JoinHandle<()>
where
    F: Fn(&Value) -> Option<Value> + Send + 'static,
{
    let broker = broker.clone();
    let queue = queue.to_string();
    tokio::spawn(async move {
        loop {
            let Some(request) = broker.take(&queue, Duration::from_millis(50)).await else {
                continue;
            };
            let Some(body) = request.json() else {
                continue;
            };
            if let Some(mut reply) = respond(&body) {
                if let (Value::Object(map), Some(id)) = (&mut reply, request.body_correlation_id()) {
                    map.insert("correlationId".to_string(), Value::String(id));
                }
                broker.reply(&request, &reply);
            }
        }
    })
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
