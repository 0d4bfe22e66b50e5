//! Typed client for the crawl worker.
//!
//! Requests are `{action, ...data}` objects; replies come back on the shared
//! crawl response queue. Long-running crawls are tracked through a task record
//! that the worker advances with status events.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CRAWL_DESTINATION;
use crate::coordinator::Dispatcher;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::state_machine::{TaskRecord, TaskStatus, TaskStore, TaskUpdate};

/// Handle returned by `CrawlClient::enqueue_task`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedTask {
    pub task_id: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone)]
pub struct CrawlClient {
    dispatcher: Dispatcher,
    destination: String,
}

impl CrawlClient {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            destination: CRAWL_DESTINATION.to_string(),
        }
    }

    /// Route through a differently named destination
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }

    /// Send `action` and wait for the worker's reply. `None` uses the
    /// destination's default timeout.
    pub async fn send_request(
        &self,
        action: &str,
        data: Option<Value>,
        timeout: Option<Duration>,
    ) -> CoordinatorResult<Value> {
        let payload = Self::request_payload(action, data)?;
        match timeout {
            Some(timeout) => self.dispatcher.call(&self.destination, payload, timeout).await,
            None => {
                self.dispatcher
                    .call_with_default_timeout(&self.destination, payload)
                    .await
            }
        }
    }

    /// Fire-and-forget `action`; returns the correlation id
    pub fn send_async_request(&self, action: &str, data: Option<Value>) -> CoordinatorResult<String> {
        let payload = Self::request_payload(action, data)?;
        self.dispatcher.dispatch_async(&self.destination, payload)
    }

    /// Create a `queued` task record, then dispatch `action` carrying its
    /// `taskId`. If the dispatch cannot be enqueued the record is marked failed.
    pub async fn enqueue_task(
        &self,
        store: &Arc<dyn TaskStore>,
        owner: Option<String>,
        action: &str,
        data: Option<Value>,
    ) -> CoordinatorResult<QueuedTask> {
        let task_id = Uuid::new_v4().to_string();
        let mut payload = Self::request_payload(action, data)?;
        if let Value::Object(map) = &mut payload {
            map.insert("taskId".to_string(), Value::String(task_id.clone()));
        }

        store
            .insert(TaskRecord::queued(task_id.as_str(), owner))
            .await?;

        match self.dispatcher.dispatch_async(&self.destination, payload) {
            Ok(correlation_id) => {
                info!(
                    task_id = %task_id,
                    correlation_id = %correlation_id,
                    action = %action,
                    "📤 CRAWL: Task queued"
                );
                Ok(QueuedTask {
                    task_id,
                    correlation_id,
                })
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "⚠️ CRAWL: Dispatch failed, failing task");
                let update = TaskUpdate {
                    result: None,
                    error: Some(json!(e.to_string())),
                };
                if let Err(store_error) = store
                    .compare_and_set_status(&task_id, &[TaskStatus::Queued], TaskStatus::Failed, update)
                    .await
                {
                    warn!(task_id = %task_id, error = %store_error, "Could not mark task failed");
                }
                Err(e)
            }
        }
    }

    fn request_payload(action: &str, data: Option<Value>) -> CoordinatorResult<Value> {
        let mut map = match data {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(CoordinatorError::invalid_payload(
                    "crawl request data must be a JSON object",
                ))
            }
        };
        map.insert("action".to_string(), Value::String(action.to_string()));
        Ok(Value::Object(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_payload_sets_action() {
        let payload =
            CrawlClient::request_payload("crawl_store", Some(json!({"storeId": 42, "action": "x"})))
                .unwrap();
        assert_eq!(payload, json!({"storeId": 42, "action": "crawl_store"}));

        assert_eq!(
            CrawlClient::request_payload("ping", None).unwrap(),
            json!({"action": "ping"})
        );
        assert!(CrawlClient::request_payload("ping", Some(json!("nope"))).is_err());
    }
}
