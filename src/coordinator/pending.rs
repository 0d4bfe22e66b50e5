//! # Pending Call Table
//!
//! Concurrency-safe map from correlation id to in-flight synchronous call.
//! Every removal path (reply, caller timeout, publish failure, health sweep,
//! shutdown) goes through `DashMap::remove`, so whichever path gets there
//! first owns the entry and the others find nothing. That single atomic
//! remove is what makes resolution happen at most once.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::error::{CoordinatorError, CoordinatorResult};

/// What a waiting caller eventually receives
pub type CallOutcome = CoordinatorResult<Value>;

/// An in-flight synchronous call
#[derive(Debug)]
pub struct PendingCall {
    pub destination: String,
    pub created_at: Instant,
    /// The caller's own timeout
    pub timeout: Duration,
    responder: oneshot::Sender<CallOutcome>,
}

impl PendingCall {
    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

/// Metrics about pending calls for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingCallMetrics {
    pub pending_count: usize,
    pub oldest_age_ms: Option<u64>,
}

#[derive(Debug, Default)]
pub struct PendingCallTable {
    calls: DashMap<String, PendingCall>,
}

impl PendingCallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a call and hand back the receiver its caller waits on.
    /// Fails if the correlation id is already in flight.
    pub fn register(
        &self,
        correlation_id: &str,
        destination: &str,
        timeout: Duration,
    ) -> CoordinatorResult<oneshot::Receiver<CallOutcome>> {
        match self.calls.entry(correlation_id.to_string()) {
            Entry::Occupied(_) => Err(CoordinatorError::invalid_payload(format!(
                "correlation id {correlation_id} is already in flight"
            ))),
            Entry::Vacant(slot) => {
                let (responder, receiver) = oneshot::channel();
                slot.insert(PendingCall {
                    destination: destination.to_string(),
                    created_at: Instant::now(),
                    timeout,
                    responder,
                });
                Ok(receiver)
            }
        }
    }

    /// Remove the call and deliver its outcome. Returns false when the call
    /// was already gone (resolved, timed out, or never registered).
    pub fn resolve(&self, correlation_id: &str, outcome: CallOutcome) -> bool {
        let Some((_, call)) = self.calls.remove(correlation_id) else {
            return false;
        };

        let elapsed = call.created_at.elapsed();
        if call.responder.send(outcome).is_err() {
            // Caller stopped waiting between our remove and the send
            debug!(
                correlation_id = %correlation_id,
                destination = %call.destination,
                elapsed_ms = elapsed.as_millis() as u64,
                "Resolved call had no waiting receiver"
            );
        }
        true
    }

    /// Remove without resolving; returns whether the entry was present
    pub fn remove(&self, correlation_id: &str) -> bool {
        self.calls.remove(correlation_id).is_some()
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.calls.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Force-resolve every call older than its own timeout plus `grace` with
    /// a timeout result. Returns the number of calls released.
    pub fn sweep_expired(&self, grace: Duration) -> usize {
        let now = Instant::now();

        // Collect first; removing while iterating would deadlock the shard
        let expired: Vec<String> = self
            .calls
            .iter()
            .filter(|entry| entry.value().age(now) > entry.value().timeout + grace)
            .map(|entry| entry.key().clone())
            .collect();

        let mut released = 0;
        for correlation_id in &expired {
            if let Some((_, call)) = self.calls.remove(correlation_id) {
                error!(
                    correlation_id = %correlation_id,
                    destination = %call.destination,
                    age_ms = call.age(now).as_millis() as u64,
                    timeout_ms = call.timeout.as_millis() as u64,
                    "⏰ PENDING_CALLS: Call expired without resolution, releasing waiter"
                );
                let outcome = Err(CoordinatorError::call_timeout(
                    call.destination.as_str(),
                    correlation_id.as_str(),
                    call.timeout,
                ));
                let _ = call.responder.send(outcome);
                released += 1;
            }
        }
        released
    }

    /// Resolve every outstanding call with an error built by `make_error`
    pub fn fail_all<F>(&self, make_error: F) -> usize
    where
        F: Fn() -> CoordinatorError,
    {
        let ids: Vec<String> = self.calls.iter().map(|entry| entry.key().clone()).collect();
        let failed = ids
            .iter()
            .filter(|id| self.resolve(id, Err(make_error())))
            .count();
        if failed > 0 {
            warn!(failed = failed, "⚠️ PENDING_CALLS: Failed all outstanding calls");
        }
        failed
    }

    pub fn metrics(&self) -> PendingCallMetrics {
        let now = Instant::now();
        let oldest = self.calls.iter().map(|entry| entry.value().age(now)).max();
        PendingCallMetrics {
            pending_count: self.calls.len(),
            oldest_age_ms: oldest.map(|age| age.as_millis() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_resolve() {
        let table = PendingCallTable::new();
        let rx = table
            .register("c-1", "crawl", Duration::from_secs(5))
            .unwrap();
        assert!(table.contains("c-1"));

        assert!(table.resolve("c-1", Ok(json!({"ok": true}))));
        assert!(!table.resolve("c-1", Ok(json!({"ok": false}))));
        assert!(table.is_empty());

        assert_eq!(rx.await.unwrap().unwrap(), json!({"ok": true}));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let table = PendingCallTable::new();
        let _rx = table.register("c-1", "crawl", Duration::from_secs(5)).unwrap();
        assert!(table.register("c-1", "crawl", Duration::from_secs(5)).is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_resolve_after_receiver_dropped() {
        let table = PendingCallTable::new();
        let rx = table.register("c-1", "crawl", Duration::from_secs(5)).unwrap();
        drop(rx);
        assert!(table.resolve("c-1", Ok(Value::Null)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_expired_releases_waiter() {
        let table = PendingCallTable::new();
        let rx = table.register("old", "infer", Duration::ZERO).unwrap();
        let _fresh = table
            .register("fresh", "infer", Duration::from_secs(60))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(table.sweep_expired(Duration::ZERO), 1);
        assert!(!table.contains("old"));
        assert!(table.contains("fresh"));

        let outcome = rx.await.unwrap();
        assert!(outcome.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_fail_all_and_metrics() {
        let table = PendingCallTable::new();
        let rx1 = table.register("a", "crawl", Duration::from_secs(5)).unwrap();
        let rx2 = table.register("b", "infer", Duration::from_secs(5)).unwrap();

        let metrics = table.metrics();
        assert_eq!(metrics.pending_count, 2);
        assert!(metrics.oldest_age_ms.is_some());

        assert_eq!(table.fail_all(|| CoordinatorError::ShuttingDown), 2);
        assert!(matches!(rx1.await.unwrap(), Err(CoordinatorError::ShuttingDown)));
        assert!(matches!(rx2.await.unwrap(), Err(CoordinatorError::ShuttingDown)));
        assert_eq!(table.metrics(), PendingCallMetrics::default());
    }
}
