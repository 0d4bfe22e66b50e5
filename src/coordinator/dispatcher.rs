//! # Dispatcher
//!
//! Public call surface of the coordinator. Callers never touch the channel:
//! a synchronous `call` registers a `PendingCall`, enqueues a
//! `SynchronousRequest` job for the IoLoop and suspends on its own oneshot
//! receiver; `dispatch_async` enqueues a `FireAndForget` job and returns the
//! correlation id immediately.
//!
//! The pending entry is always registered before the job is enqueued, so a
//! reply can never arrive ahead of its waiter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;
use uuid::Uuid;

use super::pending::PendingCallTable;
use crate::broker::{ConnectionState, PublishJob, ReplyHint, ReplyRoute, Topology};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::logging::log_call_operation;
use crate::messaging::RequestEnvelope;

/// Timeout and back-pressure knobs of the Dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSettings {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub fail_fast_when_disconnected: bool,
    pub queue_capacity: usize,
}

impl From<&CoordinatorConfig> for CallSettings {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            default_timeout: config.calls.default_timeout(),
            max_timeout: config.calls.max_timeout(),
            fail_fast_when_disconnected: config.calls.fail_fast_when_disconnected,
            queue_capacity: config.io_loop.job_queue_capacity.max(1),
        }
    }
}

/// Cheap to clone; every clone feeds the same IoLoop
#[derive(Debug, Clone)]
pub struct Dispatcher {
    pending: Arc<PendingCallTable>,
    jobs: mpsc::Sender<PublishJob>,
    topology: Arc<Topology>,
    state: Arc<ConnectionState>,
    settings: CallSettings,
}

impl Dispatcher {
    pub fn new(
        pending: Arc<PendingCallTable>,
        jobs: mpsc::Sender<PublishJob>,
        topology: Arc<Topology>,
        state: Arc<ConnectionState>,
        settings: CallSettings,
    ) -> Self {
        Self {
            pending,
            jobs,
            topology,
            state,
            settings,
        }
    }

    /// Publish a request and wait up to `timeout` for its correlated reply.
    ///
    /// `timeout` is clamped to the configured maximum. On expiry the pending
    /// entry is removed, so a reply arriving afterwards is dropped by the
    /// router.
    pub async fn call(
        &self,
        destination: &str,
        payload: Value,
        timeout: Duration,
    ) -> CoordinatorResult<Value> {
        let route = self.topology.route(destination)?;
        self.ensure_available()?;

        let timeout = timeout.min(self.settings.max_timeout);
        let correlation_id = Uuid::new_v4().to_string();
        let body = RequestEnvelope::new(correlation_id.as_str(), destination, payload)?.to_bytes()?;
        let reply_hint = match &route.reply {
            ReplyRoute::SharedQueue { queue } => ReplyHint::SharedQueue(queue.clone()),
            ReplyRoute::CallbackQueue { .. } => ReplyHint::CallbackQueue,
        };
        let job = PublishJob::SynchronousRequest {
            destination: destination.to_string(),
            routing_key: route.request_queue.clone(),
            correlation_id: correlation_id.clone(),
            body,
            reply_hint,
        };

        let mut receiver = self
            .pending
            .register(&correlation_id, destination, timeout)?;
        if let Err(e) = self.enqueue(job) {
            self.pending.remove(&correlation_id);
            log_call_operation("call", destination, &correlation_id, "rejected", None, Some(&e.to_string()));
            return Err(e);
        }
        debug!(
            correlation_id = %correlation_id,
            destination = %destination,
            timeout_ms = timeout.as_millis() as u64,
            "Synchronous request enqueued"
        );

        let started = Instant::now();
        match tokio::time::timeout(timeout, &mut receiver).await {
            Ok(Ok(outcome)) => {
                let status = if outcome.is_ok() { "resolved" } else { "failed" };
                let details = outcome.as_ref().err().map(ToString::to_string);
                log_call_operation(
                    "call",
                    destination,
                    &correlation_id,
                    status,
                    Some(started.elapsed()),
                    details.as_deref(),
                );
                outcome
            }
            Ok(Err(_)) => {
                // Responder dropped without an outcome; only happens on teardown
                self.pending.remove(&correlation_id);
                Err(CoordinatorError::ShuttingDown)
            }
            Err(_) => {
                if self.pending.remove(&correlation_id) {
                    log_call_operation(
                        "call",
                        destination,
                        &correlation_id,
                        "timed_out",
                        Some(started.elapsed()),
                        None,
                    );
                    return Err(CoordinatorError::call_timeout(
                        destination,
                        correlation_id.as_str(),
                        timeout,
                    ));
                }
                // A resolver removed the entry as our timer fired; its send is imminent
                match receiver.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(CoordinatorError::call_timeout(
                        destination,
                        correlation_id.as_str(),
                        timeout,
                    )),
                }
            }
        }
    }

    /// `call` with the destination's configured timeout, else the global default
    pub async fn call_with_default_timeout(
        &self,
        destination: &str,
        payload: Value,
    ) -> CoordinatorResult<Value> {
        let timeout = self.default_timeout_for(destination)?;
        self.call(destination, payload, timeout).await
    }

    /// Enqueue a fire-and-forget request; returns its correlation id for tracing
    pub fn dispatch_async(&self, destination: &str, payload: Value) -> CoordinatorResult<String> {
        let route = self.topology.route(destination)?;
        self.ensure_available()?;

        let correlation_id = Uuid::new_v4().to_string();
        let body = RequestEnvelope::new(correlation_id.as_str(), destination, payload)?.to_bytes()?;
        self.enqueue(PublishJob::FireAndForget {
            destination: destination.to_string(),
            routing_key: route.request_queue.clone(),
            correlation_id: correlation_id.clone(),
            body,
        })?;

        log_call_operation("dispatch_async", destination, &correlation_id, "enqueued", None, None);
        Ok(correlation_id)
    }

    pub fn default_timeout_for(&self, destination: &str) -> CoordinatorResult<Duration> {
        let route = self.topology.route(destination)?;
        Ok(route
            .default_timeout
            .unwrap_or(self.settings.default_timeout)
            .min(self.settings.max_timeout))
    }

    pub fn pending_calls(&self) -> &Arc<PendingCallTable> {
        &self.pending
    }

    pub fn settings(&self) -> &CallSettings {
        &self.settings
    }

    fn ensure_available(&self) -> CoordinatorResult<()> {
        if self.settings.fail_fast_when_disconnected && !self.state.is_open() {
            return Err(CoordinatorError::BrokerUnavailable);
        }
        Ok(())
    }

    fn enqueue(&self, job: PublishJob) -> CoordinatorResult<()> {
        match self.jobs.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(CoordinatorError::QueueFull {
                capacity: self.settings.queue_capacity,
            }),
            Err(TrySendError::Closed(_)) => Err(CoordinatorError::ShuttingDown),
        }
    }
}
