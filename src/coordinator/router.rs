//! # Response Router
//!
//! Inbound callback of the IoLoop. Each delivery ends up in exactly one of
//! four places: a waiting caller, the status-event processor, the
//! unmatched-and-dropped log line, or the malformed-and-rejected log line.
//! Nothing is ever requeued.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::pending::PendingCallTable;
use crate::error::CoordinatorError;
use crate::messaging::{Delivery, InboundMessage};
use crate::state_machine::StatusUpdateEvent;

/// How the IoLoop settles a delivery with the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Reject without requeue
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// A waiting call was resolved
    Resolved { correlation_id: String },
    /// Forwarded to the status-event processor
    StatusEvent { task_id: String },
    /// Neither a live call nor an event; dropped
    Unmatched { correlation_id: Option<String> },
    /// Undecodable or structurally invalid
    Malformed { resolved_call: bool },
}

impl RouteOutcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Malformed { .. } => Disposition::Reject,
            Self::Resolved { .. } | Self::StatusEvent { .. } | Self::Unmatched { .. } => {
                Disposition::Ack
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResponseRouter {
    pending: Arc<PendingCallTable>,
    events: mpsc::UnboundedSender<StatusUpdateEvent>,
}

impl ResponseRouter {
    pub fn new(
        pending: Arc<PendingCallTable>,
        events: mpsc::UnboundedSender<StatusUpdateEvent>,
    ) -> Self {
        Self { pending, events }
    }

    pub fn route(&self, delivery: &Delivery) -> RouteOutcome {
        let message = match InboundMessage::decode(&delivery.body) {
            Ok(message) => message,
            Err(e) => return self.route_undecodable(delivery, &e),
        };

        // Property correlation id (callback queue) wins over the body's (shared queue)
        let correlation_id = delivery
            .correlation_id
            .clone()
            .or_else(|| message.correlation_id());

        if let Some(id) = correlation_id.as_deref() {
            if self.pending.contains(id) {
                if self.pending.resolve(id, Ok(message.into_body())) {
                    debug!(
                        correlation_id = %id,
                        queue = %delivery.queue,
                        "📬 ROUTER: Reply matched pending call"
                    );
                    return RouteOutcome::Resolved {
                        correlation_id: id.to_string(),
                    };
                }
                // Lost the race to a timeout; the late reply is dropped
                debug!(correlation_id = %id, "Reply arrived as its call expired");
                return RouteOutcome::Unmatched { correlation_id };
            }
        }

        if message.is_status_event() {
            return match message.to_status_event() {
                Ok(event) => {
                    let task_id = event.task_id.clone();
                    if self.events.send(event).is_err() {
                        warn!(
                            task_id = %task_id,
                            "⚠️ ROUTER: Status event processor is gone, event dropped"
                        );
                    }
                    RouteOutcome::StatusEvent { task_id }
                }
                Err(e) => {
                    warn!(
                        queue = %delivery.queue,
                        error = %e,
                        "⚠️ ROUTER: Malformed status event rejected"
                    );
                    RouteOutcome::Malformed {
                        resolved_call: false,
                    }
                }
            };
        }

        warn!(
            queue = %delivery.queue,
            correlation_id = ?correlation_id,
            redelivered = delivery.redelivered,
            "⚠️ ROUTER: Unmatched delivery dropped"
        );
        RouteOutcome::Unmatched { correlation_id }
    }

    fn route_undecodable(&self, delivery: &Delivery, error: &serde_json::Error) -> RouteOutcome {
        warn!(
            queue = %delivery.queue,
            correlation_id = ?delivery.correlation_id,
            bytes = delivery.body.len(),
            error = %error,
            "⚠️ ROUTER: Undecodable delivery rejected"
        );

        // A reply we can still attribute fails its caller now instead of at timeout
        let resolved_call = delivery.correlation_id.as_deref().is_some_and(|id| {
            self.pending.resolve(
                id,
                Err(CoordinatorError::malformed(format!(
                    "reply could not be decoded: {error}"
                ))),
            )
        });

        RouteOutcome::Malformed { resolved_call }
    }
}
