//! Drains status events forwarded by the response router and applies them
//! off the IoLoop, so the IoLoop never waits on the task store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::events::StatusUpdateEvent;
use super::task_state_machine::{StatusEventHandler, TransitionOutcome};

#[derive(Debug, Default)]
pub struct ProcessorStats {
    applied: AtomicU64,
    dropped: AtomicU64,
    store_errors: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStatsSnapshot {
    pub applied: u64,
    /// Unknown task, duplicate, rejected or superseded
    pub dropped: u64,
    pub store_errors: u64,
}

impl ProcessorStats {
    pub fn snapshot(&self) -> ProcessorStatsSnapshot {
        ProcessorStatsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct StatusEventProcessor {
    handler: StatusEventHandler,
    events: mpsc::UnboundedReceiver<StatusUpdateEvent>,
    stats: Arc<ProcessorStats>,
}

impl StatusEventProcessor {
    pub fn new(
        handler: StatusEventHandler,
        events: mpsc::UnboundedReceiver<StatusUpdateEvent>,
        stats: Arc<ProcessorStats>,
    ) -> Self {
        Self {
            handler,
            events,
            stats,
        }
    }

    /// Process events until every sender is gone or `shutdown` fires
    pub fn spawn(mut self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = self.events.recv() => match event {
                        Some(event) => self.process(&event).await,
                        None => break,
                    },
                    _ = shutdown.recv() => {
                        // Apply what was already routed before stopping
                        while let Ok(event) = self.events.try_recv() {
                            self.process(&event).await;
                        }
                        break;
                    }
                }
            }
            info!(stats = ?self.stats.snapshot(), "🛑 STATUS_EVENTS: Processor stopped");
        })
    }

    async fn process(&self, event: &StatusUpdateEvent) {
        match self.handler.apply(event).await {
            Ok(TransitionOutcome::Applied { .. }) => {
                self.stats.applied.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.store_errors.fetch_add(1, Ordering::Relaxed);
                error!(
                    task_id = %event.task_id,
                    status = %event.status,
                    error = %e,
                    "❌ STATUS_EVENTS: Task store error, event dropped"
                );
            }
        }
    }
}
