//! # Health Monitor
//!
//! Background ticker with two idempotent duties: ask the IoLoop to reconnect
//! when it has not completed an inbound pump for too long, and force-resolve
//! pending calls that outlived their own timeout plus a grace period.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::pending::{PendingCallMetrics, PendingCallTable};
use crate::broker::{ConnectionSnapshot, ConnectionState, IoControl};
use crate::config::CoordinatorConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSettings {
    pub interval: Duration,
    /// Idle time after which an open connection is considered stale
    pub stale_after: Duration,
    pub pending_grace: Duration,
}

impl From<&CoordinatorConfig> for HealthSettings {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.health.interval_seconds.max(1)),
            stale_after: Duration::from_secs(config.health.stale_after_seconds),
            pending_grace: Duration::from_secs(config.health.pending_grace_seconds),
        }
    }
}

/// Result of one health check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub reconnect_requested: bool,
    pub expired_calls: usize,
    pub connection: ConnectionSnapshot,
    pub pending: PendingCallMetrics,
}

#[derive(Debug)]
pub struct HealthMonitor {
    state: Arc<ConnectionState>,
    pending: Arc<PendingCallTable>,
    io_control: mpsc::UnboundedSender<IoControl>,
    settings: HealthSettings,
}

impl HealthMonitor {
    pub fn new(
        state: Arc<ConnectionState>,
        pending: Arc<PendingCallTable>,
        io_control: mpsc::UnboundedSender<IoControl>,
        settings: HealthSettings,
    ) -> Self {
        Self {
            state,
            pending,
            io_control,
            settings,
        }
    }

    /// Run both duties once
    pub fn check_once(&self) -> HealthReport {
        let connection = self.state.snapshot();
        let idle = self.state.idle_for();

        // A closed connection is already being recovered by the IoLoop
        let reconnect_requested = connection.is_open && idle >= self.settings.stale_after && {
            let reason = format!("no IoLoop progress for {}s", idle.as_secs());
            warn!(
                idle_ms = connection.idle_ms,
                stale_after_ms = self.settings.stale_after.as_millis() as u64,
                "💔 HEALTH: Connection stale, requesting reconnect"
            );
            self.io_control
                .send(IoControl::Reconnect { reason })
                .is_ok()
        };

        let expired_calls = self.pending.sweep_expired(self.settings.pending_grace);

        HealthReport {
            reconnect_requested,
            expired_calls,
            connection,
            pending: self.pending.metrics(),
        }
    }

    /// Tick on the configured interval until `shutdown` fires
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            info!(
                interval_ms = self.settings.interval.as_millis() as u64,
                "💓 HEALTH: Monitor started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.check_once();
                        if report.reconnect_requested || report.expired_calls > 0 {
                            info!(
                                reconnect_requested = report.reconnect_requested,
                                expired_calls = report.expired_calls,
                                pending = report.pending.pending_count,
                                "💓 HEALTH: Check took action"
                            );
                        } else {
                            debug!(
                                is_open = report.connection.is_open,
                                pending = report.pending.pending_count,
                                "Health check ok"
                            );
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("💓 HEALTH: Monitor shutting down");
                        break;
                    }
                }
            }
        })
    }
}
