//! # Coordinator
//!
//! Request/reply coordination over the single broker channel. `BrokerCoordinator`
//! wires the pieces together at startup:
//!
//! - the `IoLoop` task owns the `BrokerConnection`
//! - the `Dispatcher` hands it `PublishJob`s and waits on the `PendingCallTable`
//! - the `ResponseRouter` resolves calls and forwards status events
//! - a `StatusEventProcessor` task applies those events to the task store
//! - a `HealthMonitor` task reconnects stale connections and sweeps expired calls

pub mod dispatcher;
pub mod health;
pub mod pending;
pub mod router;

pub use dispatcher::{CallSettings, Dispatcher};
pub use health::{HealthMonitor, HealthReport, HealthSettings};
pub use pending::{CallOutcome, PendingCall, PendingCallMetrics, PendingCallTable};
pub use router::{Disposition, ResponseRouter, RouteOutcome};

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::{
    BrokerConnection, ConnectionSnapshot, ConnectionState, IoControl, IoLoop, IoLoopSettings,
    IoLoopStats, IoLoopStatsSnapshot, ReconnectPolicy, Topology,
};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::messaging::{BrokerConnector, RabbitMqConnector};
use crate::state_machine::{
    ProcessorStats, ProcessorStatsSnapshot, StatusEventHandler, StatusEventProcessor, TaskStore,
};

/// Point-in-time view of the whole coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorHealth {
    pub healthy: bool,
    pub connection: ConnectionSnapshot,
    pub pending_calls: PendingCallMetrics,
    pub io_loop: IoLoopStatsSnapshot,
    pub status_events: ProcessorStatsSnapshot,
}

#[derive(Debug)]
struct BackgroundTasks {
    io_loop: JoinHandle<()>,
    health_monitor: JoinHandle<()>,
    status_events: JoinHandle<()>,
}

/// Running coordinator: background tasks plus the call surface
#[derive(Debug)]
pub struct BrokerCoordinator {
    dispatcher: Dispatcher,
    handler: StatusEventHandler,
    state: Arc<ConnectionState>,
    pending: Arc<PendingCallTable>,
    io_control: mpsc::UnboundedSender<IoControl>,
    io_stats: Arc<IoLoopStats>,
    processor_stats: Arc<ProcessorStats>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl BrokerCoordinator {
    /// Connect, declare the topology and start the background tasks.
    ///
    /// Fails with `CoordinatorError::Connect` when the bounded connect retries
    /// are exhausted; nothing is left running in that case.
    pub async fn start(
        config: &CoordinatorConfig,
        connector: Arc<dyn BrokerConnector>,
        store: Arc<dyn TaskStore>,
    ) -> CoordinatorResult<Self> {
        config.validate()?;

        let provider = connector.provider_name();
        let topology = Arc::new(Topology::from_config(config));
        let state = Arc::new(ConnectionState::new());
        let mut connection = BrokerConnection::new(
            connector,
            topology.clone(),
            ReconnectPolicy::from(&config.reconnect),
            state.clone(),
        );
        connection.connect().await?;

        let pending = Arc::new(PendingCallTable::new());
        let call_settings = CallSettings::from(config);
        let (jobs_tx, jobs_rx) = mpsc::channel(call_settings.queue_capacity);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(4);

        let io_stats = Arc::new(IoLoopStats::default());
        let io_loop = IoLoop::new(
            connection,
            jobs_rx,
            control_rx,
            ResponseRouter::new(pending.clone(), events_tx),
            pending.clone(),
            IoLoopSettings::from(config),
            io_stats.clone(),
        )
        .spawn();

        let handler = StatusEventHandler::new(store);
        let processor_stats = Arc::new(ProcessorStats::default());
        let status_events =
            StatusEventProcessor::new(handler.clone(), events_rx, processor_stats.clone())
                .spawn(shutdown_tx.subscribe());

        let health_monitor = HealthMonitor::new(
            state.clone(),
            pending.clone(),
            control_tx.clone(),
            HealthSettings::from(config),
        )
        .spawn(shutdown_tx.subscribe());

        let dispatcher = Dispatcher::new(pending.clone(), jobs_tx, topology.clone(), state.clone(), call_settings);

        info!(
            provider = provider,
            destinations = ?topology.destinations().iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            "🚀 COORDINATOR: Started"
        );

        Ok(Self {
            dispatcher,
            handler,
            state,
            pending,
            io_control: control_tx,
            io_stats,
            processor_stats,
            shutdown_tx,
            tasks: Mutex::new(Some(BackgroundTasks {
                io_loop,
                health_monitor,
                status_events,
            })),
        })
    }

    /// `start` against the RabbitMQ broker named in `config.broker`
    pub async fn start_rabbitmq(
        config: &CoordinatorConfig,
        store: Arc<dyn TaskStore>,
    ) -> CoordinatorResult<Self> {
        let connector = Arc::new(RabbitMqConnector::new(config.broker.clone()));
        Self::start(config, connector, store).await
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn task_store(&self) -> &Arc<dyn TaskStore> {
        self.handler.store()
    }

    pub fn pending_calls(&self) -> &Arc<PendingCallTable> {
        &self.pending
    }

    pub fn is_healthy(&self) -> bool {
        self.state.is_open()
    }

    pub fn health(&self) -> CoordinatorHealth {
        CoordinatorHealth {
            healthy: self.is_healthy(),
            connection: self.state.snapshot(),
            pending_calls: self.pending.metrics(),
            io_loop: self.io_stats.snapshot(),
            status_events: self.processor_stats.snapshot(),
        }
    }

    /// Ask the IoLoop to drop and re-establish the broker connection
    pub fn request_reconnect(&self, reason: impl Into<String>) -> CoordinatorResult<()> {
        self.io_control
            .send(IoControl::Reconnect {
                reason: reason.into(),
            })
            .map_err(|_| CoordinatorError::ShuttingDown)
    }

    /// Stop every background task. Outstanding calls fail with `ShuttingDown`.
    /// Later calls are no-ops.
    pub async fn shutdown(&self) {
        let Some(tasks) = self.tasks.lock().take() else {
            return;
        };

        info!(pending_calls = self.pending.len(), "🛑 COORDINATOR: Shutting down");
        // The IoLoop goes first so queued jobs and pending calls are failed cleanly
        let _ = self.io_control.send(IoControl::Shutdown);
        if let Err(e) = tasks.io_loop.await {
            warn!(error = %e, "⚠️ COORDINATOR: IoLoop task ended abnormally");
        }

        let _ = self.shutdown_tx.send(());
        for (name, handle) in [
            ("health_monitor", tasks.health_monitor),
            ("status_events", tasks.status_events),
        ] {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "⚠️ COORDINATOR: Background task ended abnormally");
            }
        }

        info!(health = ?self.health(), "✅ COORDINATOR: Shutdown complete");
    }
}
