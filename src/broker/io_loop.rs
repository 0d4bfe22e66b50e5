//! # IO Loop
//!
//! The only task that touches the broker channel. Each tick it pumps inbound
//! deliveries for a bounded slice (handing each to the `ResponseRouter` and
//! settling it), then drains the outbound `PublishJob` backlog. The inbound
//! slice ends early when outbound work arrives, but inbound always has
//! priority within a tick.
//!
//! Every completed inbound pump stamps connection activity, so "stale" means
//! the loop stopped making progress, not that traffic was quiet.
//!
//! Transport failures never end the loop: the connection is marked closed,
//! the loop pauses, and `BrokerConnection::reconnect` restores the topology.
//! Only `IoControl::Shutdown` (or every control handle being dropped) stops it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::connection::BrokerConnection;
use super::job::{PublishJob, ReplyHint};
use crate::config::CoordinatorConfig;
use crate::coordinator::{Disposition, PendingCallTable, ResponseRouter, RouteOutcome};
use crate::error::CoordinatorError;
use crate::messaging::{BrokerError, BrokerResult, Delivery};

/// Out-of-band instructions for the IoLoop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoControl {
    /// Tear the connection down and reconnect (health monitor, operator)
    Reconnect { reason: String },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoLoopSettings {
    pub inbound_slice: Duration,
    pub idle_sleep: Duration,
    pub max_deliveries_per_tick: usize,
    /// Upper bound on jobs executed per drain
    pub max_jobs_per_tick: usize,
    /// Pause after a transport error before reconnecting
    pub error_pause: Duration,
}

impl From<&CoordinatorConfig> for IoLoopSettings {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            inbound_slice: Duration::from_millis(config.io_loop.inbound_slice_ms),
            idle_sleep: Duration::from_millis(config.io_loop.idle_sleep_ms),
            max_deliveries_per_tick: config.io_loop.max_deliveries_per_tick.max(1),
            max_jobs_per_tick: config.io_loop.job_queue_capacity.max(1),
            error_pause: config.reconnect.io_error_pause(),
        }
    }
}

/// Counters updated by the IoLoop, readable from anywhere
#[derive(Debug, Default)]
pub struct IoLoopStats {
    ticks: AtomicU64,
    deliveries: AtomicU64,
    replies_resolved: AtomicU64,
    status_events: AtomicU64,
    unmatched: AtomicU64,
    malformed: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
    skipped_jobs: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IoLoopStatsSnapshot {
    pub ticks: u64,
    pub deliveries: u64,
    pub replies_resolved: u64,
    pub status_events: u64,
    pub unmatched: u64,
    pub malformed: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub skipped_jobs: u64,
    pub reconnects: u64,
}

impl IoLoopStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_route(&self, outcome: &RouteOutcome) {
        Self::bump(&self.deliveries);
        match outcome {
            RouteOutcome::Resolved { .. } => Self::bump(&self.replies_resolved),
            RouteOutcome::StatusEvent { .. } => Self::bump(&self.status_events),
            RouteOutcome::Unmatched { .. } => Self::bump(&self.unmatched),
            RouteOutcome::Malformed { .. } => Self::bump(&self.malformed),
        }
    }

    pub fn snapshot(&self) -> IoLoopStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        IoLoopStatsSnapshot {
            ticks: load(&self.ticks),
            deliveries: load(&self.deliveries),
            replies_resolved: load(&self.replies_resolved),
            status_events: load(&self.status_events),
            unmatched: load(&self.unmatched),
            malformed: load(&self.malformed),
            published: load(&self.published),
            publish_failures: load(&self.publish_failures),
            skipped_jobs: load(&self.skipped_jobs),
            reconnects: load(&self.reconnects),
        }
    }
}

enum InboundEvent {
    Delivery(BrokerResult<Option<Delivery>>),
    Job(Option<PublishJob>),
}

pub struct IoLoop {
    connection: BrokerConnection,
    jobs: mpsc::Receiver<PublishJob>,
    control: mpsc::UnboundedReceiver<IoControl>,
    router: ResponseRouter,
    pending: Arc<PendingCallTable>,
    settings: IoLoopSettings,
    stats: Arc<IoLoopStats>,
    /// Job received while waiting for inbound traffic, executed first next drain
    carried: Option<PublishJob>,
    jobs_closed: bool,
}

impl std::fmt::Debug for IoLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoLoop")
            .field("connection", &self.connection)
            .field("settings", &self.settings)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl IoLoop {
    pub fn new(
        connection: BrokerConnection,
        jobs: mpsc::Receiver<PublishJob>,
        control: mpsc::UnboundedReceiver<IoControl>,
        router: ResponseRouter,
        pending: Arc<PendingCallTable>,
        settings: IoLoopSettings,
        stats: Arc<IoLoopStats>,
    ) -> Self {
        Self {
            connection,
            jobs,
            control,
            router,
            pending,
            settings,
            stats,
            carried: None,
            jobs_closed: false,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until shutdown is requested
    pub async fn run(mut self) {
        info!(
            inbound_slice_ms = self.settings.inbound_slice.as_millis() as u64,
            idle_sleep_ms = self.settings.idle_sleep.as_millis() as u64,
            "🚀 IO_LOOP: Started"
        );

        loop {
            let requested_reconnect = match self.drain_control() {
                Some(request) => request,
                None => break,
            };

            if let Some(reason) = requested_reconnect {
                if !self.recover(&reason, false).await {
                    break;
                }
                continue;
            }

            if !self.connection.is_healthy() {
                if !self.recover("channel closed", true).await {
                    break;
                }
                continue;
            }

            if let Err(e) = self.tick().await {
                warn!(error = %e, "⚠️ IO_LOOP: Transport error, connection will be re-established");
                self.connection.state().mark_closed();
                continue;
            }

            tokio::time::sleep(self.settings.idle_sleep).await;
        }

        self.shutdown().await;
    }

    /// `None` means stop; `Some(Some(reason))` means a reconnect was requested
    fn drain_control(&mut self) -> Option<Option<String>> {
        let mut reconnect = None;
        loop {
            match self.control.try_recv() {
                Ok(IoControl::Shutdown) => return None,
                Ok(IoControl::Reconnect { reason }) => reconnect = Some(reason),
                Err(TryRecvError::Empty) => return Some(reconnect),
                Err(TryRecvError::Disconnected) => return None,
            }
        }
    }

    /// Pause (optionally) and reconnect. Returns false if shutdown arrived meanwhile.
    async fn recover(&mut self, reason: &str, pause: bool) -> bool {
        self.connection.state().mark_closed();
        warn!(
            reason = %reason,
            pause_ms = if pause { self.settings.error_pause.as_millis() as u64 } else { 0 },
            pending_calls = self.pending.len(),
            "🔌 IO_LOOP: Recovering broker connection"
        );

        if pause {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.error_pause) => {}
                control = self.control.recv() => match control {
                    Some(IoControl::Shutdown) | None => return false,
                    Some(IoControl::Reconnect { .. }) => {}
                },
            }
        }

        match self.connection.reconnect().await {
            Ok(()) => {
                IoLoopStats::bump(&self.stats.reconnects);
                info!(
                    generation = self.connection.state().generation(),
                    "✅ IO_LOOP: Broker connection restored"
                );
            }
            Err(e) => {
                error!(error = %e, "❌ IO_LOOP: Reconnect failed, will retry");
            }
        }
        true
    }

    async fn tick(&mut self) -> BrokerResult<()> {
        IoLoopStats::bump(&self.stats.ticks);
        self.pump_inbound().await?;
        // A pump that completed, even an empty one, proves the channel is alive
        self.connection.state().record_activity();
        self.drain_outbound().await
    }

    async fn pump_inbound(&mut self) -> BrokerResult<()> {
        let deadline = Instant::now() + self.settings.inbound_slice;
        let mut handled = 0;

        while handled < self.settings.max_deliveries_per_tick {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait_for_jobs = self.carried.is_none() && !self.jobs_closed;

            let event = {
                let Some(channel) = self.connection.channel_mut() else {
                    return Err(BrokerError::channel_closed());
                };
                let jobs = &mut self.jobs;
                tokio::select! {
                    biased;
                    delivery = channel.next_delivery(remaining) => InboundEvent::Delivery(delivery),
                    job = jobs.recv(), if wait_for_jobs => InboundEvent::Job(job),
                }
            };

            match event {
                InboundEvent::Delivery(result) => match result? {
                    Some(delivery) => {
                        handled += 1;
                        self.handle_delivery(delivery).await?;
                    }
                    None => break,
                },
                InboundEvent::Job(Some(job)) => {
                    self.carried = Some(job);
                    break;
                }
                InboundEvent::Job(None) => {
                    self.jobs_closed = true;
                }
            }

            if remaining.is_zero() {
                break;
            }
        }
        Ok(())
    }

    async fn handle_delivery(&mut self, delivery: Delivery) -> BrokerResult<()> {
        self.connection.state().record_activity();
        let outcome = self.router.route(&delivery);
        self.stats.record_route(&outcome);

        let Some(channel) = self.connection.channel_mut() else {
            return Err(BrokerError::channel_closed());
        };
        let settled = match outcome.disposition() {
            Disposition::Ack => channel.ack(delivery.delivery_tag).await,
            Disposition::Reject => channel.reject(delivery.delivery_tag).await,
        };

        match settled {
            Ok(()) => Ok(()),
            Err(e) if e.is_transport_failure() => Err(e),
            Err(e) => {
                warn!(
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "⚠️ IO_LOOP: Failed to settle delivery"
                );
                Ok(())
            }
        }
    }

    async fn drain_outbound(&mut self) -> BrokerResult<()> {
        if let Some(job) = self.carried.take() {
            self.execute(job).await?;
        }

        for _ in 0..self.settings.max_jobs_per_tick {
            match self.jobs.try_recv() {
                Ok(job) => self.execute(job).await?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.jobs_closed = true;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn execute(&mut self, job: PublishJob) -> BrokerResult<()> {
        if job.is_synchronous() && !self.pending.contains(job.correlation_id()) {
            // Caller already gave up; publishing would only produce an orphan reply
            IoLoopStats::bump(&self.stats.skipped_jobs);
            debug!(
                correlation_id = %job.correlation_id(),
                destination = %job.destination(),
                "Skipping request whose caller is gone"
            );
            return Ok(());
        }

        let properties = job.properties(self.connection.callback_queue());
        if let PublishJob::SynchronousRequest {
            reply_hint: ReplyHint::CallbackQueue,
            ..
        } = &job
        {
            if properties.reply_to.is_none() {
                self.fail_job(&job, "no callback queue declared on this connection");
                return Ok(());
            }
        }

        let Some(channel) = self.connection.channel_mut() else {
            self.fail_job(&job, "broker channel unavailable");
            return Err(BrokerError::channel_closed());
        };

        match channel
            .publish(job.routing_key(), job.body(), &properties)
            .await
        {
            Ok(()) => {
                IoLoopStats::bump(&self.stats.published);
                self.connection.state().record_activity();
                debug!(
                    correlation_id = %job.correlation_id(),
                    destination = %job.destination(),
                    routing_key = %job.routing_key(),
                    synchronous = job.is_synchronous(),
                    "📤 IO_LOOP: Published"
                );
                Ok(())
            }
            Err(e) => {
                IoLoopStats::bump(&self.stats.publish_failures);
                self.fail_job(&job, &e.to_string());
                if e.is_transport_failure() {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Resolve a synchronous job's caller with `PublishFailure`; log fire-and-forget
    fn fail_job(&self, job: &PublishJob, message: &str) {
        match job {
            PublishJob::SynchronousRequest {
                destination,
                correlation_id,
                ..
            } => {
                warn!(
                    correlation_id = %correlation_id,
                    destination = %destination,
                    error = %message,
                    "⚠️ IO_LOOP: Publish failed, failing caller"
                );
                self.pending.resolve(
                    correlation_id,
                    Err(CoordinatorError::publish_failure(destination.as_str(), message)),
                );
            }
            PublishJob::FireAndForget {
                destination,
                correlation_id,
                ..
            } => {
                warn!(
                    correlation_id = %correlation_id,
                    destination = %destination,
                    error = %message,
                    "⚠️ IO_LOOP: Fire-and-forget publish failed, message dropped"
                );
            }
        }
    }

    async fn shutdown(mut self) {
        self.jobs.close();
        let mut dropped = 0;
        while let Ok(job) = self.jobs.try_recv() {
            if let PublishJob::SynchronousRequest { correlation_id, .. } = &job {
                self.pending
                    .resolve(correlation_id, Err(CoordinatorError::ShuttingDown));
            }
            dropped += 1;
        }
        let failed = self.pending.fail_all(|| CoordinatorError::ShuttingDown);
        self.connection.close().await;

        info!(
            dropped_jobs = dropped,
            failed_calls = failed,
            stats = ?self.stats.snapshot(),
            "🛑 IO_LOOP: Stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BackoffStrategy, ConnectionState, ReconnectPolicy, Topology};
    use crate::messaging::InMemoryBroker;
    use serde_json::json;

    struct Harness {
        broker: InMemoryBroker,
        pending: Arc<PendingCallTable>,
        jobs: mpsc::Sender<PublishJob>,
        control: mpsc::UnboundedSender<IoControl>,
        stats: Arc<IoLoopStats>,
        handle: JoinHandle<()>,
    }

    async fn start() -> Harness {
        let broker = InMemoryBroker::new();
        let config = CoordinatorConfig::default();
        let pending = Arc::new(PendingCallTable::new());
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (jobs_tx, jobs_rx) = mpsc::channel(16);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(IoLoopStats::default());

        let mut connection = BrokerConnection::new(
            Arc::new(broker.connector()),
            Arc::new(Topology::from_config(&config)),
            ReconnectPolicy {
                max_attempts: 3,
                strategy: BackoffStrategy::Fixed,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            Arc::new(ConnectionState::new()),
        );
        connection.connect().await.unwrap();

        let settings = IoLoopSettings {
            inbound_slice: Duration::from_millis(20),
            idle_sleep: Duration::from_millis(1),
            max_deliveries_per_tick: 64,
            max_jobs_per_tick: 64,
            error_pause: Duration::from_millis(5),
        };
        let io_loop = IoLoop::new(
            connection,
            jobs_rx,
            control_rx,
            ResponseRouter::new(pending.clone(), events_tx),
            pending.clone(),
            settings,
            stats.clone(),
        );

        Harness {
            broker,
            pending,
            jobs: jobs_tx,
            control: control_tx,
            stats,
            handle: io_loop.spawn(),
        }
    }

    fn crawl_request(correlation_id: &str) -> PublishJob {
        PublishJob::SynchronousRequest {
            destination: "crawl".to_string(),
            routing_key: "crawling_request".to_string(),
            correlation_id: correlation_id.to_string(),
            body: json!({"correlationId": correlation_id}).to_string().into_bytes(),
            reply_hint: ReplyHint::SharedQueue("crawling_response".to_string()),
        }
    }

    #[tokio::test]
    async fn test_publishes_and_routes_reply() {
        let h = start().await;
        let rx = h
            .pending
            .register("c-1", "crawl", Duration::from_secs(5))
            .unwrap();
        h.jobs.send(crawl_request("c-1")).await.unwrap();

        let request = h
            .broker
            .take("crawling_request", Duration::from_secs(2))
            .await
            .expect("request published");
        assert_eq!(request.correlation_id.as_deref(), Some("c-1"));
        h.broker
            .publish_json("crawling_response", &json!({"correlationId": "c-1", "ok": true}));

        let reply = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply["ok"], true);
        assert_eq!(h.stats.snapshot().replies_resolved, 1);

        h.control.send(IoControl::Shutdown).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_skips_job_whose_caller_is_gone() {
        let h = start().await;
        h.jobs.send(crawl_request("orphan")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.broker.queue_len("crawling_request"), 0);
        assert_eq!(h.stats.snapshot().skipped_jobs, 1);

        h.control.send(IoControl::Shutdown).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_failure_resolves_caller() {
        let h = start().await;
        h.broker.fail_next_publishes(1);
        let rx = h
            .pending
            .register("c-2", "crawl", Duration::from_secs(5))
            .unwrap();
        h.jobs.send(crawl_request("c-2")).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Err(CoordinatorError::PublishFailure { .. })));

        h.control.send(IoControl::Shutdown).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_recovers_after_sever_and_shutdown_fails_pending() {
        let h = start().await;
        let connects_before = h.broker.connect_count();
        h.broker.sever_connections();

        let deadline = Instant::now() + Duration::from_secs(2);
        while h.stats.snapshot().reconnects == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.stats.snapshot().reconnects, 1);
        assert!(h.broker.connect_count() > connects_before);

        let rx = h
            .pending
            .register("c-3", "crawl", Duration::from_secs(5))
            .unwrap();
        h.control.send(IoControl::Shutdown).unwrap();
        h.handle.await.unwrap();
        assert!(matches!(rx.await.unwrap(), Err(CoordinatorError::ShuttingDown)));
    }
}
