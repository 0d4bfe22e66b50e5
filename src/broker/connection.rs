//! # Broker Connection
//!
//! Owns the transport channel and its connection lifecycle: bounded-retry
//! connect with backoff, idempotent teardown, and self-healing reconnect that
//! re-declares the topology and re-registers consumers.
//!
//! `ConnectionState` is the shared, lock-light view other components read to
//! decide whether to enqueue or fail fast. Only the connection (driven by the
//! IoLoop) writes to it, apart from activity stamps.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::backoff::ReconnectPolicy;
use super::topology::Topology;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::messaging::{BrokerChannel, BrokerConnector, BrokerResult};

/// Process-scoped connection status
#[derive(Debug)]
pub struct ConnectionState {
    is_open: AtomicBool,
    last_activity: Mutex<Instant>,
    retry_count: AtomicU32,
    /// Bumped on every successful (re)connect
    generation: AtomicU64,
}

/// Point-in-time copy of `ConnectionState`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub is_open: bool,
    pub idle_ms: u64,
    pub retry_count: u32,
    pub generation: u64,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            is_open: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            retry_count: AtomicU32::new(0),
            generation: AtomicU64::new(0),
        }
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }

    /// Time since the last observed inbound or outbound activity
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn record_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn mark_open(&self) {
        self.retry_count.store(0, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.record_activity();
        self.is_open.store(true, Ordering::Release);
    }

    pub(crate) fn mark_closed(&self) {
        self.is_open.store(false, Ordering::Release);
    }

    pub(crate) fn record_failed_attempt(&self) -> u32 {
        self.retry_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            is_open: self.is_open(),
            idle_ms: u64::try_from(self.idle_for().as_millis()).unwrap_or(u64::MAX),
            retry_count: self.retry_count(),
            generation: self.generation(),
        }
    }
}

/// The broker connection and its single channel
pub struct BrokerConnection {
    connector: Arc<dyn BrokerConnector>,
    topology: Arc<Topology>,
    policy: ReconnectPolicy,
    state: Arc<ConnectionState>,
    channel: Option<Box<dyn BrokerChannel>>,
    callback_queue: Option<String>,
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("provider", &self.connector.provider_name())
            .field("policy", &self.policy)
            .field("state", &self.state.snapshot())
            .field("callback_queue", &self.callback_queue)
            .finish()
    }
}

impl BrokerConnection {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        topology: Arc<Topology>,
        policy: ReconnectPolicy,
        state: Arc<ConnectionState>,
    ) -> Self {
        Self {
            connector,
            topology,
            policy,
            state,
            channel: None,
            callback_queue: None,
        }
    }

    /// Open the connection, retrying up to the policy's attempt limit
    pub async fn connect(&mut self) -> CoordinatorResult<()> {
        let max_attempts = self.policy.max_attempts;
        let mut last_error = String::from("no connection attempt made");

        for attempt in 1..=max_attempts {
            match self.open_once().await {
                Ok(()) => {
                    self.state.mark_open();
                    info!(
                        provider = self.connector.provider_name(),
                        attempt = attempt,
                        generation = self.state.generation(),
                        callback_queue = ?self.callback_queue,
                        "✅ BROKER: Connected and topology declared"
                    );
                    return Ok(());
                }
                Err(e) => {
                    let retries = self.state.record_failed_attempt();
                    last_error = e.to_string();
                    warn!(
                        provider = self.connector.provider_name(),
                        attempt = attempt,
                        max_attempts = max_attempts,
                        retry_count = retries,
                        error = %e,
                        "⚠️ BROKER: Connection attempt failed"
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(self.policy.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }

        error!(
            provider = self.connector.provider_name(),
            attempts = max_attempts,
            error = %last_error,
            "❌ BROKER: Connection retries exhausted"
        );
        Err(CoordinatorError::connect(max_attempts, last_error))
    }

    /// Tear down whatever is left of the current channel, then connect again
    pub async fn reconnect(&mut self) -> CoordinatorResult<()> {
        info!(
            provider = self.connector.provider_name(),
            "🔄 BROKER: Reconnecting"
        );
        self.teardown().await;
        self.connect().await
    }

    /// Close the channel and connection; safe to call when already closed
    pub async fn close(&mut self) {
        self.teardown().await;
    }

    /// Channel present and reported open by the transport
    pub fn is_healthy(&self) -> bool {
        self.channel.as_ref().is_some_and(|channel| channel.is_open())
    }

    pub fn channel_mut(&mut self) -> Option<&mut (dyn BrokerChannel + 'static)> {
        self.channel.as_deref_mut()
    }

    /// Name of this connection's callback queue, if the topology needs one
    pub fn callback_queue(&self) -> Option<&str> {
        self.callback_queue.as_deref()
    }

    pub fn state(&self) -> &Arc<ConnectionState> {
        &self.state
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    async fn open_once(&mut self) -> BrokerResult<()> {
        let mut channel = self.connector.open().await?;
        match self.topology.declare(channel.as_mut()).await {
            Ok(declared) => {
                self.callback_queue = declared.callback_queue;
                self.channel = Some(channel);
                Ok(())
            }
            Err(e) => {
                if let Err(close_error) = channel.close().await {
                    debug!(error = %close_error, "Close after failed declaration failed");
                }
                Err(e)
            }
        }
    }

    async fn teardown(&mut self) {
        self.state.mark_closed();
        self.callback_queue = None;
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Channel close during teardown failed");
            }
        }
    }
}
