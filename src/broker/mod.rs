//! # Broker
//!
//! Everything that owns or drives the broker channel: the connection and its
//! shared state, reconnect backoff, the declared queue topology, outbound
//! publish jobs, and the single IoLoop task permitted to touch the channel.

pub mod backoff;
pub mod connection;
pub mod io_loop;
pub mod job;
pub mod topology;

pub use backoff::{BackoffStrategy, ReconnectPolicy};
pub use connection::{BrokerConnection, ConnectionSnapshot, ConnectionState};
pub use io_loop::{IoControl, IoLoop, IoLoopSettings, IoLoopStats, IoLoopStatsSnapshot};
pub use job::{PublishJob, ReplyHint};
pub use topology::{DeclaredTopology, DestinationRoute, ReplyRoute, Topology};
