// Task status state machine
//
// Converts asynchronous worker progress events into guarded updates of durable
// task records. Delivery is at-least-once and unordered, so the transition
// table, not arrival order, decides what lands.

pub mod events;
pub mod persistence;
pub mod processor;
pub mod states;
pub mod task_state_machine;

pub use events::StatusUpdateEvent;
#[cfg(feature = "postgres")]
pub use persistence::PgTaskStore;
pub use persistence::{
    InMemoryTaskStore, TaskRecord, TaskStore, TaskStoreError, TaskStoreResult, TaskUpdate,
};
pub use processor::{ProcessorStats, ProcessorStatsSnapshot, StatusEventProcessor};
pub use states::TaskStatus;
pub use task_state_machine::{StatusEventHandler, TransitionOutcome};
