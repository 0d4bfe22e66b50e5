//! # Task State Machine
//!
//! Applies worker status events to task records under the transition guard.
//! Every anomaly an at-least-once, unordered delivery model produces
//! (unknown task, duplicate, stale or disallowed transition, lost race) is an
//! ordinary outcome here, not an error. Only task-store failures are errors.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use super::events::StatusUpdateEvent;
use super::persistence::{TaskStore, TaskUpdate};
use super::states::TaskStatus;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::logging::log_status_transition;

/// What applying one event did to the task record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied { from: TaskStatus, to: TaskStatus },
    /// No record with that task id
    UnknownTask,
    /// Event repeats the current status
    Duplicate { status: TaskStatus },
    /// Not in the allowed-transition table; record left unchanged
    Rejected { from: TaskStatus, to: TaskStatus },
    /// Allowed when read, but another writer changed the status first
    Superseded { expected: TaskStatus, to: TaskStatus },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::UnknownTask => "unknown_task",
            Self::Duplicate { .. } => "duplicate",
            Self::Rejected { .. } => "rejected",
            Self::Superseded { .. } => "superseded",
        }
    }
}

impl fmt::Display for TransitionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Guarded writer of task status
#[derive(Clone)]
pub struct StatusEventHandler {
    store: Arc<dyn TaskStore>,
}

impl fmt::Debug for StatusEventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusEventHandler")
            .field("store", &self.store.store_name())
            .finish()
    }
}

impl StatusEventHandler {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Apply one event
    pub async fn apply(&self, event: &StatusUpdateEvent) -> CoordinatorResult<TransitionOutcome> {
        let task_id = event.task_id.as_str();
        let to = event.status;

        let Some(from) = self.store.get_status(task_id).await? else {
            debug!(task_id = %task_id, status = %to, "Status event for unknown task dropped");
            log_status_transition(task_id, None, to.as_str(), "unknown_task", None);
            return Ok(TransitionOutcome::UnknownTask);
        };

        if from == to {
            debug!(task_id = %task_id, status = %to, "Duplicate status event ignored");
            return Ok(TransitionOutcome::Duplicate { status: to });
        }

        if let Err(rejection) = Self::validate_transition(task_id, from, to) {
            warn!(
                task_id = %task_id,
                error = %rejection,
                "⚠️ TASK_STATE: Disallowed transition dropped"
            );
            log_status_transition(task_id, Some(from.as_str()), to.as_str(), "rejected", None);
            return Ok(TransitionOutcome::Rejected { from, to });
        }

        let update = TaskUpdate {
            result: event.result.clone(),
            error: event.error.clone(),
        };
        let applied = self
            .store
            .compare_and_set_status(task_id, &[from], to, update)
            .await?;

        if applied {
            log_status_transition(task_id, Some(from.as_str()), to.as_str(), "applied", None);
            Ok(TransitionOutcome::Applied { from, to })
        } else {
            warn!(
                task_id = %task_id,
                expected = %from,
                to = %to,
                "⚠️ TASK_STATE: Concurrent update won, event dropped"
            );
            log_status_transition(
                task_id,
                Some(from.as_str()),
                to.as_str(),
                "superseded",
                Some("status changed between read and write"),
            );
            Ok(TransitionOutcome::Superseded { expected: from, to })
        }
    }

    /// Check a transition against the table
    pub fn validate_transition(task_id: &str, from: TaskStatus, to: TaskStatus) -> CoordinatorResult<()> {
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(CoordinatorError::invalid_transition(task_id, from, to))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{InMemoryTaskStore, TaskRecord};
    use serde_json::json;

    async fn handler_with(task_id: &str) -> (StatusEventHandler, Arc<InMemoryTaskStore>) {
        let store = Arc::new(InMemoryTaskStore::new());
        store.insert(TaskRecord::queued(task_id, None)).await.unwrap();
        (StatusEventHandler::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_happy_path_transitions() {
        let (handler, store) = handler_with("t-1").await;

        let outcome = handler
            .apply(&StatusUpdateEvent::new("t-1", TaskStatus::Processing))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TransitionOutcome::Applied {
                from: TaskStatus::Queued,
                to: TaskStatus::Processing
            }
        );

        let done = StatusUpdateEvent::new("t-1", TaskStatus::Completed).with_result(json!({"n": 1}));
        assert!(handler.apply(&done).await.unwrap().is_applied());

        let record = store.get("t-1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result, Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn test_stale_processing_after_completed_is_rejected() {
        let (handler, store) = handler_with("t-1").await;
        for status in [TaskStatus::Processing, TaskStatus::Completed] {
            handler.apply(&StatusUpdateEvent::new("t-1", status)).await.unwrap();
        }

        let outcome = handler
            .apply(&StatusUpdateEvent::new("t-1", TaskStatus::Processing))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TransitionOutcome::Rejected {
                from: TaskStatus::Completed,
                to: TaskStatus::Processing
            }
        );
        assert_eq!(store.get_status("t-1").await.unwrap(), Some(TaskStatus::Completed));
    }

    #[tokio::test]
    async fn test_unknown_task_and_duplicate_are_noops() {
        let (handler, _store) = handler_with("t-1").await;

        let outcome = handler
            .apply(&StatusUpdateEvent::new("ghost", TaskStatus::Processing))
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::UnknownTask);

        let outcome = handler
            .apply(&StatusUpdateEvent::new("t-1", TaskStatus::Queued))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TransitionOutcome::Duplicate {
                status: TaskStatus::Queued
            }
        );
    }

    #[test]
    fn test_validate_transition_error() {
        let err = StatusEventHandler::validate_transition("t-9", TaskStatus::Failed, TaskStatus::Queued)
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidTransition { .. }));
        assert!(err.to_string().contains("failed -> queued"));
    }
}
