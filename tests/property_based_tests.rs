//! Property-based tests for the task status guard and the pending call table
//!
//! These exercise the invariants that must hold for any event order or any
//! interleaving of resolvers: statuses only move forward along the transition
//! table, replaying events changes nothing, and a pending call resolves once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::json;
use tasker_rpc::coordinator::PendingCallTable;
use tasker_rpc::state_machine::{
    InMemoryTaskStore, StatusEventHandler, StatusUpdateEvent, TaskRecord, TaskStatus, TaskStore,
    TaskUpdate, TransitionOutcome,
};

fn status_strategy() -> impl Strategy<Value = TaskStatus> {
    prop::sample::select(TaskStatus::ALL.to_vec())
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Store holding one task forced into `status`, bypassing the guard
async fn store_with_task(task_id: &str, status: TaskStatus) -> Arc<InMemoryTaskStore> {
    let store = Arc::new(InMemoryTaskStore::new());
    store.insert(TaskRecord::queued(task_id, None)).await.unwrap();
    if status != TaskStatus::Queued {
        assert!(store
            .compare_and_set_status(task_id, &TaskStatus::ALL, status, TaskUpdate::default())
            .await
            .unwrap());
    }
    store
}

/// Position along the only forward path the table permits
fn rank(status: TaskStatus) -> u8 {
    match status {
        TaskStatus::Queued => 0,
        TaskStatus::Processing => 1,
        TaskStatus::Completed | TaskStatus::Failed => 2,
    }
}

proptest! {
    #[test]
    fn prop_only_table_transitions_are_applied(
        current in status_strategy(),
        proposed in status_strategy(),
    ) {
        runtime().block_on(async {
            let store = store_with_task("t", current).await;
            let handler = StatusEventHandler::new(store.clone());

            let outcome = handler
                .apply(&StatusUpdateEvent::new("t", proposed))
                .await
                .unwrap();
            let stored = store.get_status("t").await.unwrap().unwrap();

            if current == proposed {
                prop_assert_eq!(outcome, TransitionOutcome::Duplicate { status: current });
                prop_assert_eq!(stored, current);
            } else if current.can_transition_to(proposed) {
                prop_assert_eq!(outcome, TransitionOutcome::Applied { from: current, to: proposed });
                prop_assert_eq!(stored, proposed);
            } else {
                prop_assert_eq!(outcome, TransitionOutcome::Rejected { from: current, to: proposed });
                prop_assert_eq!(stored, current);
            }
            Ok(())
        })?;
    }

    #[test]
    fn prop_replaying_every_event_changes_nothing(
        events in prop::collection::vec(status_strategy(), 0..12),
    ) {
        runtime().block_on(async {
            let once = store_with_task("t", TaskStatus::Queued).await;
            let twice = store_with_task("t", TaskStatus::Queued).await;
            let once_handler = StatusEventHandler::new(once.clone());
            let twice_handler = StatusEventHandler::new(twice.clone());

            for status in &events {
                let event = StatusUpdateEvent::new("t", *status);
                once_handler.apply(&event).await.unwrap();
                twice_handler.apply(&event).await.unwrap();
                let replay = twice_handler.apply(&event).await.unwrap();
                prop_assert!(!replay.is_applied());
            }

            prop_assert_eq!(
                once.get_status("t").await.unwrap(),
                twice.get_status("t").await.unwrap()
            );
            Ok(())
        })?;
    }

    #[test]
    fn prop_status_never_moves_backwards(
        events in prop::collection::vec(status_strategy(), 1..16),
    ) {
        runtime().block_on(async {
            let store = store_with_task("t", TaskStatus::Queued).await;
            let handler = StatusEventHandler::new(store.clone());
            let mut previous = TaskStatus::Queued;

            for status in events {
                handler
                    .apply(&StatusUpdateEvent::new("t", status).with_result(json!({"n": 1})))
                    .await
                    .unwrap();
                let current = store.get_status("t").await.unwrap().unwrap();
                prop_assert!(rank(current) >= rank(previous));
                if previous.is_terminal() {
                    prop_assert_eq!(current, previous);
                }
                previous = current;
            }
            Ok(())
        })?;
    }

    #[test]
    fn prop_pending_calls_resolve_exactly_once(
        call_count in 1usize..40,
        resolver_threads in 2usize..6,
        sweep in any::<bool>(),
    ) {
        let table = Arc::new(PendingCallTable::new());
        let ids: Vec<String> = (0..call_count).map(|i| format!("call-{i}")).collect();
        let mut receivers: Vec<_> = ids
            .iter()
            .map(|id| table.register(id, "crawl", Duration::ZERO).unwrap())
            .collect();

        let wins = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for thread in 0..resolver_threads {
                let table = table.clone();
                let ids = &ids;
                let wins = &wins;
                scope.spawn(move || {
                    for id in ids {
                        if table.resolve(id, Ok(json!({"thread": thread}))) {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
            if sweep {
                let table = table.clone();
                let wins = &wins;
                scope.spawn(move || {
                    wins.fetch_add(table.sweep_expired(Duration::ZERO), Ordering::SeqCst);
                });
            }
        });

        prop_assert_eq!(wins.load(Ordering::SeqCst), call_count);
        prop_assert!(table.is_empty());
        for receiver in &mut receivers {
            prop_assert!(receiver.try_recv().is_ok());
        }
    }
}
