mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::{json, Value};
use tasker_rpc::coordinator::BrokerCoordinator;
use tasker_rpc::messaging::{InMemoryBroker, PublishProperties};
use tasker_rpc::state_machine::{InMemoryTaskStore, TaskRecord, TaskStatus, TaskStore};
use tasker_rpc::CoordinatorError;
use tokio::time::Instant;

#[tokio::test]
async fn test_crawl_call_round_trip_over_shared_queue() {
    let h = Harness::start().await;
    let worker = spawn_worker(&h.broker, CRAWL_REQUESTS, |request| {
        Some(json!({"success": true, "storeId": request["storeId"]}))
    });

    let reply = h
        .coordinator
        .dispatcher()
        .call("crawl", json!({"storeId": 42}), Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(reply["success"], true);
    assert_eq!(reply["storeId"], 42);
    assert!(h.coordinator.pending_calls().is_empty());

    worker.abort();
    h.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_infer_call_uses_connection_callback_queue() {
    let h = Harness::start().await;

    let caller = {
        let dispatcher = h.coordinator.dispatcher().clone();
        tokio::spawn(async move {
            dispatcher
                .call("infer", json!({"user_input": "pancakes"}), Duration::from_secs(2))
                .await
        })
    };

    let request = h
        .broker
        .take(INFER_REQUESTS, Duration::from_secs(2))
        .await
        .expect("inference request published");
    let reply_to = request.reply_to.clone().expect("reply_to set");
    assert!(reply_to.starts_with("amq.gen-"));
    assert_eq!(request.correlation_id, request.body_correlation_id());
    assert_eq!(request.json().unwrap()["user_input"], "pancakes");

    // The inference worker does not echo the id in the body; properties carry it
    assert!(h.broker.reply(&request, &json!({"recipe": "pancakes", "ingredients": 4})));

    let reply = caller.await.unwrap().unwrap();
    assert_eq!(reply["ingredients"], 4);
    h.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_call_returns_within_timeout_when_worker_never_replies() {
    let h = Harness::start().await;
    let timeout = Duration::from_millis(300);
    let started = Instant::now();

    let err = h
        .coordinator
        .dispatcher()
        .call("crawl", json!({"storeId": 1}), timeout)
        .await
        .unwrap_err();

    let elapsed = started.elapsed();
    assert!(err.is_timeout(), "unexpected error: {err}");
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_millis(500), "took {elapsed:?}");
    assert!(h.coordinator.pending_calls().is_empty());
    h.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_scenario_timeout_then_guarded_status_events() {
    let h = Harness::start().await;

    // A crawl worker that never responds
    let started = Instant::now();
    let err = h
        .coordinator
        .dispatcher()
        .call("crawl", json!({"storeId": 42}), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_millis(5_500));
    assert!(h.coordinator.pending_calls().is_empty());

    h.store
        .insert(TaskRecord::queued("task-1", None))
        .await
        .unwrap();
    h.coordinator
        .dispatcher()
        .dispatch_async("infer", json!({"input": "x"}))
        .unwrap();

    h.broker.publish_json(
        CRAWL_RESPONSES,
        &json!({"eventType": "status_update", "taskId": "task-1", "status": "processing"}),
    );
    let store = h.store.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let store = store.clone();
            async move { store.get_status("task-1").await.unwrap() == Some(TaskStatus::Processing) }
        })
        .await
    );

    h.broker.publish_json(
        CRAWL_RESPONSES,
        &json!({"eventType": "status_update", "taskId": "task-1", "status": "queued"}),
    );
    let coordinator = &h.coordinator;
    assert!(
        wait_until(Duration::from_secs(2), || async move {
            coordinator.health().status_events.dropped >= 1
        })
        .await
    );
    assert_eq!(
        h.store.get_status("task-1").await.unwrap(),
        Some(TaskStatus::Processing)
    );
    h.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_calls_with_instant_replies_are_never_lost() {
    let h = Harness::start().await;
    let worker = spawn_worker(&h.broker, CRAWL_REQUESTS, |request| {
        Some(json!({"echo": request["n"]}))
    });

    let calls: Vec<_> = (0..50)
        .map(|n| {
            let dispatcher = h.coordinator.dispatcher().clone();
            tokio::spawn(async move {
                dispatcher
                    .call("crawl", json!({"n": n}), Duration::from_secs(5))
                    .await
                    .map(|reply| (n, reply))
            })
        })
        .collect();

    for call in calls {
        let (n, reply) = call.await.unwrap().unwrap();
        assert_eq!(reply["echo"], n, "reply routed to the wrong caller");
    }
    assert!(h.coordinator.pending_calls().is_empty());

    worker.abort();
    h.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_service_recovers_after_connection_is_severed() {
    let h = Harness::start().await;
    let worker = spawn_worker(&h.broker, INFER_REQUESTS, |_| Some(json!({"ok": true})));
    let dispatcher = h.coordinator.dispatcher().clone();

    dispatcher
        .call("infer", json!({"user_input": "before"}), Duration::from_secs(2))
        .await
        .unwrap();
    let generation = h.coordinator.health().connection.generation;

    h.broker.sever_connections();

    let coordinator = &h.coordinator;
    assert!(
        wait_until(Duration::from_secs(3), || async move {
            let health = coordinator.health();
            health.healthy && health.connection.generation > generation
        })
        .await,
        "coordinator did not reconnect"
    );
    assert!(h.coordinator.health().io_loop.reconnects >= 1);

    let reply = dispatcher
        .call("infer", json!({"user_input": "after"}), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply["ok"], true);

    worker.abort();
    h.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_requested_reconnect_bumps_generation() {
    let h = Harness::start().await;
    let generation = h.coordinator.health().connection.generation;

    h.coordinator.request_reconnect("operator request").unwrap();

    let coordinator = &h.coordinator;
    assert!(
        wait_until(Duration::from_secs(2), || async move {
            coordinator.health().connection.generation > generation
        })
        .await
    );
    assert!(h.coordinator.is_healthy());
    h.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_publish_failure_fails_call_without_waiting_for_timeout() {
    let h = Harness::start().await;
    h.broker.fail_next_publishes(1);
    let started = Instant::now();

    let err = h
        .coordinator
        .dispatcher()
        .call("crawl", json!({"storeId": 7}), Duration::from_secs(10))
        .await
        .unwrap_err();

    assert!(matches!(err, CoordinatorError::PublishFailure { .. }), "got {err}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(h.coordinator.pending_calls().is_empty());
    assert_eq!(h.coordinator.health().io_loop.publish_failures, 1);
    h.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_late_reply_is_dropped_after_timeout() {
    let h = Harness::start().await;
    let dispatcher = h.coordinator.dispatcher().clone();

    let err = dispatcher
        .call("crawl", json!({"storeId": 3}), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    // The worker finally answers the stale request
    let request = h
        .broker
        .take(CRAWL_REQUESTS, Duration::from_secs(1))
        .await
        .expect("request was published before the timeout");
    let mut late = json!({"success": true});
    late["correlationId"] = Value::String(request.body_correlation_id().unwrap());
    h.broker.publish_json(CRAWL_RESPONSES, &late);

    let coordinator = &h.coordinator;
    assert!(
        wait_until(Duration::from_secs(2), || async move {
            coordinator.health().io_loop.unmatched >= 1
        })
        .await
    );
    assert_eq!(h.broker.queue_len(CRAWL_RESPONSES), 0);
    h.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_undecodable_reply_fails_its_caller() {
    let h = Harness::start().await;
    let caller = {
        let dispatcher = h.coordinator.dispatcher().clone();
        tokio::spawn(async move {
            dispatcher
                .call("infer", json!({"user_input": "x"}), Duration::from_secs(5))
                .await
        })
    };

    let request = h
        .broker
        .take(INFER_REQUESTS, Duration::from_secs(2))
        .await
        .unwrap();
    let mut properties = PublishProperties::persistent_json();
    properties.correlation_id = request.correlation_id.clone();
    h.broker.publish(
        request.reply_to.as_deref().unwrap(),
        b"<html>502 Bad Gateway</html>".to_vec(),
        &properties,
    );

    let err = caller.await.unwrap().unwrap_err();
    assert!(matches!(err, CoordinatorError::MalformedMessage { .. }));
    let broker = &h.broker;
    assert!(wait_until(Duration::from_secs(1), || async move { broker.rejected_count() == 1 }).await);
    h.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_fails_outstanding_calls_and_rejects_new_ones() {
    let h = Harness::start().await;
    let dispatcher = h.coordinator.dispatcher().clone();

    let caller = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .call("crawl", json!({}), Duration::from_secs(30))
                .await
        })
    };
    let pending = h.coordinator.pending_calls().clone();
    assert!(
        wait_until(Duration::from_secs(1), || {
            let pending = pending.clone();
            async move { pending.len() == 1 }
        })
        .await
    );

    h.coordinator.shutdown().await;

    assert!(matches!(
        caller.await.unwrap(),
        Err(CoordinatorError::ShuttingDown)
    ));
    assert!(matches!(
        dispatcher.dispatch_async("crawl", json!({})),
        Err(CoordinatorError::ShuttingDown)
    ));
    assert!(!h.coordinator.is_healthy());

    // Second shutdown is a no-op
    h.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_startup_fails_when_connect_retries_are_exhausted() {
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(10);

    let result = BrokerCoordinator::start(
        &fast_config(),
        Arc::new(broker.connector()),
        Arc::new(InMemoryTaskStore::new()),
    )
    .await;

    match result {
        Err(CoordinatorError::Connect { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected connect error, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_fail_fast_mode_rejects_calls_while_disconnected() {
    let mut config = fast_config();
    config.calls.fail_fast_when_disconnected = true;
    config.reconnect.io_error_pause_ms = 2_000;
    let h = Harness::start_with(config).await;

    h.broker.sever_connections();
    let coordinator = &h.coordinator;
    assert!(wait_until(Duration::from_secs(1), || async move { !coordinator.is_healthy() }).await);

    assert!(matches!(
        h.coordinator.dispatcher().dispatch_async("crawl", json!({})),
        Err(CoordinatorError::BrokerUnavailable)
    ));
    h.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_quiet_connection_is_not_treated_as_stale() {
    let mut config = fast_config();
    config.health.stale_after_seconds = 1;
    let h = Harness::start_with(config).await;
    let generation = h.coordinator.health().connection.generation;

    // No calls, no events: the IoLoop keeps pumping an empty channel
    tokio::time::sleep(Duration::from_millis(3_200)).await;

    let health = h.coordinator.health();
    assert!(health.healthy);
    assert_eq!(health.connection.generation, generation);
    assert_eq!(health.io_loop.reconnects, 0);
    assert!(health.connection.idle_ms < 1_000, "idle for {}ms", health.connection.idle_ms);
    h.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_starts_when_worker_owns_request_queue_with_other_arguments() {
    let broker = InMemoryBroker::new();
    broker.declare_worker_queue(INFER_REQUESTS, None);

    let coordinator = BrokerCoordinator::start(
        &fast_config(),
        Arc::new(broker.connector()),
        Arc::new(InMemoryTaskStore::new()),
    )
    .await
    .unwrap();
    assert!(coordinator.is_healthy());
    assert_eq!(broker.connect_count(), 1);

    let worker = spawn_worker(&broker, INFER_REQUESTS, |_| Some(json!({"ok": true})));
    let reply = coordinator
        .dispatcher()
        .call("infer", json!({"user_input": "soup"}), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply["ok"], true);

    worker.abort();
    coordinator.shutdown().await;
}
