use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::TryStreamExt;
use serde_json::json;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use keel_core::config::{RetryConfig, WorkerConfig};
use keel_core::store::WorkflowRepository;
use keel_core::workflow::{
    ActivityError, ActivityFn, ActivityInfo, EventCategory, EventStatus, StepKind, StepStatus,
    WorkflowDefinition, WorkflowStatus, PANIC_ERROR_CLASS, TIMEOUT_ERROR_CLASS,
    UNKNOWN_ACTIVITY_CLASS,
};
use keel_core::{KeelError, RetryPolicy};
use keel_runtime::engine::ExecutorConfig;
use keel_runtime::{
    MemoryStore, Registry, StatusView, StepExecutor, StepOutcome, Worker, WorkflowClient,
};

struct Harness {
    store: Arc<dyn WorkflowRepository>,
    registry: Arc<Registry>,
    client: WorkflowClient,
    worker: Worker,
}

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        id: Some("test-worker".into()),
        poll_interval_ms: 10,
        batch_size: 10,
        max_concurrent: 8,
        lease_secs: 30,
        activity_timeout_secs: 5,
        shutdown_timeout_secs: 2,
        commit_retries: 5,
    }
}

fn harness(registry: Registry) -> Harness {
    let store: Arc<dyn WorkflowRepository> = Arc::new(MemoryStore::new());
    let registry = Arc::new(registry);
    let client = WorkflowClient::new(store.clone(), registry.clone(), 5);
    let worker = Worker::new(
        worker_config(),
        &RetryConfig::default(),
        store.clone(),
        registry.clone(),
    );
    Harness {
        store,
        registry,
        client,
        worker,
    }
}

fn echo(registry: &mut Registry, name: &str) {
    registry.register_fn(name, |input| async move { Ok(input) }).unwrap();
}

/// Poll until the instance reaches a terminal status.
async fn drive(h: &Harness, id: Uuid) -> StatusView {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        h.worker.poll_once().await.unwrap();
        let status = h.client.get_status(id).await.unwrap();
        if status.status.is_terminal() {
            return status;
        }
        assert!(Instant::now() < deadline, "workflow did not finish: {:?}", status);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_activity_sleep_activity_round_trip() {
    let mut registry = Registry::new();
    registry
        .register_fn("reserve", |input| async move {
            Ok(json!({ "reserved": input["order"] }))
        })
        .unwrap();
    registry
        .register_fn("ship", |input| async move {
            Ok(json!({ "shipped": input["reserved"] }))
        })
        .unwrap();
    registry
        .register_workflow(
            WorkflowDefinition::builder("order")
                .activity("reserve")
                .sleep(Duration::from_secs(2))
                .activity("ship")
                .build()
                .unwrap(),
        )
        .unwrap();
    let h = harness(registry);

    let id = h.client.submit("order", json!({ "order": 7 })).await.unwrap();
    let status = drive(&h, id).await;

    assert_eq!(status.status, WorkflowStatus::Completed);
    assert_eq!(status.output, Some(json!({ "shipped": 7 })));
    assert!(status.steps.iter().all(|s| s.status == StepStatus::Succeeded));

    let events = h.client.get_events(id).await.unwrap();
    let shape: Vec<(EventCategory, EventStatus)> =
        events.iter().map(|e| (e.category, e.status)).collect();
    assert_eq!(
        shape,
        vec![
            (EventCategory::Workflow, EventStatus::Started),
            (EventCategory::Activity, EventStatus::Succeeded),
            (EventCategory::Sleep, EventStatus::Succeeded),
            (EventCategory::Activity, EventStatus::Succeeded),
            (EventCategory::Workflow, EventStatus::Succeeded),
        ]
    );
    assert_eq!(events[1].name, "reserve");
    assert_eq!(events[3].name, "ship");
    for event in &events {
        assert!(event.ended_at.unwrap() >= event.started_at);
    }
    let slept = events[2].duration().unwrap();
    assert!(slept >= chrono::Duration::seconds(2), "slept {:?}", slept);
    assert_eq!(events[0].started_at, events[0].ended_at.unwrap());

    let timeline = h.client.timeline(id).await.unwrap();
    assert_eq!(timeline.len(), 3);
    assert!(timeline.iter().all(|e| e.category != EventCategory::Workflow));

    let streamed: Vec<_> = h.client.stream_events(id).try_collect().await.unwrap();
    assert_eq!(streamed, events);
}

#[tokio::test]
async fn test_non_retryable_error_fails_after_one_attempt() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let mut registry = Registry::new();
    registry
        .register_activity(
            ActivityInfo::new("validate").with_retry(RetryPolicy::default().with_non_retryable("validation")),
            ActivityFn::new(move |_input| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ActivityError::new("validation", "order has no items"))
                }
            }),
        )
        .unwrap();
    echo(&mut registry, "ship");
    registry
        .register_workflow(
            WorkflowDefinition::builder("order")
                .activity("validate")
                .activity("ship")
                .build()
                .unwrap(),
        )
        .unwrap();
    let h = harness(registry);

    let id = h.client.submit("order", json!({})).await.unwrap();
    let status = drive(&h, id).await;

    assert_eq!(status.status, WorkflowStatus::Failed);
    let error = status.error.unwrap();
    assert_eq!(error.class, "validation");
    assert_eq!(error.message, "order has no items");
    assert_eq!(status.steps.len(), 1);
    assert_eq!(status.steps[0].attempts, 1);
    assert_eq!(status.steps[0].status, StepStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Stays failed.
    assert!(h.worker.poll_once().await.unwrap().is_empty());
    assert_eq!(
        h.client.get_status(id).await.unwrap().status,
        WorkflowStatus::Failed
    );

    let events = h.client.get_events(id).await.unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.category, EventCategory::Workflow);
    assert_eq!(last.status, EventStatus::Failed);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let mut registry = Registry::new();
    registry
        .register_activity(
            ActivityInfo::new("charge").with_retry(RetryPolicy::fixed(5, Duration::from_millis(20))),
            ActivityFn::new(move |input| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ActivityError::transient("gateway unavailable"))
                    } else {
                        Ok(input)
                    }
                }
            }),
        )
        .unwrap();
    registry
        .register_workflow(
            WorkflowDefinition::builder("payment")
                .activity("charge")
                .build()
                .unwrap(),
        )
        .unwrap();
    let h = harness(registry);

    let id = h.client.submit("payment", json!({ "amount": 10 })).await.unwrap();
    let status = drive(&h, id).await;

    assert_eq!(status.status, WorkflowStatus::Completed);
    assert_eq!(status.output, Some(json!({ "amount": 10 })));
    assert_eq!(status.steps[0].attempts, 3);

    let retries = h
        .client
        .timeline(id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.status == EventStatus::Retrying)
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let mut registry = Registry::new();
    registry
        .register_activity(
            ActivityInfo::new("charge").with_retry(RetryPolicy::fixed(2, Duration::from_millis(10))),
            ActivityFn::new(|_input| async move { Err(ActivityError::transient("still down")) }),
        )
        .unwrap();
    registry
        .register_workflow(
            WorkflowDefinition::builder("payment")
                .activity("charge")
                .build()
                .unwrap(),
        )
        .unwrap();
    let h = harness(registry);

    let id = h.client.submit("payment", json!({})).await.unwrap();
    let status = drive(&h, id).await;

    assert_eq!(status.status, WorkflowStatus::Failed);
    assert_eq!(status.steps[0].attempts, 2);
    assert_eq!(status.error.unwrap().class, "transient");
}

#[tokio::test]
async fn test_signal_delivery() {
    let mut registry = Registry::new();
    echo(&mut registry, "ship");
    registry
        .register_workflow(
            WorkflowDefinition::builder("approval")
                .signal("approved")
                .activity("ship")
                .build()
                .unwrap(),
        )
        .unwrap();
    let h = harness(registry);

    let id = h.client.submit("approval", json!({})).await.unwrap();
    assert!(h.worker.poll_once().await.unwrap().is_empty());
    assert_eq!(
        h.client.get_status(id).await.unwrap().steps[0].status,
        StepStatus::Pending
    );

    let before = h.client.get_events(id).await.unwrap().len();
    let err = h
        .client
        .signal(id, "rejected", json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, KeelError::NoMatchingWaiter { .. }));
    assert_eq!(h.client.get_events(id).await.unwrap().len(), before);

    h.client
        .signal(id, "approved", json!({ "by": "ops" }))
        .await
        .unwrap();
    assert_eq!(
        h.client.get_status(id).await.unwrap().steps[0].status,
        StepStatus::Ready
    );

    let outcomes = h.worker.poll_once().await.unwrap();
    assert_eq!(outcomes, vec![StepOutcome::Succeeded]);

    let status = drive(&h, id).await;
    assert_eq!(status.status, WorkflowStatus::Completed);
    assert_eq!(status.output, Some(json!({ "by": "ops" })));

    // The waiter is gone once delivered.
    let err = h
        .client
        .signal(id, "approved", json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, KeelError::NoMatchingWaiter { .. }));
}

#[tokio::test]
async fn test_signal_before_step_is_reached_is_rejected() {
    let mut registry = Registry::new();
    echo(&mut registry, "prepare");
    registry
        .register_workflow(
            WorkflowDefinition::builder("approval")
                .activity("prepare")
                .signal("approved")
                .build()
                .unwrap(),
        )
        .unwrap();
    let h = harness(registry);

    let id = h.client.submit("approval", json!({})).await.unwrap();
    let err = h.client.signal(id, "approved", json!(true)).await.unwrap_err();
    assert!(matches!(err, KeelError::NoMatchingWaiter { .. }));

    h.worker.poll_once().await.unwrap();
    h.client.signal(id, "approved", json!(true)).await.unwrap();
    let status = drive(&h, id).await;
    assert_eq!(status.output, Some(json!(true)));
}

#[tokio::test]
async fn test_cancel_mid_flight() {
    let gate = Arc::new(Notify::new());
    let after_calls = Arc::new(AtomicUsize::new(0));

    let mut registry = Registry::new();
    let release = gate.clone();
    registry
        .register_fn("slow", move |input| {
            let release = release.clone();
            async move {
                release.notified().await;
                Ok(input)
            }
        })
        .unwrap();
    let counter = after_calls.clone();
    registry
        .register_fn("after", move |input| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(input)
            }
        })
        .unwrap();
    registry
        .register_workflow(
            WorkflowDefinition::builder("long")
                .activity("slow")
                .activity("after")
                .build()
                .unwrap(),
        )
        .unwrap();
    let h = Arc::new(harness(registry));

    let id = h.client.submit("long", json!({})).await.unwrap();

    let polling = {
        let h = h.clone();
        tokio::spawn(async move { h.worker.poll_once().await })
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while h.client.get_status(id).await.unwrap().steps[0].status != StepStatus::Running {
        assert!(Instant::now() < deadline, "step was never claimed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    h.client.cancel(id).await.unwrap();
    gate.notify_one();

    let outcomes = polling.await.unwrap().unwrap();
    assert_eq!(outcomes, vec![StepOutcome::Succeeded]);

    let status = h.client.get_status(id).await.unwrap();
    assert_eq!(status.status, WorkflowStatus::Cancelled);
    assert_eq!(status.steps.len(), 1);
    assert_eq!(status.steps[0].status, StepStatus::Succeeded);

    assert!(h.worker.poll_once().await.unwrap().is_empty());
    assert_eq!(after_calls.load(Ordering::SeqCst), 0);

    let events = h.client.get_events(id).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.category == EventCategory::Workflow && e.status == EventStatus::Cancelled));

    // Cancelling again is a no-op.
    h.client.cancel(id).await.unwrap();
    assert_eq!(h.client.get_events(id).await.unwrap().len(), events.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claimers_get_exclusive_claim() {
    let mut registry = Registry::new();
    echo(&mut registry, "work");
    registry
        .register_workflow(
            WorkflowDefinition::builder("single")
                .activity("work")
                .build()
                .unwrap(),
        )
        .unwrap();
    let h = harness(registry);
    h.client.submit("single", json!({})).await.unwrap();

    let mut handles = Vec::new();
    for n in 0..8 {
        let store = h.store.clone();
        handles.push(tokio::spawn(async move {
            store
                .claim_batch(&format!("claimer-{}", n), 1, Duration::from_secs(30))
                .await
                .unwrap()
        }));
    }

    let mut claimed = 0;
    for handle in handles {
        claimed += handle.await.unwrap().len();
    }
    assert_eq!(claimed, 1);
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed_and_stale_commit_rejected() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let mut registry = Registry::new();
    registry
        .register_fn("work", move |input| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(input)
            }
        })
        .unwrap();
    registry
        .register_workflow(
            WorkflowDefinition::builder("single")
                .activity("work")
                .build()
                .unwrap(),
        )
        .unwrap();
    let h = harness(registry);
    let id = h.client.submit("single", json!("x")).await.unwrap();

    let lease = Duration::from_millis(50);
    let first = h.store.claim_batch("crashed", 1, lease).await.unwrap().remove(0);
    assert!(h.store.claim_batch("other", 1, lease).await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(80)).await;
    let second = h
        .store
        .claim_batch("rescuer", 1, Duration::from_secs(30))
        .await
        .unwrap()
        .remove(0);
    assert_eq!(second.step.seq, first.step.seq);
    assert_ne!(second.token(), first.token());

    let executor = StepExecutor::new(
        h.store.clone(),
        h.registry.clone(),
        ExecutorConfig {
            worker_id: "crashed".into(),
            lease,
            heartbeat_interval: Duration::from_millis(15),
            activity_timeout: Duration::from_secs(5),
            commit_retries: 3,
            retry: RetryPolicy::default(),
        },
    );
    assert_eq!(executor.execute(&first).await.unwrap(), StepOutcome::LeaseLost);
    assert_eq!(executor.execute(&second).await.unwrap(), StepOutcome::Succeeded);

    let status = h.client.get_status(id).await.unwrap();
    assert_eq!(status.status, WorkflowStatus::Completed);
    assert_eq!(status.steps[0].attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_uncommitted_claim_becomes_claimable_after_expiry() {
    let mut registry = Registry::new();
    echo(&mut registry, "work");
    registry
        .register_workflow(
            WorkflowDefinition::builder("single")
                .activity("work")
                .build()
                .unwrap(),
        )
        .unwrap();
    let h = harness(registry);
    let id = h.client.submit("single", json!(1)).await.unwrap();

    h.store
        .claim_batch("crashed", 1, Duration::from_millis(30))
        .await
        .unwrap();
    assert!(h.worker.poll_once().await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(
        h.worker.poll_once().await.unwrap(),
        vec![StepOutcome::Succeeded]
    );
    assert_eq!(
        h.client.get_status(id).await.unwrap().status,
        WorkflowStatus::Completed
    );
}

#[tokio::test]
async fn test_cancel_closes_step_abandoned_by_crashed_worker() {
    let mut registry = Registry::new();
    echo(&mut registry, "work");
    registry
        .register_workflow(
            WorkflowDefinition::builder("single")
                .activity("work")
                .build()
                .unwrap(),
        )
        .unwrap();
    let h = harness(registry);
    let id = h.client.submit("single", json!(1)).await.unwrap();

    h.store
        .claim_batch("crashed", 1, Duration::from_millis(20))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.client.cancel(id).await.unwrap();

    let status = h.client.get_status(id).await.unwrap();
    assert_eq!(status.status, WorkflowStatus::Cancelled);
    assert_eq!(status.steps[0].status, StepStatus::Cancelled);
    for _ in 0..3 {
        assert!(h.worker.poll_once().await.unwrap().is_empty());
    }
    assert_eq!(
        h.client.get_status(id).await.unwrap().steps[0].status,
        StepStatus::Cancelled
    );
}

#[tokio::test]
async fn test_activity_panic_consumes_retry_budget() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let mut registry = Registry::new();
    registry
        .register_activity(
            ActivityInfo::new("explode").with_retry(RetryPolicy::no_retry()),
            ActivityFn::new(move |input: serde_json::Value| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if input["ledger"].is_null() {
                        panic!("ledger corrupted");
                    }
                    Ok(input)
                }
            }),
        )
        .unwrap();
    registry
        .register_workflow(
            WorkflowDefinition::builder("fragile")
                .activity("explode")
                .build()
                .unwrap(),
        )
        .unwrap();
    let h = harness(registry);

    let id = h.client.submit("fragile", json!({})).await.unwrap();
    let status = drive(&h, id).await;

    assert_eq!(status.status, WorkflowStatus::Failed);
    assert_eq!(status.steps[0].attempts, 1);
    let error = status.error.unwrap();
    assert_eq!(error.class, PANIC_ERROR_CLASS);
    assert!(error.message.contains("ledger corrupted"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_await_detached_activity() {
    let mut registry = Registry::new();
    registry
        .register_fn("audit", |input| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(json!({ "audited": input }))
        })
        .unwrap();
    registry.register_fn("charge", |_input| async move { Ok(json!("charged")) }).unwrap();
    registry
        .register_workflow(
            WorkflowDefinition::builder("checkout")
                .detached_activity("audit")
                .activity("charge")
                .await_step(0)
                .build()
                .unwrap(),
        )
        .unwrap();
    let h = harness(registry);

    let id = h.client.submit("checkout", json!(5)).await.unwrap();
    let initial = h.client.get_status(id).await.unwrap();
    assert_eq!(initial.steps.len(), 2);

    let status = drive(&h, id).await;
    assert_eq!(status.status, WorkflowStatus::Completed);
    assert_eq!(status.output, Some(json!({ "audited": 5 })));
    assert_eq!(status.steps[2].kind, StepKind::Await);

    let timeline = h.client.timeline(id).await.unwrap();
    assert!(timeline
        .iter()
        .any(|e| e.category == EventCategory::Await && e.status == EventStatus::Succeeded));
}

#[tokio::test]
async fn test_unregistered_activity_fails_terminally() {
    let mut registry = Registry::new();
    registry
        .register_workflow(
            WorkflowDefinition::builder("ghost")
                .activity("missing")
                .build()
                .unwrap(),
        )
        .unwrap();
    let h = harness(registry);

    let id = h.client.submit("ghost", json!({})).await.unwrap();
    let status = drive(&h, id).await;
    assert_eq!(status.status, WorkflowStatus::Failed);
    assert_eq!(status.error.unwrap().class, UNKNOWN_ACTIVITY_CLASS);
}

#[tokio::test]
async fn test_activity_timeout() {
    let mut registry = Registry::new();
    registry
        .register_activity(
            ActivityInfo::new("hang")
                .with_timeout(Duration::from_millis(30))
                .with_retry(RetryPolicy::no_retry()),
            ActivityFn::new(|input| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(input)
            }),
        )
        .unwrap();
    registry
        .register_workflow(
            WorkflowDefinition::builder("stuck")
                .activity("hang")
                .build()
                .unwrap(),
        )
        .unwrap();
    let h = harness(registry);

    let id = h.client.submit("stuck", json!({})).await.unwrap();
    let status = drive(&h, id).await;
    assert_eq!(status.status, WorkflowStatus::Failed);
    assert_eq!(status.error.unwrap().class, TIMEOUT_ERROR_CLASS);
}

#[tokio::test]
async fn test_boundary_errors() {
    let h = harness(Registry::new());
    let missing = Uuid::new_v4();

    let err = h.client.submit("nope", json!({})).await.unwrap_err();
    assert!(matches!(err, KeelError::UnknownWorkflowType(_)));
    assert!(matches!(
        h.client.get_status(missing).await.unwrap_err(),
        KeelError::NotFound(_)
    ));
    assert!(matches!(
        h.client.get_events(missing).await.unwrap_err(),
        KeelError::NotFound(_)
    ));
    assert!(matches!(
        h.client.cancel(missing).await.unwrap_err(),
        KeelError::NotFound(_)
    ));
    assert!(matches!(
        h.client.signal(missing, "go", json!(null)).await.unwrap_err(),
        KeelError::NotFound(_)
    ));
}

#[tokio::test]
async fn test_worker_run_and_shutdown() {
    let mut registry = Registry::new();
    echo(&mut registry, "work");
    registry
        .register_workflow(
            WorkflowDefinition::builder("single")
                .activity("work")
                .build()
                .unwrap(),
        )
        .unwrap();
    let h = Arc::new(harness(registry));
    let id = h.client.submit("single", json!("hello")).await.unwrap();

    let running = {
        let h = h.clone();
        tokio::spawn(async move { h.worker.run().await })
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = h.client.get_status(id).await.unwrap();
        if status.status == WorkflowStatus::Completed {
            assert_eq!(status.output, Some(json!("hello")));
            break;
        }
        assert!(Instant::now() < deadline, "worker never completed the workflow");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    h.worker.shutdown();
    running.await.unwrap().unwrap();
}
