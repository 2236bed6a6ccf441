//! Outbox atomicity and projector behavior against the in-memory outbox.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use warden_core::{InterceptorError, OutboxStatus, WardenError, WardenResult};
use warden_outbox::{OutboxProjector, OutboxStore, Sink};
use warden_repository::{WardenRuntime, WriteOptions};
use warden_storage::{Interceptor, InterceptorContext, OperationResult, Priority};
use warden_test_utils::fixtures::{
    fast_projector_config, order_placed, order_row, order_type, order_updated, orders_registry,
    test_config,
};
use warden_test_utils::{init_tracing, FailingSink, RecordingSink};

/// Fails every write after the store call, once the outbox rows are staged.
struct LateVeto;

#[async_trait]
impl Interceptor for LateVeto {
    fn name(&self) -> &str {
        "late_veto"
    }

    fn priority(&self) -> Priority {
        Priority::HIGHEST
    }

    fn applies_to(&self, ctx: &InterceptorContext) -> bool {
        ctx.requested_operation().is_write()
    }

    async fn after_result(
        &self,
        ctx: &mut InterceptorContext,
        _result: OperationResult,
    ) -> WardenResult<OperationResult> {
        assert!(ctx.scratch("outbox.appended").is_some());
        Err(InterceptorError::Vetoed {
            interceptor: "late_veto".to_string(),
            reason: "rejected after staging".to_string(),
        }
        .into())
    }
}

fn runtime_with_sink(sink: Arc<dyn Sink>) -> WardenRuntime {
    init_tracing();
    WardenRuntime::builder(orders_registry())
        .with_config(test_config())
        .with_sink(sink)
        .with_projector_id("p-main")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_committed_write_yields_one_row_per_event() {
    let runtime = runtime_with_sink(Arc::new(RecordingSink::new()));
    let repo = runtime.repository();
    let row = order_row("placed", 500);
    let events = vec![order_placed(&row), order_updated(&row)];

    repo.create(row, WriteOptions::new().with_events(events.clone()))
        .await
        .unwrap();

    let outbox = runtime.outbox().unwrap();
    let pending = outbox.list_by_status(OutboxStatus::Pending, 10).await.unwrap();
    assert_eq!(pending.len(), 2);
    let ids: Vec<_> = pending
        .iter()
        .map(|r| r.to_event().unwrap().event_id)
        .collect();
    assert_eq!(ids, events.iter().map(|e| e.event_id).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_failed_write_after_insert_yields_no_rows() {
    init_tracing();
    let runtime = WardenRuntime::builder(orders_registry())
        .with_config(test_config())
        .with_interceptor(Arc::new(LateVeto))
        .build()
        .unwrap();
    let repo = runtime.repository();
    let row = order_row("placed", 500);
    let id = row.id;

    let err = repo
        .create(row.clone(), WriteOptions::new().with_event(order_placed(&row)))
        .await
        .unwrap_err();
    assert!(matches!(err, WardenError::Interceptor(_)));

    let outbox = runtime.outbox().unwrap();
    for status in [OutboxStatus::Pending, OutboxStatus::Publishing] {
        assert!(outbox.list_by_status(status, 10).await.unwrap().is_empty());
    }
    assert!(repo
        .get_including_deleted(&order_type(), id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_conflicting_update_raises_no_event() {
    let runtime = runtime_with_sink(Arc::new(RecordingSink::new()));
    let repo = runtime.repository();
    let row = repo
        .create(order_row("placed", 1), WriteOptions::new())
        .await
        .unwrap();
    repo.update(row.clone().with_field("status", "paid"), WriteOptions::new())
        .await
        .unwrap();

    let stale = row.clone().with_field("status", "cancelled");
    assert!(repo
        .update(stale.clone(), WriteOptions::new().with_event(order_updated(&stale)))
        .await
        .is_err());
    assert!(runtime
        .outbox()
        .unwrap()
        .list_by_status(OutboxStatus::Pending, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_projector_publishes_in_commit_order() {
    let sink = Arc::new(RecordingSink::new());
    let runtime = runtime_with_sink(sink.clone());
    let repo = runtime.repository();

    let mut expected = Vec::new();
    for i in 0..5 {
        let row = order_row("placed", i);
        let event = order_placed(&row);
        expected.push(event.event_id);
        repo.create(row, WriteOptions::new().with_event(event))
            .await
            .unwrap();
    }

    let report = runtime.projector().unwrap().run_once(10).await.unwrap();
    assert_eq!(report.published, 5);
    assert_eq!(sink.event_ids(), expected);

    let outbox = runtime.outbox().unwrap();
    let published = outbox
        .list_by_status(OutboxStatus::Published, 10)
        .await
        .unwrap();
    assert_eq!(published.len(), 5);
    assert!(published.iter().all(|r| r.dispatched_at.is_some()));
}

#[tokio::test]
async fn test_failing_sink_parks_row_after_max_retry() {
    let sink = Arc::new(FailingSink::new());
    let runtime = runtime_with_sink(sink.clone());
    let repo = runtime.repository();
    let row = order_row("placed", 1);
    repo.create(row.clone(), WriteOptions::new().with_event(order_placed(&row)))
        .await
        .unwrap();

    let projector = runtime.projector().unwrap();
    let max_retry = projector.config().max_retry;
    let outbox = runtime.outbox().unwrap();

    for attempt in 1..=max_retry {
        projector.run_once(10).await.unwrap();
        let record = outbox
            .list_by_status(
                if attempt < max_retry {
                    OutboxStatus::Pending
                } else {
                    OutboxStatus::Error
                },
                10,
            )
            .await
            .unwrap()
            .remove(0);
        assert_eq!(record.deliver_attempts, attempt);
        assert!(record.last_error.is_some());
    }

    // Parked: further cycles never touch it.
    for _ in 0..3 {
        assert_eq!(projector.run_once(10).await.unwrap().claimed, 0);
    }
    assert_eq!(sink.attempts(), max_retry as usize);
    assert_eq!(projector.metrics().failed, 1);
    assert_eq!(projector.metrics().retried, u64::from(max_retry - 1));
}

#[tokio::test]
async fn test_replayed_row_is_delivered() {
    let sink = Arc::new(FailingSink::failing_times(3));
    let runtime = runtime_with_sink(sink.clone());
    let repo = runtime.repository();
    let row = order_row("placed", 1);
    repo.create(row.clone(), WriteOptions::new().with_event(order_placed(&row)))
        .await
        .unwrap();

    let projector = runtime.projector().unwrap();
    for _ in 0..projector.config().max_retry {
        projector.run_once(10).await.unwrap();
    }
    let outbox = runtime.outbox().unwrap();
    let parked = outbox.list_by_status(OutboxStatus::Error, 10).await.unwrap();
    assert_eq!(parked.len(), 1);

    assert!(outbox.replay(parked[0].id).await.unwrap());
    assert_eq!(projector.run_once(10).await.unwrap().published, 1);
    assert_eq!(sink.delivered().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_projectors_never_share_a_row() {
    const EVENTS: usize = 200;
    let runtime = runtime_with_sink(Arc::new(RecordingSink::new()));
    let repo = runtime.repository();
    for i in 0..EVENTS {
        let row = order_row("placed", i as i64);
        repo.create(row.clone(), WriteOptions::new().with_event(order_placed(&row)))
            .await
            .unwrap();
    }

    let outbox = Arc::clone(runtime.outbox().unwrap());
    let sinks = [Arc::new(RecordingSink::new()), Arc::new(RecordingSink::new())];
    let projectors: Vec<Arc<OutboxProjector>> = sinks
        .iter()
        .enumerate()
        .map(|(i, sink)| {
            Arc::new(
                OutboxProjector::new(
                    Arc::clone(&outbox),
                    sink.clone(),
                    fast_projector_config().with_batch_size(7),
                )
                .with_instance_id(format!("p{i}")),
            )
        })
        .collect();
    let handles: Vec<_> = projectors.iter().map(|p| p.start()).collect();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while sinks.iter().map(|s| s.len()).sum::<usize>() < EVENTS {
        assert!(tokio::time::Instant::now() < deadline, "projectors stalled");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for projector in &projectors {
        projector.stop();
    }
    let snapshots = futures_util::future::join_all(handles).await;

    let mut seen = HashSet::new();
    for sink in &sinks {
        for id in sink.event_ids() {
            assert!(seen.insert(id), "event {id} delivered by both projectors");
        }
    }
    assert_eq!(seen.len(), EVENTS);

    let published: u64 = snapshots.into_iter().map(|s| s.unwrap().published).sum();
    assert_eq!(published, EVENTS as u64);
    assert!(outbox
        .list_by_status(OutboxStatus::Publishing, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_reaper_recovers_crashed_claims() {
    init_tracing();
    let sink = Arc::new(RecordingSink::new());
    let runtime = WardenRuntime::builder(orders_registry())
        .with_config(
            test_config().with_projector(
                fast_projector_config().with_stale_after(Duration::from_millis(20)),
            ),
        )
        .with_sink(sink.clone())
        .build()
        .unwrap();
    let repo = runtime.repository();
    for i in 0..3 {
        let row = order_row("placed", i);
        repo.create(row.clone(), WriteOptions::new().with_event(order_placed(&row)))
            .await
            .unwrap();
    }

    // An instance claims everything and dies.
    let outbox = runtime.outbox().unwrap();
    assert_eq!(outbox.claim_pending(10, "crashed").await.unwrap().len(), 3);

    let projector = runtime.projector().unwrap();
    assert_eq!(projector.run_once(10).await.unwrap().claimed, 0);
    assert_eq!(projector.reap_stale().await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(projector.reap_stale().await.unwrap(), 3);
    assert_eq!(projector.run_once(10).await.unwrap().published, 3);
    assert_eq!(sink.len(), 3);

    // The dead instance cannot overwrite the outcome.
    let id = outbox
        .list_by_status(OutboxStatus::Published, 1)
        .await
        .unwrap()[0]
        .id;
    assert!(!outbox.mark_published(id, "crashed").await.unwrap());
    assert_eq!(projector.metrics().reaped, 3);
}
