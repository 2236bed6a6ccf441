//! Full-stack scenarios through `WardenRuntime`: concurrency control, soft
//! deletion and cache coherence with every standard interceptor installed.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use warden_core::{new_entity_id, Query, Row, WardenError};
use warden_repository::{DeleteKind, WardenRuntime, WriteOptions};
use warden_storage::BatchConflictPolicy;
use warden_test_utils::assertions::{assert_conflict, assert_has_field, assert_validation_error};
use warden_test_utils::fixtures::{order_row, order_type, orders_registry, test_config};
use warden_test_utils::{init_tracing, CountingStore};

fn runtime() -> WardenRuntime {
    init_tracing();
    WardenRuntime::builder(orders_registry())
        .with_config(test_config())
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_create_concurrent_update_then_fresh_read() {
    let runtime = runtime();
    let repo = runtime.repository();

    // 1. o1 at v1, and warm the cache with it.
    let o1 = repo
        .create(order_row("placed", 1000), WriteOptions::by("alice"))
        .await
        .unwrap();
    assert_eq!(o1.version, 1);
    assert_eq!(repo.get(&order_type(), o1.id).await.unwrap(), Some(o1.clone()));

    // 2. Two writers from the same base.
    let first = {
        let repo = repo.clone();
        let patch = o1.clone().with_field("status", "paid");
        tokio::spawn(async move { repo.update(patch, WriteOptions::by("bob")).await })
    };
    let second = {
        let repo = repo.clone();
        let patch = o1.clone().with_field("status", "cancelled");
        tokio::spawn(async move { repo.update(patch, WriteOptions::by("carol")).await })
    };
    let (winners, losers): (Vec<_>, Vec<_>) = [first.await.unwrap(), second.await.unwrap()]
        .into_iter()
        .partition(|r| r.is_ok());
    assert_eq!(winners.len(), 1);
    let winner = winners.into_iter().next().unwrap().unwrap();
    assert_eq!(winner.version, 2);
    assert_conflict(losers.into_iter().next().unwrap(), 1, 2);

    // 3. The cached v1 was invalidated; the read sees the winner.
    let fresh = repo.get(&order_type(), o1.id).await.unwrap().unwrap();
    assert_eq!(fresh.version, 2);
    assert_eq!(fresh.get("status"), winner.get("status"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_k_concurrent_updates_one_winner() {
    const K: usize = 32;
    let runtime = runtime();
    let repo = runtime.repository();
    let base = repo
        .create(order_row("placed", 1), WriteOptions::new())
        .await
        .unwrap();

    let handles: Vec<_> = (0..K)
        .map(|i| {
            let repo = repo.clone();
            let patch = base.clone().with_field("writer", i as i64);
            tokio::spawn(async move { repo.update(patch, WriteOptions::new()).await })
        })
        .collect();

    let mut ok = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(row) => {
                assert_eq!(row.version, 2);
                ok += 1;
            }
            Err(e) if e.is_retryable() => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflicts, K - 1);
    assert_eq!(
        repo.require(&order_type(), base.id).await.unwrap().version,
        2
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_batches_in_opposite_order_finish() {
    const ROUNDS: usize = 20;
    let runtime = runtime();
    let repo = runtime.repository();

    for _ in 0..ROUNDS {
        let rows = repo
            .batch_create(
                &order_type(),
                vec![order_row("placed", 1), order_row("placed", 2)],
                WriteOptions::new(),
            )
            .await
            .unwrap();
        let (a, b) = (rows[0].clone(), rows[1].clone());

        let update = {
            let repo = repo.clone();
            let patches = vec![
                a.clone().with_field("status", "paid"),
                b.clone().with_field("status", "paid"),
            ];
            tokio::spawn(async move {
                repo.batch_update(&order_type(), patches, WriteOptions::new())
                    .await
            })
        };
        let delete = {
            let repo = repo.clone();
            let ids = vec![b.id, a.id];
            tokio::spawn(async move {
                repo.batch_delete(&order_type(), ids, WriteOptions::by("ops"))
                    .await
            })
        };

        let (update, delete) = tokio::time::timeout(Duration::from_secs(5), async {
            (update.await.unwrap(), delete.await.unwrap())
        })
        .await
        .expect("batches over [a, b] and [b, a] deadlocked");

        // The delete always lands; the update either ran first or lost.
        assert_eq!(delete.unwrap(), (vec![b.id, a.id], DeleteKind::Soft));
        if let Err(e) = update {
            assert!(e.is_retryable(), "unexpected error: {e}");
        }
        for id in [a.id, b.id] {
            assert!(repo.get(&order_type(), id).await.unwrap().is_none());
        }
    }
}

#[tokio::test]
async fn test_retry_after_conflict_succeeds_from_fresh_read() {
    let runtime = runtime();
    let repo = runtime.repository();
    let base = repo
        .create(order_row("placed", 1), WriteOptions::new())
        .await
        .unwrap();
    repo.update(base.clone().with_field("status", "paid"), WriteOptions::new())
        .await
        .unwrap();

    let stale = repo
        .update(base.clone().with_field("note", "gift"), WriteOptions::new())
        .await;
    assert!(stale.as_ref().unwrap_err().is_retryable());

    let current = repo.require(&order_type(), base.id).await.unwrap();
    let retried = repo
        .update(current.with_field("note", "gift"), WriteOptions::new())
        .await
        .unwrap();
    assert_eq!(retried.version, 3);
    assert_eq!(retried.get("status"), Some(&json!("paid")));
    assert_eq!(retried.get("note"), Some(&json!("gift")));
}

#[tokio::test]
async fn test_audit_stamps_survive_updates() {
    let runtime = runtime();
    let repo = runtime.repository();
    let created = repo
        .create(order_row("placed", 1), WriteOptions::by("alice"))
        .await
        .unwrap();
    assert_has_field(&created, "created_at");
    assert_has_field(&created, "updated_at");

    // Clients cannot rewrite creation columns.
    let tampered = created
        .clone()
        .with_field("created_by", "mallory")
        .with_field("status", "paid");
    let updated = repo.update(tampered, WriteOptions::by("bob")).await.unwrap();
    assert_eq!(updated.get("created_by"), Some(&json!("alice")));
    assert_eq!(updated.get("created_at"), created.get("created_at"));
    assert_eq!(updated.get("updated_by"), Some(&json!("bob")));
}

#[tokio::test]
async fn test_soft_delete_round_trip_through_cache() {
    let runtime = runtime();
    let repo = runtime.repository();
    let row = repo
        .create(order_row("placed", 1), WriteOptions::new())
        .await
        .unwrap();

    // Cached before the delete.
    assert!(repo.get(&order_type(), row.id).await.unwrap().is_some());
    assert!(repo
        .query(&order_type(), Query::new().where_eq("status", "placed"))
        .await
        .unwrap()
        .iter()
        .any(|r| r.id == row.id));

    let kind = repo
        .delete(&order_type(), row.id, WriteOptions::by("ops"))
        .await
        .unwrap();
    assert_eq!(kind, DeleteKind::Soft);

    assert!(repo.get(&order_type(), row.id).await.unwrap().is_none());
    assert!(repo
        .query(&order_type(), Query::new().where_eq("status", "placed"))
        .await
        .unwrap()
        .is_empty());

    let kept = repo
        .get_including_deleted(&order_type(), row.id)
        .await
        .unwrap()
        .unwrap();
    assert!(kept.flag("is_deleted"));
    assert_has_field(&kept, "deleted_at");

    // Deleting again is NotFound.
    let again = repo.delete(&order_type(), row.id, WriteOptions::new()).await;
    assert!(again.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_batch_update_default_aborts_whole_batch() {
    let runtime = runtime();
    let repo = runtime.repository();
    let rows = repo
        .batch_create(
            &order_type(),
            vec![order_row("placed", 1), order_row("placed", 2)],
            WriteOptions::new(),
        )
        .await
        .unwrap();
    repo.update(rows[1].clone().with_field("status", "paid"), WriteOptions::new())
        .await
        .unwrap();

    let patches = rows
        .iter()
        .map(|r| r.clone().with_field("status", "packed"))
        .collect();
    let err = repo
        .batch_update(&order_type(), patches, WriteOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, WardenError::Conflict(_)));

    // The non-conflicting row was not written either.
    let first = repo.require(&order_type(), rows[0].id).await.unwrap();
    assert_eq!(first.version, 1);
    assert_eq!(first.get("status"), Some(&json!("placed")));
}

#[tokio::test]
async fn test_batch_update_per_row_reports_conflicts() {
    init_tracing();
    let runtime = WardenRuntime::builder(orders_registry())
        .with_config(test_config())
        .with_batch_policy(BatchConflictPolicy::PerRow)
        .build()
        .unwrap();
    let repo = runtime.repository();
    let rows = repo
        .batch_create(
            &order_type(),
            vec![order_row("placed", 1), order_row("placed", 2)],
            WriteOptions::new(),
        )
        .await
        .unwrap();
    repo.update(rows[1].clone().with_field("status", "paid"), WriteOptions::new())
        .await
        .unwrap();

    let patches = rows
        .iter()
        .map(|r| r.clone().with_field("status", "packed"))
        .collect();
    let outcome = repo
        .batch_update(&order_type(), patches, WriteOptions::new())
        .await
        .unwrap();
    assert!(!outcome.is_complete());
    assert_eq!(outcome.rows.len(), 1);
    assert_eq!(outcome.rows[0].id, rows[0].id);
    assert_eq!(outcome.conflicts.len(), 1);
    assert_eq!(outcome.conflicts[0].id, rows[1].id);
}

#[tokio::test]
async fn test_validation_happens_before_any_transaction() {
    init_tracing();
    let memory = warden_test_utils::fixtures::memory_store();
    let store = Arc::new(CountingStore::new(memory.clone()));
    let runtime = WardenRuntime::builder(orders_registry())
        .with_config(test_config())
        .with_store(store.clone())
        .with_outbox_store(memory)
        .build()
        .unwrap();
    let repo = runtime.repository();

    let unversioned_update = order_row("placed", 1);
    assert_validation_error(repo.update(unversioned_update, WriteOptions::new()).await);

    let id = new_entity_id();
    let duplicate = vec![
        Row::new(order_type(), id),
        Row::new(order_type(), id),
    ];
    assert_validation_error(
        repo.batch_create(&order_type(), duplicate, WriteOptions::new())
            .await,
    );

    assert_eq!(store.begins(), 0);
}

mod properties {
    use super::*;
    use proptest::prelude::*;
    use proptest::test_runner::TestCaseError;
    use warden_test_utils::fixtures::ORDER;
    use warden_test_utils::generators::arb_row;

    const RESERVED: &[&str] = &[
        "created_at",
        "created_by",
        "updated_at",
        "updated_by",
        "is_deleted",
        "deleted_at",
        "deleted_by",
    ];

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(25))]

        /// Whatever user columns go in come back out, cached or not.
        #[test]
        fn prop_create_then_get_preserves_columns(row in arb_row(ORDER)) {
            prop_assume!(!row.flag("is_deleted"));
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let outcome: Result<(), TestCaseError> = rt.block_on(async {
                let runtime = runtime();
                let repo = runtime.repository();
                let created = repo.create(row.clone(), WriteOptions::new()).await.unwrap();
                prop_assert_eq!(created.version, 1);

                for _ in 0..2 {
                    let read = repo.get(&order_type(), row.id).await.unwrap().unwrap();
                    for (name, value) in &row.fields {
                        if RESERVED.contains(&name.as_str()) {
                            continue;
                        }
                        prop_assert_eq!(read.get(name), Some(value));
                    }
                }
                Ok(())
            });
            outcome?;
        }
    }
}
