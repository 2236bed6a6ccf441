//! Optimistic concurrency control.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use warden_core::{OptimisticLockConflict, StorageError, WardenResult};

use crate::chain::{Flow, Interceptor, InterceptorContext, Priority};
use crate::registry::EntityRegistry;

/// What a batch update does when some rows conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchConflictPolicy {
    /// Fail the whole batch on the first conflicting row.
    #[default]
    AbortBatch,
    /// Drop conflicting rows, write the rest, report the conflicts.
    PerRow,
}

/// Compares each update's declared version with the stored one, read under
/// lock inside the transaction. On a match the write is based on the stored
/// version and the store bumps it by one; on a mismatch the call fails with
/// [`OptimisticLockConflict`] before anything is written. Never retries.
///
/// Entity types registered as unversioned skip the comparison.
pub struct OptimisticLockInterceptor {
    registry: Arc<EntityRegistry>,
    policy: BatchConflictPolicy,
}

impl OptimisticLockInterceptor {
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self {
            registry,
            policy: BatchConflictPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: BatchConflictPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl Interceptor for OptimisticLockInterceptor {
    fn name(&self) -> &str {
        "optimistic_lock"
    }

    fn priority(&self) -> Priority {
        Priority::HIGH
    }

    fn applies_to(&self, ctx: &InterceptorContext) -> bool {
        let operation = ctx.requested_operation();
        operation.is_create() || operation.is_update()
    }

    async fn before(&self, ctx: &mut InterceptorContext) -> WardenResult<Flow> {
        if ctx.requested_operation().is_create() {
            for row in ctx.rows_mut() {
                row.version = 1;
            }
            return Ok(Flow::Continue);
        }

        let entity_type = ctx.entity_type().clone();
        let versioned = self
            .registry
            .get(&entity_type)
            .map(|c| c.versioned)
            .unwrap_or(true);
        let per_row =
            self.policy == BatchConflictPolicy::PerRow && ctx.requested_operation().is_batch();

        let rows = ctx.rows().to_vec();
        let mut kept = Vec::with_capacity(rows.len());
        for mut row in rows {
            let actual = ctx
                .tx()?
                .version_for_update(&entity_type, row.id)
                .await?
                .ok_or_else(|| StorageError::NotFound {
                    entity_type: entity_type.clone(),
                    id: row.id,
                })?;

            if versioned && row.version != actual {
                let conflict = OptimisticLockConflict {
                    entity_type: entity_type.clone(),
                    id: row.id,
                    expected: row.version,
                    actual,
                };
                if per_row {
                    debug!(
                        entity_type = %entity_type,
                        id = %row.id,
                        expected = row.version,
                        actual,
                        "Dropping conflicting row from batch"
                    );
                    ctx.record_conflict(conflict);
                    continue;
                }
                return Err(conflict.into());
            }

            row.version = actual;
            kept.push(row);
        }

        ctx.set_scratch("optimistic_lock.checked", kept.len());
        ctx.replace_rows(kept);
        Ok(Flow::Continue)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainBuilder, InterceptorChain, OperationResult};
    use crate::memory::MemoryStore;
    use crate::registry::EntityConfig;
    use crate::store::{Store, StoreTx};
    use std::time::Duration;
    use warden_core::{new_entity_id, EntityType, ReadScope, Row, WardenError};

    fn order() -> EntityType {
        EntityType::new("order")
    }

    fn setup(policy: BatchConflictPolicy) -> (Arc<MemoryStore>, Arc<InterceptorChain>) {
        let registry = Arc::new(
            EntityRegistry::new()
                .register("order", EntityConfig::new())
                .register("counter", EntityConfig::new().unversioned()),
        );
        let store = Arc::new(MemoryStore::new(Arc::clone(&registry)));
        let chain = ChainBuilder::new(store.clone(), Arc::clone(&registry))
            .with(OptimisticLockInterceptor::new(registry).with_policy(policy))
            .build();
        (store, Arc::new(chain))
    }

    async fn create(chain: &InterceptorChain, entity_type: EntityType) -> Row {
        chain
            .run(InterceptorContext::create(Row::new(entity_type, new_entity_id())))
            .await
            .unwrap()
            .into_rows()
            .remove(0)
    }

    #[tokio::test]
    async fn test_matching_version_bumps_by_one() {
        let (_store, chain) = setup(BatchConflictPolicy::AbortBatch);
        let row = create(&chain, order()).await;
        assert_eq!(row.version, 1);

        let updated = chain
            .run(InterceptorContext::update(row.clone().with_field("status", "paid")))
            .await
            .unwrap()
            .into_rows();
        assert_eq!(updated[0].version, 2);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts_without_mutation() {
        let (store, chain) = setup(BatchConflictPolicy::AbortBatch);
        let row = create(&chain, order()).await;
        chain
            .run(InterceptorContext::update(row.clone()))
            .await
            .unwrap();

        let err = chain
            .run(InterceptorContext::update(row.clone().with_field("status", "lost")))
            .await
            .unwrap_err();
        let conflict = err.as_conflict().expect("typed conflict");
        assert_eq!((conflict.expected, conflict.actual), (1, 2));
        assert!(err.is_retryable());

        let stored = store
            .find(&order(), row.id, ReadScope::ExcludeDeleted)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 2);
        assert!(stored.get("status").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_from_same_base() {
        const K: usize = 16;
        let (store, chain) = setup(BatchConflictPolicy::AbortBatch);
        let row = create(&chain, order()).await;

        let handles: Vec<_> = (0..K)
            .map(|i| {
                let chain = Arc::clone(&chain);
                let row = row.clone().with_field("writer", i as i64);
                tokio::spawn(async move { chain.run(InterceptorContext::update(row)).await })
            })
            .collect();

        let mut ok = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(WardenError::Conflict(c)) => {
                    assert_eq!(c.expected, 1);
                    assert_eq!(c.actual, 2);
                    conflicts += 1;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(conflicts, K - 1);

        let stored = store
            .find(&order(), row.id, ReadScope::ExcludeDeleted)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn test_unversioned_type_is_last_writer_wins() {
        let (_store, chain) = setup(BatchConflictPolicy::AbortBatch);
        let counter = EntityType::new("counter");
        let row = create(&chain, counter.clone()).await;
        chain.run(InterceptorContext::update(row.clone())).await.unwrap();

        let updated = chain
            .run(InterceptorContext::update(row.clone().with_field("n", 3)))
            .await
            .unwrap()
            .into_rows();
        assert_eq!(updated[0].version, 3);
    }

    #[tokio::test]
    async fn test_batch_aborts_on_first_conflict_by_default() {
        let (store, chain) = setup(BatchConflictPolicy::AbortBatch);
        let fresh = create(&chain, order()).await;
        let stale = create(&chain, order()).await;
        chain.run(InterceptorContext::update(stale.clone())).await.unwrap();

        let err = chain
            .run(InterceptorContext::batch_update(
                order(),
                vec![fresh.clone().with_field("status", "paid"), stale.clone()],
            ))
            .await
            .unwrap_err();
        assert!(err.as_conflict().is_some());
        let untouched = store.row_snapshot(&order(), fresh.id).unwrap().unwrap();
        assert_eq!(untouched.version, 1);
    }

    #[tokio::test]
    async fn test_batch_per_row_reports_conflicts() {
        let (store, chain) = setup(BatchConflictPolicy::PerRow);
        let fresh = create(&chain, order()).await;
        let stale = create(&chain, order()).await;
        chain.run(InterceptorContext::update(stale.clone())).await.unwrap();

        let result = chain
            .run(InterceptorContext::batch_update(
                order(),
                vec![fresh.clone().with_field("status", "paid"), stale.clone()],
            ))
            .await
            .unwrap();
        match result {
            OperationResult::Written { rows, conflicts } => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].id, fresh.id);
                assert_eq!(rows[0].version, 2);
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].id, stale.id);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(store.row_snapshot(&order(), stale.id).unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_update_of_missing_row_is_not_found() {
        let (_store, chain) = setup(BatchConflictPolicy::AbortBatch);
        let err = chain
            .run(InterceptorContext::update(
                Row::new(order(), new_entity_id()).with_version(1),
            ))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_opposite_order_batches_do_not_deadlock() {
        let (store, chain) = setup(BatchConflictPolicy::AbortBatch);
        let a = create(&chain, order()).await;
        let b = create(&chain, order()).await;

        // Hold `a` so both batches are mid-flight when it is released.
        let mut holder = store.begin().await.unwrap();
        holder.find_for_update(&order(), a.id).await.unwrap();

        let spawn_batch = |rows: Vec<Row>| {
            let chain = Arc::clone(&chain);
            tokio::spawn(async move {
                chain
                    .run(InterceptorContext::batch_update(order(), rows))
                    .await
            })
        };
        let forward = spawn_batch(vec![
            a.clone().with_field("dir", "ab"),
            b.clone().with_field("dir", "ab"),
        ]);
        let backward = spawn_batch(vec![
            b.clone().with_field("dir", "ba"),
            a.clone().with_field("dir", "ba"),
        ]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        holder.rollback().await.unwrap();

        let (forward, backward) = tokio::time::timeout(Duration::from_secs(3), async {
            (forward.await.unwrap(), backward.await.unwrap())
        })
        .await
        .expect("batches over [a, b] and [b, a] deadlocked");

        // Both lists carry v1, so exactly one batch commits.
        let outcomes = [forward, backward];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|r| r.as_ref().err().and_then(|e| e.as_conflict()).is_some()));
        for id in [a.id, b.id] {
            assert_eq!(store.row_snapshot(&order(), id).unwrap().unwrap().version, 2);
        }
    }
}
