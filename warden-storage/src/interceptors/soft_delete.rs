//! Soft delete: deletes become flag updates.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use warden_core::{Row, StorageError, WardenResult};

use crate::chain::{Flow, Interceptor, InterceptorContext, Priority};
use crate::registry::EntityRegistry;

const APPLIED: &str = "soft_delete.applied";

/// Rewrites deletes of soft-delete entity types into updates that set the
/// deleted flag, `deleted_at` and `deleted_by`.
///
/// Each target row is read under lock first. A missing or already deleted row
/// fails with `NotFound`. Hiding deleted rows from reads is the store's job.
pub struct SoftDeleteInterceptor {
    registry: Arc<EntityRegistry>,
}

impl SoftDeleteInterceptor {
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Interceptor for SoftDeleteInterceptor {
    fn name(&self) -> &str {
        "soft_delete"
    }

    fn priority(&self) -> Priority {
        Priority::NORMAL
    }

    fn applies_to(&self, ctx: &InterceptorContext) -> bool {
        ctx.requested_operation().is_delete() && self.registry.soft_delete(ctx.entity_type()).is_some()
    }

    async fn before(&self, ctx: &mut InterceptorContext) -> WardenResult<Flow> {
        if ctx.scratch_flag(APPLIED) {
            return Ok(Flow::Continue);
        }
        let entity_type = ctx.entity_type().clone();
        let Some(fields) = self.registry.soft_delete(&entity_type).cloned() else {
            return Ok(Flow::Continue);
        };

        let now = Utc::now();
        let actor = ctx.actor_or_system().to_string();
        let mut marked = Vec::with_capacity(ctx.rows().len());

        for id in ctx.ids() {
            let current = ctx.tx()?.find_for_update(&entity_type, id).await?;
            let current = match current {
                Some(row) if !row.flag(&fields.flag) => row,
                _ => {
                    return Err(StorageError::NotFound {
                        entity_type: entity_type.clone(),
                        id,
                    }
                    .into())
                }
            };

            let mut patch = Row::new(entity_type.clone(), id).with_version(current.version);
            patch.set(fields.flag.clone(), true);
            if let Some(column) = &fields.deleted_at {
                patch.set_timestamp(column.clone(), now);
            }
            if let Some(column) = &fields.deleted_by {
                patch.set(column.clone(), actor.clone());
            }
            marked.push(patch);
        }

        ctx.replace_rows(marked);
        ctx.set_operation(ctx.requested_operation().as_update());
        ctx.set_scratch(APPLIED, true);
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainBuilder, InterceptorChain, OperationResult};
    use crate::memory::MemoryStore;
    use crate::registry::{EntityConfig, SoftDeleteFields};
    use crate::store::Store;
    use warden_core::{new_entity_id, EntityType, Query, ReadScope};

    fn order() -> EntityType {
        EntityType::new("order")
    }

    fn setup() -> (Arc<MemoryStore>, InterceptorChain) {
        let registry = Arc::new(
            EntityRegistry::new()
                .register(
                    "order",
                    EntityConfig::new().with_soft_delete(SoftDeleteFields::default()),
                )
                .register("session", EntityConfig::new()),
        );
        let store = Arc::new(MemoryStore::new(Arc::clone(&registry)));
        let chain = ChainBuilder::new(store.clone(), Arc::clone(&registry))
            .with(SoftDeleteInterceptor::new(registry))
            .build();
        (store, chain)
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
    async fn test_delete_marks_row_and_keeps_it() {
        let (store, chain) = setup();
        let row = create(&chain, order()).await;

        let result = chain
            .run(InterceptorContext::delete(order(), row.id).with_actor("ada"))
            .await
            .unwrap();
        assert_eq!(
            result,
            OperationResult::Deleted {
                ids: vec![row.id],
                soft: true
            }
        );

        let raw = store.row_snapshot(&order(), row.id).unwrap().expect("row survives");
        assert!(raw.flag("is_deleted"));
        assert!(raw.timestamp("deleted_at").is_some());
        assert_eq!(raw.get("deleted_by"), Some(&serde_json::json!("ada")));
        assert_eq!(raw.version, 2);

        assert!(store
            .find(&order(), row.id, ReadScope::ExcludeDeleted)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find(&order(), row.id, ReadScope::IncludeDeleted)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .query(&order(), &Query::new(), ReadScope::ExcludeDeleted)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_deleting_twice_is_not_found() {
        let (_store, chain) = setup();
        let row = create(&chain, order()).await;
        chain
            .run(InterceptorContext::delete(order(), row.id))
            .await
            .unwrap();
        let err = chain
            .run(InterceptorContext::delete(order(), row.id))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_batch_delete_is_all_or_nothing() {
        let (store, chain) = setup();
        let kept = create(&chain, order()).await;
        let err = chain
            .run(InterceptorContext::batch_delete(
                order(),
                vec![kept.id, new_entity_id()],
            ))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        let raw = store.row_snapshot(&order(), kept.id).unwrap().unwrap();
        assert!(!raw.flag("is_deleted"));
    }

    #[tokio::test]
    async fn test_unregistered_types_are_hard_deleted() {
        let (store, chain) = setup();
        let session = EntityType::new("session");
        let row = create(&chain, session.clone()).await;
        let result = chain
            .run(InterceptorContext::delete(session.clone(), row.id))
            .await
            .unwrap();
        assert_eq!(
            result,
            OperationResult::Deleted {
                ids: vec![row.id],
                soft: false
            }
        );
        assert!(store.row_snapshot(&session, row.id).unwrap().is_none());
    }
}
