//! Chain construction and the single `run` entry point.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, trace, warn};
use warden_core::{StorageError, ValidationError, WardenError, WardenResult};

use crate::chain::context::{InterceptorContext, ReadTarget};
use crate::chain::interceptor::Interceptor;
use crate::chain::operation::{Flow, OperationResult};
use crate::registry::EntityRegistry;
use crate::store::Store;

/// Collects interceptors, then sorts them once.
pub struct ChainBuilder {
    store: Arc<dyn Store>,
    registry: Arc<EntityRegistry>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl ChainBuilder {
    pub fn new(store: Arc<dyn Store>, registry: Arc<EntityRegistry>) -> Self {
        Self {
            store,
            registry,
            interceptors: Vec::new(),
        }
    }

    pub fn with(self, interceptor: impl Interceptor + 'static) -> Self {
        self.with_arc(Arc::new(interceptor))
    }

    pub fn with_arc(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn build(mut self) -> InterceptorChain {
        // Stable: equal priorities keep registration order.
        self.interceptors.sort_by_key(|i| i.priority());
        InterceptorChain {
            store: self.store,
            registry: self.registry,
            interceptors: self.interceptors,
        }
    }
}

/// A priority-sorted interceptor list wrapped around a store.
pub struct InterceptorChain {
    store: Arc<dyn Store>,
    registry: Arc<EntityRegistry>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn builder(store: Arc<dyn Store>, registry: Arc<EntityRegistry>) -> ChainBuilder {
        ChainBuilder::new(store, registry)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    /// Interceptor names in before-phase order.
    pub fn interceptor_names(&self) -> Vec<&str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Run one operation through the chain.
    ///
    /// Validates, opens a transaction for writes and locks the target rows in
    /// id order, runs the before hooks, the store call, the after hooks,
    /// commits, then runs the after-commit hooks.
    /// Any error before commit unwinds through `on_error` and rolls back.
    pub async fn run(&self, mut ctx: InterceptorContext) -> WardenResult<OperationResult> {
        self.validate(&ctx)?;
        ctx.attach_store(Arc::clone(&self.store));

        let applicable: Vec<Arc<dyn Interceptor>> = self
            .interceptors
            .iter()
            .filter(|i| i.applies_to(&ctx))
            .cloned()
            .collect();

        if ctx.requested_operation().is_write() {
            let tx = self.store.begin().await?;
            ctx.attach_tx(tx);
        }

        let mut entered = 0;
        match self.drive(&mut ctx, &applicable, &mut entered).await {
            Ok(result) => {
                self.after_commit(&mut ctx, &applicable[..entered], &result)
                    .await;
                Ok(result)
            }
            Err(error) => self.unwind(&mut ctx, &applicable[..entered], error).await,
        }
    }

    fn validate(&self, ctx: &InterceptorContext) -> Result<(), ValidationError> {
        let entity_type = ctx.entity_type();
        let config = self.registry.require(entity_type)?;
        let operation = ctx.requested_operation();

        if operation.is_read() {
            if ctx.read_request().is_none() {
                return Err(ValidationError::RequiredFieldMissing {
                    field: "read_request".to_string(),
                });
            }
            return Ok(());
        }

        let rows = ctx.rows();
        if rows.is_empty() {
            return Err(ValidationError::EmptyBatch {
                entity_type: entity_type.clone(),
            });
        }
        if !operation.is_batch() && rows.len() > 1 {
            return Err(ValidationError::InvalidValue {
                field: "rows".to_string(),
                reason: format!("{operation} takes exactly one row, got {}", rows.len()),
            });
        }

        let mut seen = HashSet::with_capacity(rows.len());
        for row in rows {
            if &row.entity_type != entity_type {
                return Err(ValidationError::MixedEntityTypes {
                    expected: entity_type.clone(),
                    found: row.entity_type.clone(),
                    id: row.id,
                });
            }
            if !seen.insert(row.id) {
                return Err(ValidationError::DuplicateId { id: row.id });
            }
            if operation.is_update() && config.versioned && row.version < 1 {
                return Err(ValidationError::InvalidValue {
                    field: "version".to_string(),
                    reason: format!(
                        "update of {} must carry the version it was read at, got {}",
                        row.id, row.version
                    ),
                });
            }
        }
        Ok(())
    }

    async fn drive(
        &self,
        ctx: &mut InterceptorContext,
        applicable: &[Arc<dyn Interceptor>],
        entered: &mut usize,
    ) -> WardenResult<OperationResult> {
        if ctx.requested_operation().is_write() {
            // Interceptors re-read these rows in caller order; the locks are
            // already held by then.
            let entity_type = ctx.entity_type().clone();
            let ids = ctx.ids();
            ctx.tx()?.lock_rows(&entity_type, &ids).await?;
        }

        let mut response = None;
        for interceptor in applicable {
            *entered += 1;
            match interceptor.before(ctx).await? {
                Flow::Continue => {}
                Flow::Respond(result) => {
                    trace!(
                        interceptor = interceptor.name(),
                        operation = %ctx.requested_operation(),
                        "Interceptor responded, skipping store call"
                    );
                    response = Some(result);
                    break;
                }
            }
        }

        let mut result = match response {
            Some(result) => result,
            None => self.execute(ctx).await?,
        };

        for interceptor in applicable[..*entered].iter().rev() {
            result = interceptor.after_result(ctx, result).await?;
        }

        if let Some(tx) = ctx.take_tx() {
            if !ctx.events().is_empty() {
                warn!(
                    entity_type = %ctx.entity_type(),
                    operation = %ctx.requested_operation(),
                    events = ctx.events().len(),
                    "Committing with unconsumed domain events; no outbox interceptor installed?"
                );
            }
            tx.commit().await?;
        }
        Ok(result)
    }

    /// The physical store call for the effective operation.
    async fn execute(&self, ctx: &mut InterceptorContext) -> WardenResult<OperationResult> {
        let entity_type = ctx.entity_type().clone();
        let requested = ctx.requested_operation();
        let effective = ctx.operation();

        if effective.is_read() {
            let request = ctx
                .read_request()
                .cloned()
                .ok_or_else(|| ValidationError::RequiredFieldMissing {
                    field: "read_request".to_string(),
                })?;
            return match request.target {
                ReadTarget::ById(id) => Ok(OperationResult::Found(
                    self.store.find(&entity_type, id, request.scope).await?,
                )),
                ReadTarget::Query(query) => Ok(OperationResult::Listed(
                    self.store.query(&entity_type, &query, request.scope).await?,
                )),
            };
        }

        let rows = ctx.rows().to_vec();
        let mut written = Vec::with_capacity(rows.len());

        if effective.is_create() {
            for row in rows {
                written.push(ctx.tx()?.insert(row).await?);
            }
        } else if effective.is_update() {
            for row in rows {
                written.push(ctx.tx()?.update(row).await?);
            }
        } else {
            let mut ids = Vec::with_capacity(rows.len());
            for row in rows {
                if !ctx.tx()?.delete(&entity_type, row.id).await? {
                    return Err(StorageError::NotFound {
                        entity_type,
                        id: row.id,
                    }
                    .into());
                }
                ids.push(row.id);
            }
            return Ok(OperationResult::Deleted { ids, soft: false });
        }

        let ids = written.iter().map(|r| r.id).collect();
        ctx.replace_rows(written.clone());

        if requested.is_delete() {
            // A delete rewritten into a flag update.
            return Ok(OperationResult::Deleted { ids, soft: true });
        }
        Ok(OperationResult::Written {
            rows: written,
            conflicts: ctx.take_conflicts(),
        })
    }

    async fn after_commit(
        &self,
        ctx: &mut InterceptorContext,
        entered: &[Arc<dyn Interceptor>],
        result: &OperationResult,
    ) {
        for interceptor in entered.iter().rev() {
            if let Err(e) = interceptor.after_commit(ctx, result).await {
                warn!(
                    interceptor = interceptor.name(),
                    entity_type = %ctx.entity_type(),
                    error = %e,
                    "After-commit hook failed; committed write stands"
                );
            }
        }
    }

    async fn unwind(
        &self,
        ctx: &mut InterceptorContext,
        entered: &[Arc<dyn Interceptor>],
        error: WardenError,
    ) -> WardenResult<OperationResult> {
        ctx.set_error(error.clone());

        let mut substitute = None;
        for interceptor in entered.iter().rev() {
            if let Some(result) = interceptor.on_error(ctx, &error).await {
                if substitute.is_none() {
                    debug!(
                        interceptor = interceptor.name(),
                        error = %error,
                        "Interceptor substituted a result for the error"
                    );
                    substitute = Some(result);
                }
            }
        }

        if let Some(tx) = ctx.take_tx() {
            if let Err(e) = tx.rollback().await {
                warn!(
                    entity_type = %ctx.entity_type(),
                    error = %e,
                    "Rollback failed"
                );
            }
        }

        match substitute {
            Some(result) => Ok(result),
            None => Err(error),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
