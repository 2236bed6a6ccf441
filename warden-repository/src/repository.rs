//! Repository facade over the interceptor chain.
//!
//! Every method builds one [`InterceptorContext`] and runs it through the
//! chain, so audit stamping, soft deletion, version checks, caching and
//! outbox writes apply uniformly to every entry point.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use warden_core::{
    DomainEvent, EntityId, EntityType, OptimisticLockConflict, Query, ReadScope, Row,
    StorageError, WardenError, WardenResult,
};
use warden_storage::{InterceptorChain, InterceptorContext, Operation, OperationResult};

/// Per-call options for writes.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Principal recorded by the audit and soft-delete interceptors.
    pub actor: Option<String>,
    /// Events written to the outbox in the same transaction.
    pub events: Vec<DomainEvent>,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by(actor: impl Into<String>) -> Self {
        Self {
            actor: Some(actor.into()),
            events: Vec::new(),
        }
    }

    pub fn with_event(mut self, event: DomainEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn with_events(mut self, events: impl IntoIterator<Item = DomainEvent>) -> Self {
        self.events.extend(events);
        self
    }

    fn apply(self, ctx: InterceptorContext) -> InterceptorContext {
        let ctx = ctx.with_events(self.events);
        match self.actor {
            Some(actor) => ctx.with_actor(actor),
            None => ctx,
        }
    }
}

/// How a delete was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteKind {
    /// The row was flagged and still exists.
    Soft,
    /// The row was physically removed.
    Hard,
}

/// Outcome of a batch update.
///
/// Under the default abort policy a conflict fails the call instead, so
/// `conflicts` is only ever non-empty with per-row reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchWrite {
    pub rows: Vec<Row>,
    pub conflicts: Vec<OptimisticLockConflict>,
}

impl BatchWrite {
    pub fn is_complete(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Typed entry points for CRUD through the chain.
#[derive(Clone)]
pub struct Repository {
    chain: Arc<InterceptorChain>,
}

impl Repository {
    pub fn new(chain: Arc<InterceptorChain>) -> Self {
        Self { chain }
    }

    pub fn chain(&self) -> &Arc<InterceptorChain> {
        &self.chain
    }

    // ------------------------------------------------------------------
    // Single-row writes
    // ------------------------------------------------------------------

    /// Insert a new row. The returned row carries version 1 and any audit
    /// columns.
    pub async fn create(&self, row: Row, options: WriteOptions) -> WardenResult<Row> {
        let result = self
            .chain
            .run(options.apply(InterceptorContext::create(row)))
            .await?;
        single(Operation::Create, result)
    }

    /// Update a row read at `row.version`. Only the columns present in
    /// `row.fields` change.
    ///
    /// Fails with [`OptimisticLockConflict`] if the row moved on since it was
    /// read; re-read and retry.
    pub async fn update(&self, row: Row, options: WriteOptions) -> WardenResult<Row> {
        let result = self
            .chain
            .run(options.apply(InterceptorContext::update(row)))
            .await?;
        single(Operation::Update, result)
    }

    pub async fn delete(
        &self,
        entity_type: &EntityType,
        id: EntityId,
        options: WriteOptions,
    ) -> WardenResult<DeleteKind> {
        let ctx = InterceptorContext::delete(entity_type.clone(), id);
        match self.chain.run(options.apply(ctx)).await? {
            OperationResult::Deleted { soft: true, .. } => Ok(DeleteKind::Soft),
            OperationResult::Deleted { soft: false, .. } => Ok(DeleteKind::Hard),
            other => Err(unexpected(Operation::Delete, &other)),
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Read one row. Soft-deleted rows read as absent.
    pub async fn get(&self, entity_type: &EntityType, id: EntityId) -> WardenResult<Option<Row>> {
        self.find(entity_type, id, ReadScope::ExcludeDeleted).await
    }

    /// Read one row whether or not it is soft-deleted. Bypasses the cache.
    pub async fn get_including_deleted(
        &self,
        entity_type: &EntityType,
        id: EntityId,
    ) -> WardenResult<Option<Row>> {
        self.find(entity_type, id, ReadScope::IncludeDeleted).await
    }

    /// Like [`get`](Self::get), failing with `NotFound` when absent.
    pub async fn require(&self, entity_type: &EntityType, id: EntityId) -> WardenResult<Row> {
        self.get(entity_type, id).await?.ok_or_else(|| {
            StorageError::NotFound {
                entity_type: entity_type.clone(),
                id,
            }
            .into()
        })
    }

    /// Read one row and deserialize its columns.
    pub async fn get_as<T: DeserializeOwned>(
        &self,
        entity_type: &EntityType,
        id: EntityId,
    ) -> WardenResult<Option<T>> {
        match self.get(entity_type, id).await? {
            Some(row) => Ok(Some(row.to_entity()?)),
            None => Ok(None),
        }
    }

    pub async fn query(&self, entity_type: &EntityType, query: Query) -> WardenResult<Vec<Row>> {
        self.list(entity_type, query, ReadScope::ExcludeDeleted).await
    }

    pub async fn query_including_deleted(
        &self,
        entity_type: &EntityType,
        query: Query,
    ) -> WardenResult<Vec<Row>> {
        self.list(entity_type, query, ReadScope::IncludeDeleted).await
    }

    async fn find(
        &self,
        entity_type: &EntityType,
        id: EntityId,
        scope: ReadScope,
    ) -> WardenResult<Option<Row>> {
        let ctx = InterceptorContext::read(entity_type.clone(), id, scope);
        match self.chain.run(ctx).await? {
            OperationResult::Found(row) => Ok(row),
            other => Err(unexpected(Operation::Read, &other)),
        }
    }

    async fn list(
        &self,
        entity_type: &EntityType,
        query: Query,
        scope: ReadScope,
    ) -> WardenResult<Vec<Row>> {
        let ctx = InterceptorContext::query(entity_type.clone(), query, scope);
        match self.chain.run(ctx).await? {
            OperationResult::Listed(rows) => Ok(rows),
            other => Err(unexpected(Operation::Read, &other)),
        }
    }

    // ------------------------------------------------------------------
    // Typed writes
    // ------------------------------------------------------------------

    /// Serialize `entity` into a new row and insert it.
    pub async fn create_from<T: Serialize>(
        &self,
        entity_type: &EntityType,
        id: EntityId,
        entity: &T,
        options: WriteOptions,
    ) -> WardenResult<Row> {
        let row = Row::from_entity(entity_type.clone(), id, entity)?;
        self.create(row, options).await
    }

    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    /// Insert rows in one transaction. Any failure inserts none of them.
    pub async fn batch_create(
        &self,
        entity_type: &EntityType,
        rows: Vec<Row>,
        options: WriteOptions,
    ) -> WardenResult<Vec<Row>> {
        let ctx = InterceptorContext::batch_create(entity_type.clone(), rows);
        match self.chain.run(options.apply(ctx)).await? {
            OperationResult::Written { rows, .. } => Ok(rows),
            other => Err(unexpected(Operation::BatchCreate, &other)),
        }
    }

    /// Update rows in one transaction.
    pub async fn batch_update(
        &self,
        entity_type: &EntityType,
        rows: Vec<Row>,
        options: WriteOptions,
    ) -> WardenResult<BatchWrite> {
        let ctx = InterceptorContext::batch_update(entity_type.clone(), rows);
        match self.chain.run(options.apply(ctx)).await? {
            OperationResult::Written { rows, conflicts } => Ok(BatchWrite { rows, conflicts }),
            other => Err(unexpected(Operation::BatchUpdate, &other)),
        }
    }

    /// Delete rows in one transaction. Returns the ids deleted and how.
    pub async fn batch_delete(
        &self,
        entity_type: &EntityType,
        ids: Vec<EntityId>,
        options: WriteOptions,
    ) -> WardenResult<(Vec<EntityId>, DeleteKind)> {
        let ctx = InterceptorContext::batch_delete(entity_type.clone(), ids);
        match self.chain.run(options.apply(ctx)).await? {
            OperationResult::Deleted { ids, soft } => {
                let kind = if soft { DeleteKind::Soft } else { DeleteKind::Hard };
                Ok((ids, kind))
            }
            other => Err(unexpected(Operation::BatchDelete, &other)),
        }
    }
}

fn single(operation: Operation, result: OperationResult) -> WardenResult<Row> {
    match result {
        OperationResult::Written { mut rows, .. } if rows.len() == 1 => rows
            .pop()
            .ok_or_else(|| unexpected(operation, &OperationResult::Listed(Vec::new()))),
        other => Err(unexpected(operation, &other)),
    }
}

/// A result shape the operation cannot produce unless an interceptor
/// substituted something incompatible.
fn unexpected(operation: Operation, result: &OperationResult) -> WardenError {
    let shape = match result {
        OperationResult::Written { rows, .. } => format!("{} written rows", rows.len()),
        OperationResult::Deleted { ids, .. } => format!("{} deleted ids", ids.len()),
        OperationResult::Found(_) => "a single-row read".to_string(),
        OperationResult::Listed(rows) => format!("a list of {} rows", rows.len()),
    };
    StorageError::Backend {
        reason: format!("{operation} produced {shape}"),
    }
    .into()
}
