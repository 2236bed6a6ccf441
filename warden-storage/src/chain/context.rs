//! Per-call interceptor context.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use warden_core::{
    constants::SYSTEM_ACTOR, DomainEvent, EntityId, EntityType, OptimisticLockConflict, Query,
    ReadScope, Row, StorageError, WardenError, WardenResult,
};

use crate::chain::operation::Operation;
use crate::store::{Store, StoreTx};

/// What a read asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadTarget {
    ById(EntityId),
    Query(Query),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadRequest {
    pub target: ReadTarget,
    pub scope: ReadScope,
}

/// Mutable state shared by every interceptor for one chain run.
///
/// Created per call and discarded afterwards. Interceptors pass data to each
/// other through the scratch map; standard interceptors namespace their keys
/// (`audit.*`, `soft_delete.*`, `optimistic_lock.*`, `cache.*`, `outbox.*`).
pub struct InterceptorContext {
    entity_type: EntityType,
    requested: Operation,
    effective: Operation,
    rows: Vec<Row>,
    read: Option<ReadRequest>,
    actor: Option<String>,
    events: Vec<DomainEvent>,
    scratch: HashMap<String, Value>,
    conflicts: Vec<OptimisticLockConflict>,
    tx: Option<Box<dyn StoreTx>>,
    store: Option<Arc<dyn Store>>,
    error: Option<WardenError>,
}

impl InterceptorContext {
    fn new(
        entity_type: EntityType,
        operation: Operation,
        rows: Vec<Row>,
        read: Option<ReadRequest>,
    ) -> Self {
        Self {
            entity_type,
            requested: operation,
            effective: operation,
            rows,
            read,
            actor: None,
            events: Vec::new(),
            scratch: HashMap::new(),
            conflicts: Vec::new(),
            tx: None,
            store: None,
            error: None,
        }
    }

    pub fn create(row: Row) -> Self {
        Self::new(row.entity_type.clone(), Operation::Create, vec![row], None)
    }

    pub fn update(row: Row) -> Self {
        Self::new(row.entity_type.clone(), Operation::Update, vec![row], None)
    }

    pub fn delete(entity_type: EntityType, id: EntityId) -> Self {
        let key = Row::new(entity_type.clone(), id);
        Self::new(entity_type, Operation::Delete, vec![key], None)
    }

    pub fn read(entity_type: EntityType, id: EntityId, scope: ReadScope) -> Self {
        let read = ReadRequest {
            target: ReadTarget::ById(id),
            scope,
        };
        Self::new(entity_type, Operation::Read, Vec::new(), Some(read))
    }

    pub fn query(entity_type: EntityType, query: Query, scope: ReadScope) -> Self {
        let read = ReadRequest {
            target: ReadTarget::Query(query),
            scope,
        };
        Self::new(entity_type, Operation::Read, Vec::new(), Some(read))
    }

    pub fn batch_create(entity_type: EntityType, rows: Vec<Row>) -> Self {
        Self::new(entity_type, Operation::BatchCreate, rows, None)
    }

    pub fn batch_update(entity_type: EntityType, rows: Vec<Row>) -> Self {
        Self::new(entity_type, Operation::BatchUpdate, rows, None)
    }

    pub fn batch_delete(entity_type: EntityType, ids: Vec<EntityId>) -> Self {
        let keys = ids
            .into_iter()
            .map(|id| Row::new(entity_type.clone(), id))
            .collect();
        Self::new(entity_type, Operation::BatchDelete, keys, None)
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_events(mut self, events: impl IntoIterator<Item = DomainEvent>) -> Self {
        self.events.extend(events);
        self
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    /// The operation the caller asked for. Never changes.
    pub fn requested_operation(&self) -> Operation {
        self.requested
    }

    /// The operation the store will execute.
    pub fn operation(&self) -> Operation {
        self.effective
    }

    pub fn set_operation(&mut self, operation: Operation) {
        self.effective = operation;
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut Vec<Row> {
        &mut self.rows
    }

    pub fn replace_rows(&mut self, rows: Vec<Row>) -> Vec<Row> {
        std::mem::replace(&mut self.rows, rows)
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.rows.iter().map(|r| r.id).collect()
    }

    pub fn read_request(&self) -> Option<&ReadRequest> {
        self.read.as_ref()
    }

    pub fn actor(&self) -> Option<&str> {
        self.actor.as_deref()
    }

    pub fn actor_or_system(&self) -> &str {
        self.actor.as_deref().unwrap_or(SYSTEM_ACTOR)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Raise a domain event. It is written to the outbox in this call's
    /// transaction if an outbox interceptor is installed.
    pub fn raise(&mut self, event: DomainEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[DomainEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.events)
    }

    // ------------------------------------------------------------------
    // Scratch
    // ------------------------------------------------------------------

    pub fn scratch(&self, key: &str) -> Option<&Value> {
        self.scratch.get(key)
    }

    pub fn set_scratch(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.scratch.insert(key.into(), value.into());
    }

    pub fn take_scratch(&mut self, key: &str) -> Option<Value> {
        self.scratch.remove(key)
    }

    /// True if the scratch key holds `true`.
    pub fn scratch_flag(&self, key: &str) -> bool {
        matches!(self.scratch.get(key), Some(Value::Bool(true)))
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    pub fn record_conflict(&mut self, conflict: OptimisticLockConflict) {
        self.conflicts.push(conflict);
    }

    pub fn conflicts(&self) -> &[OptimisticLockConflict] {
        &self.conflicts
    }

    pub(crate) fn take_conflicts(&mut self) -> Vec<OptimisticLockConflict> {
        std::mem::take(&mut self.conflicts)
    }

    // ------------------------------------------------------------------
    // Store access
    // ------------------------------------------------------------------

    /// The open transaction. Writes only.
    pub fn tx(&mut self) -> WardenResult<&mut Box<dyn StoreTx>> {
        let operation = self.requested;
        self.tx.as_mut().ok_or_else(|| {
            StorageError::TransactionFailed {
                reason: format!("no transaction open for {operation}"),
            }
            .into()
        })
    }

    pub fn has_tx(&self) -> bool {
        self.tx.is_some()
    }

    /// The shared store, for reads.
    pub fn store(&self) -> WardenResult<&Arc<dyn Store>> {
        self.store.as_ref().ok_or_else(|| {
            StorageError::Backend {
                reason: "context is not attached to a store".to_string(),
            }
            .into()
        })
    }

    pub(crate) fn attach_store(&mut self, store: Arc<dyn Store>) {
        self.store = Some(store);
    }

    pub(crate) fn attach_tx(&mut self, tx: Box<dyn StoreTx>) {
        self.tx = Some(tx);
    }

    pub(crate) fn take_tx(&mut self) -> Option<Box<dyn StoreTx>> {
        self.tx.take()
    }

    /// The error the chain is unwinding with, while `on_error` hooks run.
    pub fn error(&self) -> Option<&WardenError> {
        self.error.as_ref()
    }

    pub(crate) fn set_error(&mut self, error: WardenError) {
        self.error = Some(error);
    }
}

impl std::fmt::Debug for InterceptorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorContext")
            .field("entity_type", &self.entity_type)
            .field("requested", &self.requested)
            .field("effective", &self.effective)
            .field("rows", &self.rows.len())
            .field("read", &self.read)
            .field("actor", &self.actor)
            .field("events", &self.events.len())
            .field("has_tx", &self.tx.is_some())
            .finish()
    }
}
