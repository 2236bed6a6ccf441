//! Store ports.
//!
//! [`Store`] is the shared, non-transactional entry point used for reads and
//! to open transactions. [`StoreTx`] is one open transaction; every write the
//! chain performs goes through it so that the entity write, the version bump
//! and the outbox rows commit or roll back together.

use async_trait::async_trait;
use warden_core::{EntityId, EntityType, NewOutboxRecord, Query, ReadScope, Row, WardenResult};

/// Transactional CRUD and filtered reads on typed rows.
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a transaction.
    async fn begin(&self) -> WardenResult<Box<dyn StoreTx>>;

    /// Read one row outside any transaction.
    async fn find(
        &self,
        entity_type: &EntityType,
        id: EntityId,
        scope: ReadScope,
    ) -> WardenResult<Option<Row>>;

    /// Filtered list read outside any transaction.
    async fn query(
        &self,
        entity_type: &EntityType,
        query: &Query,
        scope: ReadScope,
    ) -> WardenResult<Vec<Row>>;
}

/// One open transaction.
///
/// Locking reads (`find_for_update`, `version_for_update`) hold the row until
/// the transaction ends. Dropping a transaction without committing discards
/// its writes.
#[async_trait]
pub trait StoreTx: Send {
    /// Lock every listed row in ascending id order. Rows need not exist.
    ///
    /// Transactions that take all their row locks through this call acquire
    /// them in one global order and cannot deadlock each other.
    async fn lock_rows(
        &mut self,
        entity_type: &EntityType,
        ids: &[EntityId],
    ) -> WardenResult<()> {
        let mut sorted = ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        for id in sorted {
            self.version_for_update(entity_type, id).await?;
        }
        Ok(())
    }

    /// Locking read of the current row, soft-deleted or not.
    async fn find_for_update(
        &mut self,
        entity_type: &EntityType,
        id: EntityId,
    ) -> WardenResult<Option<Row>>;

    /// Locking read of the current version only.
    async fn version_for_update(
        &mut self,
        entity_type: &EntityType,
        id: EntityId,
    ) -> WardenResult<Option<i64>>;

    /// Insert a new row. The stored version is always 1.
    async fn insert(&mut self, row: Row) -> WardenResult<Row>;

    /// Compare-and-set update. `row.version` is the base version; the write
    /// succeeds only if the stored version still equals it, and stores
    /// `base + 1`. Columns not present in `row.fields` keep their stored value.
    async fn update(&mut self, row: Row) -> WardenResult<Row>;

    /// Physically remove a row. Returns false if it did not exist.
    async fn delete(&mut self, entity_type: &EntityType, id: EntityId) -> WardenResult<bool>;

    /// Stage outbox rows in this transaction. Returns how many were staged.
    async fn append_outbox(&mut self, records: Vec<NewOutboxRecord>) -> WardenResult<usize>;

    async fn commit(self: Box<Self>) -> WardenResult<()>;

    async fn rollback(self: Box<Self>) -> WardenResult<()>;
}
