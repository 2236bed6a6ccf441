//! In-memory reference store.
//!
//! Entity tables and the outbox table live behind one `RwLock`. Row locks are
//! per-key `tokio::sync::Mutex`es acquired by locking reads and writes and held
//! by the transaction until it commits, rolls back or is dropped. Writes are
//! staged in the transaction and applied atomically at commit, where update
//! versions are re-checked against the table.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use warden_core::{
    EntityId, EntityType, NewOutboxRecord, OptimisticLockConflict, OutboxId, OutboxRecord,
    OutboxStatus, Query, ReadScope, Row, StorageError, Timestamp, WardenResult,
};

use crate::registry::EntityRegistry;
use crate::store::{Store, StoreTx};

type RowKey = (EntityType, EntityId);

#[derive(Debug, Default)]
struct Tables {
    rows: HashMap<EntityType, HashMap<EntityId, Row>>,
    outbox: BTreeMap<OutboxId, OutboxRecord>,
    next_outbox_id: OutboxId,
}

impl Tables {
    fn row(&self, key: &RowKey) -> Option<&Row> {
        self.rows.get(&key.0).and_then(|table| table.get(&key.1))
    }
}

/// In-memory [`Store`] with real row locking and an outbox table.
#[derive(Clone)]
pub struct MemoryStore {
    registry: Arc<EntityRegistry>,
    tables: Arc<RwLock<Tables>>,
    row_locks: Arc<Mutex<HashMap<RowKey, Arc<AsyncMutex<()>>>>>,
}

impl MemoryStore {
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self {
            registry,
            tables: Arc::new(RwLock::new(Tables::default())),
            row_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    fn read_tables(&self) -> WardenResult<RwLockReadGuard<'_, Tables>> {
        Ok(self.tables.read().map_err(|_| StorageError::LockPoisoned)?)
    }

    fn write_tables(&self) -> WardenResult<RwLockWriteGuard<'_, Tables>> {
        Ok(self.tables.write().map_err(|_| StorageError::LockPoisoned)?)
    }

    fn visible(&self, row: &Row, scope: ReadScope) -> bool {
        match (scope, self.registry.soft_delete(&row.entity_type)) {
            (ReadScope::ExcludeDeleted, Some(fields)) => !row.flag(&fields.flag),
            _ => true,
        }
    }

    async fn lock_row(&self, key: RowKey) -> WardenResult<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.row_locks.lock().map_err(|_| StorageError::LockPoisoned)?;
            Arc::clone(locks.entry(key).or_default())
        };
        Ok(lock.lock_owned().await)
    }

    /// Raw row lookup that ignores soft-delete filtering.
    pub fn row_snapshot(&self, entity_type: &EntityType, id: EntityId) -> WardenResult<Option<Row>> {
        let tables = self.read_tables()?;
        Ok(tables.row(&(entity_type.clone(), id)).cloned())
    }

    /// Number of physically present rows of a type.
    pub fn row_count(&self, entity_type: &EntityType) -> WardenResult<usize> {
        let tables = self.read_tables()?;
        Ok(tables.rows.get(entity_type).map(HashMap::len).unwrap_or(0))
    }

    // ------------------------------------------------------------------
    // Outbox table
    // ------------------------------------------------------------------

    /// Claim up to `batch_size` pending rows in id order, flipping them to
    /// `publishing` under the table write lock.
    pub fn outbox_claim(
        &self,
        batch_size: usize,
        claimant: &str,
        now: Timestamp,
    ) -> WardenResult<Vec<OutboxRecord>> {
        let mut tables = self.write_tables()?;
        let mut claimed = Vec::new();
        for record in tables.outbox.values_mut() {
            if claimed.len() >= batch_size {
                break;
            }
            if record.claim(claimant, now) {
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    /// Apply `f` to one outbox row. Returns `None` if the row does not exist.
    pub fn outbox_update<R>(
        &self,
        id: OutboxId,
        f: impl FnOnce(&mut OutboxRecord) -> R,
    ) -> WardenResult<Option<R>> {
        let mut tables = self.write_tables()?;
        Ok(tables.outbox.get_mut(&id).map(f))
    }

    /// Return `publishing` rows claimed before `stale_before` to `pending`.
    pub fn outbox_requeue_stale(&self, stale_before: Timestamp) -> WardenResult<u64> {
        let mut tables = self.write_tables()?;
        let mut requeued = 0;
        for record in tables.outbox.values_mut() {
            if record.is_stale_claim(stale_before) {
                record.requeue();
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    /// Rows in id order, optionally filtered by status.
    pub fn outbox_list(
        &self,
        status: Option<OutboxStatus>,
        limit: usize,
    ) -> WardenResult<Vec<OutboxRecord>> {
        let tables = self.read_tables()?;
        Ok(tables
            .outbox
            .values()
            .filter(|r| status.map(|s| r.status == s).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect())
    }

    pub fn outbox_get(&self, id: OutboxId) -> WardenResult<Option<OutboxRecord>> {
        let tables = self.read_tables()?;
        Ok(tables.outbox.get(&id).cloned())
    }

    pub fn outbox_len(&self) -> WardenResult<usize> {
        Ok(self.read_tables()?.outbox.len())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> WardenResult<Box<dyn StoreTx>> {
        Ok(Box::new(MemoryTx::new(self.clone())))
    }

    async fn find(
        &self,
        entity_type: &EntityType,
        id: EntityId,
        scope: ReadScope,
    ) -> WardenResult<Option<Row>> {
        let tables = self.read_tables()?;
        Ok(tables
            .row(&(entity_type.clone(), id))
            .filter(|row| self.visible(row, scope))
            .cloned())
    }

    async fn query(
        &self,
        entity_type: &EntityType,
        query: &Query,
        scope: ReadScope,
    ) -> WardenResult<Vec<Row>> {
        let tables = self.read_tables()?;
        let mut rows: Vec<Row> = tables
            .rows
            .get(entity_type)
            .map(|table| {
                table
                    .values()
                    .filter(|row| self.visible(row, scope) && row.matches(query))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        // UUIDv7 ids sort by creation time.
        rows.sort_by_key(|row| row.id);
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

#[derive(Debug)]
enum StagedWrite {
    Insert(Row),
    Update { base: i64, row: Row },
    Delete(RowKey),
}

/// Transaction over a [`MemoryStore`].
pub struct MemoryTx {
    store: MemoryStore,
    locks: HashMap<RowKey, OwnedMutexGuard<()>>,
    /// Read-your-writes overlay. `None` marks a row deleted in this tx.
    staged: HashMap<RowKey, Option<Row>>,
    writes: Vec<StagedWrite>,
    outbox: Vec<NewOutboxRecord>,
}

impl MemoryTx {
    fn new(store: MemoryStore) -> Self {
        Self {
            store,
            locks: HashMap::new(),
            staged: HashMap::new(),
            writes: Vec::new(),
            outbox: Vec::new(),
        }
    }

    async fn lock(&mut self, key: &RowKey) -> WardenResult<()> {
        if !self.locks.contains_key(key) {
            let guard = self.store.lock_row(key.clone()).await?;
            self.locks.insert(key.clone(), guard);
        }
        Ok(())
    }

    fn current(&self, key: &RowKey) -> WardenResult<Option<Row>> {
        if let Some(staged) = self.staged.get(key) {
            return Ok(staged.clone());
        }
        let tables = self.store.read_tables()?;
        Ok(tables.row(key).cloned())
    }

    fn apply(&mut self) -> WardenResult<()> {
        let mut tables = self.store.write_tables()?;

        // Validate every write against the table before touching it.
        let mut versions: HashMap<RowKey, Option<i64>> = HashMap::new();
        for write in &self.writes {
            match write {
                StagedWrite::Insert(row) => {
                    let key = (row.entity_type.clone(), row.id);
                    let existing = *versions
                        .entry(key.clone())
                        .or_insert_with(|| tables.row(&key).map(|r| r.version));
                    if existing.is_some() {
                        return Err(StorageError::InsertFailed {
                            entity_type: row.entity_type.clone(),
                            reason: format!("row {} already exists", row.id),
                        }
                        .into());
                    }
                    versions.insert(key, Some(row.version));
                }
                StagedWrite::Update { base, row } => {
                    let key = (row.entity_type.clone(), row.id);
                    let existing = *versions
                        .entry(key.clone())
                        .or_insert_with(|| tables.row(&key).map(|r| r.version));
                    match existing {
                        Some(actual) if actual == *base => {
                            versions.insert(key, Some(row.version));
                        }
                        Some(actual) => {
                            return Err(OptimisticLockConflict {
                                entity_type: row.entity_type.clone(),
                                id: row.id,
                                expected: *base,
                                actual,
                            }
                            .into())
                        }
                        None => {
                            return Err(StorageError::NotFound {
                                entity_type: row.entity_type.clone(),
                                id: row.id,
                            }
                            .into())
                        }
                    }
                }
                StagedWrite::Delete(key) => {
                    versions.insert(key.clone(), None);
                }
            }
        }

        for write in self.writes.drain(..) {
            match write {
                StagedWrite::Insert(row) | StagedWrite::Update { row, .. } => {
                    tables
                        .rows
                        .entry(row.entity_type.clone())
                        .or_default()
                        .insert(row.id, row);
                }
                StagedWrite::Delete((entity_type, id)) => {
                    if let Some(table) = tables.rows.get_mut(&entity_type) {
                        table.remove(&id);
                    }
                }
            }
        }

        let created_at = Utc::now();
        for record in self.outbox.drain(..) {
            tables.next_outbox_id += 1;
            let id = tables.next_outbox_id;
            tables
                .outbox
                .insert(id, OutboxRecord::from_new(id, record, created_at));
        }
        Ok(())
    }

    fn release_locks(&mut self) {
        let keys: Vec<RowKey> = self
            .locks
            .drain()
            .map(|(key, guard)| {
                drop(guard);
                key
            })
            .collect();
        if keys.is_empty() {
            return;
        }
        if let Ok(mut locks) = self.store.row_locks.lock() {
            for key in keys {
                let idle = locks
                    .get(&key)
                    .map(|lock| Arc::strong_count(lock) == 1)
                    .unwrap_or(false);
                if idle {
                    locks.remove(&key);
                }
            }
        }
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        self.release_locks();
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn find_for_update(
        &mut self,
        entity_type: &EntityType,
        id: EntityId,
    ) -> WardenResult<Option<Row>> {
        let key = (entity_type.clone(), id);
        self.lock(&key).await?;
        self.current(&key)
    }

    async fn version_for_update(
        &mut self,
        entity_type: &EntityType,
        id: EntityId,
    ) -> WardenResult<Option<i64>> {
        Ok(self
            .find_for_update(entity_type, id)
            .await?
            .map(|row| row.version))
    }

    async fn insert(&mut self, mut row: Row) -> WardenResult<Row> {
        let key = (row.entity_type.clone(), row.id);
        self.lock(&key).await?;
        if self.current(&key)?.is_some() {
            return Err(StorageError::InsertFailed {
                entity_type: row.entity_type.clone(),
                reason: format!("row {} already exists", row.id),
            }
            .into());
        }
        row.version = 1;
        self.staged.insert(key, Some(row.clone()));
        self.writes.push(StagedWrite::Insert(row.clone()));
        Ok(row)
    }

    async fn update(&mut self, row: Row) -> WardenResult<Row> {
        let key = (row.entity_type.clone(), row.id);
        self.lock(&key).await?;
        let current = self.current(&key)?.ok_or_else(|| StorageError::NotFound {
            entity_type: row.entity_type.clone(),
            id: row.id,
        })?;
        let base = row.version;
        if current.version != base {
            return Err(OptimisticLockConflict {
                entity_type: row.entity_type.clone(),
                id: row.id,
                expected: base,
                actual: current.version,
            }
            .into());
        }
        let mut merged = current;
        merged.fields.extend(row.fields);
        merged.version = base + 1;
        self.staged.insert(key, Some(merged.clone()));
        self.writes.push(StagedWrite::Update {
            base,
            row: merged.clone(),
        });
        Ok(merged)
    }

    async fn delete(&mut self, entity_type: &EntityType, id: EntityId) -> WardenResult<bool> {
        let key = (entity_type.clone(), id);
        self.lock(&key).await?;
        if self.current(&key)?.is_none() {
            return Ok(false);
        }
        self.staged.insert(key.clone(), None);
        self.writes.push(StagedWrite::Delete(key));
        Ok(true)
    }

    async fn append_outbox(&mut self, records: Vec<NewOutboxRecord>) -> WardenResult<usize> {
        let count = records.len();
        self.outbox.extend(records);
        Ok(count)
    }

    async fn commit(self: Box<Self>) -> WardenResult<()> {
        let mut tx = self;
        let result = tx.apply();
        tx.release_locks();
        result
    }

    async fn rollback(self: Box<Self>) -> WardenResult<()> {
        let mut tx = self;
        tx.writes.clear();
        tx.outbox.clear();
        tx.release_locks();
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
