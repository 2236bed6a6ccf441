//! WARDEN Test Utilities
//!
//! Shared test infrastructure for the WARDEN workspace:
//! - Instrumented and faulty doubles for the store, cache and sink ports
//! - Fixtures for a small orders domain
//! - Proptest generators for rows, queries and events
//! - Assertions for WARDEN-specific error shapes

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;
use warden_outbox::Sink;
use warden_storage::{CacheBackend, Store, StoreTx};

pub use warden_core::{
    new_entity_id, CacheConfig, CacheError, DomainEvent, EntityId, EntityType,
    OptimisticLockConflict, OutboxStatus, ProjectorConfig, PublishError, Query, ReadScope, Row,
    StorageError, ValidationError, WardenConfig, WardenError, WardenResult,
};
pub use warden_storage::MemoryStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Install a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`, defaults to `warn`. Safe to call from every test.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// INSTRUMENTED STORE
// ============================================================================

/// A [`Store`] wrapper that counts calls and can slow reads down.
///
/// Used to prove how many reads actually reach the store, for example that a
/// cache stampede collapses into a single load.
pub struct CountingStore {
    inner: Arc<dyn Store>,
    read_delay: Option<Duration>,
    finds: AtomicUsize,
    queries: AtomicUsize,
    begins: AtomicUsize,
    fail_reads: AtomicBool,
}

impl CountingStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self {
            inner,
            read_delay: None,
            finds: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
            begins: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Sleep this long inside every `find` and `query`, before delegating.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    pub fn finds(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// `find` plus `query` calls.
    pub fn reads(&self) -> usize {
        self.finds() + self.queries()
    }

    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    /// Make every subsequent read fail with a backend error.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.finds.store(0, Ordering::SeqCst);
        self.queries.store(0, Ordering::SeqCst);
        self.begins.store(0, Ordering::SeqCst);
    }

    async fn before_read(&self) -> WardenResult<()> {
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Backend {
                reason: "injected read failure".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl Store for CountingStore {
    async fn begin(&self) -> WardenResult<Box<dyn StoreTx>> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        self.inner.begin().await
    }

    async fn find(
        &self,
        entity_type: &EntityType,
        id: EntityId,
        scope: ReadScope,
    ) -> WardenResult<Option<Row>> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        self.before_read().await?;
        self.inner.find(entity_type, id, scope).await
    }

    async fn query(
        &self,
        entity_type: &EntityType,
        query: &Query,
        scope: ReadScope,
    ) -> WardenResult<Vec<Row>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.before_read().await?;
        self.inner.query(entity_type, query, scope).await
    }
}

// ============================================================================
// FAULTY CACHE
// ============================================================================

/// A [`CacheBackend`] where every call fails, as if the cache server were
/// unreachable.
#[derive(Debug, Default)]
pub struct FailingCache {
    calls: AtomicUsize,
}

impl FailingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn refuse(&self) -> CacheError {
        self.calls.fetch_add(1, Ordering::SeqCst);
        CacheError::Backend {
            reason: "connection refused".to_string(),
        }
    }
}

#[async_trait]
impl CacheBackend for FailingCache {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Err(self.refuse())
    }

    async fn set(
        &self,
        _key: &str,
        _value: Vec<u8>,
        _ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        Err(self.refuse())
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Err(self.refuse())
    }
}

// ============================================================================
// SINKS
// ============================================================================

/// A [`Sink`] that accepts everything and remembers what it saw, in order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<DomainEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        lock(&self.events).clone()
    }

    pub fn event_ids(&self) -> Vec<Uuid> {
        lock(&self.events).iter().map(|e| e.event_id).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn publish(&self, event: &DomainEvent) -> Result<(), PublishError> {
        lock(&self.events).push(event.clone());
        Ok(())
    }
}

/// A [`Sink`] that rejects deliveries.
///
/// By default it rejects forever. [`FailingSink::failing_times`] makes it
/// recover after a fixed number of rejections.
#[derive(Debug, Default)]
pub struct FailingSink {
    attempts: AtomicUsize,
    fail_first: Option<usize>,
    delivered: Mutex<Vec<DomainEvent>>,
}

impl FailingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the first `n` deliveries, accept the rest.
    pub fn failing_times(n: usize) -> Self {
        Self {
            fail_first: Some(n),
            ..Self::default()
        }
    }

    /// Every call to `publish`, accepted or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<DomainEvent> {
        lock(&self.delivered).clone()
    }
}

#[async_trait]
impl Sink for FailingSink {
    async fn publish(&self, event: &DomainEvent) -> Result<(), PublishError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match self.fail_first {
            Some(n) if attempt > n => {
                lock(&self.delivered).push(event.clone());
                Ok(())
            }
            _ => Err(PublishError::Sink {
                event_type: event.event_type.clone(),
                reason: format!("broker unavailable (attempt {attempt})"),
            }),
        }
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! A small orders domain used across the integration tests.

    use super::*;
    use serde_json::json;
    use warden_storage::{
        AuditFields, CachePolicy, EntityConfig, EntityRegistry, SoftDeleteFields,
    };

    pub const ORDER: &str = "order";
    pub const CUSTOMER: &str = "customer";
    pub const AUDIT_LOG: &str = "audit_log";

    pub fn order_type() -> EntityType {
        EntityType::new(ORDER)
    }

    /// Three types covering every interceptor combination the tests need:
    ///
    /// - `order`: audited, soft-deleted, versioned, cached with list caching
    /// - `customer`: audited (timestamps only), versioned, row caching only
    /// - `audit_log`: unversioned, hard-deleted, uncached
    pub fn orders_registry() -> EntityRegistry {
        EntityRegistry::new()
            .register(
                ORDER,
                EntityConfig::new()
                    .with_audit(AuditFields::default())
                    .with_soft_delete(SoftDeleteFields::default())
                    .with_cache(CachePolicy::new().with_query_caching()),
            )
            .register(
                CUSTOMER,
                EntityConfig::new()
                    .with_audit(AuditFields::timestamps_only())
                    .with_cache(CachePolicy::new()),
            )
            .register(AUDIT_LOG, EntityConfig::new().unversioned())
    }

    /// A new, unsaved order.
    pub fn order_row(status: &str, total_cents: i64) -> Row {
        Row::new(order_type(), new_entity_id())
            .with_field("status", status)
            .with_field("total_cents", total_cents)
    }

    pub fn customer_row(name: &str) -> Row {
        Row::new(EntityType::new(CUSTOMER), new_entity_id()).with_field("name", name)
    }

    pub fn order_placed(row: &Row) -> DomainEvent {
        DomainEvent::for_entity(
            ORDER,
            row.id,
            "OrderPlaced",
            json!({
                "status": row.get("status"),
                "total_cents": row.get("total_cents"),
            }),
        )
    }

    pub fn order_updated(row: &Row) -> DomainEvent {
        DomainEvent::for_entity(ORDER, row.id, "OrderUpdated", json!({ "fields": row.fields }))
    }

    /// Cache config without jitter and with a short single-flight timeout.
    pub fn test_cache_config() -> CacheConfig {
        CacheConfig::default()
            .with_jitter_ratio(0.0)
            .with_singleflight_timeout(Duration::from_secs(2))
    }

    /// Projector config tuned for tests: small batches, near-zero delays.
    pub fn fast_projector_config() -> ProjectorConfig {
        ProjectorConfig::development()
            .with_batch_size(10)
            .with_max_retry(3)
            .with_busy_delay(Duration::from_millis(1))
            .with_idle_delays(Duration::from_millis(1), Duration::from_millis(10))
            .with_stale_after(Duration::from_secs(60))
            .with_reaper_interval(Duration::from_secs(60))
    }

    pub fn test_config() -> WardenConfig {
        WardenConfig::development()
            .with_cache(test_cache_config())
            .with_projector(fast_projector_config())
    }

    /// An in-memory store over [`orders_registry`].
    pub fn memory_store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(Arc::new(orders_registry())))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for WARDEN types.

    use super::*;
    use proptest::prelude::*;
    use serde_json::Value;

    pub fn arb_entity_id() -> impl Strategy<Value = EntityId> {
        any::<u128>().prop_map(Uuid::from_u128)
    }

    pub fn arb_field_name() -> impl Strategy<Value = String> {
        "[a-z][a-z_]{0,11}"
    }

    /// JSON scalars as they appear in row columns.
    pub fn arb_field_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-zA-Z0-9 ]{0,24}".prop_map(Value::from),
        ]
    }

    /// A fresh row of the given type with up to six user columns.
    pub fn arb_row(entity_type: &'static str) -> impl Strategy<Value = Row> {
        (
            arb_entity_id(),
            proptest::collection::btree_map(arb_field_name(), arb_field_value(), 0..6),
        )
            .prop_map(move |(id, fields)| {
                fields
                    .into_iter()
                    .fold(Row::new(EntityType::new(entity_type), id), |row, (k, v)| {
                        row.with_field(k, v)
                    })
            })
    }

    pub fn arb_query() -> impl Strategy<Value = Query> {
        (
            proptest::collection::btree_map(arb_field_name(), arb_field_value(), 0..4),
            proptest::option::of(1usize..100),
        )
            .prop_map(|(equals, limit)| {
                let query = equals
                    .into_iter()
                    .fold(Query::new(), |q, (k, v)| q.where_eq(k, v));
                match limit {
                    Some(limit) => query.limit(limit),
                    None => query,
                }
            })
    }

    pub fn arb_domain_event() -> impl Strategy<Value = DomainEvent> {
        (
            "[a-z]{3,10}",
            arb_entity_id(),
            "[A-Z][a-zA-Z]{3,15}",
            arb_field_value(),
        )
            .prop_map(|(aggregate_type, id, event_type, value)| {
                DomainEvent::for_entity(
                    aggregate_type,
                    id,
                    event_type,
                    serde_json::json!({ "value": value }),
                )
            })
    }

    pub fn arb_outbox_status() -> impl Strategy<Value = OutboxStatus> {
        prop_oneof![
            Just(OutboxStatus::Pending),
            Just(OutboxStatus::Publishing),
            Just(OutboxStatus::Published),
            Just(OutboxStatus::Error),
        ]
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for WARDEN error shapes.

    use super::*;

    /// Assert an optimistic lock conflict with the given versions and return it.
    #[track_caller]
    pub fn assert_conflict<T: std::fmt::Debug>(
        result: WardenResult<T>,
        expected: i64,
        actual: i64,
    ) -> OptimisticLockConflict {
        match result {
            Err(WardenError::Conflict(conflict)) => {
                assert_eq!(conflict.expected, expected, "expected version mismatch");
                assert_eq!(conflict.actual, actual, "actual version mismatch");
                conflict
            }
            other => panic!("Expected OptimisticLockConflict, got {:?}", other),
        }
    }

    /// Assert that a result is a not-found storage error.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: WardenResult<T>) {
        match result {
            Err(ref e) if e.is_not_found() => {}
            other => panic!("Expected StorageError::NotFound, got {:?}", other),
        }
    }

    /// Assert that a result is a validation error.
    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: WardenResult<T>) -> ValidationError {
        match result {
            Err(WardenError::Validation(e)) => e,
            other => panic!("Expected ValidationError, got {:?}", other),
        }
    }

    /// Assert a row carries a non-null column.
    #[track_caller]
    pub fn assert_has_field(row: &Row, field: &str) {
        match row.get(field) {
            Some(value) if !value.is_null() => {}
            other => panic!("Expected {field} to be set on {}, got {:?}", row.id, other),
        }
    }

    /// Assert two rows are the same entity at the same version.
    #[track_caller]
    pub fn assert_same_version(left: &Row, right: &Row) {
        assert_eq!(left.id, right.id, "different entities");
        assert_eq!(left.version, right.version, "versions differ for {}", left.id);
    }
}

// ============================================================================
// TESTS
// ============================================================================
