//! Read-through cache interceptor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use tracing::{debug, trace, warn};
use uuid::Uuid;
use warden_core::{CacheConfig, CacheError, EntityType, ReadScope, Row, WardenResult};

use crate::cache::backend::{CacheBackend, CacheEntry};
use crate::cache::keys::{jittered_ttl, DefaultKeyStrategy, KeyStrategy};
use crate::cache::singleflight::{SingleflightGroup, StaleMark};
use crate::cache::stats::{CacheCounters, CacheStatsSnapshot};
use crate::chain::{Flow, Interceptor, InterceptorContext, OperationResult, Priority, ReadTarget};
use crate::registry::EntityRegistry;
use crate::store::Store;

/// A decoded cache slot.
enum Cached {
    Row(Row),
    Rows(Vec<Row>),
    Absent,
}

impl Cached {
    fn into_result(self) -> OperationResult {
        match self {
            Cached::Row(row) => OperationResult::Found(Some(row)),
            Cached::Rows(rows) => OperationResult::Listed(rows),
            Cached::Absent => OperationResult::Found(None),
        }
    }
}

async fn read_slot(
    backend: &dyn CacheBackend,
    key: &str,
    list: bool,
) -> Result<Option<Cached>, CacheError> {
    let Some(bytes) = backend.get(key).await? else {
        return Ok(None);
    };
    let cached = if list {
        match CacheEntry::<Vec<Row>>::decode(key, &bytes)? {
            CacheEntry::Found(rows) => Cached::Rows(rows),
            CacheEntry::Absent => Cached::Rows(Vec::new()),
        }
    } else {
        match CacheEntry::<Row>::decode(key, &bytes)? {
            CacheEntry::Found(row) => Cached::Row(row),
            CacheEntry::Absent => Cached::Absent,
        }
    };
    Ok(Some(cached))
}

/// Encoded slot and its base TTL, or `None` for results that are not cached.
fn encode_result(
    key: &str,
    result: &OperationResult,
    ttl: Duration,
    null_ttl: Duration,
) -> Result<Option<(Vec<u8>, Duration)>, CacheError> {
    Ok(match result {
        OperationResult::Found(Some(row)) => Some((CacheEntry::Found(row).encode(key)?, ttl)),
        OperationResult::Found(None) => Some((CacheEntry::<Row>::Absent.encode(key)?, null_ttl)),
        OperationResult::Listed(rows) => Some((CacheEntry::Found(rows).encode(key)?, ttl)),
        OperationResult::Written { .. } | OperationResult::Deleted { .. } => None,
    })
}

/// Read-through cache for entity types with a [`CachePolicy`].
///
/// Misses are coalesced per key through a [`SingleflightGroup`]; confirmed
/// misses are cached as [`CacheEntry::Absent`]; every TTL is jittered. Writes
/// invalidate after commit. Cache failures are logged, counted and degrade to
/// store reads; they never fail the operation.
///
/// [`CachePolicy`]: crate::registry::CachePolicy
pub struct CacheInterceptor {
    backend: Arc<dyn CacheBackend>,
    keys: Arc<dyn KeyStrategy>,
    registry: Arc<EntityRegistry>,
    config: CacheConfig,
    flights: SingleflightGroup<OperationResult>,
    counters: Arc<CacheCounters>,
}

impl CacheInterceptor {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        registry: Arc<EntityRegistry>,
        config: CacheConfig,
    ) -> Self {
        if let Err(e) = config.validate() {
            warn!(error = %e, "Cache config out of range; TTL jitter is clamped");
        }
        let keys = Arc::new(DefaultKeyStrategy::new(config.key_prefix.clone()));
        Self {
            backend,
            keys,
            registry,
            config,
            flights: SingleflightGroup::new(),
            counters: Arc::new(CacheCounters::default()),
        }
    }

    pub fn with_key_strategy(mut self, keys: Arc<dyn KeyStrategy>) -> Self {
        self.keys = keys;
        self
    }

    pub fn get_stats(&self) -> CacheStatsSnapshot {
        self.counters.snapshot()
    }

    pub fn reset_stats(&self) {
        self.counters.reset();
    }

    /// A lookup the cache could not answer; the caller goes on to the store.
    fn degraded(&self, key: &str, error: &CacheError) {
        warn!(key, error = %error, "Cache lookup failed, falling back to store");
        CacheCounters::bump(&self.counters.errors);
        CacheCounters::bump(&self.counters.fail_open);
    }

    /// Current list generation of a type. `None` if it cannot be read.
    async fn generation(&self, entity_type: &EntityType) -> Option<String> {
        let key = self.keys.generation_key(entity_type);
        match self.backend.get(&key).await {
            Ok(Some(bytes)) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Ok(None) => Some("0".to_string()),
            Err(e) => {
                self.degraded(&key, &e);
                None
            }
        }
    }

    fn load(
        &self,
        store: Arc<dyn Store>,
        entity_type: EntityType,
        target: ReadTarget,
        key: String,
        (ttl, null_ttl): (Duration, Duration),
        stale: StaleMark,
    ) -> BoxFuture<'static, WardenResult<OperationResult>> {
        let backend = Arc::clone(&self.backend);
        let counters = Arc::clone(&self.counters);
        let jitter = self.config.jitter_ratio;

        async move {
            let list = matches!(target, ReadTarget::Query(_));
            // A flight that just finished may have filled the slot.
            if let Ok(Some(cached)) = read_slot(backend.as_ref(), &key, list).await {
                return Ok(cached.into_result());
            }

            let result = match target {
                ReadTarget::ById(id) => OperationResult::Found(
                    store.find(&entity_type, id, ReadScope::ExcludeDeleted).await?,
                ),
                ReadTarget::Query(query) => OperationResult::Listed(
                    store
                        .query(&entity_type, &query, ReadScope::ExcludeDeleted)
                        .await?,
                ),
            };

            if stale.is_stale() {
                trace!(key = %key, "Key invalidated during load, not filling");
                return Ok(result);
            }
            let stored = match encode_result(&key, &result, ttl, null_ttl) {
                Ok(Some((bytes, base_ttl))) => backend
                    .set(&key, bytes, Some(jittered_ttl(base_ttl, jitter)))
                    .await,
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = stored {
                warn!(key = %key, error = %e, "Failed to fill cache");
                CacheCounters::bump(&counters.errors);
            }
            // Invalidated between the check and the fill: undo the fill.
            if stale.is_stale() {
                if let Err(e) = backend.delete(&key).await {
                    warn!(key = %key, error = %e, "Failed to drop stale fill");
                    CacheCounters::bump(&counters.errors);
                }
            }
            Ok(result)
        }
        .boxed()
    }

    async fn invalidate(&self, entity_type: &EntityType, result: &OperationResult, lists: bool) {
        for id in result.written_ids() {
            let key = self.keys.entity_key(entity_type, id);
            // Mark before deleting so a racing fill sees it and backs out.
            if let Err(e) = self.flights.forget(&key) {
                warn!(key = %key, error = %e, "Failed to detach in-flight load");
            }
            if let Err(e) = self.backend.delete(&key).await {
                warn!(key = %key, error = %e, "Failed to invalidate cache entry");
                CacheCounters::bump(&self.counters.errors);
            }
        }

        if lists {
            let key = self.keys.generation_key(entity_type);
            let token = Uuid::now_v7().to_string().into_bytes();
            if let Err(e) = self.backend.set(&key, token, None).await {
                warn!(key = %key, error = %e, "Failed to rotate list generation");
                CacheCounters::bump(&self.counters.errors);
            }
        }
    }
}

#[async_trait]
impl Interceptor for CacheInterceptor {
    fn name(&self) -> &str {
        "cache"
    }

    fn priority(&self) -> Priority {
        Priority::NORMAL
    }

    fn applies_to(&self, ctx: &InterceptorContext) -> bool {
        self.registry.cache_policy(ctx.entity_type()).is_some()
    }

    async fn before(&self, ctx: &mut InterceptorContext) -> WardenResult<Flow> {
        if !ctx.requested_operation().is_read() {
            return Ok(Flow::Continue);
        }
        let Some(request) = ctx.read_request().cloned() else {
            return Ok(Flow::Continue);
        };
        if request.scope == ReadScope::IncludeDeleted {
            return Ok(Flow::Continue);
        }
        let entity_type = ctx.entity_type().clone();
        let Some(policy) = self.registry.cache_policy(&entity_type).cloned() else {
            return Ok(Flow::Continue);
        };

        let list = matches!(request.target, ReadTarget::Query(_));
        let key = match &request.target {
            ReadTarget::ById(id) => self.keys.entity_key(&entity_type, *id),
            ReadTarget::Query(query) => {
                if !policy.cache_queries {
                    return Ok(Flow::Continue);
                }
                match self.generation(&entity_type).await {
                    Some(generation) => self.keys.query_key(&entity_type, query, &generation),
                    None => return Ok(Flow::Continue),
                }
            }
        };

        match read_slot(self.backend.as_ref(), &key, list).await {
            Ok(Some(cached)) => {
                let counter = match cached {
                    Cached::Absent => &self.counters.null_hits,
                    _ => &self.counters.hits,
                };
                CacheCounters::bump(counter);
                trace!(key = %key, "Cache hit");
                return Ok(Flow::Respond(cached.into_result()));
            }
            Ok(None) => {}
            Err(e) => self.degraded(&key, &e),
        }
        CacheCounters::bump(&self.counters.misses);
        ctx.set_scratch("cache.key", key.clone());

        let store = Arc::clone(ctx.store()?);
        let ttl = policy.ttl.unwrap_or(self.config.ttl);
        let null_ttl = policy.null_ttl.unwrap_or(self.config.null_ttl);
        let flight = self.flights.join(&key, |stale| {
            self.load(
                store,
                entity_type.clone(),
                request.target.clone(),
                key.clone(),
                (ttl, null_ttl),
                stale,
            )
        })?;
        let leader = flight.is_leader();

        match flight.wait(self.config.singleflight_timeout).await {
            Ok(result) => {
                let result = result?;
                if !leader {
                    CacheCounters::bump(&self.counters.singleflight_saved);
                }
                Ok(Flow::Respond(result))
            }
            Err(_) => {
                CacheCounters::bump(&self.counters.singleflight_timeout);
                CacheCounters::bump(&self.counters.fail_open);
                warn!(
                    key = %key,
                    timeout_ms = self.config.singleflight_timeout.as_millis() as u64,
                    "Single-flight wait timed out, reading from store"
                );
                ctx.set_scratch("cache.fail_open", true);
                Ok(Flow::Continue)
            }
        }
    }

    async fn after_commit(
        &self,
        ctx: &mut InterceptorContext,
        result: &OperationResult,
    ) -> WardenResult<()> {
        if !ctx.requested_operation().is_write() {
            return Ok(());
        }
        let entity_type = ctx.entity_type().clone();
        let lists = self
            .registry
            .cache_policy(&entity_type)
            .map(|p| p.cache_queries)
            .unwrap_or(false);
        self.invalidate(&entity_type, result, lists).await;
        debug!(
            entity_type = %entity_type,
            rows = result.written_ids().len(),
            "Cache invalidated after commit"
        );
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
