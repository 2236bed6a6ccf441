//! Runtime wiring.
//!
//! [`WardenRuntime`] assembles the store, the entity registry, the standard
//! interceptors, the read-through cache and the outbox into one chain, plus an
//! optional projector when a sink is configured.
//!
//! ```ignore
//! let runtime = WardenRuntime::builder(registry)
//!     .with_config(WardenConfig::from_env())
//!     .with_sink(Arc::new(KafkaSink::new(producer)))
//!     .build()?;
//!
//! let projector = runtime.start_projector();
//! let repo = runtime.repository();
//! repo.create(row, WriteOptions::by("alice")).await?;
//!
//! runtime.shutdown();
//! ```

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;
use warden_core::{ConfigError, WardenConfig, WardenResult};
use warden_outbox::{OutboxInterceptor, OutboxProjector, OutboxStore, ProjectorSnapshot, Sink};
use warden_storage::{
    AuditInterceptor, BatchConflictPolicy, CacheBackend, CacheInterceptor, CacheStatsSnapshot,
    ChainBuilder, EntityRegistry, Interceptor, InterceptorChain, MemoryCacheBackend, MemoryStore,
    OptimisticLockInterceptor, SoftDeleteInterceptor, Store,
};

use crate::repository::Repository;

/// Builder for [`WardenRuntime`].
pub struct RuntimeBuilder {
    registry: Arc<EntityRegistry>,
    config: WardenConfig,
    store: Option<Arc<dyn Store>>,
    outbox_store: Option<Arc<dyn OutboxStore>>,
    cache_backend: Option<Arc<dyn CacheBackend>>,
    cache_enabled: bool,
    sink: Option<Arc<dyn Sink>>,
    projector_id: Option<String>,
    batch_policy: BatchConflictPolicy,
    extra: Vec<Arc<dyn Interceptor>>,
}

impl RuntimeBuilder {
    fn new(registry: EntityRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            config: WardenConfig::default(),
            store: None,
            outbox_store: None,
            cache_backend: None,
            cache_enabled: true,
            sink: None,
            projector_id: None,
            batch_policy: BatchConflictPolicy::default(),
            extra: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: WardenConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `store` for entity rows instead of a fresh [`MemoryStore`].
    ///
    /// A projector then also needs [`with_outbox_store`](Self::with_outbox_store)
    /// pointing at the outbox table `store` writes to.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_outbox_store(mut self, outbox_store: Arc<dyn OutboxStore>) -> Self {
        self.outbox_store = Some(outbox_store);
        self
    }

    /// Defaults to an in-process [`MemoryCacheBackend`].
    pub fn with_cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache_enabled = false;
        self
    }

    /// Deliver outbox rows to `sink` through a projector.
    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_projector_id(mut self, instance_id: impl Into<String>) -> Self {
        self.projector_id = Some(instance_id.into());
        self
    }

    pub fn with_batch_policy(mut self, policy: BatchConflictPolicy) -> Self {
        self.batch_policy = policy;
        self
    }

    /// Add an application interceptor next to the standard ones.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.extra.push(interceptor);
        self
    }

    pub fn build(self) -> WardenResult<WardenRuntime> {
        self.config.validate()?;

        let registry = self.registry;
        let (store, outbox_store): (Arc<dyn Store>, Option<Arc<dyn OutboxStore>>) =
            match (self.store, self.outbox_store) {
                (Some(store), outbox_store) => (store, outbox_store),
                (None, outbox_store) => {
                    let memory = Arc::new(MemoryStore::new(Arc::clone(&registry)));
                    let outbox_store =
                        outbox_store.unwrap_or_else(|| memory.clone() as Arc<dyn OutboxStore>);
                    (memory as Arc<dyn Store>, Some(outbox_store))
                }
            };

        let mut builder = ChainBuilder::new(Arc::clone(&store), Arc::clone(&registry))
            .with(AuditInterceptor::new(Arc::clone(&registry)))
            .with(SoftDeleteInterceptor::new(Arc::clone(&registry)))
            .with(
                OptimisticLockInterceptor::new(Arc::clone(&registry))
                    .with_policy(self.batch_policy),
            );

        let cache = if self.cache_enabled {
            let backend = self
                .cache_backend
                .unwrap_or_else(|| Arc::new(MemoryCacheBackend::new()) as Arc<dyn CacheBackend>);
            let cache = Arc::new(CacheInterceptor::new(
                backend,
                Arc::clone(&registry),
                self.config.cache.clone(),
            ));
            builder = builder.with_arc(cache.clone());
            Some(cache)
        } else {
            None
        };

        builder = builder.with(OutboxInterceptor::new());
        for interceptor in self.extra {
            builder = builder.with_arc(interceptor);
        }
        let chain = Arc::new(builder.build());

        let projector = match self.sink {
            Some(sink) => {
                let outbox_store = outbox_store.clone().ok_or_else(|| {
                    ConfigError::MissingRequired {
                        field: "outbox_store".to_string(),
                    }
                })?;
                let mut projector =
                    OutboxProjector::new(outbox_store, sink, self.config.projector.clone());
                if let Some(id) = self.projector_id {
                    projector = projector.with_instance_id(id);
                }
                Some(Arc::new(projector))
            }
            None => None,
        };

        info!(
            interceptors = ?chain.interceptor_names(),
            cache = cache.is_some(),
            projector = projector.is_some(),
            "WARDEN runtime built"
        );

        Ok(WardenRuntime {
            config: self.config,
            registry,
            store,
            outbox_store,
            chain,
            cache,
            projector,
        })
    }
}

/// A wired chain with its cache and projector handles.
pub struct WardenRuntime {
    config: WardenConfig,
    registry: Arc<EntityRegistry>,
    store: Arc<dyn Store>,
    outbox_store: Option<Arc<dyn OutboxStore>>,
    chain: Arc<InterceptorChain>,
    cache: Option<Arc<CacheInterceptor>>,
    projector: Option<Arc<OutboxProjector>>,
}

impl WardenRuntime {
    pub fn builder(registry: EntityRegistry) -> RuntimeBuilder {
        RuntimeBuilder::new(registry)
    }

    pub fn repository(&self) -> Repository {
        Repository::new(Arc::clone(&self.chain))
    }

    pub fn chain(&self) -> &Arc<InterceptorChain> {
        &self.chain
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The outbox table, for operator queries and replay.
    pub fn outbox(&self) -> Option<&Arc<dyn OutboxStore>> {
        self.outbox_store.as_ref()
    }

    pub fn cache(&self) -> Option<&Arc<CacheInterceptor>> {
        self.cache.as_ref()
    }

    pub fn cache_stats(&self) -> Option<CacheStatsSnapshot> {
        self.cache.as_ref().map(|c| c.get_stats())
    }

    pub fn projector(&self) -> Option<&Arc<OutboxProjector>> {
        self.projector.as_ref()
    }

    /// Spawn the projector loop, if a sink was configured.
    pub fn start_projector(&self) -> Option<JoinHandle<ProjectorSnapshot>> {
        self.projector.as_ref().map(|p| p.start())
    }

    /// Signal the projector to stop after its current cycle.
    pub fn shutdown(&self) {
        if let Some(projector) = &self.projector {
            projector.stop();
        }
    }
}
