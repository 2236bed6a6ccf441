//! WARDEN Storage - Ports, Interceptor Chain and In-Memory Adapters
//!
//! Defines the [`Store`]/[`StoreTx`] ports every entity operation runs
//! against, the priority-ordered [`InterceptorChain`] that wraps them, the
//! standard interceptors (audit, soft delete, optimistic locking, cache) and
//! the in-memory reference store used by tests and embedded deployments.

pub mod cache;
pub mod chain;
pub mod interceptors;
pub mod memory;
pub mod registry;
pub mod store;

pub use cache::{
    jittered_ttl, CacheBackend, CacheEntry, CacheInterceptor, CacheStatsSnapshot,
    DefaultKeyStrategy, KeyStrategy, MemoryCacheBackend, SingleflightGroup,
};
pub use chain::{
    ChainBuilder, Flow, Interceptor, InterceptorChain, InterceptorContext, Operation,
    OperationResult, Priority, ReadRequest, ReadTarget,
};
pub use interceptors::{
    AuditInterceptor, BatchConflictPolicy, OptimisticLockInterceptor, SoftDeleteInterceptor,
};
pub use memory::{MemoryStore, MemoryTx};
pub use registry::{AuditFields, CachePolicy, EntityConfig, EntityRegistry, SoftDeleteFields};
pub use store::{Store, StoreTx};
