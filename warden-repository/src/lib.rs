//! WARDEN Repository - Interceptor-Driven Persistence
//!
//! The entry point applications use. [`WardenRuntime`] wires a store, the
//! entity registry and the interceptor chain together; [`Repository`] exposes
//! CRUD on top of that chain.
//!
//! # Chain layout
//!
//! | priority | interceptor | concern |
//! |----------|-------------|---------|
//! | HIGH | `optimistic_lock` | version compare-and-set on updates |
//! | NORMAL | `audit` | created/updated stamps |
//! | NORMAL | `soft_delete` | deletes become flag updates, reads hide flagged rows |
//! | NORMAL | `cache` | read-through with single-flight, null caching, invalidation |
//! | LOW | `outbox` | domain events staged in the write's transaction |
//!
//! Before hooks run top to bottom, after hooks bottom to top.

pub mod repository;
pub mod runtime;

pub use repository::{BatchWrite, DeleteKind, Repository, WriteOptions};
pub use runtime::{RuntimeBuilder, WardenRuntime};

pub use warden_core::{
    CacheConfig, DomainEvent, EntityId, EntityType, ProjectorConfig, Query, Row, WardenConfig,
    WardenError, WardenResult,
};
pub use warden_outbox::{OutboxProjector, OutboxStore, Sink};
pub use warden_storage::{BatchConflictPolicy, CachePolicy, EntityConfig, EntityRegistry};
