//! WARDEN Core - Data Types
//!
//! Pure data structures shared by every other crate: row and query types,
//! domain events, the outbox record model, the error taxonomy and
//! configuration. No I/O happens here.

pub mod config;
pub mod constants;
pub mod entity;
pub mod error;
pub mod event;
pub mod identity;
pub mod outbox;

pub use config::{CacheConfig, ProjectorConfig, WardenConfig};
pub use entity::{EntityType, Query, ReadScope, Row};
pub use error::{
    CacheError, ConfigError, InterceptorError, OptimisticLockConflict, PublishError,
    StorageError, ValidationError, WardenError, WardenResult,
};
pub use event::DomainEvent;
pub use identity::{content_digest, new_entity_id, EntityId, OutboxId, Timestamp};
pub use outbox::{NewOutboxRecord, OutboxRecord, OutboxStatus, OutboxStatusParseError};

// ============================================================================
// PROPERTY TESTS
// ============================================================================
