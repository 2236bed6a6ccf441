//! Error types for WARDEN operations

use crate::entity::EntityType;
use thiserror::Error;
use uuid::Uuid;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: EntityType, id: Uuid },

    #[error("Insert failed for {entity_type}: {reason}")]
    InsertFailed { entity_type: EntityType, reason: String },

    #[error("Update failed for {entity_type} with id {id}: {reason}")]
    UpdateFailed {
        entity_type: EntityType,
        id: Uuid,
        reason: String,
    },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Storage backend error: {reason}")]
    Backend { reason: String },
}

/// Validation errors. Raised before any transaction is opened.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Entity type not registered: {entity_type}")]
    UnknownEntityType { entity_type: EntityType },

    #[error("Batch operation on {entity_type} has no rows")]
    EmptyBatch { entity_type: EntityType },

    #[error("Row {id} is a {found}, expected {expected}")]
    MixedEntityTypes {
        expected: EntityType,
        found: EntityType,
        id: Uuid,
    },

    #[error("Duplicate id {id} in batch")]
    DuplicateId { id: Uuid },
}

/// Concurrent modification detected on update.
///
/// Recoverable: re-read the entity and retry with its fresh version.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Optimistic lock conflict on {entity_type} {id}: expected version {expected}, found {actual}")]
pub struct OptimisticLockConflict {
    pub entity_type: EntityType,
    pub id: Uuid,
    pub expected: i64,
    pub actual: i64,
}

/// Cache backend errors. Never surfaced by the chain; reads degrade to the store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache backend error: {reason}")]
    Backend { reason: String },

    #[error("Cache entry for {key} could not be decoded: {reason}")]
    Serialization { key: String, reason: String },
}

/// Event delivery errors raised by sinks and the projector.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("Sink rejected {event_type}: {reason}")]
    Sink { event_type: String, reason: String },

    #[error("Payload for {event_type} is not valid JSON: {reason}")]
    Payload { event_type: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// An interceptor refused the operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InterceptorError {
    #[error("Interceptor {interceptor} vetoed the operation: {reason}")]
    Vetoed { interceptor: String, reason: String },
}

/// Master error type for all WARDEN errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WardenError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Conflict(#[from] OptimisticLockConflict),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Interceptor error: {0}")]
    Interceptor(#[from] InterceptorError),
}

impl WardenError {
    /// Whether retrying the same call after a fresh read can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WardenError::Conflict(_))
    }

    pub fn as_conflict(&self) -> Option<&OptimisticLockConflict> {
        match self {
            WardenError::Conflict(conflict) => Some(conflict),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, WardenError::Storage(StorageError::NotFound { .. }))
    }
}

/// Result type alias for WARDEN operations.
pub type WardenResult<T> = Result<T, WardenError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_not_found() {
        let err = StorageError::NotFound {
            entity_type: EntityType::new("order"),
            id: Uuid::nil(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Entity not found"));
        assert!(msg.contains("order"));
        assert!(msg.contains("00000000-0000-0000-0000-000000000000"));
    }

    #[test]
    fn test_conflict_display_carries_versions() {
        let err = WardenError::from(OptimisticLockConflict {
            entity_type: EntityType::new("order"),
            id: Uuid::nil(),
            expected: 1,
            actual: 2,
        });
        let msg = format!("{}", err);
        assert!(msg.contains("expected version 1"));
        assert!(msg.contains("found 2"));
        assert!(err.is_retryable());
        assert_eq!(err.as_conflict().map(|c| c.actual), Some(2));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "jitter_ratio".to_string(),
            value: "1.5".to_string(),
            reason: "must be in [0, 1)".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("jitter_ratio"));
        assert!(msg.contains("1.5"));
        assert!(msg.contains("must be in [0, 1)"));
    }

    #[test]
    fn test_warden_error_from_variants() {
        let storage = WardenError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, WardenError::Storage(_)));
        assert!(!storage.is_retryable());

        let validation = WardenError::from(ValidationError::RequiredFieldMissing {
            field: "id".to_string(),
        });
        assert!(matches!(validation, WardenError::Validation(_)));

        let cache = WardenError::from(CacheError::Backend {
            reason: "down".to_string(),
        });
        assert!(matches!(cache, WardenError::Cache(_)));

        let publish = WardenError::from(PublishError::Sink {
            event_type: "OrderPlaced".to_string(),
            reason: "broker down".to_string(),
        });
        assert!(matches!(publish, WardenError::Publish(_)));

        let veto = WardenError::from(InterceptorError::Vetoed {
            interceptor: "guard".to_string(),
            reason: "frozen".to_string(),
        });
        assert!(matches!(veto, WardenError::Interceptor(_)));
    }

    #[test]
    fn test_not_found_helper() {
        let err = WardenError::from(StorageError::NotFound {
            entity_type: EntityType::new("order"),
            id: Uuid::nil(),
        });
        assert!(err.is_not_found());
        assert!(!WardenError::from(StorageError::LockPoisoned).is_not_found());
    }
}
