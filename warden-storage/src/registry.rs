//! Per-entity-type metadata.
//!
//! The registry states which standard interceptors apply to each entity type
//! and which columns they touch. It is built once at startup and shared by the
//! chain and the store adapter.

use std::collections::HashMap;
use std::time::Duration;

use warden_core::{EntityType, ValidationError};

/// Audit column names. A `None` column is skipped, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditFields {
    pub created_at: Option<String>,
    pub created_by: Option<String>,
    pub updated_at: Option<String>,
    pub updated_by: Option<String>,
}

impl Default for AuditFields {
    fn default() -> Self {
        Self {
            created_at: Some("created_at".to_string()),
            created_by: Some("created_by".to_string()),
            updated_at: Some("updated_at".to_string()),
            updated_by: Some("updated_by".to_string()),
        }
    }
}

impl AuditFields {
    /// Timestamps only, no actor columns.
    pub fn timestamps_only() -> Self {
        Self {
            created_by: None,
            updated_by: None,
            ..Self::default()
        }
    }

    /// Columns a client must not rewrite on update.
    pub(crate) fn creation_columns(&self) -> impl Iterator<Item = &str> {
        self.created_at
            .as_deref()
            .into_iter()
            .chain(self.created_by.as_deref())
    }
}

/// Soft-delete column names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftDeleteFields {
    pub flag: String,
    pub deleted_at: Option<String>,
    pub deleted_by: Option<String>,
}

impl Default for SoftDeleteFields {
    fn default() -> Self {
        Self {
            flag: "is_deleted".to_string(),
            deleted_at: Some("deleted_at".to_string()),
            deleted_by: Some("deleted_by".to_string()),
        }
    }
}

/// Caching policy for one entity type. TTLs fall back to the cache config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachePolicy {
    pub ttl: Option<Duration>,
    pub null_ttl: Option<Duration>,
    /// Cache list reads too. Writes then rotate the type's generation token.
    pub cache_queries: bool,
}

impl CachePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_null_ttl(mut self, ttl: Duration) -> Self {
        self.null_ttl = Some(ttl);
        self
    }

    pub fn with_query_caching(mut self) -> Self {
        self.cache_queries = true;
        self
    }
}

/// Everything the standard interceptors need to know about one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityConfig {
    pub audit: Option<AuditFields>,
    pub soft_delete: Option<SoftDeleteFields>,
    /// When false, updates are last-writer-wins.
    pub versioned: bool,
    pub cache: Option<CachePolicy>,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            audit: None,
            soft_delete: None,
            versioned: true,
            cache: None,
        }
    }
}

impl EntityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_audit(mut self, fields: AuditFields) -> Self {
        self.audit = Some(fields);
        self
    }

    pub fn with_soft_delete(mut self, fields: SoftDeleteFields) -> Self {
        self.soft_delete = Some(fields);
        self
    }

    pub fn with_cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    pub fn unversioned(mut self) -> Self {
        self.versioned = false;
        self
    }
}

/// Entity type -> config.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    types: HashMap<EntityType, EntityConfig>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn register(mut self, entity_type: impl Into<EntityType>, config: EntityConfig) -> Self {
        self.insert(entity_type, config);
        self
    }

    pub fn insert(&mut self, entity_type: impl Into<EntityType>, config: EntityConfig) {
        self.types.insert(entity_type.into(), config);
    }

    pub fn get(&self, entity_type: &EntityType) -> Option<&EntityConfig> {
        self.types.get(entity_type)
    }

    pub fn require(&self, entity_type: &EntityType) -> Result<&EntityConfig, ValidationError> {
        self.get(entity_type)
            .ok_or_else(|| ValidationError::UnknownEntityType {
                entity_type: entity_type.clone(),
            })
    }

    pub fn soft_delete(&self, entity_type: &EntityType) -> Option<&SoftDeleteFields> {
        self.get(entity_type).and_then(|c| c.soft_delete.as_ref())
    }

    pub fn cache_policy(&self, entity_type: &EntityType) -> Option<&CachePolicy> {
        self.get(entity_type).and_then(|c| c.cache.as_ref())
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &EntityType> {
        self.types.keys()
    }
}
