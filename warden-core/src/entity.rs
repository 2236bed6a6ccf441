//! Persisted row types.
//!
//! The chain never sees domain structs. It works on [`Row`]s: an entity type
//! tag, an identity, the store-owned version and a JSON column map holding the
//! business fields plus whichever audit and soft-delete columns the entity
//! type is configured with. Converting domain objects to and from rows is the
//! caller's concern; [`Row::from_entity`] and [`Row::to_entity`] cover the
//! common serde case.

use crate::error::ValidationError;
use crate::identity::{content_digest, EntityId, Timestamp};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Entity type tag (table name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Whether soft-deleted rows are visible to a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReadScope {
    /// Normal reads: rows flagged as deleted are filtered out by the store.
    #[default]
    ExcludeDeleted,
    /// Explicit "include deleted" reads (audits, restores).
    IncludeDeleted,
}

/// A persisted entity row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub entity_type: EntityType,
    pub id: EntityId,
    /// Store-owned version. Starts at 1 on insert and moves by exactly one
    /// per successful update.
    pub version: i64,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Row {
    /// Create an empty row. Version 0 means "never persisted".
    pub fn new(entity_type: EntityType, id: EntityId) -> Self {
        Self {
            entity_type,
            id,
            version: 0,
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Builder-style version setter, for rows read earlier by the caller.
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// Store a timestamp column as RFC 3339 text.
    pub fn set_timestamp(&mut self, name: impl Into<String>, at: Timestamp) {
        self.set(name, Value::String(at.to_rfc3339_opts(SecondsFormat::Micros, true)));
    }

    /// Read a timestamp column. Null, missing and unparseable all read as `None`.
    pub fn timestamp(&self, name: &str) -> Option<Timestamp> {
        self.get(name)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Read a boolean column; anything but `true` is false.
    pub fn flag(&self, name: &str) -> bool {
        matches!(self.get(name), Some(Value::Bool(true)))
    }

    /// Convert a serializable domain value into a row.
    ///
    /// The value must serialize to a JSON object.
    pub fn from_entity<T: Serialize>(
        entity_type: EntityType,
        id: EntityId,
        entity: &T,
    ) -> Result<Self, ValidationError> {
        match serde_json::to_value(entity) {
            Ok(Value::Object(fields)) => Ok(Self {
                entity_type,
                id,
                version: 0,
                fields,
            }),
            Ok(other) => Err(ValidationError::InvalidValue {
                field: "entity".to_string(),
                reason: format!("expected a JSON object, got {}", json_kind(&other)),
            }),
            Err(e) => Err(ValidationError::InvalidValue {
                field: "entity".to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Convert the column map back into a domain value.
    pub fn to_entity<T: DeserializeOwned>(&self) -> Result<T, ValidationError> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|e| {
            ValidationError::InvalidValue {
                field: "entity".to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Check the row against a query's equality filters.
    pub fn matches(&self, query: &Query) -> bool {
        query
            .equals
            .iter()
            .all(|(field, expected)| self.get(field) == Some(expected))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Filtered list read. Equality filters only; query planning is out of scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Field name -> required value. Ordered so the fingerprint is stable.
    pub equals: BTreeMap<String, Value>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.insert(field.into(), value.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Deterministic digest of the query filters and limit.
    ///
    /// Hashes the canonical `Value` form; rendering a `Value` cannot fail.
    pub fn fingerprint(&self) -> String {
        let mut canonical = Map::new();
        canonical.insert(
            "equals".to_string(),
            Value::Object(self.equals.clone().into_iter().collect()),
        );
        canonical.insert("limit".to_string(), Value::from(self.limit));
        content_digest(Value::Object(canonical).to_string().as_bytes())
    }
}
