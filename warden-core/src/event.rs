//! Domain events raised by writes.

use crate::identity::{EntityId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A domain event raised by a write, relayed through the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub occurred_at: Timestamp,
    /// Routing key for downstream ordering. Defaults to the aggregate id.
    #[serde(default)]
    pub partition_key: Option<String>,
}

impl DomainEvent {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
            headers: BTreeMap::new(),
            occurred_at: Utc::now(),
            partition_key: None,
        }
    }

    /// Convenience constructor for events about a persisted entity.
    pub fn for_entity(
        aggregate_type: impl Into<String>,
        aggregate_id: EntityId,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(aggregate_type, aggregate_id.to_string(), event_type, payload)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// The key downstream routing should partition on.
    pub fn effective_partition_key(&self) -> &str {
        self.partition_key.as_deref().unwrap_or(&self.aggregate_id)
    }
}
