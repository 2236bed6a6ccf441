//! Outbox record model and its status machine.
//!
//! ```text
//! pending ──claim──▶ publishing ──success──▶ published (terminal, immutable)
//!    ▲                   │
//!    ├──── retry ────────┤  attempts < max_retry
//!    ├──── reaper ───────┘  claim went stale
//!    │                   │
//!    └──── replay ◀── error  attempts >= max_retry (parked for operators)
//! ```

use crate::error::PublishError;
use crate::event::DomainEvent;
use crate::identity::{OutboxId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Header carrying the originating event id through the outbox.
pub const EVENT_ID_HEADER: &str = "event_id";

/// Delivery status of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Publishing,
    Published,
    Error,
}

impl OutboxStatus {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Publishing => "publishing",
            OutboxStatus::Published => "published",
            OutboxStatus::Error => "error",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, OutboxStatusParseError> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(OutboxStatus::Pending),
            "publishing" => Ok(OutboxStatus::Publishing),
            "published" => Ok(OutboxStatus::Published),
            "error" => Ok(OutboxStatus::Error),
            _ => Err(OutboxStatusParseError(s.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Published | OutboxStatus::Error)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = OutboxStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid outbox status string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxStatusParseError(pub String);

impl fmt::Display for OutboxStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid outbox status: {}", self.0)
    }
}

impl std::error::Error for OutboxStatusParseError {}

/// An outbox row about to be inserted. The store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxRecord {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    /// JSON text of the event payload.
    pub payload: String,
    pub headers: BTreeMap<String, String>,
    pub occurred_at: Timestamp,
    pub partition_key: String,
}

impl NewOutboxRecord {
    /// Serialize a domain event into an insertable row.
    pub fn from_event(event: &DomainEvent) -> Result<Self, PublishError> {
        let payload = serde_json::to_string(&event.payload).map_err(|e| PublishError::Payload {
            event_type: event.event_type.clone(),
            reason: e.to_string(),
        })?;
        let mut headers = event.headers.clone();
        headers
            .entry(EVENT_ID_HEADER.to_string())
            .or_insert_with(|| event.event_id.to_string());
        Ok(Self {
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            event_type: event.event_type.clone(),
            payload,
            headers,
            occurred_at: event.occurred_at,
            partition_key: event.effective_partition_key().to_string(),
        })
    }
}

/// A persisted outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: OutboxId,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: String,
    pub headers: BTreeMap<String, String>,
    pub occurred_at: Timestamp,
    pub created_at: Timestamp,
    pub dispatched_at: Option<Timestamp>,
    pub status: OutboxStatus,
    pub deliver_attempts: u32,
    pub last_error: Option<String>,
    pub partition_key: String,
    /// Projector instance holding the claim while `publishing`.
    pub locked_by: Option<String>,
    pub locked_at: Option<Timestamp>,
}

impl OutboxRecord {
    /// Materialize a freshly inserted row.
    pub fn from_new(id: OutboxId, new: NewOutboxRecord, created_at: Timestamp) -> Self {
        Self {
            id,
            aggregate_type: new.aggregate_type,
            aggregate_id: new.aggregate_id,
            event_type: new.event_type,
            payload: new.payload,
            headers: new.headers,
            occurred_at: new.occurred_at,
            created_at,
            dispatched_at: None,
            status: OutboxStatus::Pending,
            deliver_attempts: 0,
            last_error: None,
            partition_key: new.partition_key,
            locked_by: None,
            locked_at: None,
        }
    }

    /// Rebuild the domain event from the stored columns.
    pub fn to_event(&self) -> Result<DomainEvent, PublishError> {
        let payload: serde_json::Value =
            serde_json::from_str(&self.payload).map_err(|e| PublishError::Payload {
                event_type: self.event_type.clone(),
                reason: e.to_string(),
            })?;
        let event_id = self
            .headers
            .get(EVENT_ID_HEADER)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .unwrap_or_else(Uuid::now_v7);
        Ok(DomainEvent {
            event_id,
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            event_type: self.event_type.clone(),
            payload,
            headers: self.headers.clone(),
            occurred_at: self.occurred_at,
            partition_key: Some(self.partition_key.clone()),
        })
    }

    /// pending -> publishing. Returns false if the row is not claimable.
    pub fn claim(&mut self, claimant: &str, at: Timestamp) -> bool {
        if self.status != OutboxStatus::Pending {
            return false;
        }
        self.status = OutboxStatus::Publishing;
        self.locked_by = Some(claimant.to_string());
        self.locked_at = Some(at);
        true
    }

    /// Whether `claimant` still owns the publishing claim.
    pub fn is_claimed_by(&self, claimant: &str) -> bool {
        self.status == OutboxStatus::Publishing && self.locked_by.as_deref() == Some(claimant)
    }

    /// publishing -> published.
    pub fn mark_published(&mut self, at: Timestamp) {
        self.status = OutboxStatus::Published;
        self.dispatched_at = Some(at);
        self.locked_by = None;
        self.locked_at = None;
    }

    /// publishing -> pending | error, depending on the attempt count.
    pub fn record_failure(&mut self, error: &str, max_retry: u32) -> OutboxStatus {
        self.deliver_attempts = self.deliver_attempts.saturating_add(1);
        self.last_error = Some(error.to_string());
        self.locked_by = None;
        self.locked_at = None;
        self.status = if self.deliver_attempts >= max_retry {
            OutboxStatus::Error
        } else {
            OutboxStatus::Pending
        };
        self.status
    }

    /// A publishing claim older than `stale_before` is presumed abandoned.
    pub fn is_stale_claim(&self, stale_before: Timestamp) -> bool {
        self.status == OutboxStatus::Publishing
            && self.locked_at.map(|at| at < stale_before).unwrap_or(true)
    }

    /// publishing -> pending without counting an attempt.
    pub fn requeue(&mut self) {
        self.status = OutboxStatus::Pending;
        self.locked_by = None;
        self.locked_at = None;
    }

    /// error -> pending with attempts reset. Returns false for other states.
    pub fn replay(&mut self) -> bool {
        if self.status != OutboxStatus::Error {
            return false;
        }
        self.status = OutboxStatus::Pending;
        self.deliver_attempts = 0;
        true
    }
}
