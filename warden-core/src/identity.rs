//! Identity types for WARDEN rows and events

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Entity identifier using UUIDv7 for timestamp-sortable IDs.
/// UUIDv7 embeds a Unix timestamp, making IDs naturally sortable by creation time.
pub type EntityId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Outbox rows are keyed by a monotonically increasing sequence.
pub type OutboxId = i64;

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

/// Hex-encoded SHA-256 digest of arbitrary bytes.
///
/// Used for deterministic cache keys over query specs.
pub fn content_digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}
