//! The projector's view of the outbox table.

use async_trait::async_trait;
use warden_core::{OutboxId, OutboxRecord, OutboxStatus, Timestamp, WardenResult};

/// Claiming, marking and operator access over persisted outbox rows.
///
/// Marks are fenced on the claimant: they only apply while the row is still
/// `publishing` under the same `locked_by`. A claim that was reaped and
/// re-claimed elsewhere makes the mark a no-op.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Atomically move up to `batch_size` pending rows, lowest id first, to
    /// `publishing` under `claimant`. Rows locked by a concurrent claim are
    /// skipped, not waited on.
    async fn claim_pending(
        &self,
        batch_size: usize,
        claimant: &str,
    ) -> WardenResult<Vec<OutboxRecord>>;

    /// publishing -> published. Returns false if the claim was lost.
    async fn mark_published(&self, id: OutboxId, claimant: &str) -> WardenResult<bool>;

    /// Count a failed delivery. Returns the new status, or `None` if the
    /// claim was lost.
    async fn record_failure(
        &self,
        id: OutboxId,
        claimant: &str,
        error: &str,
        max_retry: u32,
    ) -> WardenResult<Option<OutboxStatus>>;

    /// Return `publishing` rows claimed before `stale_before` to `pending`.
    async fn requeue_stale(&self, stale_before: Timestamp) -> WardenResult<u64>;

    async fn list_by_status(
        &self,
        status: OutboxStatus,
        limit: usize,
    ) -> WardenResult<Vec<OutboxRecord>>;

    /// error -> pending with attempts reset. Returns false if the row is not
    /// in `error`.
    async fn replay(&self, id: OutboxId) -> WardenResult<bool>;

    async fn get(&self, id: OutboxId) -> WardenResult<Option<OutboxRecord>>;
}
