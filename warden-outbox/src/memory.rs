//! [`OutboxStore`] over the in-memory store's outbox table.

use async_trait::async_trait;
use chrono::Utc;
use warden_core::{OutboxId, OutboxRecord, OutboxStatus, Timestamp, WardenResult};
use warden_storage::MemoryStore;

use crate::store::OutboxStore;

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn claim_pending(
        &self,
        batch_size: usize,
        claimant: &str,
    ) -> WardenResult<Vec<OutboxRecord>> {
        self.outbox_claim(batch_size, claimant, Utc::now())
    }

    async fn mark_published(&self, id: OutboxId, claimant: &str) -> WardenResult<bool> {
        let now = Utc::now();
        let marked = self.outbox_update(id, |record| {
            if !record.is_claimed_by(claimant) {
                return false;
            }
            record.mark_published(now);
            true
        })?;
        Ok(marked.unwrap_or(false))
    }

    async fn record_failure(
        &self,
        id: OutboxId,
        claimant: &str,
        error: &str,
        max_retry: u32,
    ) -> WardenResult<Option<OutboxStatus>> {
        let status = self.outbox_update(id, |record| {
            record
                .is_claimed_by(claimant)
                .then(|| record.record_failure(error, max_retry))
        })?;
        Ok(status.flatten())
    }

    async fn requeue_stale(&self, stale_before: Timestamp) -> WardenResult<u64> {
        self.outbox_requeue_stale(stale_before)
    }

    async fn list_by_status(
        &self,
        status: OutboxStatus,
        limit: usize,
    ) -> WardenResult<Vec<OutboxRecord>> {
        self.outbox_list(Some(status), limit)
    }

    async fn replay(&self, id: OutboxId) -> WardenResult<bool> {
        Ok(self.outbox_update(id, OutboxRecord::replay)?.unwrap_or(false))
    }

    async fn get(&self, id: OutboxId) -> WardenResult<Option<OutboxRecord>> {
        self.outbox_get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use std::sync::Arc;
    use warden_core::{DomainEvent, NewOutboxRecord};
    use warden_storage::{EntityRegistry, Store};

    async fn seeded(n: usize) -> MemoryStore {
        let store = MemoryStore::new(Arc::new(EntityRegistry::new()));
        let mut tx = store.begin().await.unwrap();
        let records = (0..n)
            .map(|i| {
                let event = DomainEvent::new("order", format!("o{i}"), "OrderPlaced", json!({}));
                NewOutboxRecord::from_event(&event).unwrap()
            })
            .collect();
        tx.append_outbox(records).await.unwrap();
        tx.commit().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_claim_then_publish() {
        let store = seeded(3).await;
        let claimed = store.claim_pending(2, "a").await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed.iter().all(|r| r.locked_by.as_deref() == Some("a")));

        assert!(store.mark_published(claimed[0].id, "a").await.unwrap());
        let published = store.get(claimed[0].id).await.unwrap().unwrap();
        assert_eq!(published.status, OutboxStatus::Published);
        assert!(published.dispatched_at.is_some());
        assert!(published.locked_by.is_none());

        // Only the unclaimed row is left for the next claimant.
        assert_eq!(store.claim_pending(10, "b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_marks_are_fenced_on_claimant() {
        let store = seeded(1).await;
        let id = store.claim_pending(1, "a").await.unwrap()[0].id;

        // The reaper takes the row back and another instance claims it.
        let requeued = store
            .requeue_stale(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(requeued, 1);
        assert_eq!(store.claim_pending(1, "b").await.unwrap()[0].id, id);

        assert!(!store.mark_published(id, "a").await.unwrap());
        assert_eq!(store.record_failure(id, "a", "boom", 5).await.unwrap(), None);
        assert!(store.get(id).await.unwrap().unwrap().is_claimed_by("b"));
        assert!(store.mark_published(id, "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_failures_park_in_error_then_replay() {
        let store = seeded(1).await;
        let mut last = None;
        for _ in 0..3 {
            let id = store.claim_pending(1, "a").await.unwrap()[0].id;
            last = store.record_failure(id, "a", "broker down", 3).await.unwrap();
        }
        assert_eq!(last, Some(OutboxStatus::Error));
        assert!(store.claim_pending(1, "a").await.unwrap().is_empty());

        let parked = store.list_by_status(OutboxStatus::Error, 10).await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].deliver_attempts, 3);
        assert_eq!(parked[0].last_error.as_deref(), Some("broker down"));

        assert!(store.replay(parked[0].id).await.unwrap());
        assert!(!store.replay(parked[0].id).await.unwrap());
        let replayed = store.get(parked[0].id).await.unwrap().unwrap();
        assert_eq!(replayed.status, OutboxStatus::Pending);
        assert_eq!(replayed.deliver_attempts, 0);
    }

    #[tokio::test]
    async fn test_fresh_claims_are_not_reaped() {
        let store = seeded(1).await;
        store.claim_pending(1, "a").await.unwrap();
        let requeued = store
            .requeue_stale(Utc::now() - Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(requeued, 0);
    }
}
