//! Delivery port.

use async_trait::async_trait;
use warden_core::{DomainEvent, PublishError};

/// Where the projector publishes events, typically a message broker.
///
/// Delivery is at least once: a crash between `publish` and the status update
/// redelivers the event, so consumers should dedupe on `event_id`.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn publish(&self, event: &DomainEvent) -> Result<(), PublishError>;
}
