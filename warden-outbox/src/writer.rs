//! Outbox writer and the interceptor that drives it.

use async_trait::async_trait;
use tracing::debug;
use warden_core::{DomainEvent, NewOutboxRecord, WardenResult};
use warden_storage::{Interceptor, InterceptorContext, OperationResult, Priority, StoreTx};

/// Stages one outbox row per event in an open transaction.
///
/// The rows commit or roll back with the entity write that produced them, so
/// an event exists if and only if that write committed.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboxWriter;

impl OutboxWriter {
    pub async fn append(tx: &mut dyn StoreTx, events: &[DomainEvent]) -> WardenResult<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let records = events
            .iter()
            .map(NewOutboxRecord::from_event)
            .collect::<Result<Vec<_>, _>>()?;
        tx.append_outbox(records).await
    }
}

/// Writes the events raised during a write into the outbox, inside the
/// write's transaction.
///
/// Runs at [`Priority::LOW`], so its `after_result` is the first after hook
/// and the rows are staged before any later veto could roll them back with
/// the entity write.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboxInterceptor;

impl OutboxInterceptor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Interceptor for OutboxInterceptor {
    fn name(&self) -> &str {
        "outbox"
    }

    fn priority(&self) -> Priority {
        Priority::LOW
    }

    fn applies_to(&self, ctx: &InterceptorContext) -> bool {
        ctx.requested_operation().is_write()
    }

    async fn after_result(
        &self,
        ctx: &mut InterceptorContext,
        result: OperationResult,
    ) -> WardenResult<OperationResult> {
        let events = ctx.take_events();
        if events.is_empty() {
            return Ok(result);
        }

        let tx = ctx.tx()?;
        let appended = OutboxWriter::append(tx.as_mut(), &events).await?;
        debug!(
            entity_type = %ctx.entity_type(),
            operation = %ctx.requested_operation(),
            appended,
            "Staged outbox rows"
        );
        ctx.set_scratch("outbox.appended", appended);
        Ok(result)
    }
}
