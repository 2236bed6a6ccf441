//! Audit stamping.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use warden_core::WardenResult;

use crate::chain::{Flow, Interceptor, InterceptorContext, Priority};
use crate::registry::EntityRegistry;

const APPLIED: &str = "audit.applied";
const STAMPED_AT: &str = "audit.stamped_at";

/// Stamps `created_at/by` on create and `updated_at/by` on create and update.
///
/// Fires once per context. Columns the entity type does not configure are
/// skipped. Deletes are never stamped, including deletes rewritten into flag
/// updates. Updates drop any client-supplied creation columns so the stored
/// values survive.
pub struct AuditInterceptor {
    registry: Arc<EntityRegistry>,
}

impl AuditInterceptor {
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Interceptor for AuditInterceptor {
    fn name(&self) -> &str {
        "audit"
    }

    fn priority(&self) -> Priority {
        Priority::NORMAL
    }

    fn applies_to(&self, ctx: &InterceptorContext) -> bool {
        let operation = ctx.requested_operation();
        (operation.is_create() || operation.is_update())
            && self
                .registry
                .get(ctx.entity_type())
                .map(|c| c.audit.is_some())
                .unwrap_or(false)
    }

    async fn before(&self, ctx: &mut InterceptorContext) -> WardenResult<Flow> {
        if ctx.scratch_flag(APPLIED) {
            return Ok(Flow::Continue);
        }
        let Some(fields) = self
            .registry
            .get(ctx.entity_type())
            .and_then(|c| c.audit.clone())
        else {
            return Ok(Flow::Continue);
        };

        // One timestamp for the whole batch.
        let now = Utc::now();
        let actor = ctx.actor_or_system().to_string();
        let creating = ctx.requested_operation().is_create();

        for row in ctx.rows_mut() {
            if creating {
                if let Some(column) = &fields.created_at {
                    row.set_timestamp(column.clone(), now);
                }
                if let Some(column) = &fields.created_by {
                    row.set(column.clone(), actor.clone());
                }
            } else {
                for column in fields.creation_columns() {
                    row.remove(column);
                }
            }
            if let Some(column) = &fields.updated_at {
                row.set_timestamp(column.clone(), now);
            }
            if let Some(column) = &fields.updated_by {
                row.set(column.clone(), actor.clone());
            }
        }

        ctx.set_scratch(APPLIED, true);
        ctx.set_scratch(STAMPED_AT, now.to_rfc3339());
        Ok(Flow::Continue)
    }
}
