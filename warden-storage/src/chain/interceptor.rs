//! The interceptor trait.

use async_trait::async_trait;
use warden_core::{WardenError, WardenResult};

use crate::chain::context::InterceptorContext;
use crate::chain::operation::{Flow, OperationResult, Priority};

/// One link in the chain.
///
/// Hooks run onion-style: `before` in ascending priority, `after_result` and
/// `after_commit` in descending priority over the interceptors whose `before`
/// was entered. Every hook has a pass-through default.
#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> Priority {
        Priority::NORMAL
    }

    /// Whether this interceptor takes part in the call at all.
    fn applies_to(&self, _ctx: &InterceptorContext) -> bool {
        true
    }

    async fn before(&self, _ctx: &mut InterceptorContext) -> WardenResult<Flow> {
        Ok(Flow::Continue)
    }

    /// Runs before commit. May transform the result, or veto by returning an
    /// error, which rolls the transaction back.
    async fn after_result(
        &self,
        _ctx: &mut InterceptorContext,
        result: OperationResult,
    ) -> WardenResult<OperationResult> {
        Ok(result)
    }

    /// Runs after a durable commit. Errors are logged and swallowed.
    async fn after_commit(
        &self,
        _ctx: &mut InterceptorContext,
        _result: &OperationResult,
    ) -> WardenResult<()> {
        Ok(())
    }

    /// Notified while the chain unwinds. Returning a result substitutes it for
    /// the error; the transaction is still rolled back.
    async fn on_error(
        &self,
        _ctx: &mut InterceptorContext,
        _error: &WardenError,
    ) -> Option<OperationResult> {
        None
    }
}
