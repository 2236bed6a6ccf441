//! Chain of responsibility around every entity read and write.
//!
//! An [`InterceptorChain`] owns a priority-sorted list of [`Interceptor`]s and
//! drives them around one store call:
//!
//! ```text
//! validate ─▶ begin tx ─▶ before (asc) ─▶ store ─▶ after_result (desc) ─▶ commit ─▶ after_commit (desc)
//!                              │                         │
//!                              └──── error ──▶ on_error (desc) ─▶ rollback
//! ```

mod context;
mod interceptor;
mod operation;
mod runner;

pub use context::{InterceptorContext, ReadRequest, ReadTarget};
pub use interceptor::Interceptor;
pub use operation::{Flow, Operation, OperationResult, Priority};
pub use runner::{ChainBuilder, InterceptorChain};
