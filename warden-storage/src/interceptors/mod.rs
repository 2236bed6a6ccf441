//! Standard interceptors.

mod audit;
mod optimistic_lock;
mod soft_delete;

pub use audit::AuditInterceptor;
pub use optimistic_lock::{BatchConflictPolicy, OptimisticLockInterceptor};
pub use soft_delete::SoftDeleteInterceptor;
