//! WARDEN Outbox - Transactional Outbox and Projector
//!
//! Domain events raised during a write are stored as outbox rows in the same
//! transaction as the entity write, and published later by one or more
//! [`OutboxProjector`] instances.
//!
//! # Row lifecycle
//!
//! ```text
//!            claim              publish ok
//! pending ──────────► publishing ──────────► published
//!    ▲                   │    │
//!    │  attempts < max   │    │ attempts >= max
//!    └───────────────────┘    └──────────────► error ──(replay)──► pending
//!    ▲                   │
//!    └─── stale reaper ──┘
//! ```
//!
//! # Modules
//!
//! - [`writer`]: [`OutboxWriter`] and the chain's [`OutboxInterceptor`]
//! - [`store`]: the [`OutboxStore`] port, implemented for
//!   [`MemoryStore`](warden_storage::MemoryStore) in `memory`
//! - [`sink`]: the [`Sink`] delivery port
//! - [`projector`]: the poll loop, backoff, reaper and metrics
//! - `postgres` (feature `postgres`): schema and `PgOutboxStore`

mod memory;
pub mod projector;
pub mod sink;
pub mod store;
pub mod writer;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use projector::{CycleReport, OutboxProjector, ProjectorMetrics, ProjectorSnapshot};
pub use sink::Sink;
pub use store::OutboxStore;
pub use writer::{OutboxInterceptor, OutboxWriter};

#[cfg(feature = "postgres")]
pub use postgres::{append_in_transaction, PgOutboxStore, OUTBOX_SCHEMA};
