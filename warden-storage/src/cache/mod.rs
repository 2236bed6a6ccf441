//! Read-through cache layer.
//!
//! [`CacheInterceptor`] sits in the chain and guards entity types that carry a
//! [`CachePolicy`](crate::registry::CachePolicy) against the three classic
//! failure modes:
//!
//! - stampede: concurrent misses on one key share a single store load
//!   ([`SingleflightGroup`]);
//! - penetration: confirmed misses are cached as [`CacheEntry::Absent`] with a
//!   shorter TTL;
//! - avalanche: every TTL is jittered ([`jittered_ttl`]).
//!
//! The store stays authoritative. The cache is only written after a store
//! read, invalidated after a durable commit (loads still running for that key
//! are detached and never fill it), and any backend failure degrades
//! to a store read.
//!
//! # Example
//!
//! ```ignore
//! let cache = Arc::new(CacheInterceptor::new(
//!     Arc::new(MemoryCacheBackend::new()),
//!     registry.clone(),
//!     CacheConfig::default(),
//! ));
//! let chain = ChainBuilder::new(store, registry).with_arc(cache.clone()).build();
//! // ...
//! let stats = cache.get_stats();
//! ```

pub mod backend;
pub mod interceptor;
pub mod keys;
pub mod singleflight;
pub mod stats;

pub use backend::{CacheBackend, CacheEntry, MemoryCacheBackend};
pub use interceptor::CacheInterceptor;
pub use keys::{jittered_ttl, DefaultKeyStrategy, KeyStrategy};
pub use singleflight::{Flight, SingleflightGroup, StaleMark};
pub use stats::CacheStatsSnapshot;
