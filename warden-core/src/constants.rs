//! Constants for WARDEN
//!
//! Default values for every tunable. `from_env()` loaders fall back to these.

// ============================================================================
// CACHE
// ============================================================================

/// Default TTL for cached rows and query results (5 minutes)
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Default TTL for cached "not found" sentinels
pub const DEFAULT_CACHE_NULL_TTL_SECS: u64 = 30;

/// Default jitter ratio; actual TTL is `ttl * uniform(1 - r, 1 + r)`
pub const DEFAULT_CACHE_JITTER_RATIO: f64 = 0.2;

/// Default bound on how long a caller waits for another caller's load
pub const DEFAULT_SINGLEFLIGHT_TIMEOUT_MS: u64 = 5000;

/// Default prefix for every cache key
pub const DEFAULT_CACHE_KEY_PREFIX: &str = "warden";

// ============================================================================
// OUTBOX PROJECTOR
// ============================================================================

/// Default number of rows claimed per cycle
pub const DEFAULT_OUTBOX_BATCH_SIZE: usize = 100;

/// Default delivery attempts before a row is parked in `error`
pub const DEFAULT_OUTBOX_MAX_RETRY: u32 = 5;

/// Default pause after draining a full batch
pub const DEFAULT_OUTBOX_BUSY_DELAY_MS: u64 = 100;

/// Default first pause after an empty cycle
pub const DEFAULT_OUTBOX_IDLE_DELAY_MIN_MS: u64 = 200;

/// Default ceiling for the doubling idle pause
pub const DEFAULT_OUTBOX_IDLE_DELAY_MAX_MS: u64 = 5000;

/// Default age after which a `publishing` claim is presumed abandoned
pub const DEFAULT_OUTBOX_STALE_AFTER_SECS: u64 = 60;

/// Default interval between stale-claim sweeps
pub const DEFAULT_OUTBOX_REAPER_INTERVAL_SECS: u64 = 30;

// ============================================================================
// CONTEXT
// ============================================================================

/// Actor recorded when a write carries none
pub const SYSTEM_ACTOR: &str = "system";
