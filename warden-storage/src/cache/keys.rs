//! Cache key derivation and TTL jitter.

use std::time::Duration;

use rand::Rng;
use warden_core::{EntityId, EntityType, Query};

/// Derives cache keys. Must be deterministic.
pub trait KeyStrategy: Send + Sync {
    fn entity_key(&self, entity_type: &EntityType, id: EntityId) -> String;

    /// Key for a list read. `generation` changes whenever the type is written.
    fn query_key(&self, entity_type: &EntityType, query: &Query, generation: &str) -> String;

    /// Where the type's current generation token lives.
    fn generation_key(&self, entity_type: &EntityType) -> String;
}

/// `{prefix}:{type}:id:{id}`, `{prefix}:{type}:q:{generation}:{sha256(query)}`
/// and `{prefix}:{type}:gen`.
#[derive(Debug, Clone)]
pub struct DefaultKeyStrategy {
    prefix: String,
}

impl DefaultKeyStrategy {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl KeyStrategy for DefaultKeyStrategy {
    fn entity_key(&self, entity_type: &EntityType, id: EntityId) -> String {
        format!("{}:{}:id:{}", self.prefix, entity_type, id)
    }

    fn query_key(&self, entity_type: &EntityType, query: &Query, generation: &str) -> String {
        format!(
            "{}:{}:q:{}:{}",
            self.prefix,
            entity_type,
            generation,
            query.fingerprint()
        )
    }

    fn generation_key(&self, entity_type: &EntityType) -> String {
        format!("{}:{}:gen", self.prefix, entity_type)
    }
}

/// `ttl * uniform(1 - ratio, 1 + ratio)`. Spreads expiry of entries cached
/// together. `ratio` is clamped to `[0, 1]`; NaN means no jitter.
pub fn jittered_ttl(ttl: Duration, ratio: f64) -> Duration {
    if ratio.is_nan() || ratio <= 0.0 {
        return ttl;
    }
    let ratio = ratio.min(1.0);
    let factor = rand::rng().random_range((1.0 - ratio)..=(1.0 + ratio));
    ttl.mul_f64(factor)
}
