//! Configuration types
//!
//! Every struct has a `Default` built from [`crate::constants`], a `from_env()`
//! loader that reads `WARDEN_*` variables and falls back to those defaults,
//! and a `validate()` that rejects values the runtime cannot honor.

use crate::constants::*;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Read-through cache tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL for real hits, before jitter.
    pub ttl: Duration,
    /// TTL for the "not found" sentinel, before jitter.
    pub null_ttl: Duration,
    /// Half-width of the uniform TTL multiplier around 1.0.
    pub jitter_ratio: f64,
    /// How long a joiner waits on another caller's load before failing open.
    pub singleflight_timeout: Duration,
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            null_ttl: Duration::from_secs(DEFAULT_CACHE_NULL_TTL_SECS),
            jitter_ratio: DEFAULT_CACHE_JITTER_RATIO,
            singleflight_timeout: Duration::from_millis(DEFAULT_SINGLEFLIGHT_TIMEOUT_MS),
            key_prefix: DEFAULT_CACHE_KEY_PREFIX.to_string(),
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self {
            ttl: Duration::from_secs(env_or("WARDEN_CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS)),
            null_ttl: Duration::from_secs(env_or(
                "WARDEN_CACHE_NULL_TTL_SECS",
                DEFAULT_CACHE_NULL_TTL_SECS,
            )),
            jitter_ratio: env_or("WARDEN_CACHE_JITTER_RATIO", DEFAULT_CACHE_JITTER_RATIO),
            singleflight_timeout: Duration::from_millis(env_or(
                "WARDEN_SINGLEFLIGHT_TIMEOUT_MS",
                DEFAULT_SINGLEFLIGHT_TIMEOUT_MS,
            )),
            key_prefix: std::env::var("WARDEN_CACHE_KEY_PREFIX")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CACHE_KEY_PREFIX.to_string()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_null_ttl(mut self, null_ttl: Duration) -> Self {
        self.null_ttl = null_ttl;
        self
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    pub fn with_singleflight_timeout(mut self, timeout: Duration) -> Self {
        self.singleflight_timeout = timeout;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl.is_zero() {
            return Err(invalid("cache.ttl", "0s", "must be positive"));
        }
        if self.null_ttl.is_zero() {
            return Err(invalid("cache.null_ttl", "0s", "must be positive"));
        }
        if !(0.0..1.0).contains(&self.jitter_ratio) {
            return Err(invalid(
                "cache.jitter_ratio",
                self.jitter_ratio,
                "must be in [0, 1)",
            ));
        }
        if self.singleflight_timeout.is_zero() {
            return Err(invalid("cache.singleflight_timeout", "0ms", "must be positive"));
        }
        if self.key_prefix.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "cache.key_prefix".to_string(),
            });
        }
        Ok(())
    }
}

/// Outbox projector tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectorConfig {
    pub batch_size: usize,
    /// Delivery attempts before a row moves to `error`.
    pub max_retry: u32,
    /// Pause after a full batch, when more backlog is likely.
    pub busy_delay: Duration,
    /// First pause after an empty cycle; doubles up to `idle_delay_max`.
    pub idle_delay_min: Duration,
    pub idle_delay_max: Duration,
    /// A `publishing` claim older than this is returned to `pending`.
    pub stale_after: Duration,
    pub reaper_interval: Duration,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_OUTBOX_BATCH_SIZE,
            max_retry: DEFAULT_OUTBOX_MAX_RETRY,
            busy_delay: Duration::from_millis(DEFAULT_OUTBOX_BUSY_DELAY_MS),
            idle_delay_min: Duration::from_millis(DEFAULT_OUTBOX_IDLE_DELAY_MIN_MS),
            idle_delay_max: Duration::from_millis(DEFAULT_OUTBOX_IDLE_DELAY_MAX_MS),
            stale_after: Duration::from_secs(DEFAULT_OUTBOX_STALE_AFTER_SECS),
            reaper_interval: Duration::from_secs(DEFAULT_OUTBOX_REAPER_INTERVAL_SECS),
        }
    }
}

impl ProjectorConfig {
    pub fn from_env() -> Self {
        Self {
            batch_size: env_or("WARDEN_OUTBOX_BATCH_SIZE", DEFAULT_OUTBOX_BATCH_SIZE),
            max_retry: env_or("WARDEN_OUTBOX_MAX_RETRY", DEFAULT_OUTBOX_MAX_RETRY),
            busy_delay: Duration::from_millis(env_or(
                "WARDEN_OUTBOX_BUSY_DELAY_MS",
                DEFAULT_OUTBOX_BUSY_DELAY_MS,
            )),
            idle_delay_min: Duration::from_millis(env_or(
                "WARDEN_OUTBOX_IDLE_DELAY_MIN_MS",
                DEFAULT_OUTBOX_IDLE_DELAY_MIN_MS,
            )),
            idle_delay_max: Duration::from_millis(env_or(
                "WARDEN_OUTBOX_IDLE_DELAY_MAX_MS",
                DEFAULT_OUTBOX_IDLE_DELAY_MAX_MS,
            )),
            stale_after: Duration::from_secs(env_or(
                "WARDEN_OUTBOX_STALE_AFTER_SECS",
                DEFAULT_OUTBOX_STALE_AFTER_SECS,
            )),
            reaper_interval: Duration::from_secs(env_or(
                "WARDEN_OUTBOX_REAPER_INTERVAL_SECS",
                DEFAULT_OUTBOX_REAPER_INTERVAL_SECS,
            )),
        }
    }

    /// Short delays for local runs and tests.
    pub fn development() -> Self {
        Self {
            batch_size: 10,
            max_retry: 3,
            busy_delay: Duration::from_millis(10),
            idle_delay_min: Duration::from_millis(20),
            idle_delay_max: Duration::from_millis(500),
            stale_after: Duration::from_secs(5),
            reaper_interval: Duration::from_secs(2),
        }
    }

    pub fn production() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_idle_delays(mut self, min: Duration, max: Duration) -> Self {
        self.idle_delay_min = min;
        self.idle_delay_max = max;
        self
    }

    pub fn with_busy_delay(mut self, delay: Duration) -> Self {
        self.busy_delay = delay;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(invalid("projector.batch_size", 0, "must be at least 1"));
        }
        if self.max_retry == 0 {
            return Err(invalid("projector.max_retry", 0, "must be at least 1"));
        }
        if self.idle_delay_min.is_zero() {
            return Err(invalid("projector.idle_delay_min", "0ms", "must be positive"));
        }
        if self.idle_delay_max < self.idle_delay_min {
            return Err(invalid(
                "projector.idle_delay_max",
                format!("{:?}", self.idle_delay_max),
                "must not be below idle_delay_min",
            ));
        }
        if self.stale_after.is_zero() {
            return Err(invalid("projector.stale_after", "0s", "must be positive"));
        }
        if self.reaper_interval.is_zero() {
            return Err(invalid("projector.reaper_interval", "0s", "must be positive"));
        }
        Ok(())
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WardenConfig {
    pub cache: CacheConfig,
    pub projector: ProjectorConfig,
}

impl WardenConfig {
    pub fn from_env() -> Self {
        Self {
            cache: CacheConfig::from_env(),
            projector: ProjectorConfig::from_env(),
        }
    }

    pub fn development() -> Self {
        Self {
            cache: CacheConfig::default()
                .with_ttl(Duration::from_secs(30))
                .with_null_ttl(Duration::from_secs(5))
                .with_singleflight_timeout(Duration::from_millis(500)),
            projector: ProjectorConfig::development(),
        }
    }

    pub fn production() -> Self {
        Self {
            cache: CacheConfig::default(),
            projector: ProjectorConfig::production(),
        }
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_projector(mut self, projector: ProjectorConfig) -> Self {
        self.projector = projector;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        self.projector.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let config = WardenConfig::default();
        assert_eq!(config.cache.ttl, Duration::from_secs(DEFAULT_CACHE_TTL_SECS));
        assert_eq!(config.cache.jitter_ratio, DEFAULT_CACHE_JITTER_RATIO);
        assert_eq!(config.projector.batch_size, DEFAULT_OUTBOX_BATCH_SIZE);
        assert_eq!(config.projector.max_retry, DEFAULT_OUTBOX_MAX_RETRY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_env_without_overrides_uses_defaults() {
        // The test harness does not set WARDEN_* variables.
        let config = WardenConfig::from_env();
        assert_eq!(config, WardenConfig::default());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(WardenConfig::development().validate().is_ok());
        assert!(WardenConfig::production().validate().is_ok());
    }

    #[test]
    fn test_jitter_ratio_bounds() {
        let config = CacheConfig::default().with_jitter_ratio(1.0);
        let err = config.validate().expect_err("ratio of 1 allows zero TTL");
        assert!(err.to_string().contains("jitter_ratio"));
        assert!(CacheConfig::default().with_jitter_ratio(0.0).validate().is_ok());
    }

    #[test]
    fn test_idle_delays_must_be_ordered() {
        let config = ProjectorConfig::default()
            .with_idle_delays(Duration::from_secs(2), Duration::from_secs(1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = ProjectorConfig::default().with_batch_size(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "projector.batch_size"
        ));
    }

    #[test]
    fn test_empty_prefix_is_missing() {
        let config = CacheConfig::default().with_key_prefix("");
        assert!(matches!(config.validate(), Err(ConfigError::MissingRequired { .. })));
    }
}
