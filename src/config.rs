//! Configuration surface for the segment cache (spec §6).
//!
//! This crate never reads configuration from disk itself — persistence
//! is the embedding application's concern (spec §1 non-goals). It only
//! defines the struct and its documented defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_expiry() -> Duration {
    Duration::from_secs(0)
}

fn default_read_ahead_segments() -> usize {
    8
}

fn default_prefetch_concurrency() -> usize {
    3
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_catalog_flush_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_eviction_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_idle_threshold() -> Duration {
    Duration::from_secs(30)
}

fn default_sequential_hits_to_engage() -> u32 {
    3
}

fn default_circuit_breaker_threshold() -> u32 {
    10
}

fn default_circuit_breaker_cooldown() -> Duration {
    Duration::from_secs(60)
}

/// The configuration surface enumerated in spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentCacheConfig {
    /// Directory holding `catalog.json` and the `.seg` files. Created if
    /// absent.
    pub cache_path: PathBuf,

    /// Soft cap enforced by `Evict`. `0` rejects all `Put`s (spec §9 open
    /// question).
    pub max_size_bytes: u64,

    /// `0` (the default) disables expiry entirely.
    #[serde(with = "duration_secs", default = "default_expiry")]
    pub expiry: Duration,

    /// Number of segments to read ahead once sequential access engages.
    #[serde(default = "default_read_ahead_segments")]
    pub read_ahead_segments: usize,

    /// Bounded worker count for lookahead fetches.
    #[serde(default = "default_prefetch_concurrency")]
    pub prefetch_concurrency: usize,

    /// Per-segment fetch timeout.
    #[serde(with = "duration_secs", default = "default_fetch_timeout")]
    pub fetch_timeout: Duration,

    /// Period of the catalog-flush background task.
    #[serde(with = "duration_secs", default = "default_catalog_flush_interval")]
    pub catalog_flush_interval: Duration,

    /// Period of the eviction+expiry background task.
    #[serde(with = "duration_secs", default = "default_eviction_interval")]
    pub eviction_interval: Duration,

    /// Inactivity window after which an idle per-path Prefetcher is torn
    /// down (and had no active file opens).
    #[serde(with = "duration_secs", default = "default_idle_threshold")]
    pub idle_threshold: Duration,

    /// Consecutive same-direction sequential hits required to engage the
    /// Prefetcher (spec §4.4 recommends 3).
    #[serde(default = "default_sequential_hits_to_engage")]
    pub sequential_hits_to_engage: u32,

    /// Consecutive fetch errors before the circuit breaker opens (spec
    /// §4.4 recommends `N_ERR = 10`).
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    /// Circuit breaker cooldown before a fresh access is allowed to
    /// re-engage prefetching (spec §4.4 recommends 60s).
    #[serde(with = "duration_secs", default = "default_circuit_breaker_cooldown")]
    pub circuit_breaker_cooldown: Duration,
}

impl Default for SegmentCacheConfig {
    fn default() -> Self {
        Self {
            cache_path: PathBuf::from("./cache"),
            max_size_bytes: 10 * 1024 * 1024 * 1024,
            expiry: default_expiry(),
            read_ahead_segments: default_read_ahead_segments(),
            prefetch_concurrency: default_prefetch_concurrency(),
            fetch_timeout: default_fetch_timeout(),
            catalog_flush_interval: default_catalog_flush_interval(),
            eviction_interval: default_eviction_interval(),
            idle_threshold: default_idle_threshold(),
            sequential_hits_to_engage: default_sequential_hits_to_engage(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_cooldown: default_circuit_breaker_cooldown(),
        }
    }
}

impl SegmentCacheConfig {
    /// `true` when expiry is disabled (spec §4.1 `Cleanup`: "a zero or
    /// negative `ExpiryDuration` disables expiry").
    pub fn expiry_disabled(&self) -> bool {
        self.expiry.is_zero()
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = SegmentCacheConfig::default();
        assert_eq!(cfg.read_ahead_segments, 8);
        assert_eq!(cfg.prefetch_concurrency, 3);
        assert_eq!(cfg.fetch_timeout, Duration::from_secs(60));
        assert_eq!(cfg.catalog_flush_interval, Duration::from_secs(10));
        assert_eq!(cfg.eviction_interval, Duration::from_secs(5 * 60));
        assert_eq!(cfg.idle_threshold, Duration::from_secs(30));
        assert!(cfg.expiry_disabled());
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = SegmentCacheConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: SegmentCacheConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_size_bytes, cfg.max_size_bytes);
    }
}
