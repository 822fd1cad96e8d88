//! Cache Entry Types
//!
//! One logical key/value record with timing, access statistics, placement
//! across layers and optimization flags.

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::compression::CompressionAlgorithm;
use super::invalidation::TriggerKind;
use super::layer::LayerId;

/// Fast non-cryptographic hash (FxHash algorithm) used for payload checksums
#[inline]
pub fn checksum(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

fn hours(duration: chrono::Duration) -> f64 {
    duration.num_milliseconds() as f64 / 3_600_000.0
}

/// Stored payload plus its encoding metadata
#[derive(Debug, Clone, PartialEq)]
pub struct EntryValue {
    /// Stored bytes (compressed when `encoding != None`)
    pub data: Bytes,
    pub content_type: String,
    pub encoding: CompressionAlgorithm,
    /// Checksum of the uncompressed payload
    pub checksum: u64,
    pub version: u32,
}

/// Timing fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryTiming {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub ttl: Option<Duration>,
}

impl EntryTiming {
    pub fn new(now: DateTime<Utc>, ttl: Option<Duration>) -> Self {
        let expires_at = ttl.and_then(|ttl| {
            chrono::Duration::from_std(ttl)
                .ok()
                .map(|d| now + d)
        });
        Self {
            created_at: now,
            updated_at: now,
            last_accessed: now,
            expires_at,
            ttl,
        }
    }
}

/// Access statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessStats {
    pub hit_count: u64,
    /// Hits per hour of lifetime
    pub frequency: f64,
    /// 1 / (1 + hours since last access)
    pub recency: f64,
    /// Moving score in [0, 1) bumped on every hit
    pub popularity: f64,
    /// Probability of a near-future access, fed by the pattern analyzer
    pub predicted_future_access: f64,
}

/// Which layers and regions hold the entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub layers: BTreeSet<LayerId>,
    pub regions: Vec<String>,
    pub replicas: u32,
    pub primary_layer: Option<LayerId>,
}

/// Optimization flags
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationFlags {
    pub compressed: bool,
    /// stored / original, 1.0 when uncompressed
    pub compression_ratio: f64,
    pub encrypted: bool,
    pub prefetched: bool,
    pub preloaded: bool,
    /// Strategy that produced a prefetched entry
    pub prefetch_strategy: Option<String>,
}

/// Per-entry invalidation policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryInvalidationPolicy {
    pub strategy: TriggerKind,
    pub triggers: Vec<String>,
    pub cascading: bool,
    pub priority: u8,
}

impl Default for EntryInvalidationPolicy {
    fn default() -> Self {
        Self {
            strategy: TriggerKind::TimeBased,
            triggers: Vec::new(),
            cascading: false,
            priority: 0,
        }
    }
}

/// Lifecycle state derived from flags and timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Populated speculatively, not yet read
    Prefetched,
    /// TTL not elapsed
    Fresh,
    /// TTL elapsed, not yet purged
    Stale,
}

/// Cache entry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: EntryValue,
    /// Stored size in bytes (post-compression), charged against layers
    pub size: u64,
    /// Uncompressed payload size
    pub original_size: u64,
    pub tags: BTreeSet<String>,
    pub dependencies: BTreeSet<String>,
    pub timing: EntryTiming,
    pub stats: AccessStats,
    pub placement: Placement,
    pub flags: OptimizationFlags,
    pub invalidation: EntryInvalidationPolicy,
}

impl CacheEntry {
    /// Create an entry for an already-encoded payload
    pub fn new(
        key: impl Into<String>,
        value: EntryValue,
        original_size: u64,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Self {
        let size = value.data.len() as u64;
        let compressed = value.encoding != CompressionAlgorithm::None;
        let compression_ratio = if original_size == 0 {
            1.0
        } else {
            size as f64 / original_size as f64
        };
        Self {
            key: key.into(),
            value,
            size,
            original_size,
            tags: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            timing: EntryTiming::new(now, ttl),
            stats: AccessStats {
                recency: 1.0,
                ..Default::default()
            },
            placement: Placement::default(),
            flags: OptimizationFlags {
                compressed,
                compression_ratio,
                ..Default::default()
            },
            invalidation: EntryInvalidationPolicy::default(),
        }
    }

    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.timing.expires_at, Some(at) if now >= at)
    }

    pub fn state(&self, now: DateTime<Utc>) -> EntryState {
        if self.is_expired(now) {
            EntryState::Stale
        } else if self.flags.prefetched {
            EntryState::Prefetched
        } else {
            EntryState::Fresh
        }
    }

    pub fn content_type(&self) -> &str {
        &self.value.content_type
    }

    pub fn is_on(&self, layer: &LayerId) -> bool {
        self.placement.layers.contains(layer)
    }

    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        hours(now - self.timing.created_at).max(0.0)
    }

    pub fn hours_since_access(&self, now: DateTime<Utc>) -> f64 {
        hours(now - self.timing.last_accessed).max(0.0)
    }

    /// Hours until expiry; entries without a TTL count as a full day out
    pub fn hours_to_expiry(&self, now: DateTime<Utc>) -> f64 {
        match self.timing.expires_at {
            Some(at) => hours(at - now),
            None => 24.0,
        }
    }

    /// Record a hit. Returns the prefetch strategy when this was the first
    /// read of a prefetched entry.
    pub fn record_hit(&mut self, now: DateTime<Utc>) -> Option<String> {
        self.stats.hit_count += 1;
        self.stats.popularity = self.stats.popularity * 0.9 + 0.1;
        self.timing.last_accessed = now;
        self.refresh_derived(now);

        if self.flags.prefetched {
            self.flags.prefetched = false;
            return self.flags.prefetch_strategy.take();
        }
        None
    }

    /// Recompute frequency and recency from raw counters
    pub fn refresh_derived(&mut self, now: DateTime<Utc>) {
        self.stats.frequency = self.stats.hit_count as f64 / (1.0 + self.age_hours(now));
        self.stats.recency = 1.0 / (1.0 + self.hours_since_access(now));
    }

    /// Mark the entry stale immediately
    pub fn expire_now(&mut self, now: DateTime<Utc>) {
        self.timing.expires_at = Some(now);
    }

    /// Verify content integrity against a decoded payload
    pub fn verify(&self, decoded: &[u8]) -> bool {
        checksum(decoded) == self.value.checksum
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(data: &'static [u8], ttl: Option<Duration>) -> CacheEntry {
        let value = EntryValue {
            data: Bytes::from_static(data),
            content_type: "application/octet-stream".into(),
            encoding: CompressionAlgorithm::None,
            checksum: checksum(data),
            version: 1,
        };
        CacheEntry::new("k", value, data.len() as u64, ttl, Utc::now())
    }

    #[test]
    fn test_checksum_is_stable() {
        assert_eq!(checksum(b"abc"), checksum(b"abc"));
        assert_ne!(checksum(b"abc"), checksum(b"abd"));
    }

    #[test]
    fn test_entry_creation() {
        let entry = make_entry(b"Hello, World!", None);
        assert_eq!(entry.size, 13);
        assert_eq!(entry.original_size, 13);
        assert!(!entry.flags.compressed);
        assert_eq!(entry.flags.compression_ratio, 1.0);
        assert!(entry.verify(b"Hello, World!"));
        assert_eq!(entry.state(Utc::now()), EntryState::Fresh);
    }

    #[test]
    fn test_entry_expiry() {
        let entry = make_entry(b"data", Some(Duration::from_millis(50)));
        let now = entry.timing.created_at;
        assert!(!entry.is_expired(now));
        let later = now + chrono::Duration::milliseconds(60);
        assert!(entry.is_expired(later));
        assert_eq!(entry.state(later), EntryState::Stale);
    }

    #[test]
    fn test_entry_without_ttl_never_expires() {
        let entry = make_entry(b"data", None);
        let far = Utc::now() + chrono::Duration::days(365);
        assert!(!entry.is_expired(far));
        assert_eq!(entry.hours_to_expiry(far), 24.0);
    }

    #[test]
    fn test_hit_tracking() {
        let mut entry = make_entry(b"data", None);
        let now = Utc::now();
        entry.record_hit(now);
        entry.record_hit(now);
        assert_eq!(entry.stats.hit_count, 2);
        assert!(entry.stats.popularity > 0.18 && entry.stats.popularity < 0.2);
        assert!(entry.stats.frequency > 1.9);
        assert!(entry.stats.recency > 0.99);
    }

    #[test]
    fn test_first_hit_clears_prefetch_flag() {
        let mut entry = make_entry(b"data", None);
        entry.flags.prefetched = true;
        entry.flags.prefetch_strategy = Some("temporal".into());
        assert_eq!(entry.state(Utc::now()), EntryState::Prefetched);

        assert_eq!(entry.record_hit(Utc::now()), Some("temporal".into()));
        assert!(!entry.flags.prefetched);
        assert_eq!(entry.record_hit(Utc::now()), None);
        assert_eq!(entry.state(Utc::now()), EntryState::Fresh);
    }

    #[test]
    fn test_expire_now() {
        let mut entry = make_entry(b"data", Some(Duration::from_secs(3600)));
        let now = Utc::now();
        entry.expire_now(now);
        assert!(entry.is_expired(now));
    }
}
