//! Eviction Engine
//!
//! Chooses victims on a layer when a write (or the optimizer) finds it over
//! its threshold. Four baseline orderings plus an adaptive scored policy whose
//! scoring function is pluggable through [`EvictionScorer`].

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::arena::EntryId;
use super::entry::CacheEntry;

/// Default fraction of candidates evicted per round
pub const DEFAULT_EVICTION_FRACTION: f64 = 0.10;

/// Eviction policy name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicyKind {
    /// Oldest `last_accessed` first
    Lru,
    /// Lowest `frequency` first
    Lfu,
    /// Closest `expires_at` first
    Ttl,
    /// Uniform random subset
    Random,
    /// Lowest adaptive score first
    #[default]
    Adaptive,
}

impl std::fmt::Display for EvictionPolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EvictionPolicyKind::Lru => "lru",
            EvictionPolicyKind::Lfu => "lfu",
            EvictionPolicyKind::Ttl => "ttl",
            EvictionPolicyKind::Random => "random",
            EvictionPolicyKind::Adaptive => "adaptive",
        };
        write!(f, "{}", name)
    }
}

/// Retention score for the adaptive policy. Higher = more worth keeping.
pub trait EvictionScorer: Send + Sync {
    fn name(&self) -> &str;

    fn score(&self, entry: &CacheEntry, now: DateTime<Utc>) -> f64;
}

/// Weights for the default adaptive scorer
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveWeights {
    pub frequency: f64,
    pub popularity: f64,
    pub predicted_access: f64,
    pub time_to_expiry: f64,
    pub age_penalty: f64,
    pub idle_penalty: f64,
    /// Cap in hours applied to age and idle time
    pub penalty_cap_hours: f64,
}

impl Default for AdaptiveWeights {
    fn default() -> Self {
        Self {
            frequency: 0.3,
            popularity: 0.2,
            predicted_access: 0.3,
            time_to_expiry: 0.1,
            age_penalty: 0.05,
            idle_penalty: 0.05,
            penalty_cap_hours: 24.0,
        }
    }
}

/// Deterministic weighted scorer
///
/// `0.3*frequency + 0.2*popularity + 0.3*predicted + 0.1*max(0, hoursToExpiry)
///  - 0.05*min(ageHours, 24) - 0.05*min(hoursSinceAccess, 24)`
#[derive(Debug, Clone, Default)]
pub struct AdaptiveScorer {
    weights: AdaptiveWeights,
}

impl AdaptiveScorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_weights(weights: AdaptiveWeights) -> Self {
        Self { weights }
    }
}

impl EvictionScorer for AdaptiveScorer {
    fn name(&self) -> &str {
        "adaptive-weighted"
    }

    fn score(&self, entry: &CacheEntry, now: DateTime<Utc>) -> f64 {
        let w = &self.weights;
        w.frequency * entry.stats.frequency
            + w.popularity * entry.stats.popularity
            + w.predicted_access * entry.stats.predicted_future_access
            + w.time_to_expiry * entry.hours_to_expiry(now).max(0.0)
            - w.age_penalty * entry.age_hours(now).min(w.penalty_cap_hours)
            - w.idle_penalty * entry.hours_since_access(now).min(w.penalty_cap_hours)
    }
}

/// Number of victims for a candidate set: `ceil(count * fraction)`, at most `count`
pub fn victim_count(candidates: usize, fraction: f64) -> usize {
    if candidates == 0 || fraction <= 0.0 {
        return 0;
    }
    ((candidates as f64 * fraction).ceil() as usize).min(candidates)
}

/// Victim selection over a layer's candidates
#[derive(Clone)]
pub struct EvictionEngine {
    scorer: Arc<dyn EvictionScorer>,
}

impl std::fmt::Debug for EvictionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictionEngine")
            .field("scorer", &self.scorer.name())
            .finish()
    }
}

impl Default for EvictionEngine {
    fn default() -> Self {
        Self::new(Arc::new(AdaptiveScorer::new()))
    }
}

impl EvictionEngine {
    pub fn new(scorer: Arc<dyn EvictionScorer>) -> Self {
        Self { scorer }
    }

    pub fn scorer(&self) -> &dyn EvictionScorer {
        self.scorer.as_ref()
    }

    /// Pick `ceil(len * fraction)` victims from `candidates` under `policy`
    pub fn select_victims(
        &self,
        candidates: &[(EntryId, &CacheEntry)],
        policy: EvictionPolicyKind,
        fraction: f64,
        now: DateTime<Utc>,
    ) -> Vec<EntryId> {
        let count = victim_count(candidates.len(), fraction);
        if count == 0 {
            return Vec::new();
        }

        if policy == EvictionPolicyKind::Random {
            let mut rng = rand::thread_rng();
            return candidates
                .choose_multiple(&mut rng, count)
                .map(|(id, _)| *id)
                .collect();
        }

        // Ascending sort key: the first `count` entries are evicted
        let mut keyed: Vec<(f64, EntryId, &CacheEntry)> = candidates
            .iter()
            .map(|(id, entry)| {
                let key = match policy {
                    EvictionPolicyKind::Lru => {
                        entry.timing.last_accessed.timestamp_millis() as f64
                    }
                    EvictionPolicyKind::Lfu => entry.stats.frequency,
                    EvictionPolicyKind::Ttl => entry
                        .timing
                        .expires_at
                        .map(|at| at.timestamp_millis() as f64)
                        .unwrap_or(f64::MAX),
                    EvictionPolicyKind::Adaptive => self.scorer.score(entry, now),
                    EvictionPolicyKind::Random => 0.0,
                };
                (key, *id, *entry)
            })
            .collect();

        keyed.sort_by(|a, b| match a.0.total_cmp(&b.0) {
            Ordering::Equal => a
                .2
                .timing
                .last_accessed
                .cmp(&b.2.timing.last_accessed)
                .then_with(|| a.2.key.cmp(&b.2.key)),
            other => other,
        });

        keyed.into_iter().take(count).map(|(_, id, _)| id).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::arena::EntryArena;
    use crate::cache::compression::CompressionAlgorithm;
    use crate::cache::entry::{checksum, EntryValue};
    use bytes::Bytes;
    use std::time::Duration;

    fn entry(key: &str, ttl: Option<Duration>, now: DateTime<Utc>) -> CacheEntry {
        let value = EntryValue {
            data: Bytes::from_static(b"0123456789"),
            content_type: "text/plain".into(),
            encoding: CompressionAlgorithm::None,
            checksum: checksum(b"0123456789"),
            version: 1,
        };
        CacheEntry::new(key, value, 10, ttl, now)
    }

    fn arena_with(entries: Vec<CacheEntry>) -> (EntryArena, Vec<EntryId>) {
        let mut arena = EntryArena::new();
        let ids = entries.into_iter().map(|e| arena.insert(e)).collect();
        (arena, ids)
    }

    #[test]
    fn test_victim_count_rounds_up() {
        assert_eq!(victim_count(5, 0.10), 1);
        assert_eq!(victim_count(10, 0.10), 1);
        assert_eq!(victim_count(11, 0.10), 2);
        assert_eq!(victim_count(3, 1.0), 3);
        assert_eq!(victim_count(0, 0.5), 0);
    }

    #[test]
    fn test_adaptive_score_formula() {
        let now = Utc::now();
        let mut e = entry("a", None, now);
        e.stats.frequency = 2.0;
        e.stats.popularity = 0.5;
        e.stats.predicted_future_access = 1.0;
        // No TTL: 24h to expiry, zero age, zero idle
        let score = AdaptiveScorer::new().score(&e, now);
        let expected = 0.3 * 2.0 + 0.2 * 0.5 + 0.3 * 1.0 + 0.1 * 24.0;
        assert!((score - expected).abs() < 1e-6, "{} vs {}", score, expected);
    }

    #[test]
    fn test_adaptive_penalties_are_capped() {
        let now = Utc::now();
        let mut e = entry("a", None, now - chrono::Duration::hours(100));
        e.timing.last_accessed = now - chrono::Duration::hours(100);
        let score = AdaptiveScorer::new().score(&e, now);
        let expected = 0.1 * 24.0 - 0.05 * 24.0 - 0.05 * 24.0;
        assert!((score - expected).abs() < 1e-6);
    }

    #[test]
    fn test_adaptive_selects_lowest_scores() {
        let now = Utc::now();
        let mut hot = entry("hot", None, now);
        hot.stats.frequency = 10.0;
        let mut warm = entry("warm", None, now);
        warm.stats.frequency = 1.0;
        let cold = entry("cold", None, now);

        let (arena, ids) = arena_with(vec![hot, warm, cold]);
        let candidates: Vec<_> = arena.iter().collect();

        let engine = EvictionEngine::default();
        let victims = engine.select_victims(&candidates, EvictionPolicyKind::Adaptive, 0.5, now);
        assert_eq!(victims.len(), 2);
        assert!(victims.contains(&ids[2]));
        assert!(victims.contains(&ids[1]));
    }

    #[test]
    fn test_lru_orders_by_last_access() {
        let now = Utc::now();
        let mut old = entry("old", None, now);
        old.timing.last_accessed = now - chrono::Duration::minutes(10);
        let recent = entry("recent", None, now);
        let (arena, ids) = arena_with(vec![recent, old]);
        let candidates: Vec<_> = arena.iter().collect();

        let victims =
            EvictionEngine::default().select_victims(&candidates, EvictionPolicyKind::Lru, 0.1, now);
        assert_eq!(victims, vec![ids[1]]);
    }

    #[test]
    fn test_lfu_orders_by_frequency() {
        let now = Utc::now();
        let mut busy = entry("busy", None, now);
        busy.stats.frequency = 5.0;
        let idle = entry("idle", None, now);
        let (arena, ids) = arena_with(vec![busy, idle]);
        let candidates: Vec<_> = arena.iter().collect();

        let victims =
            EvictionEngine::default().select_victims(&candidates, EvictionPolicyKind::Lfu, 0.1, now);
        assert_eq!(victims, vec![ids[1]]);
    }

    #[test]
    fn test_ttl_evicts_closest_expiry() {
        let now = Utc::now();
        let soon = entry("soon", Some(Duration::from_secs(5)), now);
        let later = entry("later", Some(Duration::from_secs(500)), now);
        let never = entry("never", None, now);
        let (arena, ids) = arena_with(vec![later, never, soon]);
        let candidates: Vec<_> = arena.iter().collect();

        let victims =
            EvictionEngine::default().select_victims(&candidates, EvictionPolicyKind::Ttl, 0.1, now);
        assert_eq!(victims, vec![ids[2]]);
    }

    #[test]
    fn test_random_returns_requested_count() {
        let now = Utc::now();
        let entries = (0..20).map(|i| entry(&format!("k{}", i), None, now)).collect();
        let (arena, _) = arena_with(entries);
        let candidates: Vec<_> = arena.iter().collect();

        let victims = EvictionEngine::default().select_victims(
            &candidates,
            EvictionPolicyKind::Random,
            0.25,
            now,
        );
        assert_eq!(victims.len(), 5);
        let unique: std::collections::HashSet<_> = victims.iter().collect();
        assert_eq!(unique.len(), 5);
    }

    struct InverseScorer;

    impl EvictionScorer for InverseScorer {
        fn name(&self) -> &str {
            "inverse"
        }

        fn score(&self, entry: &CacheEntry, _now: DateTime<Utc>) -> f64 {
            -entry.stats.frequency
        }
    }

    #[test]
    fn test_pluggable_scorer() {
        let now = Utc::now();
        let mut busy = entry("busy", None, now);
        busy.stats.frequency = 5.0;
        let idle = entry("idle", None, now);
        let (arena, ids) = arena_with(vec![busy, idle]);
        let candidates: Vec<_> = arena.iter().collect();

        let engine = EvictionEngine::new(Arc::new(InverseScorer));
        let victims = engine.select_victims(&candidates, EvictionPolicyKind::Adaptive, 0.1, now);
        assert_eq!(victims, vec![ids[0]]);
    }
}
