//! Pattern Analyzer
//!
//! Derives access patterns from a bounded access log. Confidence is a fixed
//! heuristic per pattern kind. Predictions feed the prefetch engine and the
//! `predicted_future_access` score used by adaptive eviction.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::store::TieredStore;
use crate::observability::{events, CacheObserver};

const TEMPORAL_CONFIDENCE: f64 = 0.7;
const SPATIAL_CONFIDENCE: f64 = 0.6;
const CONTENT_TYPE_CONFIDENCE: f64 = 0.5;
const USER_BEHAVIOR_CONFIDENCE: f64 = 0.8;

/// Buckets above this share of the busiest bucket are peaks
const PEAK_RATIO: f64 = 0.8;
/// Regions above this share of all hits are hot
const HOT_REGION_SHARE: f64 = 0.1;
const TOP_CONTENT_TYPES: usize = 5;
const TOP_TRANSITIONS: usize = 10;
const KEYS_PER_PATTERN: usize = 20;
/// Decay applied to predictions no pattern refreshed
const PREDICTION_DECAY: f64 = 0.5;

/// One observed read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessEvent {
    pub key: String,
    pub at: DateTime<Utc>,
    pub actor: Option<String>,
    pub region: Option<String>,
    pub content_type: Option<String>,
    pub hit: bool,
}

impl AccessEvent {
    pub fn new(key: impl Into<String>, at: DateTime<Utc>, hit: bool) -> Self {
        Self {
            key: key.into(),
            at,
            actor: None,
            region: None,
            content_type: None,
            hit,
        }
    }

    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn in_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Temporal,
    Spatial,
    UserBehavior,
    ContentType,
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PatternKind::Temporal => "temporal",
            PatternKind::Spatial => "spatial",
            PatternKind::UserBehavior => "user_behavior",
            PatternKind::ContentType => "content_type",
        };
        write!(f, "{}", name)
    }
}

/// Derived statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternStats {
    /// Hits per hour over the observed span
    pub frequency: f64,
    /// Mean gap between accesses
    pub interval_ms: f64,
    pub seasonality: f64,
    pub trend: f64,
    pub volatility: f64,
}

/// Forward prediction for one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub key: String,
    pub expected_at: DateTime<Utc>,
    pub probability: f64,
    pub expected_volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessPattern {
    pub kind: PatternKind,
    pub stats: PatternStats,
    pub keys: Vec<String>,
    /// Kind-specific labels: peak hours, hot regions, content types, transitions
    pub dimensions: Vec<String>,
    pub confidence: f64,
    pub strength: f64,
    pub predictions: Vec<Prediction>,
}

// =============================================================================
// Statistics Helpers
// =============================================================================

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Coefficient of variation, 0 for an all-zero series
fn variation(values: &[f64]) -> f64 {
    let m = mean(values);
    if m == 0.0 {
        0.0
    } else {
        std_dev(values) / m
    }
}

/// Least-squares slope over the index sequence
fn slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = mean(values);
    let (num, den) = values
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (x, y)| {
            let dx = x as f64 - x_mean;
            (num + dx * (y - y_mean), den + dx * dx)
        });
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// Next instant at the top of `hour` strictly after `now`
fn next_hour_at(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let candidate = now
        .date_naive()
        .and_hms_opt(hour, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(now);
    if candidate > now {
        candidate
    } else {
        candidate + ChronoDuration::days(1)
    }
}

fn top_keys(counts: &HashMap<&str, usize>, n: usize) -> Vec<(String, usize)> {
    let mut ranked: Vec<(String, usize)> = counts.iter().map(|(k, c)| (k.to_string(), *c)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(n);
    ranked
}

// =============================================================================
// Pattern Analyzer
// =============================================================================

pub struct PatternAnalyzer {
    log: Mutex<VecDeque<AccessEvent>>,
    max_history: RwLock<usize>,
    patterns: RwLock<Vec<AccessPattern>>,
    last_analysis: RwLock<Option<DateTime<Utc>>>,
    observer: Arc<dyn CacheObserver>,
}

impl std::fmt::Debug for PatternAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternAnalyzer")
            .field("history", &self.history_len())
            .field("patterns", &self.patterns.read().len())
            .finish()
    }
}

impl PatternAnalyzer {
    pub fn new(max_history: usize, observer: Arc<dyn CacheObserver>) -> Self {
        Self {
            log: Mutex::new(VecDeque::new()),
            max_history: RwLock::new(max_history.max(1)),
            patterns: RwLock::new(Vec::new()),
            last_analysis: RwLock::new(None),
            observer,
        }
    }

    pub fn set_max_history(&self, max_history: usize) {
        *self.max_history.write() = max_history.max(1);
    }

    /// Append to the access log, dropping the oldest event when full
    pub fn record(&self, event: AccessEvent) {
        let max = *self.max_history.read();
        let mut log = self.log.lock();
        while log.len() >= max {
            log.pop_front();
        }
        log.push_back(event);
    }

    pub fn history_len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn patterns(&self) -> Vec<AccessPattern> {
        self.patterns.read().clone()
    }

    pub fn patterns_of(&self, kind: PatternKind) -> Vec<AccessPattern> {
        self.patterns
            .read()
            .iter()
            .filter(|p| p.kind == kind)
            .cloned()
            .collect()
    }

    pub fn last_analysis(&self) -> Option<DateTime<Utc>> {
        *self.last_analysis.read()
    }

    /// Rebuild the pattern table and push predictions onto live entries
    pub fn analyze(&self, store: &TieredStore) -> usize {
        self.analyze_at(store, Utc::now())
    }

    pub fn analyze_at(&self, store: &TieredStore, now: DateTime<Utc>) -> usize {
        let history: Vec<AccessEvent> = self.log.lock().iter().cloned().collect();
        let hits: Vec<&AccessEvent> = history.iter().filter(|e| e.hit).collect();

        let patterns: Vec<AccessPattern> = [
            Self::temporal(&hits, now),
            Self::spatial(&hits, now),
            Self::content_types(&hits, now),
            Self::user_behavior(&history, now),
        ]
        .into_iter()
        .flatten()
        .collect();

        let updated = Self::feed_predictions(store, &patterns);
        let count = patterns.len();
        *self.patterns.write() = patterns;
        *self.last_analysis.write() = Some(now);

        debug!(events = history.len(), patterns = count, entries_scored = updated, "Analyzed access patterns");
        self.observer.emit(
            events::PATTERNS_ANALYZED,
            &[
                ("events", history.len().into()),
                ("patterns", count.into()),
                ("entries_scored", updated.into()),
            ],
        );
        count
    }

    fn interval_ms(events: &[&AccessEvent]) -> f64 {
        if events.len() < 2 {
            return 0.0;
        }
        let mut times: Vec<i64> = events.iter().map(|e| e.at.timestamp_millis()).collect();
        times.sort_unstable();
        let gaps: Vec<f64> = times.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
        mean(&gaps)
    }

    fn frequency(events: &[&AccessEvent]) -> f64 {
        let (Some(first), Some(last)) = (
            events.iter().map(|e| e.at).min(),
            events.iter().map(|e| e.at).max(),
        ) else {
            return 0.0;
        };
        let span_hours = ((last - first).num_milliseconds() as f64 / 3_600_000.0).max(1.0);
        events.len() as f64 / span_hours
    }

    /// Hour-of-day and day-of-week buckets
    fn temporal(hits: &[&AccessEvent], now: DateTime<Utc>) -> Option<AccessPattern> {
        if hits.is_empty() {
            return None;
        }

        let mut hours = [0.0f64; 24];
        let mut days = [0.0f64; 7];
        for e in hits {
            hours[e.at.hour() as usize] += 1.0;
            days[e.at.weekday().num_days_from_monday() as usize] += 1.0;
        }

        let max = hours.iter().cloned().fold(0.0, f64::max);
        let peak_hours: Vec<u32> = (0..24u32)
            .filter(|h| hours[*h as usize] > PEAK_RATIO * max)
            .collect();
        let first_peak = peak_hours.first().copied().unwrap_or(0);

        let mut per_key: HashMap<&str, usize> = HashMap::new();
        let mut per_key_peak: HashMap<&str, usize> = HashMap::new();
        for e in hits {
            *per_key.entry(e.key.as_str()).or_default() += 1;
            if peak_hours.contains(&e.at.hour()) {
                *per_key_peak.entry(e.key.as_str()).or_default() += 1;
            }
        }
        let peak_total: usize = per_key_peak.values().sum();
        let observed_days = days.iter().filter(|d| **d > 0.0).count().max(1) as f64;

        let ranked = top_keys(&per_key_peak, KEYS_PER_PATTERN);
        let expected_at = next_hour_at(now, first_peak);
        let predictions = ranked
            .iter()
            .map(|(key, peak_hits)| {
                let total = per_key.get(key.as_str()).copied().unwrap_or(1).max(1);
                Prediction {
                    key: key.clone(),
                    expected_at,
                    probability: *peak_hits as f64 / total as f64,
                    expected_volume: *peak_hits as f64 / observed_days,
                }
            })
            .collect();

        Some(AccessPattern {
            kind: PatternKind::Temporal,
            stats: PatternStats {
                frequency: Self::frequency(hits),
                interval_ms: Self::interval_ms(hits),
                seasonality: variation(&hours),
                trend: slope(&hours),
                volatility: variation(&days),
            },
            keys: ranked.iter().map(|(k, _)| k.clone()).collect(),
            dimensions: peak_hours.iter().map(|h| format!("hour:{:02}", h)).collect(),
            confidence: TEMPORAL_CONFIDENCE,
            strength: peak_total as f64 / hits.len() as f64,
            predictions,
        })
    }

    /// Hits by declared region
    fn spatial(hits: &[&AccessEvent], now: DateTime<Utc>) -> Option<AccessPattern> {
        let located: Vec<&AccessEvent> = hits.iter().copied().filter(|e| e.region.is_some()).collect();
        if located.is_empty() {
            return None;
        }

        let mut by_region: BTreeMap<&str, usize> = BTreeMap::new();
        for e in &located {
            if let Some(region) = &e.region {
                *by_region.entry(region.as_str()).or_default() += 1;
            }
        }
        // Hot regions are measured against every hit, located or not
        let all_hits = hits.len() as f64;
        let total = located.len() as f64;
        let hot: Vec<&str> = by_region
            .iter()
            .filter(|(_, c)| **c as f64 > HOT_REGION_SHARE * all_hits)
            .map(|(r, _)| *r)
            .collect();

        let mut per_key: HashMap<&str, usize> = HashMap::new();
        let mut per_key_hot: HashMap<&str, usize> = HashMap::new();
        for e in &located {
            *per_key.entry(e.key.as_str()).or_default() += 1;
            if e.region.as_deref().map_or(false, |r| hot.contains(&r)) {
                *per_key_hot.entry(e.key.as_str()).or_default() += 1;
            }
        }
        let hot_total: usize = per_key_hot.values().sum();
        let interval = Self::interval_ms(&located);
        let expected_at = now + ChronoDuration::milliseconds(interval as i64);

        let ranked = top_keys(&per_key_hot, KEYS_PER_PATTERN);
        let predictions = ranked
            .iter()
            .map(|(key, hot_hits)| {
                let total = per_key.get(key.as_str()).copied().unwrap_or(1).max(1);
                Prediction {
                    key: key.clone(),
                    expected_at,
                    probability: *hot_hits as f64 / total as f64,
                    expected_volume: *hot_hits as f64,
                }
            })
            .collect();

        let counts: Vec<f64> = by_region.values().map(|c| *c as f64).collect();
        Some(AccessPattern {
            kind: PatternKind::Spatial,
            stats: PatternStats {
                frequency: Self::frequency(&located),
                interval_ms: interval,
                seasonality: 0.0,
                trend: 0.0,
                volatility: variation(&counts),
            },
            keys: ranked.iter().map(|(k, _)| k.clone()).collect(),
            dimensions: hot.iter().map(|r| format!("region:{}", r)).collect(),
            confidence: SPATIAL_CONFIDENCE,
            strength: hot_total as f64 / total,
            predictions,
        })
    }

    /// Top content types by cumulative hits
    fn content_types(hits: &[&AccessEvent], now: DateTime<Utc>) -> Option<AccessPattern> {
        let typed: Vec<&AccessEvent> = hits
            .iter()
            .copied()
            .filter(|e| e.content_type.is_some())
            .collect();
        if typed.is_empty() {
            return None;
        }

        let mut by_type: HashMap<&str, usize> = HashMap::new();
        for e in &typed {
            if let Some(ct) = &e.content_type {
                *by_type.entry(ct.as_str()).or_default() += 1;
            }
        }
        let ranked_types = top_keys(&by_type, TOP_CONTENT_TYPES);
        let total = typed.len() as f64;
        let top_share: f64 = ranked_types.iter().map(|(_, c)| *c as f64).sum::<f64>() / total;

        let mut per_key: HashMap<&str, (usize, &str)> = HashMap::new();
        for e in &typed {
            let ct = e.content_type.as_deref().unwrap_or_default();
            if ranked_types.iter().any(|(t, _)| t == ct) {
                per_key.entry(e.key.as_str()).or_insert((0, ct)).0 += 1;
            }
        }
        let key_counts: HashMap<&str, usize> = per_key.iter().map(|(k, (c, _))| (*k, *c)).collect();
        let ranked_keys = top_keys(&key_counts, KEYS_PER_PATTERN);
        let interval = Self::interval_ms(&typed);
        let expected_at = now + ChronoDuration::milliseconds(interval as i64);

        let predictions = ranked_keys
            .iter()
            .map(|(key, count)| {
                let ct = per_key.get(key.as_str()).map(|(_, ct)| *ct).unwrap_or_default();
                let type_hits = by_type.get(ct).copied().unwrap_or(0) as f64;
                Prediction {
                    key: key.clone(),
                    expected_at,
                    probability: type_hits / total,
                    expected_volume: *count as f64,
                }
            })
            .collect();

        Some(AccessPattern {
            kind: PatternKind::ContentType,
            stats: PatternStats {
                frequency: Self::frequency(&typed),
                interval_ms: interval,
                ..Default::default()
            },
            keys: ranked_keys.iter().map(|(k, _)| k.clone()).collect(),
            dimensions: ranked_types
                .iter()
                .map(|(t, c)| format!("content_type:{}={}", t, c))
                .collect(),
            confidence: CONTENT_TYPE_CONFIDENCE,
            strength: top_share,
            predictions,
        })
    }

    /// Per-actor key transitions of length 2
    fn user_behavior(history: &[AccessEvent], now: DateTime<Utc>) -> Option<AccessPattern> {
        let mut by_actor: BTreeMap<&str, Vec<&AccessEvent>> = BTreeMap::new();
        for e in history {
            if let Some(actor) = &e.actor {
                by_actor.entry(actor.as_str()).or_default().push(e);
            }
        }

        let mut transitions: HashMap<(&str, &str), usize> = HashMap::new();
        let mut outgoing: HashMap<&str, usize> = HashMap::new();
        let mut gaps: Vec<f64> = Vec::new();
        for events in by_actor.values_mut() {
            events.sort_by_key(|e| e.at);
            for pair in events.windows(2) {
                let (a, b) = (pair[0], pair[1]);
                if a.key == b.key {
                    continue;
                }
                *transitions.entry((a.key.as_str(), b.key.as_str())).or_default() += 1;
                *outgoing.entry(a.key.as_str()).or_default() += 1;
                gaps.push((b.at - a.at).num_milliseconds() as f64);
            }
        }
        if transitions.is_empty() {
            return None;
        }

        let mut ranked: Vec<((&str, &str), usize)> = transitions.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let total_transitions: usize = ranked.iter().map(|(_, c)| *c).sum();
        ranked.truncate(TOP_TRANSITIONS);
        let kept: usize = ranked.iter().map(|(_, c)| *c).sum();

        let interval = mean(&gaps);
        let expected_at = now + ChronoDuration::milliseconds(interval as i64);

        // Best probability per predicted key
        let mut best: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
        for ((from, to), count) in &ranked {
            let probability = *count as f64 / outgoing.get(from).copied().unwrap_or(1).max(1) as f64;
            let slot = best.entry(to).or_insert((0.0, 0));
            if probability > slot.0 {
                *slot = (probability, *count);
            }
        }
        let predictions = best
            .iter()
            .map(|(key, (probability, count))| Prediction {
                key: key.to_string(),
                expected_at,
                probability: *probability,
                expected_volume: *count as f64,
            })
            .collect();

        Some(AccessPattern {
            kind: PatternKind::UserBehavior,
            stats: PatternStats {
                frequency: kept as f64,
                interval_ms: interval,
                ..Default::default()
            },
            keys: best.keys().map(|k| k.to_string()).collect(),
            dimensions: ranked
                .iter()
                .map(|((from, to), count)| format!("{}->{}={}", from, to, count))
                .collect(),
            confidence: USER_BEHAVIOR_CONFIDENCE,
            strength: kept as f64 / total_transitions as f64,
            predictions,
        })
    }

    /// Highest prediction per key becomes the entry's predicted access score
    fn feed_predictions(store: &TieredStore, patterns: &[AccessPattern]) -> usize {
        let mut scores: HashMap<&str, f64> = HashMap::new();
        for pattern in patterns {
            for p in &pattern.predictions {
                let score = scores.entry(p.key.as_str()).or_insert(0.0);
                *score = score.max(p.probability);
            }
        }

        store.update_entries(|entries| {
            let mut updated = 0;
            for (_, entry) in entries.iter_mut() {
                match scores.get(entry.key.as_str()) {
                    Some(score) => {
                        entry.stats.predicted_future_access = *score;
                        updated += 1;
                    }
                    None => entry.stats.predicted_future_access *= PREDICTION_DECAY,
                }
            }
            updated
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
