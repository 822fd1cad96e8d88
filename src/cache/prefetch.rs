//! Prefetch Engine
//!
//! Turns pattern predictions into speculative entries. Admission is bounded
//! by a global semaphore sized from `prefetching.max_concurrent`; a full
//! semaphore blocks new admissions instead of queueing them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use super::analyzer::{AccessPattern, PatternAnalyzer, PatternKind};
use super::invalidation::TimeWindow;
use super::store::{SetOptions, TieredStore};
use crate::config::PrefetchConfig;
use crate::error::{Error, Result};
use crate::observability::{events, CacheObserver};

/// What drives a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefetchTrigger {
    Predictive,
    PatternBased,
    UserBehavior,
    ContentSimilarity,
    Temporal,
}

impl PrefetchTrigger {
    /// Pattern kinds whose predictions this trigger consumes
    pub fn accepts(&self, kind: PatternKind) -> bool {
        match self {
            PrefetchTrigger::Predictive => true,
            PrefetchTrigger::PatternBased => matches!(
                kind,
                PatternKind::Temporal | PatternKind::Spatial | PatternKind::ContentType
            ),
            PrefetchTrigger::UserBehavior => kind == PatternKind::UserBehavior,
            PrefetchTrigger::ContentSimilarity => kind == PatternKind::ContentType,
            PrefetchTrigger::Temporal => kind == PatternKind::Temporal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Ignore predictions further out than this (0 = no limit)
    pub look_ahead_ms: u64,
    pub confidence_threshold: f64,
    pub max_prefetch_size: u64,
    pub max_concurrent: u32,
    pub batch_size: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            look_ahead_ms: 60 * 60 * 1000,
            confidence_threshold: 0.7,
            max_prefetch_size: 1024 * 1024,
            max_concurrent: 4,
            batch_size: 20,
        }
    }
}

/// Which predictions a strategy may act on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetFilter {
    /// Content-type patterns must name one of these
    pub content_types: Vec<String>,
    /// Passed through to the source
    pub user_segments: Vec<String>,
    /// Hours in which the strategy runs
    pub time_windows: Vec<TimeWindow>,
    /// Spatial patterns must name one of these
    pub regions: Vec<String>,
}

impl TargetFilter {
    fn admits_time(&self, now: DateTime<Utc>) -> bool {
        self.time_windows.is_empty() || self.time_windows.iter().any(|w| w.contains(now.hour()))
    }

    fn admits_pattern(&self, pattern: &AccessPattern) -> bool {
        let named = |prefix: &str, wanted: &[String]| {
            wanted.is_empty()
                || pattern.dimensions.iter().any(|d| {
                    d.strip_prefix(prefix)
                        .map(|rest| rest.split('=').next().unwrap_or(rest))
                        .map_or(false, |value| wanted.iter().any(|w| w == value))
                })
        };
        match pattern.kind {
            PatternKind::Spatial => named("region:", &self.regions),
            PatternKind::ContentType => named("content_type:", &self.content_types),
            _ => true,
        }
    }
}

/// Heuristic performance, written back by the optimizer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyPerformance {
    pub accuracy: f64,
    pub hit_rate: f64,
    pub efficiency: f64,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefetchStrategy {
    pub name: String,
    pub trigger: PrefetchTrigger,
    /// Scoring algorithm identifier
    pub algorithm: String,
    #[serde(default)]
    pub config: StrategyConfig,
    #[serde(default)]
    pub filter: TargetFilter,
    #[serde(default)]
    pub performance: StrategyPerformance,
    pub active: bool,
}

impl PrefetchStrategy {
    pub fn new(name: impl Into<String>, trigger: PrefetchTrigger) -> Self {
        Self {
            name: name.into(),
            trigger,
            algorithm: "probability".to_string(),
            config: StrategyConfig::default(),
            filter: TargetFilter::default(),
            performance: StrategyPerformance::default(),
            active: true,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.config.confidence_threshold = threshold;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    pub fn with_filter(mut self, filter: TargetFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Strategies registered by a fresh service
    pub fn defaults(config: &PrefetchConfig) -> Vec<Self> {
        let base = StrategyConfig {
            confidence_threshold: config.confidence_threshold as f64,
            max_prefetch_size: config.max_prefetch_size_bytes,
            max_concurrent: config.max_concurrent,
            batch_size: config.batch_size as usize,
            ..Default::default()
        };
        vec![
            Self {
                config: base.clone(),
                ..Self::new("temporal-peaks", PrefetchTrigger::Temporal)
            },
            Self {
                config: base,
                algorithm: "transition".to_string(),
                ..Self::new("next-key", PrefetchTrigger::UserBehavior)
            },
        ]
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfiguration("strategy name must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&self.config.confidence_threshold) {
            return Err(Error::InvalidConfiguration(format!(
                "strategy {} confidence_threshold must be in [0, 1]",
                self.name
            )));
        }
        if self.config.batch_size == 0 || self.config.max_concurrent == 0 {
            return Err(Error::InvalidConfiguration(format!(
                "strategy {} batch_size and max_concurrent must be > 0",
                self.name
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Source
// =============================================================================

/// One admitted candidate handed to the source
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchRequest {
    pub key: String,
    pub strategy: String,
    pub probability: f64,
    pub expected_volume: f64,
    pub user_segments: Vec<String>,
}

/// External producer of prefetched bytes
#[async_trait]
pub trait PrefetchSource: Send + Sync {
    /// `None` means the source has nothing for this key
    async fn fetch(&self, request: &PrefetchRequest) -> Result<Option<Bytes>>;
}

/// Simulates upstream latency and yields an empty placeholder
#[derive(Debug, Clone)]
pub struct PlaceholderSource {
    latency: Duration,
}

impl PlaceholderSource {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

impl Default for PlaceholderSource {
    fn default() -> Self {
        Self::new(Duration::from_millis(10))
    }
}

#[async_trait]
impl PrefetchSource for PlaceholderSource {
    async fn fetch(&self, _request: &PrefetchRequest) -> Result<Option<Bytes>> {
        tokio::time::sleep(self.latency).await;
        Ok(Some(Bytes::new()))
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Global knobs from `prefetching.*`
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchSettings {
    pub confidence_threshold: f64,
    pub max_concurrent: u32,
    pub default_ttl: Duration,
}

impl From<&PrefetchConfig> for PrefetchSettings {
    fn from(config: &PrefetchConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold as f64,
            max_concurrent: config.max_concurrent.max(1),
            default_ttl: Duration::from_millis(config.default_ttl_ms),
        }
    }
}

/// How a single prefetch task ended
enum Fetched {
    Stored(u64),
    /// The key was written while the fetch was in flight
    Present,
    Failed(String),
}

/// Lifetime counters for one strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StrategyStats {
    pub scheduled: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    /// First reads of entries this strategy produced
    pub hits: u64,
    pub bytes: u64,
}

impl StrategyStats {
    /// Share of completed prefetches that were later read
    pub fn accuracy(&self) -> f64 {
        if self.completed == 0 {
            0.0
        } else {
            self.hits as f64 / self.completed as f64
        }
    }

    /// Share of admissions that paid off
    pub fn efficiency(&self) -> f64 {
        if self.scheduled == 0 {
            0.0
        } else {
            self.hits as f64 / self.scheduled as f64
        }
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    key: String,
    probability: f64,
    expected_volume: f64,
}

pub struct PrefetchEngine {
    store: Arc<TieredStore>,
    analyzer: Arc<PatternAnalyzer>,
    source: Arc<dyn PrefetchSource>,
    strategies: RwLock<BTreeMap<String, PrefetchStrategy>>,
    stats: Arc<DashMap<String, StrategyStats>>,
    semaphore: RwLock<Arc<Semaphore>>,
    settings: RwLock<PrefetchSettings>,
    observer: Arc<dyn CacheObserver>,
}

impl std::fmt::Debug for PrefetchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchEngine")
            .field("strategies", &self.strategies.read().len())
            .field("settings", &*self.settings.read())
            .finish()
    }
}

impl PrefetchEngine {
    pub fn new(
        store: Arc<TieredStore>,
        analyzer: Arc<PatternAnalyzer>,
        source: Arc<dyn PrefetchSource>,
        settings: PrefetchSettings,
        observer: Arc<dyn CacheObserver>,
    ) -> Self {
        Self {
            store,
            analyzer,
            source,
            strategies: RwLock::new(BTreeMap::new()),
            stats: Arc::new(DashMap::new()),
            semaphore: RwLock::new(Arc::new(Semaphore::new(settings.max_concurrent as usize))),
            settings: RwLock::new(settings),
            observer,
        }
    }

    pub fn settings(&self) -> PrefetchSettings {
        self.settings.read().clone()
    }

    /// Swap in new settings. A new concurrency bound applies to admissions
    /// made after the call; in-flight prefetches keep their permits.
    pub fn update_settings(&self, settings: PrefetchSettings) {
        let resized = self.settings.read().max_concurrent != settings.max_concurrent;
        if resized {
            *self.semaphore.write() = Arc::new(Semaphore::new(settings.max_concurrent as usize));
        }
        *self.settings.write() = settings;
    }

    /// Free admission slots
    pub fn available_permits(&self) -> usize {
        self.semaphore.read().available_permits()
    }

    pub fn add_strategy(&self, strategy: PrefetchStrategy) -> Result<()> {
        strategy.validate()?;
        self.stats.entry(strategy.name.clone()).or_default();
        self.strategies.write().insert(strategy.name.clone(), strategy);
        Ok(())
    }

    pub fn remove_strategy(&self, name: &str) -> Option<PrefetchStrategy> {
        self.stats.remove(name);
        self.strategies.write().remove(name)
    }

    pub fn strategies(&self) -> Vec<PrefetchStrategy> {
        self.strategies.read().values().cloned().collect()
    }

    pub fn strategy(&self, name: &str) -> Option<PrefetchStrategy> {
        self.strategies.read().get(name).cloned()
    }

    /// Mutate a registered strategy in place
    pub fn tune<R>(&self, name: &str, f: impl FnOnce(&mut PrefetchStrategy) -> R) -> Option<R> {
        self.strategies.write().get_mut(name).map(f)
    }

    pub fn stats(&self, name: &str) -> StrategyStats {
        self.stats.get(name).map(|s| *s).unwrap_or_default()
    }

    /// Credit a strategy with the first read of an entry it produced
    pub fn credit(&self, strategy: &str) {
        if let Some(mut stats) = self.stats.get_mut(strategy) {
            stats.hits += 1;
        }
    }

    /// Run every active strategy once
    pub async fn run_cycle(&self) -> usize {
        let mut scheduled = 0;
        for strategy in self.strategies().into_iter().filter(|s| s.active) {
            scheduled += self.run(&strategy).await;
        }
        scheduled
    }

    /// Admit and execute predictions for one strategy. Returns the number of
    /// candidates scheduled; they have all finished when this returns.
    #[instrument(skip(self, strategy), fields(strategy = %strategy.name))]
    pub async fn run(&self, strategy: &PrefetchStrategy) -> usize {
        if !strategy.active {
            return 0;
        }
        let now = Utc::now();
        let Some(layer) = self.store.registry().fastest_active() else {
            debug!("No active layer to prefetch into");
            return 0;
        };

        let settings = self.settings();
        let candidates = self.candidates(strategy, &settings, now);
        if candidates.is_empty() {
            return 0;
        }

        let global = self.semaphore.read().clone();
        let local = Arc::new(Semaphore::new(strategy.config.max_concurrent.max(1) as usize));
        let mut tasks = JoinSet::new();
        let scheduled = candidates.len();
        self.stats.entry(strategy.name.clone()).or_default().scheduled += scheduled as u64;

        for candidate in candidates {
            let (Ok(local_permit), Ok(global_permit)) = (
                local.clone().acquire_owned().await,
                global.clone().acquire_owned().await,
            ) else {
                warn!("Prefetch semaphore closed");
                break;
            };

            let request = PrefetchRequest {
                key: candidate.key,
                strategy: strategy.name.clone(),
                probability: candidate.probability,
                expected_volume: candidate.expected_volume,
                user_segments: strategy.filter.user_segments.clone(),
            };
            let source = self.source.clone();
            let store = self.store.clone();
            let stats = self.stats.clone();
            let observer = self.observer.clone();
            let layer_id = layer.id().clone();
            let max_size = strategy.config.max_prefetch_size;
            let ttl = settings.default_ttl;

            tasks.spawn(async move {
                let _permits = (local_permit, global_permit);
                let outcome = match source.fetch(&request).await {
                    Ok(Some(data)) if data.len() as u64 > max_size => Fetched::Failed("oversize".to_string()),
                    Ok(Some(data)) => {
                        let size = data.len() as u64;
                        // A foreground write that landed during the fetch wins
                        let mut options = SetOptions::new()
                            .ttl(ttl)
                            .layers([layer_id])
                            .compress(false)
                            .if_absent();
                        options.prefetched_by = Some(request.strategy.clone());
                        match store.set(&request.key, data, options) {
                            Ok(o) if o.stored() => Fetched::Stored(size),
                            Ok(o) if o.existing => Fetched::Present,
                            Ok(_) => Fetched::Failed("not_stored".to_string()),
                            Err(e) => Fetched::Failed(e.to_string()),
                        }
                    }
                    Ok(None) => Fetched::Failed("no_content".to_string()),
                    Err(e) => Fetched::Failed(e.to_string()),
                };

                let mut entry = stats.entry(request.strategy.clone()).or_default();
                match outcome {
                    Fetched::Stored(size) => {
                        entry.completed += 1;
                        entry.bytes += size;
                        drop(entry);
                        observer.emit(
                            events::PREFETCH_COMPLETED,
                            &[
                                ("key", request.key.as_str().into()),
                                ("strategy", request.strategy.as_str().into()),
                                ("probability", request.probability.into()),
                            ],
                        );
                    }
                    Fetched::Present => {
                        entry.skipped += 1;
                        drop(entry);
                        debug!(key = %request.key, strategy = %request.strategy, "Key written during fetch; prefetch dropped");
                    }
                    Fetched::Failed(reason) => {
                        entry.failed += 1;
                        drop(entry);
                        observer.emit(
                            events::PREFETCH_FAILED,
                            &[
                                ("key", request.key.as_str().into()),
                                ("strategy", request.strategy.as_str().into()),
                                ("reason", reason.into()),
                            ],
                        );
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Prefetch task aborted");
            }
        }

        debug!(scheduled, "Prefetch run finished");
        scheduled
    }

    /// Admissible predictions, best first
    fn candidates(
        &self,
        strategy: &PrefetchStrategy,
        settings: &PrefetchSettings,
        now: DateTime<Utc>,
    ) -> Vec<Candidate> {
        if !strategy.filter.admits_time(now) {
            return Vec::new();
        }
        let threshold = strategy.config.confidence_threshold.max(settings.confidence_threshold);
        let horizon = (strategy.config.look_ahead_ms > 0)
            .then(|| now + ChronoDuration::milliseconds(strategy.config.look_ahead_ms as i64));

        let mut best: HashMap<String, Candidate> = HashMap::new();
        let mut below_threshold = 0u64;
        for pattern in self.analyzer.patterns() {
            if !strategy.trigger.accepts(pattern.kind) || !strategy.filter.admits_pattern(&pattern) {
                continue;
            }
            for prediction in pattern.predictions {
                if prediction.probability < threshold {
                    below_threshold += 1;
                    continue;
                }
                if horizon.map_or(false, |h| prediction.expected_at > h) {
                    continue;
                }
                let slot = best.entry(prediction.key.clone()).or_insert(Candidate {
                    key: prediction.key,
                    probability: 0.0,
                    expected_volume: 0.0,
                });
                if prediction.probability > slot.probability {
                    slot.probability = prediction.probability;
                    slot.expected_volume = prediction.expected_volume;
                }
            }
        }

        let mut ranked: Vec<Candidate> = best
            .into_values()
            .filter(|c| !self.store.contains(&c.key))
            .collect();
        ranked.sort_by(|a, b| {
            b.probability
                .total_cmp(&a.probability)
                .then_with(|| a.key.cmp(&b.key))
        });
        ranked.truncate(strategy.config.batch_size);

        if below_threshold > 0 {
            self.stats.entry(strategy.name.clone()).or_default().skipped += below_threshold;
        }
        ranked
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::analyzer::AccessEvent;
    use crate::cache::compression::CompressionManager;
    use crate::cache::eviction::EvictionEngine;
    use crate::cache::layer::{LayerId, LayerRegistry, StorageKind};
    use crate::cache::store::StoreSettings;
    use crate::config::{CacheConfiguration, LayerConfig};
    use crate::observability::RecordingObserver;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts peak concurrency and returns a fixed payload
    struct CountingSource {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        payload: Bytes,
    }

    impl CountingSource {
        fn new(payload: &'static [u8]) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                payload: Bytes::from_static(payload),
            }
        }
    }

    #[async_trait]
    impl PrefetchSource for CountingSource {
        async fn fetch(&self, _request: &PrefetchRequest) -> Result<Option<Bytes>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Some(self.payload.clone()))
        }
    }

    /// Writes the real value mid-fetch, then answers with an empty payload
    struct RacingSource {
        store: Arc<TieredStore>,
    }

    #[async_trait]
    impl PrefetchSource for RacingSource {
        async fn fetch(&self, request: &PrefetchRequest) -> Result<Option<Bytes>> {
            self.store
                .set(&request.key, Bytes::from_static(b"REAL"), SetOptions::new())?;
            Ok(Some(Bytes::new()))
        }
    }

    struct Fixture {
        store: Arc<TieredStore>,
        analyzer: Arc<PatternAnalyzer>,
        observer: Arc<RecordingObserver>,
    }

    fn fixture() -> Fixture {
        let config = CacheConfiguration::with_layers(vec![
            LayerConfig::new("fast", 0, StorageKind::Memory, 100_000),
            LayerConfig::new("slow", 1, StorageKind::Disk, 100_000),
        ]);
        let observer = Arc::new(RecordingObserver::new());
        let store = Arc::new(TieredStore::new(
            Arc::new(LayerRegistry::from_config(&config)),
            EvictionEngine::default(),
            CompressionManager::new(),
            StoreSettings::default(),
            observer.clone(),
        ));
        let analyzer = Arc::new(PatternAnalyzer::new(1000, observer.clone()));
        Fixture {
            store,
            analyzer,
            observer,
        }
    }

    fn engine(f: &Fixture, source: Arc<dyn PrefetchSource>, max_concurrent: u32) -> PrefetchEngine {
        PrefetchEngine::new(
            f.store.clone(),
            f.analyzer.clone(),
            source,
            PrefetchSettings {
                confidence_threshold: 0.0,
                max_concurrent,
                default_ttl: Duration::from_secs(60),
            },
            f.observer.clone(),
        )
    }

    /// One actor per target going from "home" to it; probability = share of visits
    fn record_transitions(f: &Fixture, targets: &[&str]) {
        let base = Utc::now();
        for (i, target) in targets.iter().enumerate() {
            let actor = format!("u{}", i);
            f.analyzer
                .record(AccessEvent::new("home", base, true).by(actor.as_str()));
            f.analyzer.record(
                AccessEvent::new(*target, base + ChronoDuration::seconds(1), true).by(actor.as_str()),
            );
        }
        f.analyzer.analyze(&f.store);
    }

    #[test]
    fn test_trigger_compatibility() {
        assert!(PrefetchTrigger::Predictive.accepts(PatternKind::Spatial));
        assert!(PrefetchTrigger::UserBehavior.accepts(PatternKind::UserBehavior));
        assert!(!PrefetchTrigger::UserBehavior.accepts(PatternKind::Temporal));
        assert!(!PrefetchTrigger::PatternBased.accepts(PatternKind::UserBehavior));
        assert!(PrefetchTrigger::ContentSimilarity.accepts(PatternKind::ContentType));
    }

    #[tokio::test]
    async fn test_below_threshold_is_never_admitted() {
        let f = fixture();
        // feed: 0.75, news: 0.25
        record_transitions(&f, &["feed", "feed", "feed", "news"]);
        let engine = engine(&f, Arc::new(CountingSource::new(b"x")), 4);
        let strategy = PrefetchStrategy::new("s", PrefetchTrigger::UserBehavior).with_threshold(0.7);

        assert_eq!(engine.run(&strategy).await, 1);
        assert!(f.store.contains("feed"));
        assert!(!f.store.contains("news"));
        assert!(engine.stats("s").skipped >= 1);
    }

    #[tokio::test]
    async fn test_foreground_write_during_fetch_is_kept() {
        let f = fixture();
        record_transitions(&f, &["feed"]);
        let source = Arc::new(RacingSource {
            store: f.store.clone(),
        });
        let engine = engine(&f, source, 4);
        let strategy = PrefetchStrategy::new("s", PrefetchTrigger::UserBehavior).with_threshold(0.0);

        assert_eq!(engine.run(&strategy).await, 1);
        let entry = f.store.entry("feed").unwrap();
        assert!(!entry.flags.prefetched);
        assert!(entry.is_on(&LayerId::from("slow")));
        let hit = f.store.get("feed", None).unwrap().unwrap();
        assert_eq!(hit.value.as_ref(), b"REAL");

        let stats = engine.stats("s");
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.failed, 0);
        assert_eq!(f.observer.count(events::PREFETCH_COMPLETED), 0);
    }

    #[tokio::test]
    async fn test_global_threshold_overrides_lower_strategy_threshold() {
        let f = fixture();
        record_transitions(&f, &["feed", "feed", "feed", "news"]);
        let engine = engine(&f, Arc::new(CountingSource::new(b"x")), 4);
        engine.update_settings(PrefetchSettings {
            confidence_threshold: 0.9,
            ..engine.settings()
        });
        let strategy = PrefetchStrategy::new("s", PrefetchTrigger::UserBehavior).with_threshold(0.1);
        assert_eq!(engine.run(&strategy).await, 0);
    }

    #[tokio::test]
    async fn test_prefetched_entry_is_flagged_on_fastest_layer() {
        let f = fixture();
        record_transitions(&f, &["feed"]);
        let engine = engine(&f, Arc::new(CountingSource::new(b"payload")), 4);
        engine
            .add_strategy(PrefetchStrategy::new("s", PrefetchTrigger::UserBehavior))
            .unwrap();

        assert_eq!(engine.run_cycle().await, 1);
        let entry = f.store.entry("feed").unwrap();
        assert!(entry.flags.prefetched);
        assert_eq!(entry.flags.prefetch_strategy.as_deref(), Some("s"));
        assert_eq!(
            entry.placement.layers.iter().collect::<Vec<_>>(),
            vec![&LayerId::from("fast")]
        );
        assert!(entry.timing.expires_at.is_some());
        assert_eq!(engine.stats("s").completed, 1);
        assert_eq!(f.observer.count(events::PREFETCH_COMPLETED), 1);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let f = fixture();
        let targets: Vec<String> = (0..8).map(|i| format!("k{}", i)).collect();
        let refs: Vec<&str> = targets.iter().map(String::as_str).collect();
        record_transitions(&f, &refs);

        let source = Arc::new(CountingSource::new(b"x"));
        let engine = engine(&f, source.clone(), 2);
        let strategy = PrefetchStrategy::new("s", PrefetchTrigger::UserBehavior).with_threshold(0.0);
        assert_eq!(engine.run(&strategy).await, 8);
        assert!(source.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(engine.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_oversize_payload_fails() {
        let f = fixture();
        record_transitions(&f, &["feed"]);
        let engine = engine(&f, Arc::new(CountingSource::new(b"too large")), 4);
        let mut strategy = PrefetchStrategy::new("s", PrefetchTrigger::UserBehavior);
        strategy.config.max_prefetch_size = 2;

        assert_eq!(engine.run(&strategy).await, 1);
        assert!(!f.store.contains("feed"));
        assert_eq!(f.observer.count(events::PREFETCH_FAILED), 1);
    }

    #[tokio::test]
    async fn test_cached_keys_and_batch_size() {
        let f = fixture();
        record_transitions(&f, &["a", "b", "c"]);
        f.store
            .set("a", Bytes::from_static(b"x"), SetOptions::new())
            .unwrap();
        let engine = engine(&f, Arc::new(PlaceholderSource::new(Duration::from_millis(1))), 4);
        let strategy = PrefetchStrategy::new("s", PrefetchTrigger::UserBehavior)
            .with_threshold(0.0)
            .with_batch_size(1);
        assert_eq!(engine.run(&strategy).await, 1);
        // "a" was cached, so one of the others was admitted
        assert!(f.store.contains("b") ^ f.store.contains("c"));
    }

    #[test]
    fn test_strategy_validation() {
        let f = fixture();
        let engine = engine(&f, Arc::new(PlaceholderSource::default()), 1);
        assert!(engine
            .add_strategy(PrefetchStrategy::new("", PrefetchTrigger::Temporal))
            .is_err());
        assert!(engine
            .add_strategy(PrefetchStrategy::new("x", PrefetchTrigger::Temporal).with_threshold(2.0))
            .is_err());
        assert!(engine
            .add_strategy(PrefetchStrategy::new("x", PrefetchTrigger::Temporal))
            .is_ok());
        engine.credit("x");
        assert_eq!(engine.stats("x").hits, 1);
    }
}
