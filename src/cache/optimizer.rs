//! Optimizer
//!
//! Periodic heuristic tuning: grows layers with poor hit rates, tightens
//! prefetch strategies that waste work, promotes hot entries into the
//! fastest layer and evicts proactively from layers above their
//! utilization threshold.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::layer::LayerId;
use super::prefetch::PrefetchEngine;
use super::store::TieredStore;
use crate::config::CacheConfiguration;
use crate::observability::{events, CacheObserver};
use crate::persistence::{HistoryKind, HistoryLog};

/// Confidence added to an inaccurate strategy per cycle
const THRESHOLD_STEP: f64 = 0.05;
const THRESHOLD_CEILING: f64 = 0.95;
/// Payload cap multiplier for an inefficient strategy
const PAYLOAD_SHRINK: f64 = 0.8;

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerSettings {
    pub hit_rate_threshold: f64,
    pub capacity_growth: f64,
    pub max_capacity_factor: f64,
    pub rebalance_top_n: usize,
    pub min_accuracy: f64,
    pub min_efficiency: f64,
    pub memory_pct: f64,
    pub disk_pct: f64,
}

impl From<&CacheConfiguration> for OptimizerSettings {
    fn from(config: &CacheConfiguration) -> Self {
        Self {
            hit_rate_threshold: config.optimization.hit_rate_threshold,
            capacity_growth: config.optimization.capacity_growth,
            max_capacity_factor: config.optimization.max_capacity_factor,
            rebalance_top_n: config.optimization.rebalance_top_n,
            min_accuracy: config.optimization.min_accuracy,
            min_efficiency: config.optimization.min_efficiency,
            memory_pct: config.eviction.thresholds.memory_pct,
            disk_pct: config.eviction.thresholds.disk_pct,
        }
    }
}

/// One change made by a cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OptimizationAction {
    CapacityGrown { layer: LayerId, from: u64, to: u64 },
    ThresholdRaised { strategy: String, from: f64, to: f64 },
    PrefetchSizeReduced { strategy: String, from: u64, to: u64 },
    Rebalanced { layer: LayerId, keys: Vec<String> },
    ProactiveEviction { layer: LayerId, evicted: usize },
}

impl OptimizationAction {
    fn subject(&self) -> String {
        match self {
            OptimizationAction::CapacityGrown { layer, .. }
            | OptimizationAction::Rebalanced { layer, .. }
            | OptimizationAction::ProactiveEviction { layer, .. } => layer.to_string(),
            OptimizationAction::ThresholdRaised { strategy, .. }
            | OptimizationAction::PrefetchSizeReduced { strategy, .. } => strategy.clone(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            OptimizationAction::CapacityGrown { .. } => "capacity_grown",
            OptimizationAction::ThresholdRaised { .. } => "threshold_raised",
            OptimizationAction::PrefetchSizeReduced { .. } => "prefetch_size_reduced",
            OptimizationAction::Rebalanced { .. } => "rebalanced",
            OptimizationAction::ProactiveEviction { .. } => "proactive_eviction",
        }
    }

    fn affected(&self) -> u64 {
        match self {
            OptimizationAction::Rebalanced { keys, .. } => keys.len() as u64,
            OptimizationAction::ProactiveEviction { evicted, .. } => *evicted as u64,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizationReport {
    pub actions: Vec<OptimizationAction>,
}

impl OptimizationReport {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

pub struct Optimizer {
    store: Arc<TieredStore>,
    prefetch: Arc<PrefetchEngine>,
    history: Arc<HistoryLog>,
    observer: Arc<dyn CacheObserver>,
    settings: RwLock<OptimizerSettings>,
    /// Configured capacity per layer, the base for growth limits
    baselines: RwLock<HashMap<LayerId, u64>>,
}

impl std::fmt::Debug for Optimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Optimizer")
            .field("settings", &*self.settings.read())
            .finish()
    }
}

impl Optimizer {
    pub fn new(
        store: Arc<TieredStore>,
        prefetch: Arc<PrefetchEngine>,
        history: Arc<HistoryLog>,
        config: &CacheConfiguration,
        observer: Arc<dyn CacheObserver>,
    ) -> Self {
        let optimizer = Self {
            store,
            prefetch,
            history,
            observer,
            settings: RwLock::new(OptimizerSettings::from(config)),
            baselines: RwLock::new(HashMap::new()),
        };
        optimizer.reconfigure(config);
        optimizer
    }

    pub fn settings(&self) -> OptimizerSettings {
        self.settings.read().clone()
    }

    /// Pick up a new configuration, resetting growth baselines
    pub fn reconfigure(&self, config: &CacheConfiguration) {
        *self.settings.write() = OptimizerSettings::from(config);
        *self.baselines.write() = config
            .layers
            .iter()
            .map(|l| (LayerId::new(l.id.clone()), l.max_size_bytes))
            .collect();
    }

    /// Run one optimization cycle
    pub fn optimize(&self) -> OptimizationReport {
        let settings = self.settings();
        let mut report = OptimizationReport::default();

        self.grow_capacity(&settings, &mut report);
        self.tune_strategies(&settings, &mut report);
        self.rebalance(&settings, &mut report);
        self.evict_proactively(&settings, &mut report);

        for action in &report.actions {
            self.history
                .record(HistoryKind::Optimization, &action.subject(), action.name(), action.affected());
            self.observer.emit(
                events::OPTIMIZATION_APPLIED,
                &[
                    ("action", action.name().into()),
                    ("subject", action.subject().into()),
                    ("affected", action.affected().into()),
                ],
            );
        }
        if !report.is_empty() {
            info!(actions = report.actions.len(), "Applied optimizations");
        }
        report
    }

    fn grow_capacity(&self, settings: &OptimizerSettings, report: &mut OptimizationReport) {
        let baselines = self.baselines.read();
        for layer in self.store.registry().active() {
            if layer.counters().snapshot().requests() == 0 {
                continue;
            }
            if layer.performance().hit_rate >= settings.hit_rate_threshold {
                continue;
            }
            let current = layer.capacity().max_size_bytes;
            let base = baselines.get(layer.id()).copied().unwrap_or(current);
            let ceiling = (base as f64 * settings.max_capacity_factor) as u64;
            let grown = ((current as f64 * (1.0 + settings.capacity_growth)) as u64).min(ceiling);
            if grown > current {
                layer.set_max_size(grown);
                report.actions.push(OptimizationAction::CapacityGrown {
                    layer: layer.id().clone(),
                    from: current,
                    to: grown,
                });
            }
        }
    }

    fn tune_strategies(&self, settings: &OptimizerSettings, report: &mut OptimizationReport) {
        for strategy in self.prefetch.strategies() {
            let stats = self.prefetch.stats(&strategy.name);
            if stats.completed == 0 {
                continue;
            }
            let accuracy = stats.accuracy();
            let efficiency = stats.efficiency();
            let cost = if stats.scheduled == 0 {
                0.0
            } else {
                stats.failed as f64 / stats.scheduled as f64
            };

            let actions = self.prefetch.tune(&strategy.name, |s| {
                let mut actions = Vec::new();
                s.performance.accuracy = accuracy;
                s.performance.hit_rate = accuracy;
                s.performance.efficiency = efficiency;
                s.performance.cost = cost;

                if accuracy < settings.min_accuracy && s.config.confidence_threshold < THRESHOLD_CEILING {
                    let from = s.config.confidence_threshold;
                    s.config.confidence_threshold = (from + THRESHOLD_STEP).min(THRESHOLD_CEILING);
                    actions.push(OptimizationAction::ThresholdRaised {
                        strategy: s.name.clone(),
                        from,
                        to: s.config.confidence_threshold,
                    });
                }
                if efficiency < settings.min_efficiency && s.config.max_prefetch_size > 1 {
                    let from = s.config.max_prefetch_size;
                    s.config.max_prefetch_size = ((from as f64 * PAYLOAD_SHRINK) as u64).max(1);
                    actions.push(OptimizationAction::PrefetchSizeReduced {
                        strategy: s.name.clone(),
                        from,
                        to: s.config.max_prefetch_size,
                    });
                }
                actions
            });
            report.actions.extend(actions.unwrap_or_default());
        }
    }

    fn rebalance(&self, settings: &OptimizerSettings, report: &mut OptimizationReport) {
        if settings.rebalance_top_n == 0 {
            return;
        }
        let Some(fastest) = self.store.registry().fastest_active() else {
            return;
        };
        let now = Utc::now();
        let candidates: Vec<String> = self.store.inspect(|entries| {
            let mut ranked: Vec<(f64, &str)> = entries
                .iter()
                .filter(|(_, e)| e.stats.hit_count > 0 && !e.is_on(fastest.id()) && !e.is_expired(now))
                .map(|(_, e)| (e.stats.frequency, e.key.as_str()))
                .collect();
            ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));
            ranked
                .into_iter()
                .take(settings.rebalance_top_n)
                .map(|(_, k)| k.to_string())
                .collect()
        });

        let mut promoted = Vec::new();
        for key in candidates {
            match self.store.promote(&key, fastest.id()) {
                Ok(true) => promoted.push(key),
                Ok(false) => {}
                Err(e) => warn!(key = %key, error = %e, "Rebalance promotion failed"),
            }
        }
        if !promoted.is_empty() {
            report.actions.push(OptimizationAction::Rebalanced {
                layer: fastest.id().clone(),
                keys: promoted,
            });
        }
    }

    fn evict_proactively(&self, settings: &OptimizerSettings, report: &mut OptimizationReport) {
        for layer in self.store.registry().active() {
            let pct = if layer.kind().is_disk_backed() {
                settings.disk_pct
            } else {
                settings.memory_pct
            };
            if layer.utilization() * 100.0 <= pct {
                continue;
            }
            let target = (layer.capacity().max_size_bytes as f64 * pct / 100.0) as u64;
            match self.store.evict_until(layer.id(), target) {
                Ok(evicted) if !evicted.is_empty() => {
                    report.actions.push(OptimizationAction::ProactiveEviction {
                        layer: layer.id().clone(),
                        evicted: evicted.len(),
                    });
                }
                Ok(_) => {}
                Err(e) => warn!(layer = %layer.id(), error = %e, "Proactive eviction failed"),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::analyzer::{AccessEvent, PatternAnalyzer};
    use crate::cache::compression::CompressionManager;
    use crate::cache::eviction::EvictionEngine;
    use crate::cache::layer::{LayerPerformance, LayerRegistry, StorageKind};
    use crate::cache::prefetch::{PlaceholderSource, PrefetchSettings, PrefetchStrategy, PrefetchTrigger};
    use crate::cache::store::{SetOptions, StoreSettings};
    use crate::config::LayerConfig;
    use crate::observability::RecordingObserver;
    use bytes::Bytes;
    use std::time::Duration;

    struct Fixture {
        store: Arc<TieredStore>,
        analyzer: Arc<PatternAnalyzer>,
        prefetch: Arc<PrefetchEngine>,
        history: Arc<HistoryLog>,
        optimizer: Optimizer,
    }

    fn fixture(layers: Vec<LayerConfig>) -> Fixture {
        let config = CacheConfiguration::with_layers(layers);
        let observer: Arc<RecordingObserver> = Arc::new(RecordingObserver::new());
        let store = Arc::new(TieredStore::new(
            Arc::new(LayerRegistry::from_config(&config)),
            EvictionEngine::default(),
            CompressionManager::new(),
            StoreSettings::default(),
            observer.clone(),
        ));
        let analyzer = Arc::new(PatternAnalyzer::new(100, observer.clone()));
        let prefetch = Arc::new(PrefetchEngine::new(
            store.clone(),
            analyzer.clone(),
            Arc::new(PlaceholderSource::new(Duration::from_millis(1))),
            PrefetchSettings::from(&config.prefetching),
            observer.clone(),
        ));
        let history = Arc::new(HistoryLog::new(100));
        let optimizer = Optimizer::new(store.clone(), prefetch.clone(), history.clone(), &config, observer);
        Fixture {
            store,
            analyzer,
            prefetch,
            history,
            optimizer,
        }
    }

    fn two_layers() -> Vec<LayerConfig> {
        vec![
            LayerConfig::new("fast", 0, StorageKind::Memory, 1000),
            LayerConfig::new("slow", 1, StorageKind::Disk, 10_000),
        ]
    }

    #[test]
    fn test_low_hit_rate_grows_capacity_up_to_ceiling() {
        let f = fixture(vec![LayerConfig::new("fast", 0, StorageKind::Memory, 1000)]);
        let layer = f.store.registry().get(&LayerId::from("fast")).unwrap();
        layer.counters().record_miss();
        layer.set_performance(LayerPerformance {
            hit_rate: 0.1,
            ..Default::default()
        });

        let report = f.optimizer.optimize();
        assert!(report.actions.contains(&OptimizationAction::CapacityGrown {
            layer: LayerId::from("fast"),
            from: 1000,
            to: 1100,
        }));

        for _ in 0..50 {
            f.optimizer.optimize();
        }
        assert_eq!(layer.capacity().max_size_bytes, 4000);
        assert!(!f.history.of_kind(HistoryKind::Optimization).is_empty());
    }

    #[test]
    fn test_idle_layer_is_not_grown() {
        let f = fixture(two_layers());
        let report = f.optimizer.optimize();
        assert!(report
            .actions
            .iter()
            .all(|a| !matches!(a, OptimizationAction::CapacityGrown { .. })));
    }

    #[tokio::test]
    async fn test_inaccurate_strategy_is_tightened() {
        let f = fixture(two_layers());
        let base = Utc::now();
        f.analyzer.record(AccessEvent::new("home", base, true).by("u"));
        f.analyzer
            .record(AccessEvent::new("feed", base + chrono::Duration::seconds(1), true).by("u"));
        f.analyzer.analyze(&f.store);

        let strategy = PrefetchStrategy::new("s", PrefetchTrigger::UserBehavior);
        f.prefetch.add_strategy(strategy.clone()).unwrap();
        assert_eq!(f.prefetch.run(&strategy).await, 1);

        // Prefetched but never read: accuracy and efficiency are zero
        let report = f.optimizer.optimize();
        assert!(report.actions.iter().any(|a| matches!(
            a,
            OptimizationAction::ThresholdRaised { strategy, .. } if strategy == "s"
        )));
        let tuned = f.prefetch.strategy("s").unwrap();
        assert!((tuned.config.confidence_threshold - 0.75).abs() < 1e-9);
        assert_eq!(tuned.config.max_prefetch_size, (1024.0 * 1024.0 * 0.8) as u64);
        assert_eq!(tuned.performance.accuracy, 0.0);
    }

    #[test]
    fn test_rebalance_promotes_hot_entries() {
        let f = fixture(two_layers());
        for key in ["hot", "cold"] {
            f.store
                .set(key, Bytes::from_static(b"x"), SetOptions::new().layers(["slow"]))
                .unwrap();
        }
        f.store.get("hot", None).unwrap();

        let report = f.optimizer.optimize();
        assert!(report.actions.contains(&OptimizationAction::Rebalanced {
            layer: LayerId::from("fast"),
            keys: vec!["hot".to_string()],
        }));
        assert!(f.store.entry("hot").unwrap().is_on(&LayerId::from("fast")));
        assert!(!f.store.entry("cold").unwrap().is_on(&LayerId::from("fast")));
    }

    #[test]
    fn test_proactive_eviction_above_memory_threshold() {
        let f = fixture(vec![LayerConfig::new("fast", 0, StorageKind::Memory, 1000)]);
        for i in 0..10 {
            f.store
                .set(&format!("k{}", i), Bytes::from(vec![0u8; 95]), SetOptions::new())
                .unwrap();
        }
        let layer = f.store.registry().get(&LayerId::from("fast")).unwrap();
        assert_eq!(layer.usage().bytes, 950);

        f.optimizer.optimize();
        assert!(layer.usage().bytes <= 850);
    }
}
