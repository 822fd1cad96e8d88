//! Cache Configuration
//!
//! Immutable configuration value with a validated patch/merge function.
//! A rejected patch leaves the previous configuration untouched.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::eviction::EvictionPolicyKind;
use crate::cache::layer::StorageKind;
use crate::error::{Error, Result};

/// Consistency level declared for replicated layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyLevel {
    Strong,
    #[default]
    Eventual,
    Weak,
}

// =============================================================================
// Configuration Sections
// =============================================================================

/// Global switches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Enable the prefetch loop
    pub intelligent_prefetching: bool,
    /// Enable the optimizer loop
    pub ai_optimization: bool,
    /// Compress payloads on layers that allow it
    pub compression_enabled: bool,
    /// Declared consistency level
    pub consistency_level: ConsistencyLevel,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            intelligent_prefetching: true,
            ai_optimization: true,
            compression_enabled: true,
            consistency_level: ConsistencyLevel::Eventual,
        }
    }
}

/// One declared storage tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    /// Layer identifier
    pub id: String,
    /// Ordered rank (0 = fastest)
    pub rank: u32,
    /// Storage kind
    pub kind: StorageKind,
    /// Whether the layer accepts traffic
    pub enabled: bool,
    /// Maximum bytes held
    pub max_size_bytes: u64,
    /// Maximum entry count (0 = unbounded)
    pub max_entries: u64,
    /// Default TTL for entries written here
    pub ttl_ms: u64,
    /// Fraction of `max_size_bytes` at which a write triggers eviction
    pub eviction_threshold: f64,
    /// Per-layer eviction policy override
    pub eviction_policy: Option<EvictionPolicyKind>,
    /// Allow compressed payloads
    pub compression: bool,
    /// Declared encryption at rest
    pub encryption: bool,
    /// Declared replication factor
    pub replication_factor: u32,
    /// Declared target regions
    pub regions: Vec<String>,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            id: "memory".to_string(),
            rank: 0,
            kind: StorageKind::Memory,
            enabled: true,
            max_size_bytes: 64 * 1024 * 1024,
            max_entries: 0,
            ttl_ms: 5 * 60 * 1000,
            eviction_threshold: 1.0,
            eviction_policy: None,
            compression: false,
            encryption: false,
            replication_factor: 1,
            regions: Vec::new(),
        }
    }
}

impl LayerConfig {
    /// Create a layer config with the given id, rank, kind and capacity
    pub fn new(id: impl Into<String>, rank: u32, kind: StorageKind, max_size_bytes: u64) -> Self {
        Self {
            id: id.into(),
            rank,
            kind,
            max_size_bytes,
            ..Default::default()
        }
    }

    /// Builder-style TTL override
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// Builder-style policy override
    pub fn with_policy(mut self, policy: EvictionPolicyKind) -> Self {
        self.eviction_policy = Some(policy);
        self
    }

    /// Default TTL as a Duration
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Eviction thresholds in percent of capacity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionThresholds {
    /// Proactive eviction threshold for memory layers
    pub memory_pct: f64,
    /// Proactive eviction threshold for disk-backed layers
    pub disk_pct: f64,
}

impl Default for EvictionThresholds {
    fn default() -> Self {
        Self {
            memory_pct: 85.0,
            disk_pct: 90.0,
        }
    }
}

/// Eviction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Default policy for layers without an override
    pub strategy: EvictionPolicyKind,
    /// Proactive thresholds
    pub thresholds: EvictionThresholds,
    /// Fraction of candidates evicted per round
    pub fraction: f64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            strategy: EvictionPolicyKind::Adaptive,
            thresholds: EvictionThresholds::default(),
            fraction: 0.10,
        }
    }
}

/// Prefetch settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Global concurrent prefetch bound
    pub max_concurrent: u32,
    /// Global minimum prediction probability
    pub confidence_threshold: f32,
    /// Default per-strategy batch size
    pub batch_size: u32,
    /// TTL for prefetched placeholders
    pub default_ttl_ms: u64,
    /// Default maximum prefetched payload size
    pub max_prefetch_size_bytes: u64,
    /// Prefetch loop interval
    pub interval_ms: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            confidence_threshold: 0.7,
            batch_size: 20,
            default_ttl_ms: 5 * 60 * 1000,
            max_prefetch_size_bytes: 1024 * 1024,
            interval_ms: 60_000,
        }
    }
}

/// Invalidation queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    /// Jobs drained per tick
    pub batch_size: u32,
    /// Re-attempts after the first failure before a job is dropped
    pub retries: u32,
    /// Dependency hops followed by cascading invalidation
    pub cascade_depth: u32,
    /// Drain loop interval
    pub drain_interval_ms: u64,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            retries: 3,
            cascade_depth: 1,
            drain_interval_ms: 1_000,
        }
    }
}

/// Telemetry sampling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Sampling interval
    pub interval_ms: u64,
    /// Samples retained per layer
    pub retention_samples: usize,
    /// Maximum sample age
    pub retention_ms: u64,
    /// Samples used to smooth layer performance
    pub smoothing_window: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            retention_samples: 120,
            retention_ms: 60 * 60 * 1000,
            smoothing_window: 5,
        }
    }
}

/// Optimizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
    /// Optimizer interval
    pub interval_ms: u64,
    /// Grow a layer when its hit rate is below this
    pub hit_rate_threshold: f64,
    /// Relative capacity growth per step
    pub capacity_growth: f64,
    /// Upper bound on growth relative to configured capacity
    pub max_capacity_factor: f64,
    /// Entries promoted into the fastest layer per cycle
    pub rebalance_top_n: usize,
    /// Strategy accuracy floor
    pub min_accuracy: f64,
    /// Strategy efficiency floor
    pub min_efficiency: f64,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5 * 60 * 1000,
            hit_rate_threshold: 0.5,
            capacity_growth: 0.10,
            max_capacity_factor: 4.0,
            rebalance_top_n: 10,
            min_accuracy: 0.6,
            min_efficiency: 0.7,
        }
    }
}

/// Pattern analysis settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Analyzer interval
    pub interval_ms: u64,
    /// Access events retained for analysis
    pub max_history: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2 * 60 * 1000,
            max_history: 10_000,
        }
    }
}

// =============================================================================
// Cache Configuration
// =============================================================================

/// Complete cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfiguration {
    pub global: GlobalConfig,
    pub layers: Vec<LayerConfig>,
    pub eviction: EvictionConfig,
    pub prefetching: PrefetchConfig,
    pub invalidation: InvalidationConfig,
    pub monitoring: MonitoringConfig,
    pub optimization: OptimizationConfig,
    pub analysis: AnalysisConfig,
}

impl Default for CacheConfiguration {
    fn default() -> Self {
        Self {
            global: GlobalConfig::default(),
            layers: vec![
                LayerConfig::new("memory", 0, StorageKind::Memory, 64 * 1024 * 1024)
                    .with_ttl(Duration::from_secs(5 * 60)),
                LayerConfig {
                    compression: true,
                    ..LayerConfig::new("disk", 1, StorageKind::Disk, 512 * 1024 * 1024)
                        .with_ttl(Duration::from_secs(60 * 60))
                },
                LayerConfig {
                    compression: true,
                    replication_factor: 3,
                    ..LayerConfig::new(
                        "distributed",
                        2,
                        StorageKind::Distributed,
                        4 * 1024 * 1024 * 1024,
                    )
                    .with_ttl(Duration::from_secs(24 * 60 * 60))
                },
            ],
            eviction: EvictionConfig::default(),
            prefetching: PrefetchConfig::default(),
            invalidation: InvalidationConfig::default(),
            monitoring: MonitoringConfig::default(),
            optimization: OptimizationConfig::default(),
            analysis: AnalysisConfig::default(),
        }
    }
}

impl CacheConfiguration {
    /// Configuration with the given layers and defaults elsewhere
    pub fn with_layers(layers: Vec<LayerConfig>) -> Self {
        Self {
            layers,
            ..Default::default()
        }
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a layer by id
    pub fn layer(&self, id: &str) -> Option<&LayerConfig> {
        self.layers.iter().find(|l| l.id == id)
    }

    /// Check basic bounds
    pub fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(invalid("at least one layer must be declared"));
        }

        let mut seen = HashSet::new();
        for layer in &self.layers {
            if layer.id.is_empty() {
                return Err(invalid("layer id must not be empty"));
            }
            if !seen.insert(layer.id.as_str()) {
                return Err(invalid(format!("duplicate layer id: {}", layer.id)));
            }
            if layer.max_size_bytes == 0 {
                return Err(invalid(format!(
                    "layer {} max_size_bytes must be > 0",
                    layer.id
                )));
            }
            if !(layer.eviction_threshold > 0.0 && layer.eviction_threshold <= 1.0) {
                return Err(invalid(format!(
                    "layer {} eviction_threshold must be in (0, 1]",
                    layer.id
                )));
            }
            if layer.replication_factor == 0 {
                return Err(invalid(format!(
                    "layer {} replication_factor must be >= 1",
                    layer.id
                )));
            }
        }

        let pct_ok = |p: f64| p > 0.0 && p <= 100.0;
        if !pct_ok(self.eviction.thresholds.memory_pct) || !pct_ok(self.eviction.thresholds.disk_pct)
        {
            return Err(invalid("eviction thresholds must be in (0, 100]"));
        }
        if !(self.eviction.fraction > 0.0 && self.eviction.fraction <= 1.0) {
            return Err(invalid("eviction.fraction must be in (0, 1]"));
        }
        if self.prefetching.max_concurrent == 0 {
            return Err(invalid("prefetching.max_concurrent must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.prefetching.confidence_threshold) {
            return Err(invalid("prefetching.confidence_threshold must be in [0, 1]"));
        }
        if self.prefetching.batch_size == 0 {
            return Err(invalid("prefetching.batch_size must be > 0"));
        }
        if self.invalidation.batch_size == 0 {
            return Err(invalid("invalidation.batch_size must be > 0"));
        }
        if self.monitoring.interval_ms == 0
            || self.optimization.interval_ms == 0
            || self.analysis.interval_ms == 0
            || self.invalidation.drain_interval_ms == 0
            || self.prefetching.interval_ms == 0
        {
            return Err(invalid("intervals must be > 0"));
        }
        if self.monitoring.retention_samples == 0 || self.monitoring.smoothing_window == 0 {
            return Err(invalid("monitoring retention and smoothing window must be > 0"));
        }
        if self.optimization.capacity_growth < 0.0 || self.optimization.max_capacity_factor < 1.0
        {
            return Err(invalid(
                "optimization.capacity_growth must be >= 0 and max_capacity_factor >= 1",
            ));
        }
        Ok(())
    }

    /// Merge a patch, returning a new validated configuration
    pub fn apply(&self, patch: &ConfigPatch) -> Result<Self> {
        let mut next = self.clone();

        if let Some(v) = patch.global.intelligent_prefetching {
            next.global.intelligent_prefetching = v;
        }
        if let Some(v) = patch.global.ai_optimization {
            next.global.ai_optimization = v;
        }
        if let Some(v) = patch.global.compression_enabled {
            next.global.compression_enabled = v;
        }
        if let Some(v) = patch.global.consistency_level {
            next.global.consistency_level = v;
        }

        for (id, layer_patch) in &patch.layers {
            let layer = next
                .layers
                .iter_mut()
                .find(|l| &l.id == id)
                .ok_or_else(|| invalid(format!("unknown layer in patch: {}", id)))?;

            if let Some(enabled) = layer_patch.enabled {
                layer.enabled = enabled;
            }
            if let Some(size) = layer_patch.max_size_bytes {
                if size <= 0 {
                    return Err(invalid(format!(
                        "layer {} max_size_bytes must be > 0, got {}",
                        id, size
                    )));
                }
                layer.max_size_bytes = size as u64;
            }
            if let Some(ttl) = layer_patch.ttl_ms {
                layer.ttl_ms = ttl;
            }
        }

        if let Some(strategy) = patch.eviction.strategy {
            next.eviction.strategy = strategy;
        }
        if let Some(pct) = patch.eviction.memory_pct {
            next.eviction.thresholds.memory_pct = pct;
        }
        if let Some(pct) = patch.eviction.disk_pct {
            next.eviction.thresholds.disk_pct = pct;
        }
        if let Some(n) = patch.prefetching.max_concurrent {
            next.prefetching.max_concurrent = n;
        }
        if let Some(t) = patch.prefetching.confidence_threshold {
            next.prefetching.confidence_threshold = t;
        }
        if let Some(n) = patch.invalidation.batch_size {
            next.invalidation.batch_size = n;
        }
        if let Some(n) = patch.invalidation.retries {
            next.invalidation.retries = n;
        }
        if let Some(ms) = patch.monitoring_interval_ms {
            next.monitoring.interval_ms = ms;
        }
        if let Some(ms) = patch.optimization_interval_ms {
            next.optimization.interval_ms = ms;
        }

        next.validate()?;
        Ok(next)
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidConfiguration(reason.into())
}

// =============================================================================
// Configuration Patch
// =============================================================================

/// Partial update for global switches
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalPatch {
    pub intelligent_prefetching: Option<bool>,
    pub ai_optimization: Option<bool>,
    pub compression_enabled: Option<bool>,
    pub consistency_level: Option<ConsistencyLevel>,
}

/// Partial update for one layer
///
/// `max_size_bytes` is signed so that nonsensical patches can be expressed and rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerPatch {
    pub enabled: Option<bool>,
    pub max_size_bytes: Option<i64>,
    pub ttl_ms: Option<u64>,
}

/// Partial update for eviction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionPatch {
    pub strategy: Option<EvictionPolicyKind>,
    pub memory_pct: Option<f64>,
    pub disk_pct: Option<f64>,
}

/// Partial update for prefetching
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchPatch {
    pub max_concurrent: Option<u32>,
    pub confidence_threshold: Option<f32>,
}

/// Partial update for invalidation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationPatch {
    pub batch_size: Option<u32>,
    pub retries: Option<u32>,
}

/// Configuration patch accepted by `update_configuration`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    pub global: GlobalPatch,
    pub layers: BTreeMap<String, LayerPatch>,
    pub eviction: EvictionPatch,
    pub prefetching: PrefetchPatch,
    pub invalidation: InvalidationPatch,
    pub monitoring_interval_ms: Option<u64>,
    pub optimization_interval_ms: Option<u64>,
}

// =============================================================================
// Tests
// =============================================================================
