//! Layer Registry
//!
//! Ordered set of storage tiers. Each layer owns a usage lock that serializes
//! capacity accounting, plus lock-free counters for the telemetry loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};

use super::eviction::EvictionPolicyKind;
use crate::config::{CacheConfiguration, ConsistencyLevel, LayerConfig};
use crate::error::{Error, Result};

/// Number of recent latencies kept per layer for percentile estimation
const LATENCY_RESERVOIR: usize = 1024;

/// Layer identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(pub String);

impl LayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for LayerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for LayerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Backing storage kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    Disk,
    Distributed,
    Hybrid,
}

impl StorageKind {
    /// Disk-backed layers use the disk proactive-eviction threshold
    pub fn is_disk_backed(&self) -> bool {
        matches!(self, StorageKind::Disk | StorageKind::Hybrid)
    }
}

/// Operational status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerStatus {
    Active,
    Degraded,
    Maintenance,
    Offline,
}

impl LayerStatus {
    /// Only active layers serve reads and accept writes
    pub fn is_available(&self) -> bool {
        matches!(self, LayerStatus::Active)
    }
}

impl std::fmt::Display for LayerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerStatus::Active => write!(f, "active"),
            LayerStatus::Degraded => write!(f, "degraded"),
            LayerStatus::Maintenance => write!(f, "maintenance"),
            LayerStatus::Offline => write!(f, "offline"),
        }
    }
}

// =============================================================================
// Layer Value Types
// =============================================================================

/// Capacity limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerCapacity {
    pub max_size_bytes: u64,
    /// 0 = unbounded
    pub max_entries: u64,
    pub default_ttl: Duration,
}

/// Current usage, guarded by the layer's usage lock
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerUsage {
    pub bytes: u64,
    pub entries: u64,
}

impl LayerUsage {
    /// `bytes / max_size_bytes`
    pub fn utilization(&self, capacity: &LayerCapacity) -> f64 {
        if capacity.max_size_bytes == 0 {
            return 0.0;
        }
        self.bytes as f64 / capacity.max_size_bytes as f64
    }

    pub(crate) fn charge(&mut self, size: u64) {
        self.bytes += size;
        self.entries += 1;
    }

    pub(crate) fn release(&mut self, size: u64) {
        self.bytes = self.bytes.saturating_sub(size);
        self.entries = self.entries.saturating_sub(1);
    }
}

/// Policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerPolicy {
    pub eviction_policy: EvictionPolicyKind,
    pub eviction_threshold: f64,
    pub compression_enabled: bool,
    pub encryption_enabled: bool,
    pub replication_factor: u32,
    pub consistency_level: ConsistencyLevel,
    pub regions: Vec<String>,
}

/// Smoothed performance fields recomputed by the telemetry loop
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerPerformance {
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub avg_latency_us: f64,
    pub throughput_rps: f64,
    pub error_rate: f64,
}

// =============================================================================
// Layer Counters
// =============================================================================

/// Lock-free live counters for one layer
#[derive(Debug, Default)]
pub struct LayerCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    // Exponential moving average, microseconds
    latency_ema_us: AtomicU64,
    recent_latencies: Mutex<VecDeque<u64>>,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CounterSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub writes: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl CounterSnapshot {
    /// Counter deltas since an earlier snapshot
    pub fn delta(&self, earlier: &CounterSnapshot) -> CounterSnapshot {
        CounterSnapshot {
            hits: self.hits.saturating_sub(earlier.hits),
            misses: self.misses.saturating_sub(earlier.misses),
            errors: self.errors.saturating_sub(earlier.errors),
            writes: self.writes.saturating_sub(earlier.writes),
            evictions: self.evictions.saturating_sub(earlier.evictions),
            invalidations: self.invalidations.saturating_sub(earlier.invalidations),
            bytes_read: self.bytes_read.saturating_sub(earlier.bytes_read),
            bytes_written: self.bytes_written.saturating_sub(earlier.bytes_written),
        }
    }

    pub fn requests(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.requests();
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl LayerCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, bytes: u64, latency: Duration) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: u64, latency: Duration) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    fn record_latency(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1;

        loop {
            let current = self.latency_ema_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if self
                .latency_ema_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        let mut recent = self.recent_latencies.lock();
        if recent.len() == LATENCY_RESERVOIR {
            recent.pop_front();
        }
        recent.push_back(new_us);
    }

    /// Smoothed latency
    pub fn average_latency(&self) -> Duration {
        Duration::from_micros(self.latency_ema_us.load(Ordering::Relaxed))
    }

    /// p50 / p95 / p99 over recent operations, in microseconds
    pub fn latency_percentiles(&self) -> (u64, u64, u64) {
        let mut values: Vec<u64> = self.recent_latencies.lock().iter().copied().collect();
        if values.is_empty() {
            return (0, 0, 0);
        }
        values.sort_unstable();
        let pick = |q: f64| {
            let idx = ((values.len() - 1) as f64 * q).round() as usize;
            values[idx.min(values.len() - 1)]
        };
        (pick(0.50), pick(0.95), pick(0.99))
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Cache Layer
// =============================================================================

/// One storage tier
#[derive(Debug)]
pub struct CacheLayer {
    id: LayerId,
    rank: u32,
    kind: StorageKind,
    capacity: RwLock<LayerCapacity>,
    policy: RwLock<LayerPolicy>,
    usage: Mutex<LayerUsage>,
    status: RwLock<LayerStatus>,
    performance: RwLock<LayerPerformance>,
    counters: LayerCounters,
}

/// Serializable view of a layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSnapshot {
    pub id: LayerId,
    pub rank: u32,
    pub kind: StorageKind,
    pub capacity: LayerCapacity,
    pub usage: LayerUsage,
    pub utilization: f64,
    pub policy: LayerPolicy,
    pub performance: LayerPerformance,
    pub status: LayerStatus,
}

impl CacheLayer {
    /// Build a layer from its configuration
    pub fn from_config(config: &LayerConfig, defaults: &CacheConfiguration) -> Self {
        Self {
            id: LayerId::new(config.id.clone()),
            rank: config.rank,
            kind: config.kind,
            capacity: RwLock::new(Self::capacity_of(config)),
            policy: RwLock::new(Self::policy_of(config, defaults)),
            usage: Mutex::new(LayerUsage::default()),
            status: RwLock::new(if config.enabled {
                LayerStatus::Active
            } else {
                LayerStatus::Offline
            }),
            performance: RwLock::new(LayerPerformance::default()),
            counters: LayerCounters::new(),
        }
    }

    fn capacity_of(config: &LayerConfig) -> LayerCapacity {
        LayerCapacity {
            max_size_bytes: config.max_size_bytes,
            max_entries: config.max_entries,
            default_ttl: config.ttl(),
        }
    }

    fn policy_of(config: &LayerConfig, defaults: &CacheConfiguration) -> LayerPolicy {
        LayerPolicy {
            eviction_policy: config
                .eviction_policy
                .unwrap_or(defaults.eviction.strategy),
            eviction_threshold: config.eviction_threshold,
            compression_enabled: config.compression && defaults.global.compression_enabled,
            encryption_enabled: config.encryption,
            replication_factor: config.replication_factor,
            consistency_level: defaults.global.consistency_level,
            regions: config.regions.clone(),
        }
    }

    /// Re-apply configuration to an existing layer, keeping usage and counters
    fn reconfigure(&self, config: &LayerConfig, defaults: &CacheConfiguration) {
        *self.capacity.write() = Self::capacity_of(config);
        *self.policy.write() = Self::policy_of(config, defaults);
        let mut status = self.status.write();
        if !config.enabled {
            *status = LayerStatus::Offline;
        } else if *status == LayerStatus::Offline {
            *status = LayerStatus::Active;
        }
    }

    pub fn id(&self) -> &LayerId {
        &self.id
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    pub fn capacity(&self) -> LayerCapacity {
        self.capacity.read().clone()
    }

    pub fn policy(&self) -> LayerPolicy {
        self.policy.read().clone()
    }

    pub fn status(&self) -> LayerStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: LayerStatus) {
        *self.status.write() = status;
    }

    pub fn is_available(&self) -> bool {
        self.status().is_available()
    }

    pub fn counters(&self) -> &LayerCounters {
        &self.counters
    }

    pub fn performance(&self) -> LayerPerformance {
        self.performance.read().clone()
    }

    pub fn set_performance(&self, performance: LayerPerformance) {
        *self.performance.write() = performance;
    }

    /// Grow or shrink the byte capacity at runtime
    pub fn set_max_size(&self, max_size_bytes: u64) {
        self.capacity.write().max_size_bytes = max_size_bytes;
    }

    /// Acquire the per-layer usage lock
    pub fn lock_usage(&self) -> MutexGuard<'_, LayerUsage> {
        self.usage.lock()
    }

    /// Current usage (takes the usage lock briefly)
    pub fn usage(&self) -> LayerUsage {
        self.usage.lock().clone()
    }

    pub fn utilization(&self) -> f64 {
        self.usage().utilization(&self.capacity())
    }

    pub fn snapshot(&self) -> LayerSnapshot {
        let capacity = self.capacity();
        let usage = self.usage();
        LayerSnapshot {
            id: self.id.clone(),
            rank: self.rank,
            kind: self.kind,
            utilization: usage.utilization(&capacity),
            capacity,
            usage,
            policy: self.policy(),
            performance: self.performance(),
            status: self.status(),
        }
    }
}

// =============================================================================
// Layer Registry
// =============================================================================

/// Ordered set of layers (fastest first)
#[derive(Debug, Default)]
pub struct LayerRegistry {
    layers: RwLock<Vec<Arc<CacheLayer>>>,
}

impl LayerRegistry {
    /// Build the registry from configuration
    pub fn from_config(config: &CacheConfiguration) -> Self {
        let mut layers: Vec<Arc<CacheLayer>> = config
            .layers
            .iter()
            .map(|l| Arc::new(CacheLayer::from_config(l, config)))
            .collect();
        layers.sort_by_key(|l| l.rank());
        Self {
            layers: RwLock::new(layers),
        }
    }

    /// All layers in rank order
    pub fn ordered(&self) -> Vec<Arc<CacheLayer>> {
        self.layers.read().clone()
    }

    /// Active layers in rank order
    pub fn active(&self) -> Vec<Arc<CacheLayer>> {
        self.layers
            .read()
            .iter()
            .filter(|l| l.is_available())
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &LayerId) -> Option<Arc<CacheLayer>> {
        self.layers.read().iter().find(|l| l.id() == id).cloned()
    }

    /// Look up a layer or fail with `UnknownLayer`
    pub fn require(&self, id: &LayerId) -> Result<Arc<CacheLayer>> {
        self.get(id)
            .ok_or_else(|| Error::UnknownLayer(id.to_string()))
    }

    /// Fastest active layer
    pub fn fastest_active(&self) -> Option<Arc<CacheLayer>> {
        self.layers
            .read()
            .iter()
            .find(|l| l.is_available())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.layers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.read().is_empty()
    }

    /// Apply a new configuration: update existing layers, add new ones and
    /// return the layers that were removed so the caller can purge placements.
    pub fn reconfigure(&self, config: &CacheConfiguration) -> Vec<Arc<CacheLayer>> {
        let mut layers = self.layers.write();
        let mut removed = Vec::new();

        layers.retain(|layer| {
            let keep = config.layer(layer.id().as_str()).is_some();
            if !keep {
                removed.push(Arc::clone(layer));
            }
            keep
        });

        for layer_config in &config.layers {
            match layers.iter().find(|l| l.id().as_str() == layer_config.id) {
                Some(existing) => existing.reconfigure(layer_config, config),
                None => layers.push(Arc::new(CacheLayer::from_config(layer_config, config))),
            }
        }
        layers.sort_by_key(|l| l.rank());
        removed
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn two_layer_config() -> CacheConfiguration {
        CacheConfiguration::with_layers(vec![
            LayerConfig::new("slow", 1, StorageKind::Disk, 10_000),
            LayerConfig::new("fast", 0, StorageKind::Memory, 1_000),
        ])
    }

    #[test]
    fn test_registry_orders_by_rank() {
        let registry = LayerRegistry::from_config(&two_layer_config());
        let ids: Vec<String> = registry
            .ordered()
            .iter()
            .map(|l| l.id().to_string())
            .collect();
        assert_eq!(ids, vec!["fast", "slow"]);
        assert_eq!(registry.fastest_active().unwrap().id().as_str(), "fast");
    }

    #[test]
    fn test_disabled_layer_starts_offline() {
        let mut config = two_layer_config();
        config.layers[1].enabled = false;
        let registry = LayerRegistry::from_config(&config);
        let fast = registry.get(&LayerId::from("fast")).unwrap();
        assert_eq!(fast.status(), LayerStatus::Offline);
        assert_eq!(registry.active().len(), 1);
        assert_eq!(registry.fastest_active().unwrap().id().as_str(), "slow");
    }

    #[test]
    fn test_usage_utilization() {
        let registry = LayerRegistry::from_config(&two_layer_config());
        let fast = registry.get(&LayerId::from("fast")).unwrap();
        fast.lock_usage().charge(250);
        assert!((fast.utilization() - 0.25).abs() < f64::EPSILON);
        fast.lock_usage().release(250);
        assert_eq!(fast.usage(), LayerUsage::default());
    }

    #[test]
    fn test_reconfigure_adds_and_removes_layers() {
        let registry = LayerRegistry::from_config(&two_layer_config());
        let next = CacheConfiguration::with_layers(vec![
            LayerConfig::new("fast", 0, StorageKind::Memory, 2_000),
            LayerConfig::new("remote", 2, StorageKind::Distributed, 50_000),
        ]);
        let removed = registry.reconfigure(&next);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id().as_str(), "slow");
        assert_eq!(registry.len(), 2);
        let fast = registry.get(&LayerId::from("fast")).unwrap();
        assert_eq!(fast.capacity().max_size_bytes, 2_000);
    }

    #[test]
    fn test_counters_and_percentiles() {
        let counters = LayerCounters::new();
        for i in 1..=100 {
            counters.record_hit(10, Duration::from_micros(i));
        }
        counters.record_miss();
        let snap = counters.snapshot();
        assert_eq!(snap.hits, 100);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.bytes_read, 1000);
        let (p50, p95, p99) = counters.latency_percentiles();
        assert!(p50 <= p95 && p95 <= p99);
        assert!((45..=55).contains(&p50));
    }

    #[test]
    fn test_counter_delta() {
        let counters = LayerCounters::new();
        counters.record_miss();
        let before = counters.snapshot();
        counters.record_hit(1, Duration::from_micros(5));
        counters.record_hit(1, Duration::from_micros(5));
        let delta = counters.snapshot().delta(&before);
        assert_eq!(delta.hits, 2);
        assert_eq!(delta.misses, 0);
        assert_eq!(delta.hit_rate(), 1.0);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(LayerStatus::Offline.to_string(), "offline");
        assert!(LayerStatus::Active.is_available());
        assert!(!LayerStatus::Degraded.is_available());
    }
}
