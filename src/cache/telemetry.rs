//! Telemetry
//!
//! Samples live layer counters into a bounded rolling window and derives
//! smoothed layer performance from the most recent samples. Samples are
//! read-only inputs for the optimizer and for callers; nothing in the cache
//! core depends on them for correctness.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::layer::{CacheLayer, CounterSnapshot, LayerId, LayerPerformance, LayerStatus};
use super::store::TieredStore;
use crate::config::MonitoringConfig;

/// Keys reported per hot/cold list
const KEY_LIST_LEN: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestCounts {
    pub total: u64,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
}

/// Latency in microseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub average_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageOccupancy {
    pub bytes: u64,
    pub entries: u64,
    pub max_size_bytes: u64,
    pub utilization: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationCounts {
    pub writes: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EfficiencyRatios {
    pub hit_ratio: f64,
    pub miss_ratio: f64,
    pub error_ratio: f64,
    pub throughput_rps: f64,
}

/// Point-in-time view of one layer; counts cover the interval since the
/// previous sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSample {
    pub layer: LayerId,
    pub at: DateTime<Utc>,
    pub status: LayerStatus,
    pub requests: RequestCounts,
    pub latency: LatencyPercentiles,
    pub storage: StorageOccupancy,
    pub operations: OperationCounts,
    pub efficiency: EfficiencyRatios,
    pub hot_keys: Vec<String>,
    pub cold_keys: Vec<String>,
}

/// Cache-wide totals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalMetrics {
    pub layers: usize,
    pub active_layers: usize,
    pub entries: usize,
    pub bytes: u64,
    pub capacity_bytes: u64,
    pub utilization: f64,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub invalidations: u64,
    pub average_latency_us: f64,
    pub samples_retained: usize,
}

/// Window bounds from `monitoring.*`
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySettings {
    pub retention_samples: usize,
    pub retention: Duration,
    pub smoothing_window: usize,
}

impl From<&MonitoringConfig> for TelemetrySettings {
    fn from(config: &MonitoringConfig) -> Self {
        Self {
            retention_samples: config.retention_samples.max(1),
            retention: Duration::from_millis(config.retention_ms),
            smoothing_window: config.smoothing_window.max(1),
        }
    }
}

pub struct Telemetry {
    store: Arc<TieredStore>,
    previous: Mutex<HashMap<LayerId, (CounterSnapshot, Instant)>>,
    window: RwLock<HashMap<LayerId, VecDeque<AnalyticsSample>>>,
    settings: RwLock<TelemetrySettings>,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("settings", &*self.settings.read())
            .field("retained", &self.retained())
            .finish()
    }
}

impl Telemetry {
    pub fn new(store: Arc<TieredStore>, settings: TelemetrySettings) -> Self {
        Self {
            store,
            previous: Mutex::new(HashMap::new()),
            window: RwLock::new(HashMap::new()),
            settings: RwLock::new(settings),
        }
    }

    pub fn update_settings(&self, settings: TelemetrySettings) {
        *self.settings.write() = settings;
    }

    /// Samples held across all layers
    pub fn retained(&self) -> usize {
        self.window.read().values().map(VecDeque::len).sum()
    }

    /// Take one sample per layer, prune the window and refresh smoothed
    /// performance. Returns the new samples.
    pub fn sample(&self) -> Vec<AnalyticsSample> {
        let now = Utc::now();
        let settings = self.settings.read().clone();
        let layers = self.store.registry().ordered();
        let mut taken = Vec::with_capacity(layers.len());

        for layer in &layers {
            let sample = self.sample_layer(layer, now);
            let smoothed = {
                let mut window = self.window.write();
                let series = window.entry(layer.id().clone()).or_default();
                series.push_back(sample.clone());
                Self::prune(series, &settings, now);
                Self::smooth(series, settings.smoothing_window)
            };
            layer.set_performance(smoothed);
            taken.push(sample);
        }

        // Forget layers that left the registry
        let live: Vec<&LayerId> = layers.iter().map(|l| l.id()).collect();
        self.window.write().retain(|id, _| live.contains(&id));
        self.previous.lock().retain(|id, _| live.contains(&id));

        debug!(layers = taken.len(), "Sampled layer telemetry");
        taken
    }

    fn sample_layer(&self, layer: &CacheLayer, now: DateTime<Utc>) -> AnalyticsSample {
        let counters = layer.counters();
        let current = counters.snapshot();
        let taken_at = Instant::now();
        let (delta, elapsed) = {
            let mut previous = self.previous.lock();
            let (before, at) = previous
                .insert(layer.id().clone(), (current, taken_at))
                .unwrap_or((CounterSnapshot::default(), taken_at));
            (current.delta(&before), taken_at.duration_since(at))
        };

        let (p50, p95, p99) = counters.latency_percentiles();
        let capacity = layer.capacity();
        let usage = layer.usage();
        let (hot_keys, cold_keys) = self.hot_and_cold(layer.id());

        let total = delta.requests();
        let ratio = |n: u64| if total == 0 { 0.0 } else { n as f64 / total as f64 };
        let secs = elapsed.as_secs_f64();

        AnalyticsSample {
            layer: layer.id().clone(),
            at: now,
            status: layer.status(),
            requests: RequestCounts {
                total,
                hits: delta.hits,
                misses: delta.misses,
                errors: delta.errors,
            },
            latency: LatencyPercentiles {
                average_us: counters.average_latency().as_micros() as u64,
                p50_us: p50,
                p95_us: p95,
                p99_us: p99,
            },
            storage: StorageOccupancy {
                bytes: usage.bytes,
                entries: usage.entries,
                max_size_bytes: capacity.max_size_bytes,
                utilization: usage.utilization(&capacity),
            },
            operations: OperationCounts {
                writes: delta.writes,
                evictions: delta.evictions,
                invalidations: delta.invalidations,
                bytes_read: delta.bytes_read,
                bytes_written: delta.bytes_written,
            },
            efficiency: EfficiencyRatios {
                hit_ratio: ratio(delta.hits),
                miss_ratio: ratio(delta.misses),
                error_ratio: ratio(delta.errors),
                throughput_rps: if secs > 0.0 { total as f64 / secs } else { 0.0 },
            },
            hot_keys,
            cold_keys,
        }
    }

    /// Most and least frequently read keys on a layer
    fn hot_and_cold(&self, layer: &LayerId) -> (Vec<String>, Vec<String>) {
        self.store.inspect(|entries| {
            let mut ranked: Vec<(f64, DateTime<Utc>, &str)> = entries
                .entries_on(layer)
                .into_iter()
                .map(|(_, e)| (e.stats.frequency, e.timing.last_accessed, e.key.as_str()))
                .collect();
            ranked.sort_by(|a, b| {
                b.0.total_cmp(&a.0)
                    .then_with(|| b.1.cmp(&a.1))
                    .then_with(|| a.2.cmp(b.2))
            });
            let hot: Vec<String> = ranked
                .iter()
                .take(KEY_LIST_LEN)
                .map(|(_, _, k)| k.to_string())
                .collect();
            let cold: Vec<String> = ranked
                .iter()
                .rev()
                .take(KEY_LIST_LEN)
                .map(|(_, _, k)| k.to_string())
                .collect();
            (hot, cold)
        })
    }

    fn prune(series: &mut VecDeque<AnalyticsSample>, settings: &TelemetrySettings, now: DateTime<Utc>) {
        while series.len() > settings.retention_samples {
            series.pop_front();
        }
        if let Ok(max_age) = ChronoDuration::from_std(settings.retention) {
            while series.front().map_or(false, |s| now - s.at > max_age) {
                series.pop_front();
            }
        }
    }

    /// Request-weighted performance over the most recent samples
    fn smooth(series: &VecDeque<AnalyticsSample>, window: usize) -> LayerPerformance {
        let recent: Vec<&AnalyticsSample> = series.iter().rev().take(window).collect();
        if recent.is_empty() {
            return LayerPerformance::default();
        }
        let total: u64 = recent.iter().map(|s| s.requests.total).sum();
        let hits: u64 = recent.iter().map(|s| s.requests.hits).sum();
        let misses: u64 = recent.iter().map(|s| s.requests.misses).sum();
        let errors: u64 = recent.iter().map(|s| s.requests.errors).sum();
        let share = |n: u64| if total == 0 { 0.0 } else { n as f64 / total as f64 };

        LayerPerformance {
            hit_rate: share(hits),
            miss_rate: share(misses),
            avg_latency_us: recent.iter().map(|s| s.latency.average_us as f64).sum::<f64>()
                / recent.len() as f64,
            throughput_rps: recent.iter().map(|s| s.efficiency.throughput_rps).sum::<f64>()
                / recent.len() as f64,
            error_rate: share(errors),
        }
    }

    /// Retained samples, optionally for one layer and newer than `since`
    pub fn analytics(&self, layer: Option<&LayerId>, since: Option<DateTime<Utc>>) -> Vec<AnalyticsSample> {
        let window = self.window.read();
        let mut samples: Vec<AnalyticsSample> = window
            .iter()
            .filter(|(id, _)| layer.map_or(true, |wanted| *id == wanted))
            .flat_map(|(_, series)| series.iter())
            .filter(|s| since.map_or(true, |t| s.at >= t))
            .cloned()
            .collect();
        samples.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.layer.cmp(&b.layer)));
        samples
    }

    /// Totals from live counters and usage
    pub fn global_metrics(&self) -> GlobalMetrics {
        let layers = self.store.registry().ordered();
        let mut metrics = GlobalMetrics {
            layers: layers.len(),
            entries: self.store.len(),
            samples_retained: self.retained(),
            ..Default::default()
        };

        let mut latency_sum = 0.0;
        for layer in &layers {
            let counters = layer.counters().snapshot();
            let usage = layer.usage();
            if layer.is_available() {
                metrics.active_layers += 1;
            }
            metrics.bytes += usage.bytes;
            metrics.capacity_bytes += layer.capacity().max_size_bytes;
            metrics.hits += counters.hits;
            metrics.misses += counters.misses;
            metrics.errors += counters.errors;
            metrics.evictions += counters.evictions;
            metrics.invalidations += counters.invalidations;
            latency_sum += layer.counters().average_latency().as_micros() as f64;
        }

        // Each read probes several layers; a request hits at most once
        let requests = metrics.hits + metrics.misses;
        metrics.hit_rate = if requests == 0 {
            0.0
        } else {
            metrics.hits as f64 / requests as f64
        };
        metrics.utilization = if metrics.capacity_bytes == 0 {
            0.0
        } else {
            metrics.bytes as f64 / metrics.capacity_bytes as f64
        };
        if !layers.is_empty() {
            metrics.average_latency_us = latency_sum / layers.len() as f64;
        }
        metrics
    }
}

// =============================================================================
// Tests
// =============================================================================
