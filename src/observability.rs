//! Observability Hook
//!
//! Components report domain events as an event name plus key/value fields
//! through an injected [`CacheObserver`]. Formatting is left to the observer.

use std::sync::Arc;

use parking_lot::RwLock;
use prometheus::{IntCounterVec, Opts, Registry};
use tracing::{debug, info};

/// Event names emitted by the cache core
pub mod events {
    pub const ENTRY_STORED: &str = "cache.entry_stored";
    pub const ENTRY_EXPIRED: &str = "cache.entry_expired";
    pub const ENTRY_CORRUPTED: &str = "cache.entry_corrupted";
    pub const ENTRY_EVICTED: &str = "cache.entry_evicted";
    pub const ENTRY_INVALIDATED: &str = "cache.entry_invalidated";
    pub const ENTRY_PROMOTED: &str = "cache.entry_promoted";
    pub const WRITE_SKIPPED: &str = "cache.write_skipped";
    pub const COMPRESSION_FALLBACK: &str = "cache.compression_fallback";
    pub const INVALIDATION_QUEUED: &str = "cache.invalidation_queued";
    pub const INVALIDATION_DROPPED: &str = "cache.invalidation_dropped";
    pub const REFRESH_REQUESTED: &str = "cache.refresh_requested";
    pub const PRELOAD_REQUESTED: &str = "cache.preload_requested";
    pub const NOTIFY: &str = "cache.notify";
    pub const PATTERNS_ANALYZED: &str = "cache.patterns_analyzed";
    pub const PREFETCH_COMPLETED: &str = "cache.prefetch_completed";
    pub const PREFETCH_FAILED: &str = "cache.prefetch_failed";
    pub const OPTIMIZATION_APPLIED: &str = "cache.optimization_applied";
    pub const CONFIGURATION_UPDATED: &str = "cache.configuration_updated";
    pub const LAYER_STATUS_CHANGED: &str = "cache.layer_status_changed";
    pub const PERSISTENCE_FAILED: &str = "cache.persistence_failed";
}

/// Field value attached to an event
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    U64(u64),
    F64(f64),
    Bool(bool),
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Str(s) => write!(f, "{}", s),
            FieldValue::U64(v) => write!(f, "{}", v),
            FieldValue::F64(v) => write!(f, "{:.4}", v),
            FieldValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<&String> for FieldValue {
    fn from(v: &String) -> Self {
        FieldValue::Str(v.clone())
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::U64(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::U64(v as u64)
    }
}

impl From<usize> for FieldValue {
    fn from(v: usize) -> Self {
        FieldValue::U64(v as u64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::F64(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

/// Structured event sink injected into every component
pub trait CacheObserver: Send + Sync {
    fn emit(&self, event: &str, fields: &[(&str, FieldValue)]);
}

fn render(fields: &[(&str, FieldValue)]) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Forwards events to `tracing`
#[derive(Debug, Clone, Default)]
pub struct TracingObserver {
    info_level: bool,
}

impl TracingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log events at info level instead of debug
    pub fn info_level() -> Self {
        Self { info_level: true }
    }
}

impl CacheObserver for TracingObserver {
    fn emit(&self, event: &str, fields: &[(&str, FieldValue)]) {
        let fields = render(fields);
        if self.info_level {
            info!(event = %event, fields = %fields, "Cache event");
        } else {
            debug!(event = %event, fields = %fields, "Cache event");
        }
    }
}

/// One captured event
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub name: String,
    pub fields: Vec<(String, FieldValue)>,
}

impl RecordedEvent {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }
}

/// In-memory collector for tests
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: RwLock<Vec<RecordedEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.read().clone()
    }

    pub fn events_named(&self, name: &str) -> Vec<RecordedEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.read().iter().filter(|e| e.name == name).count()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl CacheObserver for RecordingObserver {
    fn emit(&self, event: &str, fields: &[(&str, FieldValue)]) {
        self.events.write().push(RecordedEvent {
            name: event.to_string(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        });
    }
}

/// Counts events per name in a Prometheus registry
pub struct PrometheusObserver {
    events: IntCounterVec,
}

impl PrometheusObserver {
    /// Register the event counter in `registry`
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let events = IntCounterVec::new(
            Opts::new("tiercache_events_total", "Cache domain events by name"),
            &["event"],
        )?;
        registry.register(Box::new(events.clone()))?;
        Ok(Self { events })
    }

    pub fn count(&self, event: &str) -> u64 {
        self.events.with_label_values(&[event]).get()
    }
}

impl std::fmt::Debug for PrometheusObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusObserver").finish()
    }
}

impl CacheObserver for PrometheusObserver {
    fn emit(&self, event: &str, _fields: &[(&str, FieldValue)]) {
        self.events.with_label_values(&[event]).inc();
    }
}

/// Fans every event out to several observers
#[derive(Default)]
pub struct FanoutObserver {
    observers: Vec<Arc<dyn CacheObserver>>,
}

impl FanoutObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(mut self, observer: Arc<dyn CacheObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl std::fmt::Debug for FanoutObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutObserver")
            .field("observer_count", &self.observers.len())
            .finish()
    }
}

impl CacheObserver for FanoutObserver {
    fn emit(&self, event: &str, fields: &[(&str, FieldValue)]) {
        for observer in &self.observers {
            observer.emit(event, fields);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_observer_collects_fields() {
        let observer = RecordingObserver::new();
        observer.emit(
            events::ENTRY_STORED,
            &[("key", "a".into()), ("size", 10u64.into())],
        );
        observer.emit(events::ENTRY_EVICTED, &[("key", "b".into())]);

        assert_eq!(observer.len(), 2);
        assert_eq!(observer.count(events::ENTRY_STORED), 1);
        let stored = &observer.events_named(events::ENTRY_STORED)[0];
        assert_eq!(stored.field("size"), Some(&FieldValue::U64(10)));

        observer.clear();
        assert!(observer.is_empty());
    }

    #[test]
    fn test_prometheus_observer_counts_by_name() {
        let registry = Registry::new();
        let observer = PrometheusObserver::register(&registry).unwrap();
        observer.emit(events::ENTRY_EVICTED, &[]);
        observer.emit(events::ENTRY_EVICTED, &[]);
        assert_eq!(observer.count(events::ENTRY_EVICTED), 2);
        assert_eq!(registry.gather().len(), 1);
    }

    #[test]
    fn test_fanout_reaches_every_observer() {
        let a = Arc::new(RecordingObserver::new());
        let b = Arc::new(RecordingObserver::new());
        let fanout = FanoutObserver::new()
            .with_observer(a.clone())
            .with_observer(b.clone());
        fanout.emit(events::NOTIFY, &[("rule", "r1".into())]);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_field_display() {
        assert_eq!(render(&[("a", 1u64.into()), ("b", true.into())]), "a=1 b=true");
    }
}
