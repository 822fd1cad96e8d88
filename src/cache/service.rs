//! Cache Service
//!
//! The handle callers hold. Wires the store, engines and loops together,
//! owns the background tasks and the configuration lifecycle.
//!
//! # Background tasks
//!
//! ```text
//! drain      invalidation queue, time rules, expired purge
//! analysis   access log -> patterns -> predicted access
//! telemetry  layer counters -> samples -> smoothed performance
//! optimizer  capacity, strategy tuning, rebalance, proactive eviction
//! prefetch   active strategies -> speculative entries
//! ```
//!
//! Every loop waits on its interval or the shared cancellation token.
//! [`CacheService::stop`] cancels the token and waits for in-flight ticks.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::analyzer::{AccessEvent, AccessPattern, PatternAnalyzer};
use super::compression::{CompressionConfig, CompressionManager};
use super::eviction::{EvictionEngine, EvictionScorer};
use super::invalidation::{
    DrainReport, InvalidateOptions, InvalidationEngine, InvalidationRule, InvalidationSettings,
    RuleContext,
};
use super::layer::{LayerId, LayerRegistry, LayerSnapshot, LayerStatus};
use super::optimizer::{OptimizationReport, Optimizer};
use super::prefetch::{
    PlaceholderSource, PrefetchEngine, PrefetchSettings, PrefetchSource, PrefetchStrategy,
};
use super::store::{CacheHit, SetOptions, SetOutcome, StoreSettings, TieredStore};
use super::telemetry::{AnalyticsSample, GlobalMetrics, Telemetry, TelemetrySettings};
use crate::config::{CacheConfiguration, ConfigPatch};
use crate::error::{Error, Result};
use crate::observability::{events, CacheObserver, TracingObserver};
use crate::persistence::{
    HistoryLog, HistoryRecord, InMemoryPersistence, PersistenceStore, CONFIGURATION_KEY,
    HISTORY_KEY,
};

/// History records kept in memory and persisted
const HISTORY_CAPACITY: usize = 1_000;

/// Read options beyond the layer list
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub layers: Option<Vec<LayerId>>,
    /// Caller identity for transition analysis
    pub actor: Option<String>,
    /// Caller region for spatial analysis
    pub region: Option<String>,
}

impl GetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layers<I, L>(mut self, layers: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<LayerId>,
    {
        self.layers = Some(layers.into_iter().map(Into::into).collect());
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// What [`CacheService::restore`] found in persistence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub configuration: bool,
    pub history_records: usize,
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`CacheService`] with its collaborators
pub struct CacheServiceBuilder {
    config: CacheConfiguration,
    observer: Arc<dyn CacheObserver>,
    persistence: Arc<dyn PersistenceStore>,
    source: Arc<dyn PrefetchSource>,
    scorer: Option<Arc<dyn EvictionScorer>>,
    default_strategies: bool,
}

impl CacheServiceBuilder {
    pub fn new(config: CacheConfiguration) -> Self {
        Self {
            config,
            observer: Arc::new(TracingObserver::new()),
            persistence: Arc::new(InMemoryPersistence::new()),
            source: Arc::new(PlaceholderSource::default()),
            scorer: None,
            default_strategies: true,
        }
    }

    pub fn observer(mut self, observer: Arc<dyn CacheObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn PersistenceStore>) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn prefetch_source(mut self, source: Arc<dyn PrefetchSource>) -> Self {
        self.source = source;
        self
    }

    /// Replace the adaptive eviction scorer
    pub fn scorer(mut self, scorer: Arc<dyn EvictionScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Skip registering the built-in prefetch strategies
    pub fn without_default_strategies(mut self) -> Self {
        self.default_strategies = false;
        self
    }

    pub fn build(self) -> Result<Arc<CacheService>> {
        let config = self.config;
        config.validate()?;
        let observer = self.observer;

        let registry = Arc::new(LayerRegistry::from_config(&config));
        let eviction = match self.scorer {
            Some(scorer) => EvictionEngine::new(scorer),
            None => EvictionEngine::default(),
        };
        let store = Arc::new(TieredStore::new(
            registry.clone(),
            eviction,
            CompressionManager::with_config(CompressionConfig::default()),
            store_settings(&config),
            observer.clone(),
        ));
        let history = Arc::new(HistoryLog::new(HISTORY_CAPACITY));
        let invalidation = Arc::new(InvalidationEngine::new(
            store.clone(),
            InvalidationSettings::from(&config.invalidation),
            history.clone(),
            observer.clone(),
        ));
        let analyzer = Arc::new(PatternAnalyzer::new(config.analysis.max_history, observer.clone()));
        let prefetch = Arc::new(PrefetchEngine::new(
            store.clone(),
            analyzer.clone(),
            self.source,
            PrefetchSettings::from(&config.prefetching),
            observer.clone(),
        ));
        if self.default_strategies {
            for strategy in PrefetchStrategy::defaults(&config.prefetching) {
                prefetch.add_strategy(strategy)?;
            }
        }
        let telemetry = Arc::new(Telemetry::new(
            store.clone(),
            TelemetrySettings::from(&config.monitoring),
        ));
        let optimizer = Arc::new(Optimizer::new(
            store.clone(),
            prefetch.clone(),
            history.clone(),
            &config,
            observer.clone(),
        ));

        info!(layers = registry.len(), "Cache service initialized");
        Ok(Arc::new(CacheService {
            config: RwLock::new(config),
            registry,
            store,
            invalidation,
            analyzer,
            prefetch,
            telemetry,
            optimizer,
            history,
            persistence: self.persistence,
            observer,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            stopping: tokio::sync::Mutex::new(()),
            started: AtomicBool::new(false),
        }))
    }
}

fn store_settings(config: &CacheConfiguration) -> StoreSettings {
    StoreSettings {
        compression_enabled: config.global.compression_enabled,
        eviction_fraction: config.eviction.fraction,
    }
}

// =============================================================================
// Service
// =============================================================================

pub struct CacheService {
    config: RwLock<CacheConfiguration>,
    registry: Arc<LayerRegistry>,
    store: Arc<TieredStore>,
    invalidation: Arc<InvalidationEngine>,
    analyzer: Arc<PatternAnalyzer>,
    prefetch: Arc<PrefetchEngine>,
    telemetry: Arc<Telemetry>,
    optimizer: Arc<Optimizer>,
    history: Arc<HistoryLog>,
    persistence: Arc<dyn PersistenceStore>,
    observer: Arc<dyn CacheObserver>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Held across the join so every `stop` caller waits for it
    stopping: tokio::sync::Mutex<()>,
    started: AtomicBool,
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("store", &self.store)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl CacheService {
    /// Service with default collaborators
    pub fn new(config: CacheConfiguration) -> Result<Arc<Self>> {
        CacheServiceBuilder::new(config).build()
    }

    pub fn builder(config: CacheConfiguration) -> CacheServiceBuilder {
        CacheServiceBuilder::new(config)
    }

    // =========================================================================
    // Foreground Operations
    // =========================================================================

    /// Read a value, probing `layers` in order (all active layers by default)
    pub fn get(&self, key: &str, layers: Option<&[LayerId]>) -> Result<Option<Bytes>> {
        let options = GetOptions {
            layers: layers.map(|l| l.to_vec()),
            ..Default::default()
        };
        Ok(self.get_with(key, &options)?.map(|hit| hit.value))
    }

    /// Read with caller context; returns the full hit record
    pub fn get_with(&self, key: &str, options: &GetOptions) -> Result<Option<CacheHit>> {
        let hit = self.store.get(key, options.layers.as_deref())?;

        let mut event = AccessEvent::new(key, Utc::now(), hit.is_some());
        event.actor = options.actor.clone();
        event.region = options.region.clone();
        if let Some(hit) = &hit {
            event.content_type = Some(hit.content_type.clone());
            if let Some(strategy) = &hit.prefetch_credit {
                self.prefetch.credit(strategy);
            }
        }
        self.analyzer.record(event);
        Ok(hit)
    }

    pub fn set(&self, key: &str, value: impl Into<Bytes>, options: SetOptions) -> Result<SetOutcome> {
        self.store.set(key, value.into(), options)
    }

    /// Invalidate by key, tag or glob. Returns the number of entries
    /// affected; queued invalidations return 0.
    pub fn invalidate<I, S>(&self, patterns: I, options: InvalidateOptions) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        self.invalidation.invalidate(&patterns, options)
    }

    pub fn apply_rule(&self, rule_id: &str, context: &RuleContext) -> usize {
        self.invalidation.apply_rule(rule_id, context)
    }

    /// Apply every event-based rule listening for `event`
    pub fn handle_event(&self, event: &str) -> usize {
        self.invalidation.handle_event(event)
    }

    pub fn add_rule(&self, rule: InvalidationRule) -> Result<()> {
        self.invalidation.add_rule(rule)
    }

    pub fn remove_rule(&self, rule_id: &str) -> Option<InvalidationRule> {
        self.invalidation.remove_rule(rule_id)
    }

    pub fn rules(&self) -> Vec<InvalidationRule> {
        self.invalidation.rules()
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Samples for one layer (or all), optionally only the last `since_ms`
    pub fn get_analytics(&self, layer: Option<&LayerId>, since_ms: Option<u64>) -> Result<Vec<AnalyticsSample>> {
        if let Some(layer) = layer {
            self.registry.require(layer)?;
        }
        let since = since_ms.map(|ms| Utc::now() - ChronoDuration::milliseconds(ms as i64));
        Ok(self.telemetry.analytics(layer, since))
    }

    pub fn get_global_metrics(&self) -> GlobalMetrics {
        self.telemetry.global_metrics()
    }

    pub fn layers(&self) -> Vec<LayerSnapshot> {
        self.registry.ordered().iter().map(|l| l.snapshot()).collect()
    }

    pub fn patterns(&self) -> Vec<AccessPattern> {
        self.analyzer.patterns()
    }

    pub fn history(&self) -> Vec<HistoryRecord> {
        self.history.snapshot()
    }

    pub fn configuration(&self) -> CacheConfiguration {
        self.config.read().clone()
    }

    pub fn store(&self) -> &Arc<TieredStore> {
        &self.store
    }

    pub fn pending_invalidations(&self) -> usize {
        self.invalidation.pending()
    }

    // =========================================================================
    // Operator Controls
    // =========================================================================

    pub fn set_layer_status(&self, layer: &LayerId, status: LayerStatus) -> Result<()> {
        let layer = self.registry.require(layer)?;
        let previous = layer.status();
        layer.set_status(status);
        if previous != status {
            info!(layer = %layer.id(), from = %previous, to = %status, "Layer status changed");
            self.observer.emit(
                events::LAYER_STATUS_CHANGED,
                &[
                    ("layer", layer.id().as_str().into()),
                    ("from", previous.to_string().into()),
                    ("to", status.to_string().into()),
                ],
            );
        }
        Ok(())
    }

    pub fn add_strategy(&self, strategy: PrefetchStrategy) -> Result<()> {
        self.prefetch.add_strategy(strategy)
    }

    pub fn strategies(&self) -> Vec<PrefetchStrategy> {
        self.prefetch.strategies()
    }

    /// Run one registered strategy now
    pub async fn run_prefetch(&self, strategy: &str) -> Result<usize> {
        let strategy = self
            .prefetch
            .strategy(strategy)
            .ok_or_else(|| Error::Internal(format!("unknown prefetch strategy: {}", strategy)))?;
        Ok(self.prefetch.run(&strategy).await)
    }

    pub async fn run_prefetch_cycle(&self) -> usize {
        self.prefetch.run_cycle().await
    }

    pub fn analyze(&self) -> usize {
        self.analyzer.analyze(&self.store)
    }

    pub fn sample(&self) -> Vec<AnalyticsSample> {
        self.telemetry.sample()
    }

    pub fn optimize(&self) -> OptimizationReport {
        self.optimizer.optimize()
    }

    /// One drain tick: queued invalidations, time rules, expired entries
    pub fn drain_invalidations(&self) -> DrainReport {
        let report = self.invalidation.drain();
        let timed = self.invalidation.evaluate_time_rules();
        let purged = self.store.purge_expired();
        if report.processed > 0 || timed > 0 || purged > 0 {
            debug!(
                processed = report.processed,
                dropped = report.dropped,
                timed,
                purged,
                "Invalidation tick"
            );
        }
        report
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Validate and apply a patch. A rejected patch changes nothing.
    #[instrument(skip(self, patch))]
    pub async fn update_configuration(&self, patch: &ConfigPatch) -> Result<()> {
        let next = {
            let mut config = self.config.write();
            let next = config.apply(patch)?;
            self.install(&next);
            *config = next.clone();
            next
        };

        info!(layers = next.layers.len(), "Configuration updated");
        self.observer
            .emit(events::CONFIGURATION_UPDATED, &[("layers", next.layers.len().into())]);
        self.persist_configuration(&next).await;
        Ok(())
    }

    /// Push a validated configuration into every component
    fn install(&self, config: &CacheConfiguration) {
        for removed in self.registry.reconfigure(config) {
            let purged = self.store.purge_layer(removed.id());
            warn!(layer = %removed.id(), purged, "Layer removed from configuration");
        }
        self.store.update_settings(store_settings(config));
        self.shrink_to_capacity();
        self.invalidation
            .update_settings(InvalidationSettings::from(&config.invalidation));
        self.prefetch
            .update_settings(PrefetchSettings::from(&config.prefetching));
        self.telemetry
            .update_settings(TelemetrySettings::from(&config.monitoring));
        self.analyzer.set_max_history(config.analysis.max_history);
        self.optimizer.reconfigure(config);
    }

    /// Evict from every layer left above its write limit by a reconfiguration
    fn shrink_to_capacity(&self) {
        for layer in self.registry.ordered() {
            let limit = (layer.capacity().max_size_bytes as f64 * layer.policy().eviction_threshold) as u64;
            let used = layer.usage().bytes;
            if used <= limit {
                continue;
            }
            match self.store.evict_until(layer.id(), limit) {
                Ok(evicted) => info!(
                    layer = %layer.id(),
                    used,
                    limit,
                    evicted = evicted.len(),
                    "Layer shrunk below its new capacity"
                ),
                Err(e) => warn!(layer = %layer.id(), error = %e, "Failed to shrink layer"),
            }
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    fn persistence_failed(&self, key: &str, error: &Error) {
        warn!(key = %key, error = %error, "Persistence operation failed");
        self.observer.emit(
            events::PERSISTENCE_FAILED,
            &[("key", key.into()), ("error", error.to_string().into())],
        );
    }

    async fn save(&self, key: &str, value: Result<Bytes>) {
        let outcome = match value {
            Ok(value) => self.persistence.save(key, value).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            self.persistence_failed(key, &e);
        }
    }

    async fn persist_configuration(&self, config: &CacheConfiguration) {
        let value = serde_json::to_vec(config).map(Bytes::from).map_err(Error::from);
        self.save(CONFIGURATION_KEY, value).await;
    }

    /// Save the invalidation/optimization history
    pub async fn persist_history(&self) {
        self.save(HISTORY_KEY, self.history.to_bytes()).await;
    }

    /// Load configuration and history saved by an earlier run. Failures are
    /// logged and leave the in-memory state in place.
    pub async fn restore(&self) -> RestoreOutcome {
        let mut outcome = RestoreOutcome::default();

        match self.persistence.load(CONFIGURATION_KEY).await {
            Ok(Some(data)) => {
                let parsed = serde_json::from_slice::<CacheConfiguration>(&data)
                    .map_err(Error::from)
                    .and_then(|config| config.validate().map(|_| config));
                match parsed {
                    Ok(config) => {
                        let mut current = self.config.write();
                        self.install(&config);
                        *current = config;
                        outcome.configuration = true;
                    }
                    Err(e) => self.persistence_failed(CONFIGURATION_KEY, &e),
                }
            }
            Ok(None) => {}
            Err(e) => self.persistence_failed(CONFIGURATION_KEY, &e),
        }

        match self.persistence.load(HISTORY_KEY).await {
            Ok(Some(data)) => match HistoryLog::from_bytes(&data) {
                Ok(records) => {
                    outcome.history_records = records.len();
                    self.history.restore(records);
                }
                Err(e) => self.persistence_failed(HISTORY_KEY, &e),
            },
            Ok(None) => {}
            Err(e) => self.persistence_failed(HISTORY_KEY, &e),
        }

        info!(
            configuration = outcome.configuration,
            history = outcome.history_records,
            "Restored persisted state"
        );
        outcome
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Spawn the background loops. Later calls, and calls after `stop`, do nothing.
    pub fn start(self: &Arc<Self>) {
        if self.is_stopped() || self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.spawn_periodic("invalidation-drain", |c| c.invalidation.drain_interval_ms, |svc| async move {
            svc.drain_invalidations();
        });
        self.spawn_periodic("pattern-analysis", |c| c.analysis.interval_ms, |svc| async move {
            svc.analyze();
        });
        self.spawn_periodic("telemetry", |c| c.monitoring.interval_ms, |svc| async move {
            svc.sample();
        });
        self.spawn_periodic("optimizer", |c| c.optimization.interval_ms, |svc| async move {
            let enabled = svc.config.read().global.ai_optimization;
            if enabled {
                svc.optimize();
                svc.persist_history().await;
            }
        });
        self.spawn_periodic("prefetch", |c| c.prefetching.interval_ms, |svc| async move {
            let enabled = svc.config.read().global.intelligent_prefetching;
            if enabled {
                svc.run_prefetch_cycle().await;
            }
        });

        info!(tasks = self.tasks.lock().len(), "Background tasks started");
    }

    fn spawn_periodic<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        period_ms: fn(&CacheConfiguration) -> u64,
        tick: F,
    ) where
        F: Fn(Arc<CacheService>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let service = Arc::clone(self);
        let token = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            debug!(task = name, "Background task running");
            loop {
                // Re-read so interval changes apply from the next tick
                let wait = Duration::from_millis(period_ms(&service.config.read()).max(1));
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => tick(service.clone()).await,
                }
            }
            debug!(task = name, "Background task stopped");
        });
        self.tasks.lock().push(handle);
    }

    /// Cancel the background loops and wait for in-flight ticks. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let _stopping = self.stopping.lock().await;
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        if handles.is_empty() {
            return;
        }

        info!(tasks = handles.len(), "Stopping background tasks");
        for joined in join_all(handles).await {
            if let Err(e) = joined {
                error!(error = %e, "Background task ended abnormally");
            }
        }
        self.persist_history().await;
        info!("Cache service stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================
