//! Invalidation Engine
//!
//! Retires entries in response to explicit patterns, declared rules and
//! domain events. Immediate invalidations are a barrier for later reads;
//! queued ones are drained FIFO in batches with bounded retries.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::entry::CacheEntry;
use super::layer::LayerId;
use super::store::TieredStore;
use crate::config::InvalidationConfig;
use crate::error::{Error, Result};
use crate::observability::{events, CacheObserver};
use crate::persistence::{HistoryKind, HistoryLog};

/// What fires a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    EventBased,
    TimeBased,
    DependencyBased,
    Cascade,
    Predictive,
}

/// What a matching rule does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Remove matching entries from the scoped layers
    Invalidate,
    /// Mark matching entries stale and ask the external fetcher to refresh
    Refresh,
    /// Ask the external fetcher to preload the matched keys
    Preload,
    /// Emit a notification only
    Notify,
}

/// Hour-of-day window, `start_hour <= h < end_hour`, wrapping past midnight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl TimeWindow {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Match conditions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConditions {
    /// Event names that fire an event-based rule
    pub events: Vec<String>,
    /// Hours in which a time-based rule is live
    pub time_windows: Vec<TimeWindow>,
    /// Entries depending on any of these keys match
    pub dependencies: Vec<String>,
    /// Key globs or tags; empty matches everything in scope
    pub patterns: Vec<String>,
    /// Entries older than this match a time-based rule
    pub max_age_ms: Option<u64>,
    /// Entries whose predicted access falls below this match a predictive rule
    pub min_predicted_access: Option<f64>,
}

/// Where a rule applies. Empty lists are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleScope {
    pub layers: Vec<LayerId>,
    pub regions: Vec<String>,
    /// Exact types, `*`, or `type/*` prefixes
    pub content_types: Vec<String>,
    pub tags: Vec<String>,
}

impl RuleScope {
    fn content_type_matches(&self, content_type: &str) -> bool {
        self.content_types.is_empty()
            || self.content_types.iter().any(|scope| {
                scope == "*"
                    || scope == content_type
                    || scope
                        .strip_suffix("/*")
                        .map_or(false, |prefix| {
                            content_type
                                .split('/')
                                .next()
                                .map_or(false, |t| t == prefix)
                        })
            })
    }

    /// Content type, tags, layers and regions all intersect the scope
    pub fn matches(&self, entry: &CacheEntry) -> bool {
        self.content_type_matches(entry.content_type())
            && (self.tags.is_empty() || self.tags.iter().any(|t| entry.tags.contains(t)))
            && (self.layers.is_empty() || self.layers.iter().any(|l| entry.is_on(l)))
            && (self.regions.is_empty()
                || self
                    .regions
                    .iter()
                    .any(|r| entry.placement.regions.contains(r)))
    }

    fn target_layers(&self) -> Option<&[LayerId]> {
        if self.layers.is_empty() {
            None
        } else {
            Some(self.layers.as_slice())
        }
    }
}

/// Declared invalidation rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationRule {
    pub id: String,
    pub name: String,
    pub trigger: TriggerKind,
    #[serde(default)]
    pub conditions: RuleConditions,
    pub actions: Vec<RuleAction>,
    #[serde(default)]
    pub scope: RuleScope,
    /// Higher fires first
    #[serde(default)]
    pub priority: u8,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Follow dependents of invalidated keys
    #[serde(default)]
    pub cascade: bool,
}

fn default_active() -> bool {
    true
}

impl InvalidationRule {
    pub fn new(id: impl Into<String>, trigger: TriggerKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            trigger,
            conditions: RuleConditions::default(),
            actions: vec![RuleAction::Invalidate],
            scope: RuleScope::default(),
            priority: 0,
            active: true,
            cascade: trigger == TriggerKind::Cascade,
        }
    }

    pub fn on_event(mut self, event: impl Into<String>) -> Self {
        self.conditions.events.push(event.into());
        self
    }

    pub fn with_actions(mut self, actions: Vec<RuleAction>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_scope(mut self, scope: RuleScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_conditions(mut self, conditions: RuleConditions) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Whether the rule is live for this invocation
    fn armed(&self, context: &RuleContext) -> bool {
        if !self.active {
            return false;
        }
        if self.trigger == TriggerKind::EventBased {
            if let Some(event) = &context.event {
                if !self.conditions.events.iter().any(|e| e == event) {
                    return false;
                }
            }
        }
        self.conditions.time_windows.is_empty()
            || self
                .conditions
                .time_windows
                .iter()
                .any(|w| w.contains(context.now.hour()))
    }

    /// Entry-level match: scope plus trigger-specific conditions
    pub fn matches(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        if !self.scope.matches(entry) {
            return false;
        }
        let c = &self.conditions;
        if !c.patterns.is_empty() && !c.patterns.iter().any(|p| pattern_matches(p, entry)) {
            return false;
        }
        if !c.dependencies.is_empty()
            && !c.dependencies.iter().any(|d| entry.dependencies.contains(d))
        {
            return false;
        }
        if let Some(max_age) = c.max_age_ms {
            if (now - entry.timing.created_at).num_milliseconds() < max_age as i64 {
                return false;
            }
        }
        if let Some(floor) = c.min_predicted_access {
            if entry.stats.predicted_future_access >= floor {
                return false;
            }
        }
        true
    }
}

/// Invocation context for [`InvalidationEngine::apply_rule`]
#[derive(Debug, Clone)]
pub struct RuleContext {
    pub event: Option<String>,
    pub now: DateTime<Utc>,
}

impl RuleContext {
    pub fn now() -> Self {
        Self {
            event: None,
            now: Utc::now(),
        }
    }

    pub fn event(name: impl Into<String>) -> Self {
        Self {
            event: Some(name.into()),
            now: Utc::now(),
        }
    }
}

/// Glob with `*` wildcards
pub fn glob_matches(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut rest = text;
    let first = parts[0];
    if !rest.starts_with(first) {
        return false;
    }
    rest = &rest[first.len()..];

    let last = parts[parts.len() - 1];
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

/// A pattern matches its exact key, any tag, or a key glob
pub fn pattern_matches(pattern: &str, entry: &CacheEntry) -> bool {
    entry.key == pattern
        || entry.tags.contains(pattern)
        || (pattern.contains('*') && glob_matches(pattern, &entry.key))
}

// =============================================================================
// Invalidation Queue
// =============================================================================

/// Options for [`InvalidationEngine::invalidate`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidateOptions {
    /// Restrict removal to these layers
    pub layers: Option<Vec<LayerId>>,
    /// Follow dependents of removed keys
    pub cascade: bool,
    /// Run now instead of queueing
    pub immediate: bool,
}

impl Default for InvalidateOptions {
    fn default() -> Self {
        Self {
            layers: None,
            cascade: false,
            immediate: true,
        }
    }
}

impl InvalidateOptions {
    pub fn immediate() -> Self {
        Self::default()
    }

    pub fn queued() -> Self {
        Self {
            immediate: false,
            ..Self::default()
        }
    }

    pub fn cascade(mut self) -> Self {
        self.cascade = true;
        self
    }

    pub fn layers<I, L>(mut self, layers: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<LayerId>,
    {
        self.layers = Some(layers.into_iter().map(Into::into).collect());
        self
    }
}

/// Queued invalidation
#[derive(Debug, Clone)]
pub struct InvalidationJob {
    pub id: Uuid,
    pub patterns: Vec<String>,
    pub options: InvalidateOptions,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Outcome of one drain tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub processed: usize,
    pub affected: usize,
    pub retried: usize,
    pub dropped: usize,
}

/// Runtime knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidationSettings {
    pub batch_size: u32,
    pub retries: u32,
    pub cascade_depth: u32,
}

impl From<&InvalidationConfig> for InvalidationSettings {
    fn from(config: &InvalidationConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            retries: config.retries,
            cascade_depth: config.cascade_depth,
        }
    }
}

// =============================================================================
// Invalidation Engine
// =============================================================================

pub struct InvalidationEngine {
    store: Arc<TieredStore>,
    rules: RwLock<BTreeMap<String, InvalidationRule>>,
    queue: Mutex<VecDeque<InvalidationJob>>,
    settings: RwLock<InvalidationSettings>,
    history: Arc<HistoryLog>,
    observer: Arc<dyn CacheObserver>,
}

impl std::fmt::Debug for InvalidationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationEngine")
            .field("rules", &self.rules.read().len())
            .field("pending", &self.pending())
            .field("settings", &*self.settings.read())
            .finish()
    }
}

impl InvalidationEngine {
    pub fn new(
        store: Arc<TieredStore>,
        settings: InvalidationSettings,
        history: Arc<HistoryLog>,
        observer: Arc<dyn CacheObserver>,
    ) -> Self {
        Self {
            store,
            rules: RwLock::new(BTreeMap::new()),
            queue: Mutex::new(VecDeque::new()),
            settings: RwLock::new(settings),
            history,
            observer,
        }
    }

    pub fn update_settings(&self, settings: InvalidationSettings) {
        *self.settings.write() = settings;
    }

    pub fn settings(&self) -> InvalidationSettings {
        *self.settings.read()
    }

    /// Jobs waiting in the queue
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    // =========================================================================
    // Rules
    // =========================================================================

    pub fn add_rule(&self, rule: InvalidationRule) -> Result<()> {
        if rule.id.is_empty() {
            return Err(Error::InvalidConfiguration("rule id must not be empty".into()));
        }
        if rule.actions.is_empty() {
            return Err(Error::InvalidConfiguration(format!(
                "rule {} declares no actions",
                rule.id
            )));
        }
        for window in &rule.conditions.time_windows {
            if window.start_hour > 23 || window.end_hour > 24 {
                return Err(Error::InvalidConfiguration(format!(
                    "rule {} has an invalid time window",
                    rule.id
                )));
            }
        }
        debug!(rule = %rule.id, trigger = ?rule.trigger, "Registered invalidation rule");
        self.rules.write().insert(rule.id.clone(), rule);
        Ok(())
    }

    pub fn remove_rule(&self, id: &str) -> Option<InvalidationRule> {
        self.rules.write().remove(id)
    }

    pub fn rules(&self) -> Vec<InvalidationRule> {
        self.rules.read().values().cloned().collect()
    }

    // =========================================================================
    // Pattern Invalidation
    // =========================================================================

    /// Invalidate entries matching any of `patterns`. Queued calls return 0.
    pub fn invalidate(&self, patterns: &[String], options: InvalidateOptions) -> Result<usize> {
        if !options.immediate {
            if let Some(layers) = &options.layers {
                for layer in layers {
                    self.store.registry().require(layer)?;
                }
            }

            let job = InvalidationJob {
                id: Uuid::new_v4(),
                patterns: patterns.to_vec(),
                options,
                attempts: 0,
                enqueued_at: Utc::now(),
            };
            self.observer.emit(
                events::INVALIDATION_QUEUED,
                &[("job", job.id.to_string().into()), ("patterns", job.patterns.len().into())],
            );
            self.queue.lock().push_back(job);
            return Ok(0);
        }

        self.execute(patterns, &options)
    }

    fn execute(&self, patterns: &[String], options: &InvalidateOptions) -> Result<usize> {
        if let Some(layers) = &options.layers {
            for layer in layers {
                self.store.registry().require(layer)?;
            }
        }
        let layers = options.layers.as_deref();
        let keys: Vec<String> = self.store.inspect(|store| {
            store
                .iter()
                .filter(|(_, e)| patterns.iter().any(|p| pattern_matches(p, e)))
                .filter(|(_, e)| layers.map_or(true, |ls| ls.iter().any(|l| e.is_on(l))))
                .map(|(_, e)| e.key.clone())
                .collect()
        });

        let mut affected = self.remove_keys(&keys, layers, "pattern");
        if options.cascade {
            let mut roots: Vec<String> = patterns.to_vec();
            roots.extend(keys);
            affected += self.cascade_from(roots, layers);
        }

        let subject = patterns.join(",");
        self.history
            .record(HistoryKind::Invalidation, &subject, "pattern", affected as u64);
        info!(patterns = %subject, affected = affected, cascade = options.cascade, "Invalidated entries");
        Ok(affected)
    }

    fn remove_keys(&self, keys: &[String], layers: Option<&[LayerId]>, reason: &str) -> usize {
        let mut affected = 0;
        for key in keys {
            let outcome = self.store.remove_key(key, layers);
            if outcome.is_empty() {
                continue;
            }
            affected += 1;
            for layer_id in &outcome.layers {
                if let Some(layer) = self.store.registry().get(layer_id) {
                    layer.counters().record_invalidation();
                }
            }
            self.observer.emit(
                events::ENTRY_INVALIDATED,
                &[
                    ("key", key.into()),
                    ("layers", outcome.layers.len().into()),
                    ("deleted", outcome.deleted.into()),
                    ("reason", reason.into()),
                ],
            );
        }
        affected
    }

    /// Remove dependents of `roots`, `cascade_depth` hops deep
    fn cascade_from(&self, roots: Vec<String>, layers: Option<&[LayerId]>) -> usize {
        let depth = self.settings().cascade_depth;
        let mut visited: HashSet<String> = roots.iter().cloned().collect();
        let mut frontier = roots;
        let mut affected = 0;

        for _ in 0..depth {
            let next: Vec<String> = self.store.inspect(|store| {
                frontier
                    .iter()
                    .flat_map(|key| store.dependents_of(key))
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .filter(|key| !visited.contains(key))
                    .collect()
            });
            if next.is_empty() {
                break;
            }
            visited.extend(next.iter().cloned());
            affected += self.remove_keys(&next, layers, "cascade");
            frontier = next;
        }
        affected
    }

    // =========================================================================
    // Rule Application
    // =========================================================================

    /// Apply one rule. Unknown or inactive rules affect nothing.
    pub fn apply_rule(&self, rule_id: &str, context: &RuleContext) -> usize {
        let rule = match self.rules.read().get(rule_id) {
            Some(rule) => rule.clone(),
            None => {
                warn!(rule = %rule_id, "Unknown invalidation rule");
                return 0;
            }
        };
        if !rule.armed(context) {
            return 0;
        }

        let keys: Vec<String> = self.store.inspect(|store| {
            store
                .iter()
                .filter(|(_, e)| rule.matches(e, context.now))
                .map(|(_, e)| e.key.clone())
                .collect()
        });

        let mut affected = 0;
        for action in &rule.actions {
            match action {
                RuleAction::Invalidate => {
                    affected += self.remove_keys(&keys, rule.scope.target_layers(), &rule.id);
                    if rule.cascade || rule.trigger == TriggerKind::Cascade {
                        affected += self.cascade_from(keys.clone(), rule.scope.target_layers());
                    }
                }
                RuleAction::Refresh => {
                    let now = context.now;
                    let refreshed = self.store.update_entries(|store| {
                        let mut n = 0;
                        for key in &keys {
                            if let Some(entry) = store.get_by_key_mut(key) {
                                entry.expire_now(now);
                                n += 1;
                            }
                        }
                        n
                    });
                    for key in &keys {
                        self.observer.emit(
                            events::REFRESH_REQUESTED,
                            &[("key", key.into()), ("rule", rule.id.as_str().into())],
                        );
                    }
                    affected += refreshed;
                }
                RuleAction::Preload => self.observer.emit(
                    events::PRELOAD_REQUESTED,
                    &[("rule", rule.id.as_str().into()), ("keys", keys.len().into())],
                ),
                RuleAction::Notify => self.observer.emit(
                    events::NOTIFY,
                    &[("rule", rule.id.as_str().into()), ("keys", keys.len().into())],
                ),
            }
        }

        if affected > 0 {
            self.history
                .record(HistoryKind::Invalidation, &rule.id, "rule", affected as u64);
        }
        debug!(rule = %rule.id, matched = keys.len(), affected = affected, "Applied invalidation rule");
        affected
    }

    fn rules_by_priority(&self, filter: impl Fn(&InvalidationRule) -> bool) -> Vec<String> {
        let mut rules: Vec<(u8, String)> = self
            .rules
            .read()
            .values()
            .filter(|r| r.active && filter(r))
            .map(|r| (r.priority, r.id.clone()))
            .collect();
        rules.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        rules.into_iter().map(|(_, id)| id).collect()
    }

    /// Apply every event-based rule listening for `event`
    pub fn handle_event(&self, event: &str) -> usize {
        let context = RuleContext::event(event);
        self.rules_by_priority(|r| {
            r.trigger == TriggerKind::EventBased && r.conditions.events.iter().any(|e| e == event)
        })
        .iter()
        .map(|id| self.apply_rule(id, &context))
        .sum()
    }

    /// Apply every time-based rule whose window is open
    pub fn evaluate_time_rules(&self) -> usize {
        let context = RuleContext::now();
        self.rules_by_priority(|r| r.trigger == TriggerKind::TimeBased)
            .iter()
            .map(|id| self.apply_rule(id, &context))
            .sum()
    }

    // =========================================================================
    // Queue Drain
    // =========================================================================

    /// Process up to `batch_size` queued jobs in FIFO order
    pub fn drain(&self) -> DrainReport {
        let settings = self.settings();
        let batch: Vec<InvalidationJob> = {
            let mut queue = self.queue.lock();
            let n = (settings.batch_size as usize).min(queue.len());
            queue.drain(..n).collect()
        };

        let mut report = DrainReport::default();
        let mut retry = Vec::new();
        for mut job in batch {
            report.processed += 1;
            match self.execute(&job.patterns, &job.options) {
                Ok(affected) => report.affected += affected,
                Err(e) => {
                    job.attempts += 1;
                    if job.attempts > settings.retries {
                        warn!(job = %job.id, attempts = job.attempts, error = %e, "Dropping invalidation job");
                        self.observer.emit(
                            events::INVALIDATION_DROPPED,
                            &[("job", job.id.to_string().into()), ("error", e.to_string().into())],
                        );
                        report.dropped += 1;
                    } else {
                        debug!(job = %job.id, attempts = job.attempts, error = %e, "Retrying invalidation job");
                        report.retried += 1;
                        retry.push(job);
                    }
                }
            }
        }

        // Retried jobs keep their place ahead of newer work
        if !retry.is_empty() {
            let mut queue = self.queue.lock();
            for job in retry.into_iter().rev() {
                queue.push_front(job);
            }
        }
        report
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::compression::CompressionManager;
    use crate::cache::eviction::EvictionEngine;
    use crate::cache::layer::{LayerRegistry, StorageKind};
    use crate::cache::store::{SetOptions, StoreSettings};
    use crate::config::{CacheConfiguration, LayerConfig};
    use crate::observability::RecordingObserver;
    use bytes::Bytes;

    struct Fixture {
        store: Arc<TieredStore>,
        engine: InvalidationEngine,
        observer: Arc<RecordingObserver>,
        config: CacheConfiguration,
    }

    fn fixture() -> Fixture {
        let config = CacheConfiguration::with_layers(vec![
            LayerConfig::new("fast", 0, StorageKind::Memory, 10_000),
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
        let engine = InvalidationEngine::new(
            store.clone(),
            InvalidationSettings::from(&config.invalidation),
            Arc::new(HistoryLog::new(100)),
            observer.clone(),
        );
        Fixture {
            store,
            engine,
            observer,
            config,
        }
    }

    fn put(store: &TieredStore, key: &str, options: SetOptions) {
        store
            .set(key, Bytes::from_static(b"payload"), options.compress(false))
            .unwrap();
    }

    fn pats(p: &[&str]) -> Vec<String> {
        p.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_glob_matching() {
        assert!(glob_matches("user:*", "user:42"));
        assert!(glob_matches("*:profile", "user:profile"));
        assert!(glob_matches("a*c*e", "abcde"));
        assert!(glob_matches("*", "anything"));
        assert!(!glob_matches("user:*", "session:1"));
        assert!(!glob_matches("a*b", "ab-c"));
        assert!(glob_matches("exact", "exact"));
        assert!(!glob_matches("exact", "exactly"));
    }

    #[test]
    fn test_invalidate_by_tag_only_touches_requested_layers() {
        let f = fixture();
        put(&f.store, "a", SetOptions::new().tag("news"));
        put(&f.store, "b", SetOptions::new().tag("news"));
        put(&f.store, "c", SetOptions::new().tag("sports"));

        let affected = f
            .engine
            .invalidate(&pats(&["news"]), InvalidateOptions::immediate().layers(["fast"]))
            .unwrap();
        assert_eq!(affected, 2);

        let fast = [LayerId::from("fast")];
        assert!(f.store.get("a", Some(&fast)).unwrap().is_none());
        assert!(f.store.get("c", Some(&fast)).unwrap().is_some());
        // Still held by the slow layer
        assert_eq!(f.store.get("a", None).unwrap().unwrap().layer.as_str(), "slow");
        assert_eq!(f.observer.count(events::ENTRY_INVALIDATED), 2);
    }

    #[test]
    fn test_invalidating_absent_key_is_noop() {
        let f = fixture();
        assert_eq!(
            f.engine
                .invalidate(&pats(&["ghost"]), InvalidateOptions::immediate())
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_cascade_is_single_hop_by_default() {
        let f = fixture();
        put(&f.store, "c", SetOptions::new());
        put(&f.store, "b", SetOptions::new());
        put(&f.store, "a", SetOptions::new().depends_on("b"));
        put(&f.store, "z", SetOptions::new().depends_on("a"));

        let affected = f
            .engine
            .invalidate(&pats(&["b"]), InvalidateOptions::immediate().cascade())
            .unwrap();
        assert_eq!(affected, 2);
        assert!(!f.store.contains("a"));
        assert!(!f.store.contains("b"));
        assert!(f.store.contains("z"));
        assert!(f.store.contains("c"));
    }

    #[test]
    fn test_cascade_depth_is_configurable() {
        let f = fixture();
        f.engine.update_settings(InvalidationSettings {
            cascade_depth: 2,
            ..InvalidationSettings::from(&f.config.invalidation)
        });
        put(&f.store, "b", SetOptions::new());
        put(&f.store, "a", SetOptions::new().depends_on("b"));
        put(&f.store, "z", SetOptions::new().depends_on("a"));

        let affected = f
            .engine
            .invalidate(&pats(&["b"]), InvalidateOptions::immediate().cascade())
            .unwrap();
        assert_eq!(affected, 3);
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_queued_invalidation_drains_fifo() {
        let f = fixture();
        put(&f.store, "k1", SetOptions::new());
        put(&f.store, "k2", SetOptions::new());

        assert_eq!(
            f.engine
                .invalidate(&pats(&["k1"]), InvalidateOptions::queued())
                .unwrap(),
            0
        );
        f.engine
            .invalidate(&pats(&["k2"]), InvalidateOptions::queued())
            .unwrap();
        assert_eq!(f.engine.pending(), 2);
        assert!(f.store.contains("k1"));

        f.engine.update_settings(InvalidationSettings {
            batch_size: 1,
            ..f.engine.settings()
        });
        let report = f.engine.drain();
        assert_eq!(report.processed, 1);
        assert!(!f.store.contains("k1"));
        assert!(f.store.contains("k2"));

        f.engine.drain();
        assert!(!f.store.contains("k2"));
        assert_eq!(f.engine.pending(), 0);
    }

    #[test]
    fn test_failing_job_is_dropped_after_retries() {
        let f = fixture();
        f.engine.queue.lock().push_back(InvalidationJob {
            id: Uuid::new_v4(),
            patterns: pats(&["k"]),
            options: InvalidateOptions::queued().layers(["gone"]),
            attempts: 0,
            enqueued_at: Utc::now(),
        });

        // One initial attempt plus `retries` re-attempts
        let retries = f.engine.settings().retries;
        for _ in 0..retries {
            let report = f.engine.drain();
            assert_eq!(report.retried, 1);
            assert_eq!(report.dropped, 0);
            assert_eq!(f.engine.pending(), 1);
        }
        let last = f.engine.drain();
        assert_eq!(last.dropped, 1);
        assert_eq!(f.engine.pending(), 0);
        assert_eq!(f.observer.count(events::INVALIDATION_DROPPED), 1);
    }

    #[test]
    fn test_single_retry_setting_reattempts_once() {
        let f = fixture();
        f.engine.update_settings(InvalidationSettings {
            retries: 1,
            ..f.engine.settings()
        });
        f.engine.queue.lock().push_back(InvalidationJob {
            id: Uuid::new_v4(),
            patterns: pats(&["k"]),
            options: InvalidateOptions::queued().layers(["gone"]),
            attempts: 0,
            enqueued_at: Utc::now(),
        });

        assert_eq!(f.engine.drain().retried, 1);
        assert_eq!(f.engine.drain().dropped, 1);
    }

    #[test]
    fn test_retried_job_keeps_queue_position() {
        let f = fixture();
        put(&f.store, "later", SetOptions::new());
        let failing = Uuid::new_v4();
        f.engine.queue.lock().push_back(InvalidationJob {
            id: failing,
            patterns: pats(&["k"]),
            options: InvalidateOptions::queued().layers(["gone"]),
            attempts: 0,
            enqueued_at: Utc::now(),
        });
        f.engine
            .invalidate(&pats(&["later"]), InvalidateOptions::queued())
            .unwrap();
        f.engine.update_settings(InvalidationSettings {
            batch_size: 1,
            ..f.engine.settings()
        });

        let report = f.engine.drain();
        assert_eq!(report.retried, 1);
        assert_eq!(f.engine.queue.lock().front().map(|j| j.id), Some(failing));
        assert!(f.store.contains("later"));
    }

    #[test]
    fn test_event_rule_scoped_by_content_type() {
        let f = fixture();
        put(&f.store, "img", SetOptions::new().content_type("image/png").tag("feed"));
        put(&f.store, "doc", SetOptions::new().content_type("text/html").tag("feed"));

        let rule = InvalidationRule::new("images", TriggerKind::EventBased)
            .on_event("feed.updated")
            .with_scope(RuleScope {
                content_types: vec!["image/*".into()],
                tags: vec!["feed".into()],
                ..Default::default()
            });
        f.engine.add_rule(rule).unwrap();

        assert_eq!(f.engine.handle_event("other.event"), 0);
        assert_eq!(f.engine.handle_event("feed.updated"), 1);
        assert!(!f.store.contains("img"));
        assert!(f.store.contains("doc"));
    }

    #[test]
    fn test_refresh_rule_marks_entries_stale() {
        let f = fixture();
        put(&f.store, "k", SetOptions::new().tag("prices"));
        let rule = InvalidationRule::new("refresh", TriggerKind::EventBased)
            .on_event("prices.changed")
            .with_actions(vec![RuleAction::Refresh, RuleAction::Notify])
            .with_scope(RuleScope {
                tags: vec!["prices".into()],
                ..Default::default()
            });
        f.engine.add_rule(rule).unwrap();

        assert_eq!(f.engine.handle_event("prices.changed"), 1);
        assert_eq!(f.observer.count(events::REFRESH_REQUESTED), 1);
        assert_eq!(f.observer.count(events::NOTIFY), 1);
        assert!(f.store.get("k", None).unwrap().is_none());
    }

    #[test]
    fn test_dependency_rule() {
        let f = fixture();
        put(&f.store, "user:1", SetOptions::new());
        put(&f.store, "feed:1", SetOptions::new().depends_on("user:1"));
        let rule = InvalidationRule::new("deps", TriggerKind::DependencyBased).with_conditions(
            RuleConditions {
                dependencies: vec!["user:1".into()],
                ..Default::default()
            },
        );
        f.engine.add_rule(rule).unwrap();
        assert_eq!(f.engine.apply_rule("deps", &RuleContext::now()), 1);
        assert!(f.store.contains("user:1"));
        assert!(!f.store.contains("feed:1"));
    }

    #[test]
    fn test_time_rule_with_age_threshold() {
        let f = fixture();
        put(&f.store, "k", SetOptions::new());
        let rule = InvalidationRule::new("old", TriggerKind::TimeBased).with_conditions(
            RuleConditions {
                max_age_ms: Some(0),
                time_windows: vec![TimeWindow {
                    start_hour: 0,
                    end_hour: 24,
                }],
                ..Default::default()
            },
        );
        f.engine.add_rule(rule).unwrap();
        assert_eq!(f.engine.evaluate_time_rules(), 1);
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_inactive_and_unknown_rules() {
        let f = fixture();
        put(&f.store, "k", SetOptions::new());
        let mut rule = InvalidationRule::new("off", TriggerKind::Predictive);
        rule.active = false;
        f.engine.add_rule(rule).unwrap();
        assert_eq!(f.engine.apply_rule("off", &RuleContext::now()), 0);
        assert_eq!(f.engine.apply_rule("missing", &RuleContext::now()), 0);
        assert!(f.engine.remove_rule("off").is_some());
        assert!(f.engine.rules().is_empty());
    }

    #[test]
    fn test_invalid_rule_rejected() {
        let f = fixture();
        let rule = InvalidationRule::new("", TriggerKind::EventBased);
        assert!(f.engine.add_rule(rule).is_err());
        let rule = InvalidationRule::new("x", TriggerKind::EventBased).with_actions(vec![]);
        assert!(f.engine.add_rule(rule).is_err());
    }

    #[test]
    fn test_time_window_wraps_midnight() {
        let w = TimeWindow {
            start_hour: 22,
            end_hour: 2,
        };
        assert!(w.contains(23));
        assert!(w.contains(1));
        assert!(!w.contains(12));
    }
}
