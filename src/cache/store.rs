//! Tiered Entry Store
//!
//! Placement and capacity accounting across the layer registry. Reads probe
//! layers in order; writes charge every target layer, evicting synchronously
//! when a layer would go over its threshold.
//!
//! # Lock order
//!
//! Layer usage locks are taken in rank order, then the entry store lock.
//! Membership of layer `L` in an entry's placement, and `L`'s usage, only
//! change while `L`'s usage lock is held.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{MutexGuard, RwLock};
use tracing::{debug, warn};

use super::arena::{EntryId, EntryStore};
use super::compression::{CompressionAlgorithm, CompressionManager};
use super::entry::{checksum, CacheEntry, EntryValue};
use super::eviction::{EvictionEngine, DEFAULT_EVICTION_FRACTION};
use super::layer::{CacheLayer, LayerId, LayerRegistry, LayerUsage};
use super::DEFAULT_CONTENT_TYPE;
use crate::error::{Error, Result};
use crate::observability::{events, CacheObserver};

/// Options accepted by [`TieredStore::set`]
#[derive(Debug, Clone)]
pub struct SetOptions {
    /// Entry TTL; defaults to the first target layer's TTL
    pub ttl: Option<Duration>,
    /// Target layers; defaults to every active layer
    pub layers: Option<Vec<LayerId>>,
    pub content_type: Option<String>,
    pub tags: Vec<String>,
    /// Keys whose invalidation cascades to this entry
    pub dependencies: Vec<String>,
    /// Allow compression when the target layers enable it
    pub compress: bool,
    pub regions: Vec<String>,
    /// Leave a live entry under the key untouched
    pub if_absent: bool,
    pub(crate) prefetched_by: Option<String>,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            layers: None,
            content_type: None,
            tags: Vec::new(),
            dependencies: Vec::new(),
            compress: true,
            regions: Vec::new(),
            if_absent: false,
            prefetched_by: None,
        }
    }
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn ttl_ms(self, ttl_ms: u64) -> Self {
        self.ttl(Duration::from_millis(ttl_ms))
    }

    pub fn layers<I, L>(mut self, layers: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<LayerId>,
    {
        self.layers = Some(layers.into_iter().map(Into::into).collect());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.dependencies.push(key.into());
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.regions.push(region.into());
        self
    }

    pub fn if_absent(mut self) -> Self {
        self.if_absent = true;
        self
    }
}

/// Result of a write
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOutcome {
    pub id: Option<EntryId>,
    /// Layers now holding the entry
    pub layers: Vec<LayerId>,
    /// Target layers the entry did not fit on
    pub skipped: Vec<LayerId>,
    /// Entries evicted to make room, as (layer, key)
    pub evicted: Vec<(LayerId, String)>,
    pub version: u32,
    pub size: u64,
    pub compressed: bool,
    /// An `if_absent` write found a live entry and stored nothing
    pub existing: bool,
}

impl SetOutcome {
    pub fn stored(&self) -> bool {
        self.id.is_some()
    }
}

/// Result of a layer removal
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoveOutcome {
    pub key: Option<String>,
    /// Layers the entry was removed from
    pub layers: Vec<LayerId>,
    /// The entry left the store entirely
    pub deleted: bool,
}

impl RemoveOutcome {
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// A satisfied read
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    /// Decoded payload
    pub value: Bytes,
    pub layer: LayerId,
    pub content_type: String,
    pub version: u32,
    /// Strategy credited when this was the first read of a prefetched entry
    pub prefetch_credit: Option<String>,
}

/// Runtime knobs the service can change without rebuilding the store
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSettings {
    pub compression_enabled: bool,
    pub eviction_fraction: f64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            compression_enabled: true,
            eviction_fraction: DEFAULT_EVICTION_FRACTION,
        }
    }
}

enum Lookup {
    Absent,
    Expired,
    Hit {
        id: EntryId,
        index: usize,
        value: EntryValue,
    },
}

/// Drop layers with a duplicate id and order by rank
fn lock_order(layers: &mut Vec<Arc<CacheLayer>>) {
    layers.sort_by(|a, b| a.rank().cmp(&b.rank()).then_with(|| a.id().cmp(b.id())));
    layers.dedup_by(|a, b| a.id() == b.id());
}

/// Take `layer` off an entry's placement and release its credit. Deletes the
/// entry once no layer holds it. Returns `(key, deleted)`.
fn detach(
    store: &mut EntryStore,
    id: EntryId,
    layer: &LayerId,
    usage: &mut LayerUsage,
) -> Option<(String, bool)> {
    let entry = store.get_mut(id)?;
    if !entry.placement.layers.remove(layer) {
        return None;
    }
    usage.release(entry.size);
    entry.placement.replicas = entry.placement.layers.len() as u32;
    if entry.placement.primary_layer.as_ref() == Some(layer) {
        entry.placement.primary_layer = entry.placement.layers.iter().next().cloned();
    }
    let key = entry.key.clone();
    if entry.placement.layers.is_empty() {
        store.remove(id);
        Some((key, true))
    } else {
        Some((key, false))
    }
}

/// Multi-layer entry store
pub struct TieredStore {
    registry: Arc<LayerRegistry>,
    entries: RwLock<EntryStore>,
    eviction: EvictionEngine,
    compression: CompressionManager,
    settings: RwLock<StoreSettings>,
    observer: Arc<dyn CacheObserver>,
}

impl std::fmt::Debug for TieredStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredStore")
            .field("layers", &self.registry.len())
            .field("entries", &self.len())
            .field("eviction", &self.eviction)
            .finish()
    }
}

impl TieredStore {
    pub fn new(
        registry: Arc<LayerRegistry>,
        eviction: EvictionEngine,
        compression: CompressionManager,
        settings: StoreSettings,
        observer: Arc<dyn CacheObserver>,
    ) -> Self {
        Self {
            registry,
            entries: RwLock::new(EntryStore::new()),
            eviction,
            compression,
            settings: RwLock::new(settings),
            observer,
        }
    }

    pub fn registry(&self) -> &Arc<LayerRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> StoreSettings {
        self.settings.read().clone()
    }

    pub fn update_settings(&self, settings: StoreSettings) {
        *self.settings.write() = settings;
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// True when a non-expired entry exists for `key`
    pub fn contains(&self, key: &str) -> bool {
        let now = Utc::now();
        self.entries
            .read()
            .get_by_key(key)
            .map(|(_, e)| !e.is_expired(now))
            .unwrap_or(false)
    }

    /// Clone of the entry record, payload included
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().get_by_key(key).map(|(_, e)| e.clone())
    }

    /// Read-only access to the entry map
    pub fn inspect<R>(&self, f: impl FnOnce(&EntryStore) -> R) -> R {
        f(&self.entries.read())
    }

    /// Mutate entry statistics or timing. Placement must not change here.
    pub(crate) fn update_entries<R>(&self, f: impl FnOnce(&mut EntryStore) -> R) -> R {
        f(&mut self.entries.write())
    }

    /// Resolve a caller layer list (or all active layers) to usable layers
    fn resolve_layers(&self, requested: Option<&[LayerId]>) -> Result<Vec<Arc<CacheLayer>>> {
        let ids = match requested {
            None | Some([]) => return Ok(self.registry.active()),
            Some(ids) => ids,
        };

        let mut usable: Vec<Arc<CacheLayer>> = Vec::with_capacity(ids.len());
        let mut first_unusable: Option<Arc<CacheLayer>> = None;
        for id in ids {
            let layer = self.registry.require(id)?;
            if !layer.is_available() {
                first_unusable.get_or_insert(layer);
            } else if !usable.iter().any(|l| l.id() == layer.id()) {
                usable.push(layer);
            }
        }

        match (usable.is_empty(), first_unusable) {
            (true, Some(layer)) => Err(Error::LayerUnavailable {
                layer: layer.id().to_string(),
                status: layer.status().to_string(),
            }),
            _ => Ok(usable),
        }
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Probe layers in order and return the first live copy
    pub fn get(&self, key: &str, layers: Option<&[LayerId]>) -> Result<Option<CacheHit>> {
        let started = Instant::now();
        let probes = self.resolve_layers(layers)?;
        let now = Utc::now();

        // Shared lock for the lookup; hit stats are recorded after decoding
        let lookup = {
            let store = self.entries.read();
            match store.get_by_key(key) {
                None => Lookup::Absent,
                Some((_, entry)) if entry.is_expired(now) => Lookup::Expired,
                Some((id, entry)) => match probes.iter().position(|l| entry.is_on(l.id())) {
                    None => Lookup::Absent,
                    Some(index) => Lookup::Hit {
                        id,
                        index,
                        value: entry.value.clone(),
                    },
                },
            }
        };

        match lookup {
            Lookup::Absent => {
                probes.iter().for_each(|l| l.counters().record_miss());
                Ok(None)
            }
            Lookup::Expired => {
                probes.iter().for_each(|l| l.counters().record_miss());
                self.remove_key(key, None);
                self.observer
                    .emit(events::ENTRY_EXPIRED, &[("key", key.into())]);
                Ok(None)
            }
            Lookup::Hit { id, index, value } => {
                probes[..index]
                    .iter()
                    .for_each(|l| l.counters().record_miss());
                let layer = &probes[index];

                let decoded = match self.compression.decompress(&value.data, value.encoding) {
                    Ok(decoded) if checksum(&decoded) == value.checksum => decoded,
                    outcome => {
                        let reason = match outcome {
                            Err(e) => e.to_string(),
                            Ok(_) => "checksum mismatch".to_string(),
                        };
                        warn!(key = %key, layer = %layer.id(), reason = %reason, "Dropping unreadable entry");
                        layer.counters().record_error();
                        self.remove_key(key, None);
                        self.observer.emit(
                            events::ENTRY_CORRUPTED,
                            &[("key", key.into()), ("reason", reason.into())],
                        );
                        return Ok(None);
                    }
                };

                // A concurrent overwrite bumps the generation and gets no credit
                let credit = self
                    .entries
                    .write()
                    .get_mut(id)
                    .and_then(|entry| entry.record_hit(now));
                layer
                    .counters()
                    .record_hit(decoded.len() as u64, started.elapsed());
                Ok(Some(CacheHit {
                    value: decoded,
                    layer: layer.id().clone(),
                    content_type: value.content_type,
                    version: value.version,
                    prefetch_credit: credit,
                }))
            }
        }
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Store `value` under `key` on every target layer
    pub fn set(&self, key: &str, value: Bytes, options: SetOptions) -> Result<SetOutcome> {
        let started = Instant::now();
        let mut targets = self.resolve_layers(options.layers.as_deref())?;
        lock_order(&mut targets);
        if targets.is_empty() {
            warn!(key = %key, "No active layer accepts writes");
            self.observer.emit(
                events::WRITE_SKIPPED,
                &[("key", key.into()), ("reason", "no_active_layer".into())],
            );
            return Ok(SetOutcome::default());
        }

        let settings = self.settings();
        let original_size = value.len() as u64;
        let digest = checksum(&value);
        let compress = options.compress
            && settings.compression_enabled
            && targets.iter().any(|l| l.policy().compression_enabled);
        let (data, encoding) = if compress {
            let outcome = self.compression.compress(&value);
            if outcome.fell_back {
                self.observer
                    .emit(events::COMPRESSION_FALLBACK, &[("key", key.into())]);
            }
            (outcome.data, outcome.algorithm)
        } else {
            (value, CompressionAlgorithm::None)
        };
        let size = data.len() as u64;
        let ttl = options
            .ttl
            .or_else(|| Some(targets[0].capacity().default_ttl))
            .filter(|ttl| !ttl.is_zero());

        loop {
            let previous: BTreeSet<LayerId> = self
                .entries
                .read()
                .get_by_key(key)
                .map(|(_, e)| e.placement.layers.clone())
                .unwrap_or_default();

            let mut locked = targets.clone();
            locked.extend(previous.iter().filter_map(|id| self.registry.get(id)));
            lock_order(&mut locked);

            let mut guards: Vec<MutexGuard<'_, LayerUsage>> =
                locked.iter().map(|l| l.lock_usage()).collect();
            let mut store = self.entries.write();

            let current = store
                .get_by_key(key)
                .map(|(_, e)| e.placement.layers.clone())
                .unwrap_or_default();
            if current != previous {
                // Placement moved between the probe and the lock; retry
                continue;
            }

            let now = Utc::now();
            if options.if_absent
                && store
                    .get_by_key(key)
                    .is_some_and(|(_, e)| !e.is_expired(now))
            {
                drop(store);
                drop(guards);
                debug!(key = %key, "Key already present; write skipped");
                return Ok(SetOutcome {
                    existing: true,
                    ..Default::default()
                });
            }

            let prior = store.id_of(key).and_then(|id| store.remove(id));
            if let Some(prior) = &prior {
                for layer_id in &prior.placement.layers {
                    if let Some(i) = locked.iter().position(|l| l.id() == layer_id) {
                        guards[i].release(prior.size);
                    }
                }
            }

            let mut entry = self.build_entry(key, data.clone(), encoding, digest, original_size, ttl, &options, now);
            if let Some(prior) = &prior {
                entry.value.version = prior.value.version.wrapping_add(1);
                entry.timing.created_at = prior.timing.created_at;
                entry.stats = prior.stats.clone();
            }

            let mut outcome = SetOutcome {
                version: entry.value.version,
                size,
                compressed: entry.flags.compressed,
                ..Default::default()
            };

            for layer in &targets {
                let Some(i) = locked.iter().position(|l| l.id() == layer.id()) else {
                    continue;
                };
                if self.make_room(&mut store, layer, &mut guards[i], size, settings.eviction_fraction, now, &mut outcome.evicted) {
                    guards[i].charge(size);
                    entry.placement.layers.insert(layer.id().clone());
                    entry
                        .placement
                        .primary_layer
                        .get_or_insert_with(|| layer.id().clone());
                    outcome.layers.push(layer.id().clone());
                } else {
                    outcome.skipped.push(layer.id().clone());
                }
            }

            entry.placement.replicas = entry.placement.layers.len() as u32;
            if !entry.placement.layers.is_empty() {
                outcome.id = Some(store.insert(entry));
            }

            drop(store);
            drop(guards);

            self.report_write(key, &outcome, &targets, started.elapsed());
            return Ok(outcome);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_entry(
        &self,
        key: &str,
        data: Bytes,
        encoding: CompressionAlgorithm,
        digest: u64,
        original_size: u64,
        ttl: Option<Duration>,
        options: &SetOptions,
        now: DateTime<Utc>,
    ) -> CacheEntry {
        let value = EntryValue {
            data,
            content_type: options
                .content_type
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            encoding,
            checksum: digest,
            version: 1,
        };
        let mut entry = CacheEntry::new(key, value, original_size, ttl, now);
        entry.tags = options.tags.iter().cloned().collect();
        entry.dependencies = options.dependencies.iter().cloned().collect();
        entry.invalidation.cascading = !entry.dependencies.is_empty();
        entry.placement.regions = options.regions.clone();
        if let Some(strategy) = &options.prefetched_by {
            entry.flags.prefetched = true;
            entry.flags.prefetch_strategy = Some(strategy.clone());
        }
        entry
    }

    /// Evict from `layer` until `size` more bytes fit under its threshold.
    /// Returns false when the entry cannot fit.
    #[allow(clippy::too_many_arguments)]
    fn make_room(
        &self,
        store: &mut EntryStore,
        layer: &CacheLayer,
        usage: &mut LayerUsage,
        size: u64,
        fraction: f64,
        now: DateTime<Utc>,
        evicted: &mut Vec<(LayerId, String)>,
    ) -> bool {
        let capacity = layer.capacity();
        let policy = layer.policy();
        let limit = (capacity.max_size_bytes as f64 * policy.eviction_threshold) as u64;
        if size > limit {
            return false;
        }

        let fits = |usage: &LayerUsage| {
            usage.bytes + size <= limit
                && (capacity.max_entries == 0 || usage.entries < capacity.max_entries)
        };

        while !fits(usage) {
            let victims = {
                let candidates = store.entries_on(layer.id());
                if candidates.is_empty() {
                    return false;
                }
                self.eviction
                    .select_victims(&candidates, policy.eviction_policy, fraction, now)
            };
            if victims.is_empty() {
                return false;
            }
            for victim in victims {
                if let Some((key, _)) = detach(store, victim, layer.id(), usage) {
                    layer.counters().record_eviction();
                    evicted.push((layer.id().clone(), key));
                }
            }
        }
        true
    }

    fn report_write(&self, key: &str, outcome: &SetOutcome, targets: &[Arc<CacheLayer>], elapsed: Duration) {
        for (layer_id, victim) in &outcome.evicted {
            debug!(layer = %layer_id, key = %victim, "Evicted entry");
            self.observer.emit(
                events::ENTRY_EVICTED,
                &[("key", victim.into()), ("layer", layer_id.as_str().into())],
            );
        }
        for layer_id in &outcome.skipped {
            self.observer.emit(
                events::WRITE_SKIPPED,
                &[
                    ("key", key.into()),
                    ("layer", layer_id.as_str().into()),
                    ("reason", "capacity".into()),
                ],
            );
        }
        for layer in targets.iter().filter(|l| outcome.layers.contains(l.id())) {
            layer.counters().record_write(outcome.size, elapsed);
        }
        if outcome.stored() {
            self.observer.emit(
                events::ENTRY_STORED,
                &[
                    ("key", key.into()),
                    ("size", outcome.size.into()),
                    ("layers", outcome.layers.len().into()),
                    ("version", outcome.version.into()),
                    ("compressed", outcome.compressed.into()),
                ],
            );
        }
    }

    // =========================================================================
    // Removal & Eviction
    // =========================================================================

    /// Remove an entry from `layers` (all of its layers when `None`)
    pub fn remove(&self, id: EntryId, layers: Option<&[LayerId]>) -> RemoveOutcome {
        loop {
            let placement = match self.entries.read().get(id) {
                Some(entry) => entry.placement.layers.clone(),
                None => return RemoveOutcome::default(),
            };
            let scope: Vec<LayerId> = placement
                .iter()
                .filter(|l| layers.map_or(true, |wanted| wanted.contains(l)))
                .cloned()
                .collect();
            if scope.is_empty() {
                return RemoveOutcome::default();
            }

            let mut locked: Vec<Arc<CacheLayer>> =
                scope.iter().filter_map(|l| self.registry.get(l)).collect();
            lock_order(&mut locked);
            let mut guards: Vec<MutexGuard<'_, LayerUsage>> =
                locked.iter().map(|l| l.lock_usage()).collect();
            let mut store = self.entries.write();

            match store.get(id) {
                None => return RemoveOutcome::default(),
                Some(entry) if entry.placement.layers != placement => continue,
                Some(_) => {}
            }

            let mut outcome = RemoveOutcome::default();
            for layer_id in &scope {
                // A layer dropped from the registry has no usage left to release
                let mut detached_usage = LayerUsage::default();
                let usage = match locked.iter().position(|l| l.id() == layer_id) {
                    Some(i) => &mut *guards[i],
                    None => &mut detached_usage,
                };
                if let Some((key, deleted)) = detach(&mut store, id, layer_id, usage) {
                    outcome.key = Some(key);
                    outcome.layers.push(layer_id.clone());
                    outcome.deleted = deleted;
                }
            }
            return outcome;
        }
    }

    /// Remove by logical key
    pub fn remove_key(&self, key: &str, layers: Option<&[LayerId]>) -> RemoveOutcome {
        let id = self.entries.read().id_of(key);
        match id {
            Some(id) => self.remove(id, layers),
            None => RemoveOutcome::default(),
        }
    }

    /// Victims `layer` would give up for `fraction`, without removing them
    pub fn select_victims(&self, layer: &LayerId, fraction: f64) -> Result<Vec<EntryId>> {
        let layer = self.registry.require(layer)?;
        let policy = layer.policy();
        let store = self.entries.read();
        let candidates = store.entries_on(layer.id());
        Ok(self
            .eviction
            .select_victims(&candidates, policy.eviction_policy, fraction, Utc::now()))
    }

    /// Evict from `layer` until its usage is at most `target_bytes`.
    /// Returns the evicted keys.
    pub fn evict_until(&self, layer: &LayerId, target_bytes: u64) -> Result<Vec<String>> {
        let layer = self.registry.require(layer)?;
        let policy = layer.policy();
        let fraction = self.settings().eviction_fraction;
        let now = Utc::now();
        let mut evicted = Vec::new();

        {
            let mut usage = layer.lock_usage();
            let mut store = self.entries.write();
            while usage.bytes > target_bytes {
                let victims = {
                    let candidates = store.entries_on(layer.id());
                    if candidates.is_empty() {
                        break;
                    }
                    self.eviction
                        .select_victims(&candidates, policy.eviction_policy, fraction, now)
                };
                if victims.is_empty() {
                    break;
                }
                for victim in victims {
                    if let Some((key, _)) = detach(&mut store, victim, layer.id(), &mut usage) {
                        layer.counters().record_eviction();
                        evicted.push(key);
                    }
                }
            }
        }

        for key in &evicted {
            self.observer.emit(
                events::ENTRY_EVICTED,
                &[("key", key.into()), ("layer", layer.id().as_str().into())],
            );
        }
        Ok(evicted)
    }

    /// Copy an entry onto `layer` (rebalance). Returns true when placed.
    pub fn promote(&self, key: &str, layer: &LayerId) -> Result<bool> {
        let layer = self.registry.require(layer)?;
        if !layer.is_available() {
            return Ok(false);
        }
        let fraction = self.settings().eviction_fraction;
        let now = Utc::now();
        let mut evicted = Vec::new();

        let placed = {
            let mut usage = layer.lock_usage();
            let mut store = self.entries.write();
            let size = match store.get_by_key(key) {
                Some((_, e)) if !e.is_on(layer.id()) && !e.is_expired(now) => e.size,
                _ => return Ok(false),
            };
            if self.make_room(&mut store, &layer, &mut usage, size, fraction, now, &mut evicted) {
                match store.get_by_key_mut(key) {
                    Some(entry) => {
                        usage.charge(size);
                        entry.placement.layers.insert(layer.id().clone());
                        entry.placement.replicas = entry.placement.layers.len() as u32;
                        true
                    }
                    // Evicted while making room for itself
                    None => false,
                }
            } else {
                false
            }
        };

        for (layer_id, victim) in &evicted {
            self.observer.emit(
                events::ENTRY_EVICTED,
                &[("key", victim.into()), ("layer", layer_id.as_str().into())],
            );
        }
        if placed {
            self.observer.emit(
                events::ENTRY_PROMOTED,
                &[("key", key.into()), ("layer", layer.id().as_str().into())],
            );
        }
        Ok(placed)
    }

    /// Drop every placement on a layer that left the registry
    pub fn purge_layer(&self, layer: &LayerId) -> usize {
        let mut store = self.entries.write();
        let ids: Vec<EntryId> = store
            .entries_on(layer)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let mut scratch = LayerUsage::default();
        ids.into_iter()
            .filter(|id| detach(&mut store, *id, layer, &mut scratch).is_some())
            .count()
    }

    /// Remove every expired entry. Returns the number purged.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<EntryId> = self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(id, _)| id)
            .collect();
        expired
            .into_iter()
            .filter(|id| self.remove(*id, None).deleted)
            .count()
    }
}

// =============================================================================
// Tests
// =============================================================================
