//! Entry Arena
//!
//! Entries live in a slot arena addressed by a generational [`EntryId`].
//! A logical-key index gives O(1) lookup and a reverse dependency index maps
//! a key to the keys that declared a dependency on it.

use std::collections::{BTreeSet, HashMap};

use super::entry::CacheEntry;
use super::layer::LayerId;

/// Generational handle to an arena slot
///
/// A handle whose slot has been freed and reused no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId {
    index: u32,
    generation: u32,
}

impl EntryId {
    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<CacheEntry>,
}

/// Slot arena of entries with free-list reuse
#[derive(Debug, Default)]
pub struct EntryArena {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    len: usize,
}

impl EntryArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: CacheEntry) -> EntryId {
        let id = if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            EntryId {
                index,
                generation: slot.generation,
            }
        } else {
            self.slots.push(Slot {
                generation: 0,
                entry: Some(entry),
            });
            EntryId {
                index: (self.slots.len() - 1) as u32,
                generation: 0,
            }
        };
        self.len += 1;
        id
    }

    pub fn remove(&mut self, id: EntryId) -> Option<CacheEntry> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(id.index);
        self.len -= 1;
        Some(entry)
    }

    pub fn get(&self, id: EntryId) -> Option<&CacheEntry> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut CacheEntry> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    pub fn contains(&self, id: EntryId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &CacheEntry)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|entry| {
                (
                    EntryId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    entry,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntryId, &mut CacheEntry)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.entry.as_mut().map(|entry| {
                (
                    EntryId {
                        index: index as u32,
                        generation,
                    },
                    entry,
                )
            })
        })
    }
}

// =============================================================================
// Entry Store
// =============================================================================

/// Authoritative key -> entry map
#[derive(Debug, Default)]
pub struct EntryStore {
    arena: EntryArena,
    by_key: HashMap<String, EntryId>,
    /// dependency key -> keys that depend on it
    dependents: HashMap<String, BTreeSet<String>>,
}

impl EntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn id_of(&self, key: &str) -> Option<EntryId> {
        self.by_key.get(key).copied()
    }

    pub fn get(&self, id: EntryId) -> Option<&CacheEntry> {
        self.arena.get(id)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut CacheEntry> {
        self.arena.get_mut(id)
    }

    pub fn get_by_key(&self, key: &str) -> Option<(EntryId, &CacheEntry)> {
        let id = self.id_of(key)?;
        self.arena.get(id).map(|entry| (id, entry))
    }

    pub fn get_by_key_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
        let id = self.id_of(key)?;
        self.arena.get_mut(id)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    /// Insert an entry. The caller must have removed any prior record for
    /// the same key so its layer credits could be released first.
    pub fn insert(&mut self, entry: CacheEntry) -> EntryId {
        debug_assert!(!self.by_key.contains_key(&entry.key));
        let key = entry.key.clone();
        for dependency in &entry.dependencies {
            self.dependents
                .entry(dependency.clone())
                .or_default()
                .insert(key.clone());
        }
        let id = self.arena.insert(entry);
        self.by_key.insert(key, id);
        id
    }

    /// Delete an entry and unindex it
    pub fn remove(&mut self, id: EntryId) -> Option<CacheEntry> {
        let entry = self.arena.remove(id)?;
        self.by_key.remove(&entry.key);
        for dependency in &entry.dependencies {
            if let Some(keys) = self.dependents.get_mut(dependency) {
                keys.remove(&entry.key);
                if keys.is_empty() {
                    self.dependents.remove(dependency);
                }
            }
        }
        Some(entry)
    }

    /// Keys that declared a dependency on `key`
    pub fn dependents_of(&self, key: &str) -> Vec<String> {
        self.dependents
            .get(key)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Entries currently placed on `layer`
    pub fn entries_on(&self, layer: &LayerId) -> Vec<(EntryId, &CacheEntry)> {
        self.arena.iter().filter(|(_, e)| e.is_on(layer)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &CacheEntry)> {
        self.arena.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntryId, &mut CacheEntry)> {
        self.arena.iter_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.by_key.keys()
    }
}
