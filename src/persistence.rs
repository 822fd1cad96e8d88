//! Persistence Port
//!
//! Configuration and history are saved as opaque blobs under namespaced keys
//! through an external key-value collaborator. Save failures are logged by
//! the caller and never propagated to cache operations.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Key holding the serialized configuration
pub const CONFIGURATION_KEY: &str = "tiercache:configuration";

/// Key holding the serialized invalidation/optimization history
pub const HISTORY_KEY: &str = "tiercache:history";

/// Load/save contract for durable state
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Bytes>>;

    async fn save(&self, key: &str, value: Bytes) -> Result<()>;
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// Map-backed store for tests and ephemeral deployments
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    values: RwLock<HashMap<String, Bytes>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryPersistence {
    async fn load(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.values.read().get(key).cloned())
    }

    async fn save(&self, key: &str, value: Bytes) -> Result<()> {
        self.values.write().insert(key.to_string(), value);
        Ok(())
    }
}

// =============================================================================
// File Store
// =============================================================================

/// One file per key under a directory
#[derive(Debug, Clone)]
pub struct FilePersistence {
    root: PathBuf,
}

impl FilePersistence {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{}.json", file))
    }

    fn failure(key: &str, e: std::io::Error) -> Error {
        Error::Persistence {
            key: key.to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl PersistenceStore for FilePersistence {
    async fn load(&self, key: &str) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::failure(key, e)),
        }
    }

    async fn save(&self, key: &str, value: Bytes) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Self::failure(key, e))?;

        // Write then rename so a crash never leaves a torn file
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &value)
            .await
            .map_err(|e| Self::failure(key, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::failure(key, e))
    }
}

// =============================================================================
// History
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Invalidation,
    Optimization,
}

/// One invalidation or optimization action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub at: DateTime<Utc>,
    pub kind: HistoryKind,
    /// Pattern, rule id, layer or strategy the action targeted
    pub subject: String,
    pub detail: String,
    pub affected: u64,
}

/// Bounded in-memory history, oldest dropped first
#[derive(Debug)]
pub struct HistoryLog {
    records: RwLock<VecDeque<HistoryRecord>>,
    capacity: usize,
}

impl HistoryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, kind: HistoryKind, subject: &str, detail: &str, affected: u64) {
        self.push(HistoryRecord {
            at: Utc::now(),
            kind,
            subject: subject.to_string(),
            detail: detail.to_string(),
            affected,
        });
    }

    fn push(&self, record: HistoryRecord) {
        let mut records = self.records.write();
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn snapshot(&self) -> Vec<HistoryRecord> {
        self.records.read().iter().cloned().collect()
    }

    pub fn of_kind(&self, kind: HistoryKind) -> Vec<HistoryRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    /// Replace contents with previously persisted records
    pub fn restore(&self, records: Vec<HistoryRecord>) {
        let skip = records.len().saturating_sub(self.capacity);
        let mut current = self.records.write();
        current.clear();
        current.extend(records.into_iter().skip(skip));
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&self.snapshot())?))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Vec<HistoryRecord>> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_load_save() {
        let store = InMemoryPersistence::new();
        assert!(store.load(CONFIGURATION_KEY).await.unwrap().is_none());
        store
            .save(CONFIGURATION_KEY, Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert_eq!(
            store.load(CONFIGURATION_KEY).await.unwrap(),
            Some(Bytes::from_static(b"{}"))
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistence::new(dir.path().join("state"));

        assert!(store.load(HISTORY_KEY).await.unwrap().is_none());
        store
            .save(HISTORY_KEY, Bytes::from_static(b"[1,2,3]"))
            .await
            .unwrap();
        let loaded = store.load(HISTORY_KEY).await.unwrap().unwrap();
        assert_eq!(loaded.as_ref(), b"[1,2,3]");
        assert!(dir.path().join("state/tiercache_history.json").exists());
    }

    #[tokio::test]
    async fn test_file_store_reports_unwritable_root() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file, not a directory").unwrap();

        let store = FilePersistence::new(blocker.join("nested"));
        let err = store
            .save(CONFIGURATION_KEY, Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Persistence { .. }));
    }

    #[test]
    fn test_history_is_bounded() {
        let log = HistoryLog::new(3);
        for i in 0..5 {
            log.record(HistoryKind::Invalidation, &format!("k{}", i), "pattern", 1);
        }
        let records = log.snapshot();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].subject, "k2");
    }

    #[test]
    fn test_history_serialization() {
        let log = HistoryLog::new(10);
        log.record(HistoryKind::Optimization, "memory", "capacity_growth", 0);
        log.record(HistoryKind::Invalidation, "news", "pattern", 4);

        let bytes = log.to_bytes().unwrap();
        let restored = HistoryLog::new(10);
        restored.restore(HistoryLog::from_bytes(&bytes).unwrap());
        assert_eq!(restored.snapshot(), log.snapshot());
        assert_eq!(restored.of_kind(HistoryKind::Invalidation).len(), 1);
    }
}
