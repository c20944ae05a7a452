//! Small persistent key-value store for markers and the collection index.
//!
//! Entries are plain strings kept in one JSON object on disk. The file is
//! rewritten on every change (write to a temp file, then rename).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Suffix of the key holding a collection's produced original page count.
const ORIG_SUFFIX: &str = "-orig";

/// Suffix of the key holding a collection's last reading position.
const POSITION_SUFFIX: &str = "-position";

/// Where the reader left off in a collection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReadingPosition {
    pub page: usize,
    pub percentage: f64,
}

pub struct KeyValueStore {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, String>>,
}

impl KeyValueStore {
    /// Open the store at `path`. A missing file starts empty; a corrupt one is
    /// logged and replaced on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupt state file");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Cannot read state file");
                BTreeMap::new()
            }
        };

        Self {
            path: Some(path),
            entries: Mutex::new(entries),
        }
    }

    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: impl Into<String>) -> Result<(), StoreError> {
        let mut entries = self.lock();
        entries.insert(key.to_string(), value.into());
        self.persist(&entries)
    }

    /// Number of original pages last recorded for a collection.
    pub fn page_count(&self, collection: &str) -> Option<usize> {
        self.get(&format!("{collection}{ORIG_SUFFIX}"))?.parse().ok()
    }

    pub fn set_page_count(&self, collection: &str, count: usize) -> Result<(), StoreError> {
        self.set(&format!("{collection}{ORIG_SUFFIX}"), count.to_string())
    }

    pub fn position(&self, collection: &str) -> Option<ReadingPosition> {
        let raw = self.get(&format!("{collection}{POSITION_SUFFIX}"))?;
        serde_json::from_str(&raw).ok()
    }

    pub fn set_position(
        &self,
        collection: &str,
        position: ReadingPosition,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(&position).map_err(|e| self.io_error(e.into()))?;
        self.set(&format!("{collection}{POSITION_SUFFIX}"), raw)
    }

    /// Names of all collections known to the index.
    pub fn collection_names(&self) -> Vec<String> {
        self.lock()
            .keys()
            .filter_map(|key| key.strip_suffix(ORIG_SUFFIX))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Drop every entry belonging to a collection.
    pub fn remove_collection(&self, collection: &str) -> Result<(), StoreError> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.remove(&format!("{collection}{ORIG_SUFFIX}"));
        entries.remove(&format!("{collection}{POSITION_SUFFIX}"));
        if entries.len() != before {
            self.persist(&entries)?;
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::io(self.path.clone().unwrap_or_default(), source)
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = serde_json::to_vec_pretty(entries).map_err(|e| self.io_error(e.into()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| StoreError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let kv = KeyValueStore::open(&path);
        kv.set("alignment-in-progress", "manga").unwrap();
        kv.set_page_count("manga", 12).unwrap();
        drop(kv);

        let kv = KeyValueStore::open(&path);
        assert_eq!(kv.get("alignment-in-progress").as_deref(), Some("manga"));
        assert_eq!(kv.page_count("manga"), Some(12));
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let kv = KeyValueStore::open(&path);
        assert!(kv.get("anything").is_none());
        kv.set("a", "b").unwrap();
        assert_eq!(KeyValueStore::open(&path).get("a").as_deref(), Some("b"));
    }

    #[test]
    fn test_position_format() {
        let kv = KeyValueStore::in_memory();
        kv.set_position(
            "manga",
            ReadingPosition {
                page: 3,
                percentage: 0.25,
            },
        )
        .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&kv.get("manga-position").unwrap()).unwrap();
        assert_eq!(raw["page"], 3);
        assert_eq!(kv.position("manga").unwrap().percentage, 0.25);
    }

    #[test]
    fn test_collection_index() {
        let kv = KeyValueStore::in_memory();
        kv.set("alignment-in-progress", "false").unwrap();
        kv.set_page_count("b", 1).unwrap();
        kv.set_page_count("a", 2).unwrap();
        kv.set_position("a", ReadingPosition { page: 0, percentage: 0.0 })
            .unwrap();

        assert_eq!(kv.collection_names(), vec!["a".to_string(), "b".to_string()]);

        kv.remove_collection("a").unwrap();
        assert_eq!(kv.collection_names(), vec!["b".to_string()]);
        assert!(kv.position("a").is_none());
        assert_eq!(kv.get("alignment-in-progress").as_deref(), Some("false"));
    }
}
