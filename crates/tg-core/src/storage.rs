//! Key-value persistence
//!
//! The engine sees storage as an opaque async get/set of JSON values, one
//! instance for durable state and one for session-scoped state.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;

/// Values keyed by storage key.
pub type StorageMap = serde_json::Map<String, Value>;

/// Storage keys shared with the extension pages.
pub mod keys {
    // Durable
    pub const BLOCKED_URLS: &str = "blockedUrls";
    pub const ALLOW_URLS: &str = "allowUrls";
    pub const CACHED_SCORES: &str = "cachedScores";
    pub const SCORE_MODE: &str = "scoreMode";
    pub const API_KEY: &str = "gtiApiKey";
    pub const DAILY_PAGE_LOAD_DATE: &str = "dailyPageLoadDate";
    pub const DAILY_PAGE_LOAD_COUNT: &str = "dailyPageLoadCount";
    pub const REMOTE_TIMING: &str = "gtiTiming";

    // Session
    pub const PENDING_URLS: &str = "pendingUrls";
    pub const BLOCKED_INFO: &str = "blockedInfoByTab";
}

/// A value changed by another extension page. `newValue` is absent when
/// the key was removed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageChange {
    pub key: String,
    #[serde(default)]
    pub new_value: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Stored data is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the given keys. Keys with no stored value are left out.
    async fn get(&self, keys: &[&str]) -> Result<StorageMap, StorageError>;

    /// Write all entries, replacing previous values.
    async fn set(&self, entries: StorageMap) -> Result<(), StorageError>;
}

/// Build a single-entry map for `set`.
pub fn entry(key: &str, value: Value) -> StorageMap {
    let mut map = StorageMap::new();
    map.insert(key.to_string(), value);
    map
}

// =============================================================================
// In-memory Store
// =============================================================================

/// Process-local store, with switchable failure injection.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<StorageMap>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: StorageMap) -> Self {
        Self {
            data: Mutex::new(entries),
            ..Self::default()
        }
    }

    /// Current value stored under `key`.
    pub fn value(&self, key: &str) -> Option<Value> {
        self.data.lock().get(key).cloned()
    }

    pub fn snapshot(&self) -> StorageMap {
        self.data.lock().clone()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of `get` calls served, failed ones included.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `set` calls received, failed ones included.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, keys: &[&str]) -> Result<StorageMap, StorageError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("reads disabled".to_string()));
        }
        let data = self.data.lock();
        Ok(keys
            .iter()
            .filter_map(|k| data.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect())
    }

    async fn set(&self, entries: StorageMap) -> Result<(), StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("writes disabled".to_string()));
        }
        self.data.lock().extend(entries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_omits_missing_keys() {
        let store = MemoryStore::new();
        store.set(entry("a", json!(1))).await.unwrap();

        let got = store.get(&["a", "b"]).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got["a"], json!(1));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.set(entry("a", json!(1))).await.is_err());
        assert_eq!(store.value("a"), None);
        assert_eq!(store.write_count(), 1);

        store.set_fail_reads(true);
        assert!(store.get(&["a"]).await.is_err());
    }
}
