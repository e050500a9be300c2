use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use bytes::Bytes;

/// Cache key: method + URL. Only GET responses are ever stored.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_owned(),
            url: url.into(),
        }
    }
}

/// A stored response snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl StoredResponse {
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The opaque network-error response (status 0, no body), returned
    /// when every fallback is exhausted.
    pub fn network_error() -> Self {
        Self {
            status: 0,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn is_network_error(&self) -> bool {
        self.status == 0
    }
}

/// One named cache: insertion-ordered request-to-response snapshots.
#[derive(Clone, Default)]
pub struct Cache {
    entries: Arc<Mutex<Vec<(CacheKey, StoredResponse)>>>,
}

impl Cache {
    fn entries(&self) -> MutexGuard<'_, Vec<(CacheKey, StoredResponse)>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<StoredResponse> {
        self.entries()
            .iter()
            .find(|(stored_key, _)| stored_key == key)
            .map(|(_, response)| response.clone())
    }

    /// Stores a snapshot. A re-put of an existing key replaces the old
    /// snapshot and counts as a fresh insertion for eviction order.
    pub fn put(&self, key: CacheKey, response: StoredResponse) {
        let mut entries = self.entries();
        entries.retain(|(stored_key, _)| stored_key != &key);
        entries.push((key, response));
    }

    pub fn delete(&self, key: &CacheKey) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(stored_key, _)| stored_key != key);
        entries.len() != before
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries().iter().map(|(key, _)| key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Evicts oldest-inserted entries until at most `max_entries`
    /// remain. FIFO by insertion, not LRU. Returns the eviction count.
    pub fn trim(&self, max_entries: usize) -> usize {
        let mut entries = self.entries();
        if entries.len() <= max_entries {
            return 0;
        }
        let excess = entries.len() - max_entries;
        entries.drain(..excess);
        excess
    }
}

/// The set of named caches, standing in for the browser's CacheStorage.
/// Cache names carry a version tag so a controller upgrade invalidates
/// stale generations wholesale at activation.
#[derive(Clone, Default)]
pub struct CacheSet {
    caches: Arc<Mutex<BTreeMap<String, Cache>>>,
}

impl CacheSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn caches(&self) -> MutexGuard<'_, BTreeMap<String, Cache>> {
        self.caches.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opens a named cache, creating it when absent.
    pub fn open(&self, name: &str) -> Cache {
        self.caches().entry(name.to_owned()).or_default().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.caches().keys().cloned().collect()
    }

    pub fn delete(&self, name: &str) -> bool {
        self.caches().remove(name).is_some()
    }
}
