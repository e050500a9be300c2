use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::storage::BlobStore;

pub const QUEUE_STORAGE_KEY: &str = "offline_request_queue";

static ENQUEUE_SEQ: AtomicU64 = AtomicU64::new(0);

/// A single deferred mutation, immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub ts: i64,
    pub item: QueuedRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub url: String,
    pub init: RequestInit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInit {
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<CapturedBody>,
}

/// Captured request body. Markers are objects so they can never be
/// confused with a real text body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapturedBody {
    Text(String),
    Marker { marker: BodyMarker },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyMarker {
    /// The original payload was binary and was not captured.
    Binary,
    /// Serializing the original payload failed.
    Unreadable,
}

impl CapturedBody {
    pub fn binary_marker() -> Self {
        Self::Marker {
            marker: BodyMarker::Binary,
        }
    }

    pub fn unreadable_marker() -> Self {
        Self::Marker {
            marker: BodyMarker::Unreadable,
        }
    }

    pub fn is_marker(&self) -> bool {
        matches!(self, Self::Marker { .. })
    }
}

/// FIFO queue of deferred requests persisted as one JSON array blob.
///
/// Persistence is best-effort: a failed write is logged and the
/// in-memory result still returned, so a reload before the next
/// successful persist can lose that entry.
#[derive(Clone)]
pub struct QueueStore {
    store: Arc<dyn BlobStore>,
}

impl QueueStore {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    pub fn enqueue(&self, item: QueuedRequest) -> QueueEntry {
        let ts = now_unix_ms();
        let seq = ENQUEUE_SEQ.fetch_add(1, Ordering::Relaxed);
        let entry = QueueEntry {
            id: format!("{ts}-{seq:04x}"),
            ts,
            item,
        };

        let mut entries = self.read_entries();
        entries.push(entry.clone());
        self.write_entries(&entries);
        entry
    }

    /// Ordered read-only snapshot of the queue.
    pub fn list(&self) -> Vec<QueueEntry> {
        self.read_entries()
    }

    /// Removes the entry with the given id; no-op when absent.
    pub fn remove(&self, id: &str) {
        let entries = self.read_entries();
        let filtered: Vec<QueueEntry> =
            entries.into_iter().filter(|entry| entry.id != id).collect();
        self.write_entries(&filtered);
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_entries().is_empty()
    }

    fn read_entries(&self) -> Vec<QueueEntry> {
        let blob = match self.store.read(QUEUE_STORAGE_KEY) {
            Ok(Some(blob)) => blob,
            Ok(None) => return Vec::new(),
            Err(err) => {
                tracing::warn!("read offline queue blob failed: {err:#}");
                return Vec::new();
            }
        };

        match serde_json::from_str(&blob) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!("offline queue blob is corrupt, treating as empty: {err}");
                Vec::new()
            }
        }
    }

    fn write_entries(&self, entries: &[QueueEntry]) {
        let blob = match serde_json::to_string(entries) {
            Ok(blob) => blob,
            Err(err) => {
                tracing::warn!("serialize offline queue failed: {err}");
                return;
            }
        };
        if let Err(err) = self.store.write(QUEUE_STORAGE_KEY, &blob) {
            tracing::warn!("persist offline queue failed: {err:#}");
        }
    }
}

fn now_unix_ms() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
