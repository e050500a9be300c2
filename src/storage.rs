use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Context as _;

/// Synchronous whole-blob storage keyed by a well-known string.
///
/// Every write replaces the entire blob for a key; there is no
/// incremental append. The expected workload is a short queue of
/// deferred requests, not bulk traffic.
pub trait BlobStore: Send + Sync {
    fn read(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn write(&self, key: &str, blob: &str) -> anyhow::Result<()>;
}

/// One file per key under a base directory.
#[derive(Debug)]
pub struct FileBlobStore {
    base_path: PathBuf,
}

impl FileBlobStore {
    pub fn open(base_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)
            .with_context(|| format!("create storage dir {}", base_path.display()))?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{key}.json"))
    }
}

impl BlobStore for FileBlobStore {
    fn read(&self, key: &str) -> anyhow::Result<Option<String>> {
        let path = self.blob_path(key);
        match fs::read_to_string(&path) {
            Ok(blob) => Ok(Some(blob)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read blob {}", path.display())),
        }
    }

    fn write(&self, key: &str, blob: &str) -> anyhow::Result<()> {
        let path = self.blob_path(key);
        // Write-then-rename so a reader never observes a torn blob.
        let tmp_path = self.base_path.join(format!("{key}.json.tmp"));
        fs::write(&tmp_path, blob)
            .with_context(|| format!("write blob {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("rename blob into place {}", path.display()))?;
        Ok(())
    }
}

/// In-memory store for tests and embedded callers.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    cells: Mutex<HashMap<String, String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn read(&self, key: &str) -> anyhow::Result<Option<String>> {
        let cells = self
            .cells
            .lock()
            .map_err(|_| anyhow::anyhow!("memory blob store lock poisoned"))?;
        Ok(cells.get(key).cloned())
    }

    fn write(&self, key: &str, blob: &str) -> anyhow::Result<()> {
        let mut cells = self
            .cells
            .lock()
            .map_err(|_| anyhow::anyhow!("memory blob store lock poisoned"))?;
        cells.insert(key.to_owned(), blob.to_owned());
        Ok(())
    }
}
