// =============================================================================
// Persistent key-value storage for cache snapshots
// =============================================================================
//
// The cache manager mirrors each resident entry into a `CandleStorage` as a
// JSON blob under `candle_cache_<SYMBOL>`. Every call is independently
// fallible; the manager logs failures and carries on memory-only.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Prefix of every cache snapshot key.
pub const STORAGE_KEY_PREFIX: &str = "candle_cache_";

/// Storage key for a symbol's cache snapshot.
pub fn storage_key(symbol: &str) -> String {
    format!("{STORAGE_KEY_PREFIX}{symbol}")
}

#[async_trait]
pub trait CandleStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, blob: String) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory storage
// ---------------------------------------------------------------------------

/// Process-local storage. Useful for tests and for running without a disk.
#[derive(Default)]
pub struct MemoryStorage {
    blobs: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs.lock().contains_key(key)
    }
}

#[async_trait]
impl CandleStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.blobs.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, blob: String) -> Result<()> {
        self.blobs.lock().insert(key.to_string(), blob);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.blobs.lock().remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File storage
// ---------------------------------------------------------------------------

/// One JSON file per key inside `dir`, written atomically (tmp + rename).
///
/// Each write goes through its own tmp file, so concurrent writers of one key
/// never collide; the last rename wins.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Create the storage, making `dir` if it does not exist yet.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create storage dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl CandleStorage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("failed to read snapshot {}", path.display()))
            }
        }
    }

    async fn set(&self, key: &str, blob: String) -> Result<()> {
        let path = self.path_for(key);
        let tmp_path = path.with_extension(format!("{}.json.tmp", Uuid::new_v4().simple()));

        tokio::fs::write(&tmp_path, blob.as_bytes())
            .await
            .with_context(|| format!("failed to write tmp snapshot {}", tmp_path.display()))?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e)
                .with_context(|| format!("failed to rename snapshot to {}", path.display()));
        }

        debug!(path = %path.display(), bytes = blob.len(), "snapshot written");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to remove snapshot {}", path.display()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_prefixed() {
        assert_eq!(storage_key("AAPL"), "candle_cache_AAPL");
    }

    #[tokio::test]
    async fn memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get("k").await.unwrap(), None);
        storage.set("k", "v".into()).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap().as_deref(), Some("v"));
        storage.remove("k").await.unwrap();
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn file_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path().join("cache")).await.unwrap();

        assert_eq!(storage.get("candle_cache_BTC/USD").await.unwrap(), None);
        storage
            .set("candle_cache_BTC/USD", "{\"a\":1}".into())
            .await
            .unwrap();
        assert_eq!(
            storage.get("candle_cache_BTC/USD").await.unwrap().as_deref(),
            Some("{\"a\":1}")
        );

        storage.remove("candle_cache_BTC/USD").await.unwrap();
        assert_eq!(storage.get("candle_cache_BTC/USD").await.unwrap(), None);
        // Removing a missing key is not an error.
        storage.remove("candle_cache_BTC/USD").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_to_one_key_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let storage = std::sync::Arc::new(FileStorage::open(dir.path()).await.unwrap());

        for round in 0..50 {
            let a = storage.clone();
            let b = storage.clone();
            let (ra, rb) = tokio::join!(
                tokio::spawn(async move { a.set("k", format!("a{round}")).await }),
                tokio::spawn(async move { b.set("k", format!("b{round}")).await }),
            );
            ra.unwrap().unwrap();
            rb.unwrap().unwrap();

            let stored = storage.get("k").await.unwrap().unwrap();
            assert!(stored == format!("a{round}") || stored == format!("b{round}"));
        }

        // No tmp files are left behind.
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["k.json".to_string()]);
    }
}
