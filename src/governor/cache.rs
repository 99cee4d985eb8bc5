//! Content-addressed response cache.
//!
//! Entries are keyed by the payload digest and never invalidated: identical
//! content and instruction are assumed to deserve the same completion.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::transport::Completion;

const ENTRY_EXTENSION: &str = "json";

/// Errors that can occur during cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Key is not a hex digest.
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Durable key-value store for completions.
#[async_trait]
pub trait ContentCache: Send + Sync {
    /// Whether an entry exists for `key`.
    async fn has(&self, key: &str) -> CacheResult<bool>;

    /// The cached completion for `key`, if any.
    async fn get(&self, key: &str) -> CacheResult<Option<Completion>>;

    /// Store a completion. Idempotent; concurrent writers are last-write-wins.
    async fn set(&self, key: &str, value: &Completion) -> CacheResult<()>;
}

/// On-disk layout of one cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheRecord {
    key: String,
    cached_at: DateTime<Utc>,
    value: Completion,
}

/// Cache backed by the local filesystem, one JSON file per digest.
///
/// Files are sharded by the first two hex characters of the key and written
/// through a temporary file plus rename, so readers never observe a partial
/// entry.
#[derive(Debug)]
pub struct FileCache {
    root_dir: PathBuf,
    write_seq: AtomicU64,
}

impl FileCache {
    /// Open (and create if needed) a cache rooted at `root_dir`.
    pub async fn open(root_dir: impl Into<PathBuf>) -> CacheResult<Self> {
        let root_dir = root_dir.into();
        fs::create_dir_all(&root_dir).await?;
        Ok(Self {
            root_dir,
            write_seq: AtomicU64::new(0),
        })
    }

    /// Get the cache root directory path.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Delete the entry for `key`. Missing entries are not an error.
    pub async fn remove(&self, key: &str) -> CacheResult<()> {
        let path = self.entry_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CacheError::Io(err)),
        }
    }

    /// Count stored entries.
    pub async fn len(&self) -> CacheResult<usize> {
        let mut count = 0;
        let mut shards = fs::read_dir(&self.root_dir).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(shard.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) == Some(ENTRY_EXTENSION) {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> CacheResult<bool> {
        Ok(self.len().await? == 0)
    }

    fn entry_path(&self, key: &str) -> CacheResult<PathBuf> {
        validate_key(key)?;
        Ok(self
            .root_dir
            .join(&key[..2])
            .join(format!("{}.{}", key, ENTRY_EXTENSION)))
    }
}

#[async_trait]
impl ContentCache for FileCache {
    async fn has(&self, key: &str) -> CacheResult<bool> {
        let path = self.entry_path(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Completion>> {
        let path = self.entry_path(key)?;
        match fs::read_to_string(&path).await {
            Ok(content) => {
                let record: CacheRecord = serde_json::from_str(&content)?;
                Ok(Some(record.value))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(CacheError::Io(err)),
        }
    }

    async fn set(&self, key: &str, value: &Completion) -> CacheResult<()> {
        let path = self.entry_path(key)?;
        let shard_dir = self.root_dir.join(&key[..2]);
        fs::create_dir_all(&shard_dir).await?;

        let record = CacheRecord {
            key: key.to_string(),
            cached_at: Utc::now(),
            value: value.clone(),
        };
        let json = serde_json::to_string_pretty(&record)?;

        // Unique per writer so concurrent sets never share a temp file.
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let temp_path = shard_dir.join(format!(
            "{}.{}.{}.tmp",
            key,
            std::process::id(),
            seq
        ));

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(CacheError::Io(err));
        }

        Ok(())
    }
}

/// In-process cache, for tests and short-lived runs.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Completion>>,
}

impl MemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ContentCache for MemoryCache {
    async fn has(&self, key: &str) -> CacheResult<bool> {
        Ok(self
            .entries
            .read()
            .map(|e| e.contains_key(key))
            .unwrap_or(false))
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Completion>> {
        Ok(self
            .entries
            .read()
            .ok()
            .and_then(|e| e.get(key).cloned()))
    }

    async fn set(&self, key: &str, value: &Completion) -> CacheResult<()> {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key.to_string(), value.clone());
        }
        Ok(())
    }
}

fn validate_key(key: &str) -> CacheResult<()> {
    if key.len() < 2 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    Ok(())
}
