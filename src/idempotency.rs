//! Processed-message tracking for duplicate suppression
//!
//! At-least-once delivery means a message handled just before a crash is
//! delivered again. When a consumer has an `IdempotencyStore`, it records
//! each event's idempotency key after the handler succeeds and skips (but
//! commits) later deliveries carrying a key its group already processed.

use crate::error::{MessagingError, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Trait for recording which events a consumer group has processed
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Check whether `key` was already processed by `group`
    async fn is_processed(&self, group: &str, key: &str) -> Result<bool>;

    /// Record `key` as processed by `group`
    async fn mark_processed(&self, group: &str, key: &str) -> Result<()>;
}

type ProcessedKeys = HashMap<String, BTreeSet<String>>;

/// In-memory store; lost on drop
#[derive(Default)]
pub struct MemoryIdempotencyStore {
    keys: RwLock<ProcessedKeys>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys recorded for a group
    pub async fn len(&self, group: &str) -> usize {
        self.keys.read().await.get(group).map(BTreeSet::len).unwrap_or(0)
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn is_processed(&self, group: &str, key: &str) -> Result<bool> {
        let keys = self.keys.read().await;
        Ok(keys.get(group).is_some_and(|set| set.contains(key)))
    }

    async fn mark_processed(&self, group: &str, key: &str) -> Result<()> {
        let mut keys = self.keys.write().await;
        keys.entry(group.to_string())
            .or_default()
            .insert(key.to_string());
        Ok(())
    }
}

/// JSON file-backed store
///
/// Keys are cached in memory and the whole set is rewritten on every mark.
/// Writes go to a temp file that is renamed over the target, so a crash
/// never leaves a truncated file.
pub struct FileIdempotencyStore {
    path: PathBuf,
    keys: RwLock<ProcessedKeys>,
}

impl FileIdempotencyStore {
    /// Open a store at `path`, loading existing keys if the file exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let keys = load(&path)?;
        Ok(Self {
            path,
            keys: RwLock::new(keys),
        })
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl IdempotencyStore for FileIdempotencyStore {
    async fn is_processed(&self, group: &str, key: &str) -> Result<bool> {
        let keys = self.keys.read().await;
        Ok(keys.get(group).is_some_and(|set| set.contains(key)))
    }

    async fn mark_processed(&self, group: &str, key: &str) -> Result<()> {
        let mut keys = self.keys.write().await;
        let inserted = keys
            .entry(group.to_string())
            .or_default()
            .insert(key.to_string());
        if inserted {
            save(&self.path, &keys)?;
        }
        Ok(())
    }
}

fn load(path: &Path) -> Result<ProcessedKeys> {
    if !path.exists() {
        return Ok(HashMap::new());
    }

    let json = std::fs::read_to_string(path).map_err(|e| {
        MessagingError::Idempotency(format!(
            "Failed to read idempotency file {}: {}",
            path.display(),
            e
        ))
    })?;

    let keys: ProcessedKeys = serde_json::from_str(&json).map_err(|e| {
        MessagingError::Idempotency(format!(
            "Failed to parse idempotency file {}: {}",
            path.display(),
            e
        ))
    })?;

    tracing::debug!(
        path = %path.display(),
        groups = keys.len(),
        "Idempotency keys loaded"
    );
    Ok(keys)
}

fn save(path: &Path, keys: &ProcessedKeys) -> Result<()> {
    let json = serde_json::to_string_pretty(keys)?;
    let tmp_path = path.with_extension("tmp");

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            MessagingError::Idempotency(format!(
                "Failed to create directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    std::fs::write(&tmp_path, json).map_err(|e| {
        MessagingError::Idempotency(format!(
            "Failed to write idempotency file {}: {}",
            tmp_path.display(),
            e
        ))
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        MessagingError::Idempotency(format!(
            "Failed to rename idempotency file {} → {}: {}",
            tmp_path.display(),
            path.display(),
            e
        ))
    })?;

    tracing::debug!(path = %path.display(), "Idempotency keys saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("commerce-events-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    #[tokio::test]
    async fn test_memory_store_scoped_by_group() {
        let store = MemoryIdempotencyStore::new();
        store.mark_processed("orders", "user:1").await.unwrap();

        assert!(store.is_processed("orders", "user:1").await.unwrap());
        assert!(!store.is_processed("users", "user:1").await.unwrap());
        assert!(!store.is_processed("orders", "user:2").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_mark_twice() {
        let store = MemoryIdempotencyStore::new();
        store.mark_processed("g", "k").await.unwrap();
        store.mark_processed("g", "k").await.unwrap();
        assert_eq!(store.len("g").await, 1);
    }

    #[tokio::test]
    async fn test_file_store_persists_across_reopen() {
        let path = temp_path("processed.json");

        {
            let store = FileIdempotencyStore::open(&path).unwrap();
            store.mark_processed("users", "order:42").await.unwrap();
        }

        let reopened = FileIdempotencyStore::open(&path).unwrap();
        assert!(reopened.is_processed("users", "order:42").await.unwrap());
        assert!(!reopened.is_processed("users", "order:43").await.unwrap());
        assert!(!path.with_extension("tmp").exists());

        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_file_store_missing_file_is_empty() {
        let path = temp_path("missing.json");
        let store = FileIdempotencyStore::open(&path).unwrap();
        assert_eq!(store.path(), path.as_path());
    }

    #[test]
    fn test_file_store_corrupt_file() {
        let path = temp_path("corrupt.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json").unwrap();

        let result = FileIdempotencyStore::open(&path);
        assert!(matches!(result, Err(MessagingError::Idempotency(_))));

        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }
}
