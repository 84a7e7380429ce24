//! Key-value backends for the connection table.
//!
//! The table only needs single-key reads, writes and deletes with per-key
//! atomicity. `MemoryKv` lives for the process; `FileKv` mirrors every write
//! to a JSON document so rows survive a restart.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistent key-value collaborator
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Upsert; overwrites any previous value
    async fn put(&self, key: &str, value: Value) -> StoreResult<()>;

    /// Deleting a missing key is not an error
    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn scan(&self) -> StoreResult<Vec<(String, Value)>>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    items: Arc<RwLock<HashMap<String, Value>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> StoreResult<()> {
        self.items.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.items.write().await.remove(key);
        Ok(())
    }

    async fn scan(&self) -> StoreResult<Vec<(String, Value)>> {
        Ok(self
            .items
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// JSON-file table. The whole document is rewritten through a temp file and
/// renamed into place, so a crash never leaves a torn file behind.
#[derive(Debug, Clone)]
pub struct FileKv {
    path: PathBuf,
    items: Arc<RwLock<HashMap<String, Value>>>,
}

impl FileKv {
    /// Open (or create) the table at `path`
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();

        let items = match tokio::fs::read_to_string(&path).await {
            Ok(contents) if contents.trim().is_empty() => HashMap::new(),
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            "Opened connection table at {} ({} rows)",
            path.display(),
            items.len()
        );

        Ok(Self {
            path,
            items: Arc::new(RwLock::new(items)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, items: &HashMap<String, Value>) -> StoreResult<()> {
        let json = serde_json::to_vec_pretty(items)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StoreError::Unavailable(format!("write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::Unavailable(format!("rename {}: {}", tmp.display(), e)))?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileKv {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> StoreResult<()> {
        let mut items = self.items.write().await;
        let previous = items.insert(key.to_string(), value);
        if let Err(e) = self.flush(&items).await {
            // Keep memory and disk in agreement
            match previous {
                Some(prev) => items.insert(key.to_string(), prev),
                None => items.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut items = self.items.write().await;
        let Some(previous) = items.remove(key) else {
            return Ok(());
        };
        if let Err(e) = self.flush(&items).await {
            items.insert(key.to_string(), previous);
            return Err(e);
        }
        Ok(())
    }

    async fn scan(&self) -> StoreResult<Vec<(String, Value)>> {
        Ok(self
            .items
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
