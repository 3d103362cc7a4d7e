use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use taskmesh_core::{MeshError, MeshResult};
use uuid::Uuid;

/// Minimal key/value contract: no cross-key transactions.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// `None` when the key was never written or has been deleted.
    async fn get(&self, key: &str) -> MeshResult<Option<Value>>;
    /// Replace the whole value stored under `key`.
    async fn save(&self, key: &str, value: &Value) -> MeshResult<()>;
    /// Absent keys are not an error.
    async fn delete(&self, key: &str) -> MeshResult<()>;
}

/// In-process store, lost on restart.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryKvStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> MeshResult<Option<Value>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn save(&self, key: &str, value: &Value) -> MeshResult<()> {
        self.entries.write().insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> MeshResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// File-based store: one JSON document per key, named by the hex-encoded key.
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub async fn new(dir: PathBuf) -> MeshResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(key)))
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> MeshResult<Option<Value>> {
        let path = self.key_path(key);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value = serde_json::from_str(&data).map_err(|e| {
            MeshError::Registry(format!("corrupt entry for key '{key}': {e}"))
        })?;
        Ok(Some(value))
    }

    async fn save(&self, key: &str, value: &Value) -> MeshResult<()> {
        // Write-then-rename so a crash never leaves a half-written document.
        // Each write gets its own temp file; concurrent saves of one key race
        // only on the rename, and the last rename wins.
        let path = self.key_path(key);
        let tmp = self.dir.join(format!(
            "{}.{}.tmp",
            hex::encode(key),
            Uuid::new_v4().simple()
        ));
        let json = serde_json::to_string_pretty(value)?;
        let written = async {
            tokio::fs::write(&tmp, json).await?;
            tokio::fs::rename(&tmp, &path).await
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> MeshResult<()> {
        match tokio::fs::remove_file(self.key_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_crud() {
        let store = MemoryKvStore::new();
        assert!(store.get("agent:a").await.unwrap().is_none());

        store.save("agent:a", &json!({"n": 1})).await.unwrap();
        assert_eq!(store.get("agent:a").await.unwrap(), Some(json!({"n": 1})));
        assert_eq!(store.len(), 1);

        store.delete("agent:a").await.unwrap();
        assert!(store.is_empty());
        // Deleting twice is fine.
        store.delete("agent:a").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_handles_unsafe_key_characters() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileKvStore::new(tmp.path().join("kv")).await.unwrap();

        store.save("agent:../etc/passwd", &json!([1, 2])).await.unwrap();
        assert_eq!(
            store.get("agent:../etc/passwd").await.unwrap(),
            Some(json!([1, 2]))
        );
        // Nothing escaped the store directory.
        let entries: Vec<_> = std::fs::read_dir(tmp.path().join("kv")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_concurrent_saves_of_one_key() {
        let tmp = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FileKvStore::new(tmp.path().to_path_buf()).await.unwrap());

        let mut writers = tokio::task::JoinSet::new();
        for n in 0..16 {
            let store = store.clone();
            writers.spawn(async move { store.save("agent:a", &json!({"n": n})).await });
        }
        while let Some(joined) = writers.join_next().await {
            joined.unwrap().unwrap();
        }

        let value = store.get("agent:a").await.unwrap().unwrap();
        assert!(value["n"].as_i64().unwrap() < 16);
        // Only the final document remains; no temp files are left behind.
        let entries: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_corrupt_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileKvStore::new(tmp.path().to_path_buf()).await.unwrap();
        std::fs::write(store.key_path("broken"), "{not json").unwrap();
        assert!(matches!(
            store.get("broken").await,
            Err(MeshError::Registry(_))
        ));
    }
}
