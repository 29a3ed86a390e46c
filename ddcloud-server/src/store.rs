//! Durable storage for the persisted server record.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::record::ServerRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// The caller's durable slot for a single server record.
///
/// Each call to `save` must be durable before it returns; the orchestrator
/// relies on this to resume from the last checkpoint after a crash.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<Option<ServerRecord>, StoreError>;

    async fn save(&self, record: &ServerRecord) -> Result<(), StoreError>;

    /// Forget the record (server is gone).
    async fn clear(&self) -> Result<(), StoreError>;
}

/// In-memory store that also keeps every saved revision.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    current: Option<ServerRecord>,
    history: Vec<ServerRecord>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: ServerRecord) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                current: Some(record),
                history: Vec::new(),
            }),
        }
    }

    /// Every record passed to `save`, oldest first.
    pub async fn history(&self) -> Vec<ServerRecord> {
        self.inner.lock().await.history.clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<ServerRecord>, StoreError> {
        Ok(self.inner.lock().await.current.clone())
    }

    async fn save(&self, record: &ServerRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.current = Some(record.clone());
        inner.history.push(record.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.inner.lock().await.current = None;
        Ok(())
    }
}

/// JSON file store. Writes go to a sibling temp file and are renamed into
/// place.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<Option<ServerRecord>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, record: &ServerRecord) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(record)?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), phase = %record.phase, "Saved server record");
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OsImage, ServerSpec};

    fn record() -> ServerRecord {
        ServerRecord::new(ServerSpec {
            name: "app-01".to_string(),
            description: String::new(),
            admin_password: "pw".to_string(),
            network_domain_id: "nd-1".to_string(),
            memory_gb: Some(4),
            cpu_count: Some(2),
            os_image: OsImage::Name("Ubuntu".to_string()),
            primary_adapter_vlan: None,
            primary_adapter_ipv4: None,
            primary_adapter_ipv6: None,
            dns_primary: String::new(),
            dns_secondary: String::new(),
            auto_start: true,
            image_disks: vec![],
            additional_disks: vec![],
            tags: vec![],
        })
    }

    #[tokio::test]
    async fn test_file_store_missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("server.json"));
        assert!(store.load().await.unwrap().is_none());
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        let store = FileStateStore::new(&path);

        store.save(&record()).await.unwrap();
        assert!(!dir.path().join("server.json.tmp").exists());

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.spec.name, "app-01");

        store.clear().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_memory_store_keeps_history() {
        let store = MemoryStateStore::new();
        let mut r = record();
        store.save(&r).await.unwrap();
        r.spec.memory_gb = Some(8);
        store.save(&r).await.unwrap();

        let history = store.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].spec.memory_gb, Some(4));
        assert_eq!(
            store.load().await.unwrap().unwrap().spec.memory_gb,
            Some(8)
        );
    }
}
