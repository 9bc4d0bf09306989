use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use directories::ProjectDirs;
use opslink_proto::Identity;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;

pub const IDENTITY_KEY: &str = "identity";
pub const SESSION_STATE_KEY: &str = "session-state";

/// The auth-relevant snapshot written under [`SESSION_STATE_KEY`]. Domain
/// lists are deliberately absent; they are refetched fresh on every start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedSession {
    pub user_id: Uuid,
    pub roles: Vec<String>,
    pub saved_at: u64,
}

impl PersistedSession {
    pub fn from_identity(identity: &Identity, saved_at: u64) -> Self {
        Self {
            user_id: identity.user_id,
            roles: identity.roles.clone(),
            saved_at,
        }
    }
}

/// Durable key/value blobs for the small subset of state that survives a
/// process restart.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn store(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// In-process storage for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStorage {
    entries: parking_lot::Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn store(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// One file per key under the platform data directory.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new() -> Result<Self, StoreError> {
        let dirs = ProjectDirs::from("", "", "opslink").ok_or_else(|| {
            StoreError::Io("could not resolve platform data directory".to_string())
        })?;
        Ok(Self {
            dir: dirs.data_dir().to_path_buf(),
        })
    }

    pub fn at(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl KeyValueStorage for FileStorage {
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Io(err.to_string())),
        }
    }

    async fn store(&self, key: &str, value: &str) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| StoreError::Io(err.to_string()))?;
        let path = self.path_for(key);
        debug!(?path, "persisting state blob");
        tokio::fs::write(&path, value)
            .await
            .map_err(|err| StoreError::Io(err.to_string()))
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Io(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_storage_round_trips() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.load(IDENTITY_KEY).await.unwrap(), None);
        storage.store(IDENTITY_KEY, "{\"user_id\":\"u1\"}").await.unwrap();
        assert_eq!(
            storage.load(IDENTITY_KEY).await.unwrap().as_deref(),
            Some("{\"user_id\":\"u1\"}")
        );
        storage.remove(IDENTITY_KEY).await.unwrap();
        assert_eq!(storage.load(IDENTITY_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_storage_round_trips() {
        let dir = std::env::temp_dir().join(format!("opslink-test-{}", uuid::Uuid::new_v4()));
        let storage = FileStorage::at(dir.clone());
        assert_eq!(storage.load(SESSION_STATE_KEY).await.unwrap(), None);
        storage.store(SESSION_STATE_KEY, "{}").await.unwrap();
        assert_eq!(
            storage.load(SESSION_STATE_KEY).await.unwrap().as_deref(),
            Some("{}")
        );
        storage.remove(SESSION_STATE_KEY).await.unwrap();
        storage.remove(SESSION_STATE_KEY).await.unwrap();
        let _ = tokio::fs::remove_dir_all(dir).await;
    }
}
