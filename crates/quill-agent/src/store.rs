use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::state::DurableState;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self) -> Result<Option<DurableState>>;
    async fn save(&self, record: &DurableState) -> Result<()>;
}

/// Durable session list as a single JSON document. Writes go through a
/// temp file and rename so a crash mid-write never truncates the record.
#[derive(Debug, Clone)]
pub struct JsonSessionStore {
    path: PathBuf,
}

impl JsonSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::data_dir()
            .ok_or_else(|| Error::Store("no user data directory".to_string()))?;
        Ok(base.join("quill").join("sessions.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SessionStore for JsonSessionStore {
    async fn load(&self) -> Result<Option<DurableState>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = serde_json::from_slice(&bytes)?;
        Ok(Some(record))
    }

    async fn save(&self, record: &DurableState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(record)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Store backed by memory only; for tests and ephemeral embeddings.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    record: Mutex<Option<DurableState>>,
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self) -> Result<Option<DurableState>> {
        Ok(self.record.lock().await.clone())
    }

    async fn save(&self, record: &DurableState) -> Result<()> {
        *self.record.lock().await = Some(record.clone());
        Ok(())
    }
}
