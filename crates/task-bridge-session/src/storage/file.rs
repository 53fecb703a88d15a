//! JSON file history storage.
//!
//! The whole list lives in one JSON array, newest first. Writes go to a
//! sibling temp file and are renamed into place.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use task_bridge_core::{HistoryError, HistoryFilter, HistoryRecord, HistoryStore};
use tokio::sync::Mutex;

/// History kept in a JSON file.
pub struct JsonFileHistory {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileHistory {
    /// Use the file at `path`. It is created on first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `<data dir>/task-bridge/history.json`, if the platform has a data dir.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("task-bridge").join("history.json"))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<HistoryRecord>, HistoryError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, records: &[HistoryRecord]) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(records)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for JsonFileHistory {
    async fn append(&self, record: HistoryRecord) -> Result<(), HistoryError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        records.insert(0, record);
        self.save(&records).await?;
        tracing::debug!("History now holds {} records", records.len());
        Ok(())
    }

    async fn list(&self, filter: HistoryFilter) -> Result<Vec<HistoryRecord>, HistoryError> {
        let _guard = self.lock.lock().await;
        Ok(filter.apply(self.load().await?))
    }

    async fn get(&self, id: &str) -> Result<Option<HistoryRecord>, HistoryError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.into_iter().find(|r| r.id == id))
    }

    async fn delete(&self, id: &str) -> Result<(), HistoryError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Err(HistoryError::NotFound(id.to_string()));
        }
        self.save(&records).await
    }

    async fn clear(&self) -> Result<(), HistoryError> {
        let _guard = self.lock.lock().await;
        self.save(&[]).await
    }
}
