//! In-memory history storage.

use std::sync::RwLock;

use async_trait::async_trait;
use task_bridge_core::{HistoryError, HistoryFilter, HistoryRecord, HistoryStore};

/// In-memory history.
///
/// Useful for tests and short-lived processes. Data is lost on restart.
pub struct MemoryHistory {
    records: RwLock<Vec<HistoryRecord>>,
}

impl MemoryHistory {
    /// Create an empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn append(&self, record: HistoryRecord) -> Result<(), HistoryError> {
        self.records
            .write()
            .map_err(|e| HistoryError::Internal(e.to_string()))?
            .push(record);
        Ok(())
    }

    async fn list(&self, filter: HistoryFilter) -> Result<Vec<HistoryRecord>, HistoryError> {
        let records = self
            .records
            .read()
            .map_err(|e| HistoryError::Internal(e.to_string()))?;
        Ok(filter.apply(records.iter().cloned()))
    }

    async fn get(&self, id: &str) -> Result<Option<HistoryRecord>, HistoryError> {
        Ok(self
            .records
            .read()
            .map_err(|e| HistoryError::Internal(e.to_string()))?
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn delete(&self, id: &str) -> Result<(), HistoryError> {
        let mut records = self
            .records
            .write()
            .map_err(|e| HistoryError::Internal(e.to_string()))?;

        let index = records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| HistoryError::NotFound(id.to_string()))?;
        records.remove(index);

        Ok(())
    }

    async fn clear(&self) -> Result<(), HistoryError> {
        self.records
            .write()
            .map_err(|e| HistoryError::Internal(e.to_string()))?
            .clear();
        Ok(())
    }
}
