//! Persistence boundary for finished jobs.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::command::Parameters;

/// One successful job, as kept in the local history list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    /// `video`, `image`, or the lowercased task kind.
    #[serde(rename = "type")]
    pub kind: String,
    pub prompt: String,
    pub url: String,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    #[serde(default)]
    pub params: Parameters,
}

impl HistoryRecord {
    /// New record stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(
        kind: impl Into<String>,
        prompt: impl Into<String>,
        url: impl Into<String>,
        params: Parameters,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            prompt: prompt.into(),
            url: url.into(),
            timestamp: Utc::now().timestamp_millis(),
            params,
        }
    }
}

/// History filter for queries.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Filter by record type.
    pub kind: Option<String>,
    /// Limit results.
    pub limit: Option<usize>,
}

impl HistoryFilter {
    /// Whether a record passes the type filter.
    #[must_use]
    pub fn matches(&self, record: &HistoryRecord) -> bool {
        self.kind.as_deref().is_none_or(|kind| record.kind == kind)
    }

    /// Sort newest first, filter, and truncate.
    #[must_use]
    pub fn apply<I>(&self, records: I) -> Vec<HistoryRecord>
    where
        I: IntoIterator<Item = HistoryRecord>,
    {
        let mut out: Vec<_> = records.into_iter().filter(|r| self.matches(r)).collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

/// History storage error.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("History record not found: {0}")]
    NotFound(String),
    #[error("History I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("History encoding error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("History error: {0}")]
    Internal(String),
}

/// Trait for history storage backends.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append a record.
    async fn append(&self, record: HistoryRecord) -> Result<(), HistoryError>;

    /// List records, newest first.
    async fn list(&self, filter: HistoryFilter) -> Result<Vec<HistoryRecord>, HistoryError>;

    /// Get a record by ID.
    async fn get(&self, id: &str) -> Result<Option<HistoryRecord>, HistoryError>;

    /// Delete a record by ID.
    async fn delete(&self, id: &str) -> Result<(), HistoryError>;

    /// Remove every record.
    async fn clear(&self) -> Result<(), HistoryError>;
}
