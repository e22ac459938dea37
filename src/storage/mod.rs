pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use crate::error::Result;
use crate::types::{CandleRecord, TaskKey};

pub use sqlite::SqliteStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Active,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "failed" { TaskStatus::Failed } else { TaskStatus::Active }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted progress of one ingestion task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskCursor {
    /// Open time of the next candle to fetch.
    pub cursor: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub last_error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionStats {
    pub key: TaskKey,
    pub candles: u64,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
}

/// Insert-only candle storage keyed on `(exchange, symbol, interval, open_time)`.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Insert `records` in one transaction. Rows whose key already exists are
    /// skipped without error. Returns how many rows were new.
    async fn upsert_batch(&self, records: &[CandleRecord]) -> Result<u64>;

    async fn stats(&self) -> Result<Vec<CollectionStats>>;
}

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load_cursor(&self, key: &TaskKey) -> Result<Option<TaskCursor>>;

    /// Move the cursor forward. A value behind the stored cursor is ignored.
    async fn advance_cursor(&self, key: &TaskKey, cursor: DateTime<Utc>) -> Result<()>;

    /// Set the cursor to `cursor` even if that moves it backwards.
    async fn rewind_cursor(&self, key: &TaskKey, cursor: DateTime<Utc>) -> Result<()>;

    async fn mark_failed(&self, key: &TaskKey, reason: &str) -> Result<()>;

    async fn clear_failed(&self, key: &TaskKey) -> Result<()>;

    async fn list_cursors(&self) -> Result<Vec<(TaskKey, TaskCursor)>>;
}
