//! Persistent store seam for window counts
//!
//! Rows are keyed by `(ts = window.start, topic)`. Every backend must make
//! `upsert` an overwrite, never an increment: each `WindowCount` already
//! carries the full total for its window.

use crate::model::{Timestamp, WindowCount};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Connectivity, timeouts, lock contention; worth retrying
    #[error("transient store error: {0}")]
    Transient(String),
    /// Malformed data or constraint violations; retrying cannot help
    #[error("fatal store error: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

#[async_trait]
pub trait WindowCountStore: Send + Sync {
    /// Insert or replace the row for `(count.window.start, count.topic)`
    async fn upsert(&self, count: &WindowCount) -> Result<(), StoreError>;

    /// Upsert several counts; backends with transactions apply them atomically
    async fn upsert_batch(&self, counts: &[WindowCount]) -> Result<(), StoreError> {
        for count in counts {
            self.upsert(count).await?;
        }
        Ok(())
    }

    /// Stored count for `(ts, topic)`, if any
    async fn fetch(&self, ts: Timestamp, topic: &str) -> Result<Option<u64>, StoreError>;

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}

/// Store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<(Timestamp, String), u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All rows sorted by `(ts, topic)`
    pub fn rows(&self) -> Vec<(Timestamp, String, u64)> {
        let mut rows: Vec<_> = match self.rows.lock() {
            Ok(rows) => rows
                .iter()
                .map(|((ts, topic), count)| (*ts, topic.clone(), *count))
                .collect(),
            Err(_) => Vec::new(),
        };
        rows.sort();
        rows
    }
}

#[async_trait]
impl WindowCountStore for MemoryStore {
    async fn upsert(&self, count: &WindowCount) -> Result<(), StoreError> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| StoreError::Fatal("memory store mutex poisoned".to_string()))?;
        rows.insert((count.window.start, count.topic.clone()), count.count);
        Ok(())
    }

    async fn fetch(&self, ts: Timestamp, topic: &str) -> Result<Option<u64>, StoreError> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| StoreError::Fatal("memory store mutex poisoned".to_string()))?;
        Ok(rows.get(&(ts, topic.to_string())).copied())
    }

    fn backend_type(&self) -> &'static str {
        "Memory"
    }
}
