//! SQLite store for hashtag window counts
//!
//! Table `hashtag_counts` holds one row per `(ts, topic)`. Writes use a
//! native `INSERT ... ON CONFLICT DO UPDATE`, so replaying a window leaves the
//! stored count unchanged.

use super::store::{StoreError, WindowCountStore};
use crate::model::{Timestamp, WindowCount};
use crate::sqlite_pragma::apply_optimized_pragmas;
use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS hashtag_counts (
    ts INTEGER NOT NULL,
    topic TEXT NOT NULL,
    window_end INTEGER NOT NULL,
    count INTEGER NOT NULL CHECK (count >= 0),
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (ts, topic)
);
CREATE INDEX IF NOT EXISTS idx_hashtag_counts_topic ON hashtag_counts(topic, ts DESC);
"#;

const UPSERT: &str = r#"
INSERT INTO hashtag_counts (ts, topic, window_end, count, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(ts, topic) DO UPDATE SET
    window_end = excluded.window_end,
    count = excluded.count,
    updated_at = excluded.updated_at
"#;

pub struct SqliteHashtagStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHashtagStore {
    /// Open (or create) the database and ensure the schema exists
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Fatal(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(db_path).map_err(classify)?;
        apply_optimized_pragmas(&conn).map_err(classify)?;
        conn.execute_batch(SCHEMA).map_err(classify)?;

        log::info!("✅ SQLite hashtag store initialized: {}", db_path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking thread pool
    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Fatal("connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Transient(format!("blocking write task failed: {}", e)))?
    }
}

struct RowValues {
    ts: i64,
    topic: String,
    window_end: i64,
    count: i64,
}

fn row_values(count: &WindowCount) -> Result<RowValues, StoreError> {
    let stored = i64::try_from(count.count).map_err(|_| {
        StoreError::Fatal(format!(
            "count {} for {} at {} does not fit an INTEGER column",
            count.count, count.topic, count.window.start
        ))
    })?;
    Ok(RowValues {
        ts: count.window.start,
        topic: count.topic.clone(),
        window_end: count.window.end,
        count: stored,
    })
}

/// Busy, locked and I/O conditions are retryable; everything else is not
fn classify(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) => match e.code {
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::SystemIoFailure
            | ErrorCode::CannotOpen
            | ErrorCode::DiskFull
            | ErrorCode::OutOfMemory
            | ErrorCode::FileLockingProtocolFailed => StoreError::Transient(err.to_string()),
            _ => StoreError::Fatal(err.to_string()),
        },
        _ => StoreError::Fatal(err.to_string()),
    }
}

#[async_trait]
impl WindowCountStore for SqliteHashtagStore {
    async fn upsert(&self, count: &WindowCount) -> Result<(), StoreError> {
        let row = row_values(count)?;
        let now = chrono::Utc::now().timestamp_millis();

        self.with_conn(move |conn| {
            conn.execute(
                UPSERT,
                params![row.ts, row.topic, row.window_end, row.count, now],
            )
            .map_err(classify)?;
            Ok(())
        })
        .await
    }

    async fn upsert_batch(&self, counts: &[WindowCount]) -> Result<(), StoreError> {
        if counts.is_empty() {
            return Ok(());
        }

        let rows = counts
            .iter()
            .map(row_values)
            .collect::<Result<Vec<_>, _>>()?;
        let now = chrono::Utc::now().timestamp_millis();

        let written = self
            .with_conn(move |conn| {
                let tx = conn.transaction().map_err(classify)?;
                {
                    let mut stmt = tx.prepare_cached(UPSERT).map_err(classify)?;
                    for row in &rows {
                        stmt.execute(params![row.ts, row.topic, row.window_end, row.count, now])
                            .map_err(classify)?;
                    }
                }
                tx.commit().map_err(classify)?;
                Ok(rows.len())
            })
            .await?;

        log::debug!("✅ Upserted {} hashtag counts to SQLite", written);
        Ok(())
    }

    async fn fetch(&self, ts: Timestamp, topic: &str) -> Result<Option<u64>, StoreError> {
        let topic = topic.to_string();
        let stored: Option<i64> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT count FROM hashtag_counts WHERE ts = ?1 AND topic = ?2",
                    params![ts, topic],
                    |row| row.get(0),
                )
                .optional()
                .map_err(classify)
            })
            .await?;

        stored
            .map(|c| {
                u64::try_from(c)
                    .map_err(|_| StoreError::Fatal(format!("negative count {} in store", c)))
            })
            .transpose()
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}
