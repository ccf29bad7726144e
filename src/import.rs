//! Bulk import of already-windowed counts
//!
//! Input is JSONL, one `WindowCount` per line:
//! `{"window":{"start":0,"end":60000},"topic":"foo","count":3}`

use crate::model::WindowCount;
use crate::sink::{SinkError, SinkWriter};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Rows written per upsert batch
const IMPORT_CHUNK: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: u64,
    pub skipped: u64,
}

pub async fn import_window_counts(
    path: impl AsRef<Path>,
    writer: &SinkWriter,
) -> Result<ImportSummary, ImportError> {
    let path = path.as_ref();
    let io_err = |source| ImportError::Io {
        path: path.display().to_string(),
        source,
    };

    let file = File::open(path).await.map_err(io_err)?;
    let mut lines = BufReader::new(file).lines();
    let mut summary = ImportSummary::default();
    let mut chunk: Vec<WindowCount> = Vec::with_capacity(IMPORT_CHUNK);
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await.map_err(io_err)? {
        line_no += 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<WindowCount>(trimmed) {
            Ok(count) if count.window.start < count.window.end => chunk.push(count),
            Ok(_) => {
                summary.skipped += 1;
                log::warn!("⚠️  Skipping line {}: window end is not after start", line_no);
            }
            Err(e) => {
                summary.skipped += 1;
                log::warn!("⚠️  Skipping malformed line {}: {}", line_no, e);
            }
        }

        if chunk.len() >= IMPORT_CHUNK {
            writer.upsert_batch(&chunk).await?;
            summary.imported += chunk.len() as u64;
            chunk.clear();
        }
    }

    if !chunk.is_empty() {
        writer.upsert_batch(&chunk).await?;
        summary.imported += chunk.len() as u64;
    }

    log::info!(
        "✅ Imported {} window counts from {} ({} skipped)",
        summary.imported,
        path.display(),
        summary.skipped
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemoryStore, RetryPolicy, WindowCountStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_import_skips_malformed_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counts.jsonl");
        tokio::fs::write(
            &path,
            concat!(
                r#"{"window":{"start":0,"end":60000},"topic":"foo","count":3}"#,
                "\n",
                "not json\n",
                "\n",
                r#"{"window":{"start":0,"end":60000},"topic":"bar","count":1}"#,
                "\n",
                r#"{"window":{"start":60000,"end":60000},"topic":"bad","count":1}"#,
                "\n",
            ),
        )
        .await
        .unwrap();

        let store = Arc::new(MemoryStore::new());
        let writer = SinkWriter::new(store.clone(), RetryPolicy::default());

        let summary = import_window_counts(&path, &writer).await.unwrap();
        assert_eq!(summary, ImportSummary { imported: 2, skipped: 2 });

        let again = import_window_counts(&path, &writer).await.unwrap();
        assert_eq!(again.imported, 2);
        assert_eq!(store.len(), 2);
        assert_eq!(store.fetch(0, "foo").await.unwrap(), Some(3));
        assert_eq!(
            store.rows(),
            vec![(0, "bar".to_string(), 1), (0, "foo".to_string(), 3)]
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let store = Arc::new(MemoryStore::new());
        let writer = SinkWriter::new(store, RetryPolicy::default());
        let err = import_window_counts("/nonexistent/counts.jsonl", &writer)
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Io { .. }));
    }
}
