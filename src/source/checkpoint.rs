use super::SourceError;
use crate::model::{Offset, Timestamp};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Committed position of a file source
///
/// `watermark` is the highest watermark at which every window that had
/// closed was already persisted. Checkpoints written before it existed load
/// with `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub committed_offset: Offset,
    #[serde(default)]
    pub watermark: Option<Timestamp>,
    pub updated_at: i64,
}

/// Save checkpoint to JSON file (temp file + rename, so readers never see
/// a torn write)
pub async fn save_checkpoint(
    path: &Path,
    offset: Offset,
    watermark: Option<Timestamp>,
) -> Result<(), SourceError> {
    let checkpoint = Checkpoint {
        committed_offset: offset,
        watermark,
        updated_at: chrono::Utc::now().timestamp_millis(),
    };

    let json = serde_json::to_string_pretty(&checkpoint)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;

    log::debug!(
        "Saved checkpoint {} (watermark {:?}) to {}",
        offset,
        watermark,
        path.display()
    );
    Ok(())
}

/// Load checkpoint from JSON file; `None` when no checkpoint exists yet
pub async fn load_checkpoint(path: &Path) -> Result<Option<Checkpoint>, SourceError> {
    if !tokio::fs::try_exists(path).await? {
        log::info!("No existing checkpoint file found: {}", path.display());
        return Ok(None);
    }

    let json = tokio::fs::read_to_string(path).await?;
    let checkpoint: Checkpoint = serde_json::from_str(&json)?;

    log::info!(
        "Loaded checkpoint {} (watermark {:?}) from {}",
        checkpoint.committed_offset,
        checkpoint.watermark,
        path.display()
    );
    Ok(Some(checkpoint))
}
