//! Pipeline configuration from environment variables

use crate::aggregator::{LatePolicy, WatermarkMode, WindowAggregator};
use crate::pipeline::DriverConfig;
use crate::sink::RetryPolicy;
use crate::window::{parse_duration_ms, WindowAssigner};
use std::env;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Configuration for the hashtag pipeline runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// JSONL file of hashtag occurrences
    pub source_path: Option<String>,

    /// Checkpoint file for the source (defaults to `<source>.checkpoint.json`)
    pub checkpoint_path: Option<String>,

    /// Keep polling the source file at EOF
    pub follow: bool,

    pub window_size_ms: i64,
    pub window_slide_ms: Option<i64>,
    pub allowed_lateness_ms: i64,
    pub late_policy: LatePolicy,
    pub watermark_mode: WatermarkMode,

    /// Max occurrences per source pull
    pub pull_batch_size: usize,

    /// Window close check interval in milliseconds
    pub flush_interval_ms: u64,

    /// Sleep between empty pulls in milliseconds
    pub poll_interval_ms: u64,

    pub writer_workers: usize,

    /// In-flight write batches before ingestion pauses
    pub max_pending_writes: usize,

    pub sink_max_retries: u32,
    pub sink_initial_backoff_ms: u64,
    pub sink_max_backoff_ms: u64,

    /// Times a batch is re-dispatched after its retries are exhausted
    pub max_batch_replays: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: "hashflow.db".to_string(),
            source_path: None,
            checkpoint_path: None,
            follow: false,
            window_size_ms: 60_000,
            window_slide_ms: None,
            allowed_lateness_ms: 0,
            late_policy: LatePolicy::Drop,
            watermark_mode: WatermarkMode::EventTime {
                max_out_of_orderness_ms: 0,
            },
            pull_batch_size: 500,
            flush_interval_ms: 1_000,
            poll_interval_ms: 100,
            writer_workers: 4,
            max_pending_writes: 64,
            sink_max_retries: 5,
            sink_initial_backoff_ms: 100,
            sink_max_backoff_ms: 5_000,
            max_batch_replays: 3,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `HASHFLOW_DB_PATH` (default: hashflow.db)
    /// - `HASHFLOW_SOURCE_PATH`, `HASHFLOW_CHECKPOINT_PATH`, `HASHFLOW_FOLLOW`
    /// - `WINDOW_SIZE` (default: 60s), `WINDOW_SLIDE` (unset: tumbling)
    /// - `ALLOWED_LATENESS` (default: 0)
    /// - `LATE_POLICY` = drop | correct, `CORRECTION_RETENTION` (default: 10m)
    /// - `WATERMARK_MODE` = event | processing, `MAX_OUT_OF_ORDERNESS` (default: 0)
    /// - `PULL_BATCH_SIZE`, `FLUSH_INTERVAL_MS`, `POLL_INTERVAL_MS`
    /// - `WRITER_WORKERS`, `MAX_PENDING_WRITES`
    /// - `SINK_MAX_RETRIES`, `SINK_INITIAL_BACKOFF_MS`, `SINK_MAX_BACKOFF_MS`
    /// - `MAX_BATCH_REPLAYS`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let duration = |key: &str, default: i64| -> Result<i64, ConfigError> {
            match lookup(key) {
                Some(raw) => parse_duration_ms(&raw).ok_or_else(|| {
                    ConfigError::InvalidValue(format!("{} is not a duration: {}", key, raw))
                }),
                None => Ok(default),
            }
        };

        let window_size_ms = duration("WINDOW_SIZE", defaults.window_size_ms)?;
        let window_slide_ms = match lookup("WINDOW_SLIDE") {
            Some(_) => Some(duration("WINDOW_SLIDE", 0)?),
            None => None,
        };
        let allowed_lateness_ms = duration("ALLOWED_LATENESS", 0)?;

        let late_policy = match lookup("LATE_POLICY")
            .unwrap_or_else(|| "drop".to_string())
            .to_lowercase()
            .as_str()
        {
            "drop" => LatePolicy::Drop,
            "correct" => LatePolicy::Correct {
                retention_ms: duration("CORRECTION_RETENTION", 10 * 60_000)?,
            },
            other => {
                return Err(ConfigError::InvalidValue(format!(
                    "LATE_POLICY must be drop or correct, got {}",
                    other
                )))
            }
        };

        let watermark_mode = match lookup("WATERMARK_MODE")
            .unwrap_or_else(|| "event".to_string())
            .to_lowercase()
            .as_str()
        {
            "event" => WatermarkMode::EventTime {
                max_out_of_orderness_ms: duration("MAX_OUT_OF_ORDERNESS", 0)?,
            },
            "processing" => WatermarkMode::ProcessingTime,
            other => {
                return Err(ConfigError::InvalidValue(format!(
                    "WATERMARK_MODE must be event or processing, got {}",
                    other
                )))
            }
        };

        let config = Self {
            db_path: lookup("HASHFLOW_DB_PATH").unwrap_or(defaults.db_path),
            source_path: lookup("HASHFLOW_SOURCE_PATH"),
            checkpoint_path: lookup("HASHFLOW_CHECKPOINT_PATH"),
            follow: parse_or(&lookup, "HASHFLOW_FOLLOW", defaults.follow)?,
            window_size_ms,
            window_slide_ms,
            allowed_lateness_ms,
            late_policy,
            watermark_mode,
            pull_batch_size: parse_or(&lookup, "PULL_BATCH_SIZE", defaults.pull_batch_size)?,
            flush_interval_ms: parse_or(&lookup, "FLUSH_INTERVAL_MS", defaults.flush_interval_ms)?,
            poll_interval_ms: parse_or(&lookup, "POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            writer_workers: parse_or(&lookup, "WRITER_WORKERS", defaults.writer_workers)?,
            max_pending_writes: parse_or(&lookup, "MAX_PENDING_WRITES", defaults.max_pending_writes)?,
            sink_max_retries: parse_or(&lookup, "SINK_MAX_RETRIES", defaults.sink_max_retries)?,
            sink_initial_backoff_ms: parse_or(
                &lookup,
                "SINK_INITIAL_BACKOFF_MS",
                defaults.sink_initial_backoff_ms,
            )?,
            sink_max_backoff_ms: parse_or(&lookup, "SINK_MAX_BACKOFF_MS", defaults.sink_max_backoff_ms)?,
            max_batch_replays: parse_or(&lookup, "MAX_BATCH_REPLAYS", defaults.max_batch_replays)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.window_assigner()?;

        if self.pull_batch_size == 0 {
            return Err(ConfigError::InvalidValue("PULL_BATCH_SIZE must be at least 1".to_string()));
        }
        if self.writer_workers == 0 {
            return Err(ConfigError::InvalidValue("WRITER_WORKERS must be at least 1".to_string()));
        }
        if self.max_pending_writes == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_PENDING_WRITES must be at least 1".to_string(),
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "FLUSH_INTERVAL_MS must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn window_assigner(&self) -> Result<WindowAssigner, ConfigError> {
        match self.window_slide_ms {
            Some(slide) => WindowAssigner::sliding(self.window_size_ms, slide),
            None => WindowAssigner::tumbling(self.window_size_ms),
        }
    }

    pub fn build_aggregator(&self) -> Result<WindowAggregator, ConfigError> {
        Ok(WindowAggregator::new(self.window_assigner()?)
            .with_allowed_lateness(self.allowed_lateness_ms)
            .with_late_policy(self.late_policy)
            .with_watermark_mode(self.watermark_mode))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay_ms: self.sink_initial_backoff_ms,
            max_delay_ms: self.sink_max_backoff_ms,
            max_retries: self.sink_max_retries,
        }
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            pull_batch_size: self.pull_batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            writer_workers: self.writer_workers,
            max_pending_writes: self.max_pending_writes,
            max_batch_replays: self.max_batch_replays,
            ..DriverConfig::default()
        }
    }

    pub fn checkpoint_path_for(&self, source_path: &str) -> String {
        self.checkpoint_path
            .clone()
            .unwrap_or_else(|| format!("{}.checkpoint.json", source_path))
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().to_lowercase().parse::<T>().map_err(|_| {
            ConfigError::InvalidValue(format!("{} has an invalid value: {}", key, raw))
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.window_size_ms, 60_000);
        assert_eq!(config.late_policy, LatePolicy::Drop);
        assert_eq!(
            config.window_assigner().unwrap(),
            WindowAssigner::Tumbling { size_ms: 60_000 }
        );
    }

    #[test]
    fn test_custom_config() {
        let config = PipelineConfig::from_lookup(lookup_from(&[
            ("HASHFLOW_DB_PATH", "/tmp/test.db"),
            ("WINDOW_SIZE", "5m"),
            ("WINDOW_SLIDE", "1m"),
            ("ALLOWED_LATENESS", "30s"),
            ("LATE_POLICY", "correct"),
            ("CORRECTION_RETENTION", "1h"),
            ("WATERMARK_MODE", "processing"),
            ("WRITER_WORKERS", "2"),
            ("HASHFLOW_FOLLOW", "true"),
        ]))
        .unwrap();

        assert_eq!(config.db_path, "/tmp/test.db");
        assert_eq!(config.window_size_ms, 300_000);
        assert_eq!(config.window_slide_ms, Some(60_000));
        assert_eq!(config.allowed_lateness_ms, 30_000);
        assert_eq!(
            config.late_policy,
            LatePolicy::Correct {
                retention_ms: 3_600_000
            }
        );
        assert_eq!(config.watermark_mode, WatermarkMode::ProcessingTime);
        assert_eq!(config.writer_workers, 2);
        assert!(config.follow);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        assert!(PipelineConfig::from_lookup(lookup_from(&[("WINDOW_SIZE", "soon")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup_from(&[("WINDOW_SIZE", "0")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup_from(&[("LATE_POLICY", "keep")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup_from(&[("WRITER_WORKERS", "0")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup_from(&[("PULL_BATCH_SIZE", "many")])).is_err());
    }

    #[test]
    fn test_checkpoint_path_default() {
        let config = PipelineConfig::default();
        assert_eq!(
            config.checkpoint_path_for("events.jsonl"),
            "events.jsonl.checkpoint.json"
        );
    }
}
