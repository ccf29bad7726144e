//! HashFlow - windowed hashtag counting over an event stream
//!
//! Occurrences `(topic, event_time)` are assigned to tumbling or sliding
//! event-time windows, counted per `(window, topic)`, and each window's totals
//! are upserted into SQLite once the watermark closes it.

pub mod aggregator;
pub mod config;
pub mod import;
pub mod model;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod sqlite_pragma;
pub mod window;

pub use aggregator::{LatePolicy, WatermarkMode, WindowAggregator};
pub use config::{ConfigError, PipelineConfig};
pub use model::{HashtagOccurrence, Offset, TimeWindow, Timestamp, WindowCount, WindowKey};
pub use pipeline::{PipelineDriver, PipelineError, PipelineReport, PipelineState};
pub use window::WindowAssigner;
