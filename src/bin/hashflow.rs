//! HashFlow runtime
//!
//! Usage:
//!   hashflow [run [<occurrences.jsonl>]]   Count hashtags per window into SQLite
//!   hashflow import <counts.jsonl>         Upsert pre-aggregated window counts
//!
//! Environment variables:
//!   HASHFLOW_DB_PATH - SQLite database path (default: hashflow.db)
//!   HASHFLOW_SOURCE_PATH - Occurrence JSONL file when `run` is given no path
//!   HASHFLOW_CHECKPOINT_PATH - Offset checkpoint (default: <source>.checkpoint.json)
//!   HASHFLOW_FOLLOW - Keep tailing the source at EOF (default: false)
//!   WINDOW_SIZE / WINDOW_SLIDE - Window size and optional slide (default: 60s, tumbling)
//!   ALLOWED_LATENESS, LATE_POLICY, CORRECTION_RETENTION - Late data handling
//!   WATERMARK_MODE, MAX_OUT_OF_ORDERNESS - Watermark source
//!   RUST_LOG - Log filter (default: info)

use dotenv::dotenv;
use hashflow::config::PipelineConfig;
use hashflow::import::import_window_counts;
use hashflow::pipeline::{PipelineDriver, PipelineState};
use hashflow::sink::{SinkWriter, SqliteHashtagStore};
use hashflow::source::JsonlFileSource;
use log::{error, info};
use std::env;
use std::sync::Arc;

enum Command {
    Run { source_path: Option<String> },
    Import { path: String },
    Help,
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    match args {
        [] => Ok(Command::Run { source_path: None }),
        [cmd] if cmd == "run" => Ok(Command::Run { source_path: None }),
        [cmd, path] if cmd == "run" => Ok(Command::Run {
            source_path: Some(path.clone()),
        }),
        [cmd, path] if cmd == "import" => Ok(Command::Import { path: path.clone() }),
        [cmd] if cmd == "-h" || cmd == "--help" || cmd == "help" => Ok(Command::Help),
        _ => Err(format!("unrecognized arguments: {}", args.join(" "))),
    }
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  hashflow [run [<occurrences.jsonl>]]");
    eprintln!("  hashflow import <counts.jsonl>");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(msg) => {
            print_usage();
            return Err(msg.into());
        }
    };

    let config = PipelineConfig::from_env()?;

    match command {
        Command::Help => {
            print_usage();
            Ok(())
        }
        Command::Import { path } => run_import(&config, &path).await,
        Command::Run { source_path } => {
            let source_path = source_path
                .or_else(|| config.source_path.clone())
                .ok_or("no source given: pass a path to `run` or set HASHFLOW_SOURCE_PATH")?;
            run_pipeline(&config, &source_path).await
        }
    }
}

fn open_writer(config: &PipelineConfig) -> Result<Arc<SinkWriter>, Box<dyn std::error::Error>> {
    info!("🔧 Opening database: {}", config.db_path);
    let store = SqliteHashtagStore::open(&config.db_path)?;
    Ok(Arc::new(SinkWriter::new(
        Arc::new(store),
        config.retry_policy(),
    )))
}

async fn run_import(config: &PipelineConfig, path: &str) -> Result<(), Box<dyn std::error::Error>> {
    info!("📥 HashFlow import");
    let writer = open_writer(config)?;
    let summary = import_window_counts(path, &writer).await?;
    info!(
        "✅ Import finished: {} imported, {} skipped",
        summary.imported, summary.skipped
    );
    Ok(())
}

async fn run_pipeline(
    config: &PipelineConfig,
    source_path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("🚀 HashFlow pipeline");
    info!("   ├─ Source: {}", source_path);
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Follow: {}", config.follow);
    info!("   └─ Flush interval: {}ms", config.flush_interval_ms);

    let aggregator = config.build_aggregator()?;
    let writer = open_writer(config)?;

    let checkpoint_path = config.checkpoint_path_for(source_path);
    let source = JsonlFileSource::open(source_path, &checkpoint_path, config.follow).await?;
    let committed = source.committed_offset();

    let driver = PipelineDriver::new(config.driver_config(), source, aggregator, writer)
        .with_committed_offset(committed);

    let shutdown = driver.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("⚠️  Received CTRL+C, draining...");
                shutdown.shutdown();
            }
            Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
        }
    });

    info!("🔄 Press CTRL+C to shutdown gracefully");
    let report = driver.run().await?;
    if report.state != PipelineState::Stopped {
        return Err(format!("pipeline ended in state {}", report.state).into());
    }
    Ok(())
}
