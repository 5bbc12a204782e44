use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Instrument};
use usage_window::cache::PersistedCache;
use usage_window::config::{get_config, Config};
use usage_window::display::DisplayManager;
use usage_window::engine::UsageEngine;
use usage_window::file_discovery::{JsonlDirectorySource, RecordSource};
use usage_window::logging;
use usage_window::monitor::LiveMonitor;
use usage_window::timestamp_parser::TimestampParser;

#[derive(Parser)]
#[command(name = "usage-window")]
#[command(about = "Unified 5-hour usage window across concurrent sessions")]
#[command(version)]
struct Cli {
    /// Directory holding <project>/<session>.jsonl logs
    #[arg(long, global = true)]
    projects_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the current unified window
    Snapshot {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
        /// Use this window start instead of selecting one (RFC 3339)
        #[arg(long)]
        window_start: Option<String>,
        /// Evaluate at this instant instead of now (RFC 3339)
        #[arg(long)]
        as_of: Option<String>,
    },
    /// List every block, gaps included
    Blocks {
        /// Only this project
        #[arg(long)]
        project: Option<String>,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Keep polling and redraw the window
    Watch {
        /// Resume from the persisted cache instead of replaying all history
        #[arg(long)]
        resume: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Snapshot {
        json: false,
        window_start: None,
        as_of: None,
    });
    let json = matches!(
        command,
        Commands::Snapshot { json: true, .. } | Commands::Blocks { json: true, .. }
    );

    let config = match get_config() {
        Ok(config) => config,
        Err(e) => handle_error(e, json),
    };
    let _log_guard = logging::init_logging(&config.logging, &config.paths.log_directory);
    let projects_dir = cli
        .projects_dir
        .unwrap_or_else(|| config.paths.projects_dir.clone());

    if let Err(e) = run(command, config, projects_dir).await {
        handle_error(e, json);
    }
    Ok(())
}

async fn run(command: Commands, config: &Config, projects_dir: PathBuf) -> Result<()> {
    let pricing = Arc::new(config.pricing_manager());
    let display = DisplayManager::new();

    match command {
        Commands::Snapshot {
            json,
            window_start,
            as_of,
        } => {
            let window_start = window_start.as_deref().map(parse_instant).transpose()?;
            let now = as_of.as_deref().map(parse_instant).transpose()?.unwrap_or_else(Utc::now);

            let engine = UsageEngine::new(config.engine_settings(), pricing);
            let span = logging::run_span(engine.run_id());
            async {
                load_history(&engine, &projects_dir, now)?;
                let report = engine.snapshot(now, window_start).await;
                display.display_snapshot(&report, json);
                Ok::<_, anyhow::Error>(())
            }
            .instrument(span)
            .await
        }
        Commands::Blocks { project, json } => {
            let now = Utc::now();
            let engine = UsageEngine::new(config.engine_settings(), pricing);
            let span = logging::run_span(engine.run_id());
            async {
                load_history(&engine, &projects_dir, now)?;
                let blocks = engine.blocks(project.as_deref()).await;
                display.display_blocks(&blocks, json);
                Ok::<_, anyhow::Error>(())
            }
            .instrument(span)
            .await
        }
        Commands::Watch { resume } => {
            let (engine, source) = if resume && config.cache.enabled {
                let cache = PersistedCache::load_or_rebuild(&config.cache.path);
                let engine = UsageEngine::from_cache(config.engine_settings(), pricing, &cache);
                let source = JsonlDirectorySource::with_positions(&projects_dir, cache.tailer_positions);
                (engine, source)
            } else {
                (
                    UsageEngine::new(config.engine_settings(), pricing),
                    JsonlDirectorySource::new(&projects_dir),
                )
            };

            let engine = Arc::new(engine);
            let span = logging::run_span(engine.run_id());
            let mut monitor = LiveMonitor::new(Arc::clone(&engine), Box::new(source))
                .with_poll_interval(Duration::from_secs(config.monitor.poll_interval_secs))
                .with_checkpoint_every(config.monitor.checkpoint_every);
            if config.cache.enabled {
                monitor = monitor.with_cache(config.cache.path.clone());
            }
            monitor.run().instrument(span).await
        }
    }
}

/// Read every log under `projects_dir` from the beginning.
fn load_history(engine: &UsageEngine, projects_dir: &std::path::Path, now: DateTime<Utc>) -> Result<()> {
    let mut source = JsonlDirectorySource::new(projects_dir);
    let records = source.poll()?;
    for record in &records {
        engine.ingest(&record.value, &record.context, now);
    }

    let stats = engine.stats();
    info!(
        dir = %projects_dir.display(),
        records = records.len(),
        malformed_lines = source.malformed_lines(),
        folded = stats.folded,
        duplicates = stats.duplicates,
        rejected = stats.rejected(),
        "History loaded"
    );
    Ok(())
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    TimestampParser::parse(raw).with_context(|| format!("Invalid timestamp: {}. Use RFC 3339", raw))
}

fn handle_error(e: anyhow::Error, json: bool) -> ! {
    if json {
        println!("{}", serde_json::json!({ "error": format!("{:#}", e) }));
    } else {
        eprintln!("Error: {:#}", e);
    }
    process::exit(1);
}
