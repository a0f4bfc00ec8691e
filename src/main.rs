//! rfid-inventory - RFID tag presence service
//!
//! Reads batches of tag reads, tracks per-tag presence in an embedded index
//! and fans presence changes out to the configured sinks.
//!
//! # Usage
//!
//! ```bash
//! # Pipe synthetic traffic through the service
//! read-simulation --batches 200 | rfid-inventory --stdin
//!
//! # Replay a recorded JSON-lines file using read time as the clock
//! rfid-inventory --replay reads.jsonl --replay-clock
//!
//! # Sweep idle facilities every 60 seconds and hot-reload facilities
//! rfid-inventory --stdin --sweep-interval-secs 60 --watch-config
//! ```
//!
//! # Environment Variables
//!
//! - `RFID_CONFIG`: Path to the TOML config (default: ./inventory_config.toml)
//! - `RUST_LOG`: Logging level (default: info)
//! - `RESET_DB`: Set to "true" to wipe the data directory on startup

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rfid_inventory::config::{self, defaults, watcher, InventoryConfig};
use rfid_inventory::engine::{EngineSettings, TagEngine};
use rfid_inventory::facility::{FacilityRegistry, SensorRegistry};
use rfid_inventory::pipeline::source::{BatchSource, ReplaySource, StdinSource};
use rfid_inventory::pipeline::{Clock, DepartureSweeper, Inventory, ProcessingLoop};
use rfid_inventory::publisher::{self, PublishSink, PublisherSettings, TimeSeriesSink, WebhookSink};
use rfid_inventory::storage::{InMemoryTagStore, ProcessLock, SledTagStore, TagStore};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "rfid-inventory")]
#[command(about = "RFID tag presence tracking service")]
#[command(version)]
struct CliArgs {
    /// Read JSON-lines read batches from stdin
    #[arg(long, conflicts_with = "replay")]
    stdin: bool,

    /// Replay a JSON-lines file of read batches
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// Delay between replayed batches in milliseconds
    #[arg(long, default_value = "0")]
    replay_delay_ms: u64,

    /// Use the newest read timestamp as "now" instead of the wall clock
    #[arg(long)]
    replay_clock: bool,

    /// Config file (overrides the RFID_CONFIG / ./inventory_config.toml search)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Keep tags in memory instead of the sled index
    #[arg(long)]
    in_memory: bool,

    /// Sweep every active facility for silent tags on this interval
    #[arg(long, value_name = "SECS")]
    sweep_interval_secs: Option<u64>,

    /// Reload facility definitions when the config file changes
    #[arg(long)]
    watch_config: bool,

    /// Wipe the data directory on startup.
    /// Can also be set via RESET_DB=true environment variable.
    #[arg(long)]
    reset_db: bool,
}

// ============================================================================
// Database Reset
// ============================================================================

/// Check if database reset is requested via CLI flag or environment variable.
fn should_reset_db(cli_flag: bool) -> bool {
    if cli_flag {
        return true;
    }
    if let Ok(val) = std::env::var("RESET_DB") {
        let val_lower = val.to_lowercase();
        return val_lower == "true" || val_lower == "1" || val_lower == "yes";
    }
    false
}

/// Remove the data directory and all its contents.
fn reset_data_directory(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        info!("Data directory does not exist, nothing to reset");
        return Ok(());
    }

    warn!(path = %data_dir.display(), "RESET_DB requested, wiping persistent data");
    if let Ok(entries) = std::fs::read_dir(data_dir) {
        for entry in entries.flatten() {
            warn!("    removing {}", entry.path().display());
        }
    }
    std::fs::remove_dir_all(data_dir).context("Failed to remove data directory")?;
    warn!("Data directory removed, a fresh index will be created");
    Ok(())
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    BatchProcessor,
    Publisher,
    DepartureSweeper,
    ConfigWatcher,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::BatchProcessor => write!(f, "BatchProcessor"),
            TaskName::Publisher => write!(f, "Publisher"),
            TaskName::DepartureSweeper => write!(f, "DepartureSweeper"),
            TaskName::ConfigWatcher => write!(f, "ConfigWatcher"),
        }
    }
}

// ============================================================================
// Wiring
// ============================================================================

/// Storage handles that must outlive the tasks.
struct Storage {
    store: Arc<dyn TagStore>,
    _process_lock: Option<ProcessLock>,
}

fn open_storage(cfg: &InventoryConfig, in_memory: bool) -> Result<Storage> {
    if in_memory {
        info!("Tag index: in-memory (nothing survives a restart)");
        return Ok(Storage {
            store: Arc::new(InMemoryTagStore::new()),
            _process_lock: None,
        });
    }

    let data_dir = &cfg.service.data_dir;
    let process_lock = ProcessLock::acquire(data_dir).context("Failed to acquire process lock")?;
    let store = SledTagStore::open(data_dir.join(defaults::TAG_DB_DIR))
        .context("Failed to open tag index")?;
    Ok(Storage {
        store: Arc::new(store),
        _process_lock: Some(process_lock),
    })
}

fn build_sinks(cfg: &InventoryConfig, in_memory: bool) -> Result<Vec<Arc<dyn PublishSink>>> {
    let timeout = Duration::from_secs(cfg.publisher.sink_timeout_secs);
    let mut sinks: Vec<Arc<dyn PublishSink>> = Vec::new();

    if let Some(ref url) = cfg.publisher.cloud_connector_url {
        sinks.push(Arc::new(
            WebhookSink::cloud_connector(url, timeout).context("Failed to build cloud connector sink")?,
        ));
    }
    if let Some(ref url) = cfg.publisher.rules_url {
        sinks.push(Arc::new(
            WebhookSink::rules_engine(url, timeout).context("Failed to build rules engine sink")?,
        ));
    }
    if cfg.publisher.time_series {
        let sink = if in_memory {
            TimeSeriesSink::temporary()
        } else {
            TimeSeriesSink::open(cfg.service.data_dir.join(defaults::TIME_SERIES_DB_DIR))
        }
        .context("Failed to open time-series store")?;
        sinks.push(Arc::new(sink));
    }

    if sinks.is_empty() {
        info!("No publish sinks configured, changes are only logged");
    }
    Ok(sinks)
}

/// Config path to watch: the explicit flag, then the same search `load()` uses.
fn watched_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var("RFID_CONFIG").ok().map(PathBuf::from))
        .or_else(|| {
            let local = PathBuf::from("inventory_config.toml");
            local.exists().then_some(local)
        })
}

// ============================================================================
// Supervisor
// ============================================================================

/// Monitor tasks until all have finished. A failed task cancels the rest.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("Supervisor: all tasks spawned, monitoring");
    let mut first_error = None;

    while let Some(result) = task_set.join_next().await {
        match result {
            Ok(Ok(task_name)) => {
                info!("Supervisor: task {} completed", task_name);
            }
            Ok(Err(e)) => {
                error!("Supervisor: task failed with error: {:#}", e);
                cancel_token.cancel();
                first_error.get_or_insert(e);
            }
            Err(e) => {
                error!("Supervisor: task panicked: {}", e);
                cancel_token.cancel();
                first_error.get_or_insert(anyhow::anyhow!("Task panicked: {}", e));
            }
        }
    }

    info!("Supervisor: all tasks completed");
    first_error.map_or(Ok(()), Err)
}

async fn run_service<S: BatchSource>(mut source: S, args: &CliArgs, cancel_token: CancellationToken) -> Result<()> {
    let cfg = config::get();
    let storage = open_storage(cfg, args.in_memory)?;
    let store = Arc::clone(&storage.store);

    let facilities = Arc::new(FacilityRegistry::from_config(cfg));
    let sensors = Arc::new(SensorRegistry::new(cfg.sensors.clone()));
    info!(
        facilities = ?facilities.ids(),
        sensors = sensors.len(),
        "Reference data loaded"
    );

    let engine = Arc::new(TagEngine::new(
        Arc::clone(&store),
        Arc::clone(&facilities) as Arc<dyn rfid_inventory::FacilityDirectory>,
        sensors,
        EngineSettings::from(&cfg.engine),
    ));

    let sinks = build_sinks(cfg, args.in_memory)?;
    let (change_publisher, publisher_worker) = publisher::channel(
        sinks,
        PublisherSettings::from(&cfg.publisher),
        cancel_token.child_token(),
    );
    let inventory = Inventory::new(engine, change_publisher);

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    task_set.spawn(async move {
        let stats = publisher_worker.run().await;
        info!(
            delivered = stats.delivered,
            failed = stats.failed,
            dropped = stats.dropped,
            "[Publisher] Final statistics"
        );
        Ok(TaskName::Publisher)
    });

    if let Some(secs) = args.sweep_interval_secs {
        let sweeper = DepartureSweeper::new(
            inventory.clone(),
            Arc::clone(&facilities),
            Duration::from_secs(secs.max(1)),
            cancel_token.clone(),
        );
        task_set.spawn(async move {
            sweeper.run().await;
            Ok(TaskName::DepartureSweeper)
        });
    }

    if args.watch_config {
        match watched_config_path(args.config.as_deref()) {
            Some(path) => {
                let registry = Arc::clone(&facilities);
                let watch_cancel = cancel_token.clone();
                task_set.spawn(async move {
                    let (tx, mut rx) = mpsc::channel(4);
                    let consumer = async {
                        while let Some(event) = rx.recv().await {
                            match event {
                                watcher::ConfigEvent::Reloaded(ids) if ids.is_empty() => {
                                    info!("[ConfigWatcher] Config changed, facilities unchanged");
                                }
                                watcher::ConfigEvent::Reloaded(ids) => {
                                    info!(facilities = ?ids, "[ConfigWatcher] Facilities updated");
                                }
                                watcher::ConfigEvent::Error(e) => {
                                    warn!("[ConfigWatcher] Reload rejected: {}", e);
                                }
                            }
                        }
                    };
                    tokio::join!(
                        watcher::run_config_watcher(path, registry, tx, watch_cancel),
                        consumer
                    );
                    Ok(TaskName::ConfigWatcher)
                });
            }
            None => warn!("--watch-config given but no config file to watch"),
        }
    }

    // The processor ends the run: at end of input everything else shuts down
    let clock = if args.replay_clock { Clock::ReadTime } else { Clock::Wall };
    let proc_cancel = cancel_token.clone();
    let proc_inventory = inventory.clone();
    task_set.spawn(async move {
        info!("[BatchProcessor] Task starting");
        let processing_loop = ProcessingLoop::new(proc_inventory, proc_cancel.clone()).with_clock(clock);
        let stats = processing_loop.run(&mut source).await;
        info!(
            batches = stats.batches,
            changes = stats.state_changes,
            failed = stats.failed_batches,
            "[BatchProcessor] Done"
        );
        proc_cancel.cancel();
        Ok(TaskName::BatchProcessor)
    });

    // Only the tasks may keep publisher handles alive
    drop(inventory);

    let result = run_supervisor(&mut task_set, cancel_token).await;

    match store.flush() {
        Ok(()) => info!(tags = store.count().unwrap_or(0), "Tag index flushed"),
        Err(e) => error!("Failed to flush tag index: {}", e),
    }
    result
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    let cfg = match args.config {
        Some(ref path) => InventoryConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => InventoryConfig::load(),
    };
    info!(
        service = %cfg.service.name,
        data_dir = %cfg.service.data_dir.display(),
        facilities = cfg.facilities.len(),
        "Configuration loaded"
    );
    config::init(cfg);

    // Reset before any storage is opened
    if should_reset_db(args.reset_db) && !args.in_memory {
        reset_data_directory(&config::get().service.data_dir)?;
    }

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown");
        shutdown_token.cancel();
    });

    if let Some(ref path) = args.replay {
        info!(file = %path.display(), "Input: replay");
        let source = ReplaySource::from_file(path, args.replay_delay_ms)?;
        run_service(source, &args, cancel_token).await?;
    } else if args.stdin {
        info!("Input: stdin (JSON-lines read batches)");
        run_service(StdinSource::stdin(), &args, cancel_token).await?;
    } else {
        anyhow::bail!("No input selected: pass --stdin or --replay <FILE>");
    }

    info!("rfid-inventory shutdown complete");
    Ok(())
}
