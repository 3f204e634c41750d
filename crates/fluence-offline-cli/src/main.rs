//! Fluence Offline - drive the offline cache and action queue from a terminal.
//!
//! Each invocation builds a worker from the saved configuration with on-disk
//! storage, dispatches one lifecycle event and prints what happened.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fluence_offline_core::queue::SubmitOutcome;
use fluence_offline_core::{
    ActionKind, CacheStorage, Config, Destination, DiskCacheStorage, EventOutcome, FileStore,
    HttpClient, LifecycleEvent, Request, ServiceWorker,
};

// ============================================================================
// Constants
// ============================================================================

/// Subdirectory of the cache dir holding response partitions
const CACHES_DIR: &str = "caches";

/// Subdirectory of the cache dir holding key-value storage
const STORAGE_DIR: &str = "storage";

/// Bytes of a response body echoed by `fetch`
const BODY_PREVIEW_BYTES: usize = 300;

#[derive(Parser)]
#[command(name = "fluence-offline", version, about = "Offline cache and action queue for the Fluence learning site")]
struct Cli {
    /// Config file (defaults to ~/.config/fluence-offline/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config file if none exists
    Init,
    /// Cache the static manifest and activate
    Install,
    /// Activate an installed worker, evicting stale partitions
    Activate,
    /// Fetch a URL through the cache
    Fetch {
        url: String,
        /// document, image, style, script, font, audio or other
        #[arg(long, default_value = "other")]
        destination: String,
    },
    /// Queue an action for later delivery
    Queue {
        /// quiz_result or progress_update
        kind: String,
        /// JSON payload
        data: String,
    },
    /// Deliver an action now, queueing it if that fails
    Submit { kind: String, data: String },
    /// Replay the offline queue (background sync)
    Sync,
    /// Signal that connectivity is back and drain the queue
    Online,
    /// Signal that connectivity was lost
    Offline,
    /// Drop every queued action
    Clear,
    /// Show partitions and queued actions
    Status,
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_file: Option<&PathBuf>) -> Result<Option<WorkerGuard>> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("Log file path has no file name: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file.as_ref())?;
    info!("Fluence offline starting");

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::config_path()?,
    };

    if matches!(cli.command, Command::Init) {
        return init_config(&config_path);
    }

    let config = Config::load_from(&config_path)?;
    let cache_dir = config.cache_dir().context("Failed to locate cache directory")?;
    let cache_storage = Arc::new(DiskCacheStorage::new(cache_dir.join(CACHES_DIR))?);
    let store = Arc::new(FileStore::new(cache_dir.join(STORAGE_DIR))?);
    let origin = config.origin_url().context("Invalid origin in config")?;
    let network = Arc::new(HttpClient::new(origin)?);

    let worker = ServiceWorker::new(config, cache_storage.clone(), store, network).await?;
    let result = run(&worker, cache_storage.as_ref(), cli.command).await;

    // Don't lose dynamic-cache writes started by `fetch`
    worker.shutdown().await;
    info!("Fluence offline shutting down");
    result
}

async fn run(worker: &ServiceWorker, caches: &dyn CacheStorage, command: Command) -> Result<()> {
    match command {
        // Handled before the worker is built
        Command::Init => {}
        Command::Install => {
            let outcome = worker.dispatch(LifecycleEvent::Install).await?;
            print_outcome(&outcome);
            // Skip waiting
            let outcome = worker.dispatch(LifecycleEvent::Activate).await?;
            print_outcome(&outcome);
        }
        Command::Activate => {
            let outcome = worker.dispatch(LifecycleEvent::Activate).await?;
            print_outcome(&outcome);
        }
        Command::Fetch { url, destination } => {
            let url = worker
                .config()
                .resolve(&url)
                .with_context(|| format!("Invalid URL: {}", url))?;
            let destination: Destination = destination.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            let request = Request::get(url).with_destination(destination);
            let outcome = worker.dispatch(LifecycleEvent::Fetch(request)).await?;
            print_outcome(&outcome);
        }
        Command::Queue { kind, data } => {
            let data = parse_data(&data)?;
            let len = worker.queue().enqueue_raw(&kind, data).await?;
            println!("Queued {} ({} pending)", kind, len);
        }
        Command::Submit { kind, data } => {
            let kind: ActionKind = kind.parse()?;
            let data = parse_data(&data)?;
            match worker.queue().submit(kind, data).await? {
                SubmitOutcome::Delivered => println!("Delivered {}", kind),
                SubmitOutcome::Queued(position) => {
                    println!("Delivery failed, queued {} at position {}", kind, position)
                }
            }
        }
        Command::Sync => {
            let tag = worker.config().sync_tag.clone();
            let outcome = worker.dispatch(LifecycleEvent::Sync { tag }).await?;
            print_outcome(&outcome);
        }
        Command::Online => {
            let outcome = worker.dispatch(LifecycleEvent::Online).await?;
            print_outcome(&outcome);
        }
        Command::Offline => {
            let outcome = worker.dispatch(LifecycleEvent::Offline).await?;
            print_outcome(&outcome);
        }
        Command::Clear => {
            worker.queue().clear().await?;
            println!("Offline queue cleared");
        }
        Command::Status => print_status(worker, caches).await?,
    }
    Ok(())
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        println!("Config already exists at {}", path.display());
    } else {
        Config::default().save_to(path)?;
        println!("Wrote default config to {}", path.display());
    }
    Ok(())
}

fn parse_data(data: &str) -> Result<serde_json::Value> {
    serde_json::from_str(data).with_context(|| format!("Action data is not valid JSON: {}", data))
}

fn print_outcome(outcome: &EventOutcome) {
    match outcome {
        EventOutcome::Installed(report) => {
            println!("Installed: {} cached, {} failed", report.cached.len(), report.failed.len());
            for failed in &report.failed {
                println!("  ✗ {} ({})", failed.url, failed.reason);
            }
        }
        EventOutcome::Activated(report) => {
            println!("Activated, clients claimed: {}", report.clients_claimed);
            for name in &report.deleted {
                println!("  deleted old cache {}", name);
            }
        }
        EventOutcome::Response(response) | EventOutcome::Passthrough(response) => {
            let source = if matches!(outcome, EventOutcome::Response(_)) {
                "worker"
            } else {
                "network"
            };
            println!(
                "{} {} ({} bytes, {:?}, via {})",
                response.status,
                response.status_text,
                response.body.len(),
                response.response_type,
                source
            );
            if let Some(content_type) = response.content_type() {
                println!("Content-Type: {}", content_type);
            }
            let text = response.text();
            let preview: String = text.chars().take(BODY_PREVIEW_BYTES).collect();
            println!("{}", preview);
        }
        EventOutcome::Synced(report) | EventOutcome::Reconnected(report) => {
            println!(
                "Processed {} offline actions: {} delivered, {} failed, {} remaining",
                report.attempted, report.delivered, report.failed, report.remaining
            );
        }
        EventOutcome::Disconnected => println!("Offline - queued actions will wait for reconnect"),
        EventOutcome::Ignored => println!("Nothing to do"),
    }
}

async fn print_status(worker: &ServiceWorker, caches: &dyn CacheStorage) -> Result<()> {
    println!("Worker: {}", worker.state());
    println!("Connectivity: {:?}", worker.queue().connectivity());

    println!("Caches:");
    let current = [worker.cache().static_cache_name(), worker.cache().dynamic_cache_name()];
    for name in caches.keys().await? {
        let marker = if current.contains(&name) { "*" } else { " " };
        let entries = caches.entries(&name).await?;
        println!(" {} {} ({} entries)", marker, name, entries.len());
    }

    let pending = worker.queue().pending().await;
    println!("Offline queue: {} pending", pending.len());
    for action in pending {
        println!(
            "  {} {} {}",
            action.timestamp.format("%Y-%m-%d %H:%M:%S"),
            action.kind,
            action.data
        );
    }
    Ok(())
}
