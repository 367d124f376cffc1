use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use fieldsync::api::MutationApi;
use fieldsync::background_sync::SyncScheduler;
use fieldsync::cache::SqliteStorage;
use fieldsync::clients::ClientRegistry;
use fieldsync::config::Config;
use fieldsync::connectivity::ConnectivityMonitor;
use fieldsync::coordinator::SyncCoordinator;
use fieldsync::executor::SyncExecutor;
use fieldsync::gateway::{MutationGateway, SubmitOutcome};
use fieldsync::logging;
use fieldsync::net::{FetchRequest, Fetcher, HttpFetcher};
use fieldsync::page::PageContext;
use fieldsync::queue::{MutationId, QueueStore};
use fieldsync::worker::Worker;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(about = "Offline-resilient mutation sync for field inspection apps")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fieldsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Queue and cache database (default: <data dir>/fieldsync/fieldsync.db)
  #[arg(long)]
  db: Option<PathBuf>,

  /// Log to stderr instead of the log file
  #[arg(long)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the worker and one page context. Reads `{"kind", "payload"}`
  /// lines from stdin and submits them.
  Run,
  /// Queue a mutation for the next sync
  Enqueue {
    kind: String,
    /// JSON payload
    payload: String,
  },
  /// List queued mutations
  Status,
  /// Reset a permanently failed mutation to pending
  Retry { id: i64 },
  /// Drop a permanently failed mutation
  Discard { id: i64 },
  /// Fetch a path through the cache layer
  Fetch { path: String },
}

/// One stdin line in `run` mode.
#[derive(Deserialize)]
struct SubmitLine {
  kind: String,
  payload: serde_json::Value,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let db_path = match args.db {
    Some(path) => path,
    None => Config::default_db_path()?,
  };
  let _guard = logging::init(&Config::data_dir()?, args.log_stderr)?;

  let store = Arc::new(QueueStore::open(&db_path, config.queue.max_attempts)?);

  match args.command {
    Command::Run => run(config, db_path, store).await,
    Command::Enqueue { kind, payload } => {
      let payload: serde_json::Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Invalid JSON payload: {}", e))?;
      if !config.endpoints.contains_key(&kind) {
        return Err(eyre!("Unknown mutation kind: {}", kind));
      }
      let id = store.enqueue(&kind, &payload)?;
      println!("queued {}", id);
      Ok(())
    }
    Command::Status => {
      let now = chrono::Utc::now();
      let items = store.all_items()?;
      if items.is_empty() {
        println!("queue is empty");
      }
      for item in items {
        println!(
          "{:>6}  {:<28} {:<9} attempts={} {}{}",
          item.id,
          item.kind,
          item.status.as_str(),
          item.attempts,
          item.queued_ago(now),
          item
            .last_error
            .map(|e| format!("  ({})", e))
            .unwrap_or_default()
        );
      }
      Ok(())
    }
    Command::Retry { id } => {
      store.retry_failed(MutationId(id))?;
      println!("{} reset to pending", id);
      Ok(())
    }
    Command::Discard { id } => {
      if store.discard(MutationId(id))? {
        println!("{} discarded", id);
        Ok(())
      } else {
        Err(eyre!("{} is not a failed mutation", id))
      }
    }
    Command::Fetch { path } => fetch(config, db_path, &path).await,
  }
}

async fn run(config: Config, db_path: PathBuf, store: Arc<QueueStore>) -> Result<()> {
  let base_url = config.server.base_url.clone();
  let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(config.server.request_timeout())?);

  let connectivity = ConnectivityMonitor::default();
  let probe_url = base_url
    .join(&config.connectivity.probe_path)
    .map_err(|e| eyre!("Invalid probe path {}: {}", config.connectivity.probe_path, e))?;
  let _probe = connectivity.spawn_probe(
    Arc::clone(&fetcher),
    probe_url,
    Duration::from_secs(config.connectivity.probe_interval_secs),
  );

  let (registry, worker_rx) = ClientRegistry::new();
  let coordinator = Arc::new(SyncCoordinator::new(
    registry.clone(),
    config.sync.tag.clone(),
    config.sync.handshake_timeout(),
  ));
  let storage = Arc::new(SqliteStorage::open(&db_path)?);
  let worker = Arc::new(Worker::new(
    storage,
    Arc::clone(&fetcher),
    base_url.clone(),
    coordinator,
  ));
  if let Err(e) = worker.install(&config.cache).await {
    warn!(version = %config.cache.version, error = %e, "Install failed, keeping previous caches");
  }
  let _listener = Arc::clone(&worker).listen(worker_rx);
  let (scheduler, _scheduler_task) =
    SyncScheduler::spawn(worker.clone(), &connectivity, config.sync.retry.clone());

  let api = MutationApi::new(fetcher, base_url, config.endpoints.clone())
    .with_token(Config::get_api_token());
  let executor = Arc::new(SyncExecutor::new(
    Arc::clone(&store),
    api.clone(),
    format!("page-{}", std::process::id()),
    config.queue.lease_ttl(),
  ));
  let _page = PageContext::open(&registry, executor).spawn();

  if !store.peek_all()?.is_empty() {
    scheduler.register(&config.sync.tag);
  }
  let gateway = MutationGateway::new(store, api, connectivity, scheduler, config.sync.tag);
  info!("fieldsync running");

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  let mut stdin_open = true;
  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      line = lines.next_line(), if stdin_open => match line {
        Ok(Some(line)) if line.trim().is_empty() => {}
        Ok(Some(line)) => submit_line(&gateway, &line).await,
        Ok(None) => stdin_open = false,
        Err(e) => {
          warn!(error = %e, "Failed to read stdin");
          stdin_open = false;
        }
      },
    }
  }

  info!("fieldsync stopping");
  Ok(())
}

async fn submit_line(gateway: &MutationGateway, line: &str) {
  let parsed: SubmitLine = match serde_json::from_str(line) {
    Ok(parsed) => parsed,
    Err(e) => {
      eprintln!("invalid line: {}", e);
      return;
    }
  };

  match gateway.submit(&parsed.kind, &parsed.payload).await {
    Ok(SubmitOutcome::Sent(response)) => println!("sent {} {}", response.status, response.body_text()),
    Ok(SubmitOutcome::Queued(id)) => println!("queued {}", id),
    Err(e) => eprintln!("rejected: {}", e),
  }
}

async fn fetch(config: Config, db_path: PathBuf, path: &str) -> Result<()> {
  let base_url = config.server.base_url.clone();
  let url = base_url
    .join(path)
    .map_err(|e| eyre!("Invalid path {}: {}", path, e))?;
  let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(config.server.request_timeout())?);
  let (registry, _worker_rx) = ClientRegistry::new();
  let coordinator = Arc::new(SyncCoordinator::new(
    registry,
    config.sync.tag.clone(),
    config.sync.handshake_timeout(),
  ));
  let worker = Worker::new(Arc::new(SqliteStorage::open(&db_path)?), fetcher, base_url, coordinator);
  if let Err(e) = worker.install(&config.cache).await {
    warn!(version = %config.cache.version, error = %e, "Install failed");
  }

  let served = worker.handle_fetch(FetchRequest::get(url)).await?;
  eprintln!("{} ({:?})", served.response.status, served.source);
  println!("{}", served.response.body_text());
  if let Some(revalidation) = served.revalidation {
    let _ = revalidation.await;
  }
  Ok(())
}
