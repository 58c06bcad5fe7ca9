use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lexsync::config::Config;
use lexsync::connectivity::ConnectivityEvent;
use lexsync::sync::SyncEvent;
use lexsync::OfflineEngine;

#[derive(Parser, Debug)]
#[command(name = "lexsync")]
#[command(about = "Offline cache and sync engine for the legal document portal")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/lexsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  /// Keep everything in memory; nothing is written to the data directory
  #[arg(long)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pull every remote table into the local cache
  Export,
  /// Load a previously exported manifest file
  Import { file: PathBuf },
  /// Show the last export
  Status,
  /// Show cache and queue statistics
  Stats,
  /// Evict expired and outdated cache entries
  Sweep,
  /// Remove exported tables and the manifest
  Clear {
    /// Drop pending sync jobs as well
    #[arg(long)]
    queue: bool,
  },
  /// Push pending mutations to the remote now
  Drain,
  /// List jobs that exhausted their retries
  Failed {
    /// Forget the listed jobs
    #[arg(long)]
    clear: bool,
  },
  /// Probe the remote and drain automatically until interrupted
  Watch,
}

fn init_tracing(log_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)?;
  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "lexsync.log"));

  let filter = EnvFilter::try_from_env("LEXSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
  let stderr = verbose.then(|| fmt::layer().with_writer(std::io::stderr));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(stderr)
    .try_init()?;
  Ok(guard)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_tracing(&config.data_dir()?.join("logs"), args.verbose)?;

  let engine = if args.ephemeral {
    OfflineEngine::open_ephemeral(&config)?
  } else {
    OfflineEngine::open(&config)?
  };

  match args.command {
    Command::Export => {
      if !engine.check_connectivity().await {
        return Err(eyre!("Remote {} is unreachable", config.remote.url));
      }
      engine.on_progress(|p| {
        if let Some(table) = &p.current_table {
          eprintln!("[{:>3}%] {}", p.percentage, table);
        }
      });
      let result = engine.sync_all_data().await;
      print_json(&result)?;
      if !result.success {
        return Err(eyre!("Export finished with {} error(s)", result.errors.len()));
      }
    }
    Command::Import { file } => {
      let report = engine.import_file(&file).await?;
      print_json(&report)?;
    }
    Command::Status => print_json(&engine.check_sync_status().await)?,
    Command::Stats => {
      engine.check_connectivity().await;
      print_json(&engine.get_cache_stats()?)?;
    }
    Command::Sweep => {
      let report = engine.cleanup_cache().await?;
      println!(
        "scanned {}, removed {}, failed {}",
        report.scanned, report.removed, report.failed
      );
    }
    Command::Clear { queue } => {
      let removed = engine.clear_local_data().await?;
      println!("removed {} snapshot entries", removed);
      if queue {
        let pending = engine.pending_jobs().len();
        engine.clear_sync_queue()?;
        println!("dropped {} pending sync jobs", pending);
      }
    }
    Command::Drain => {
      if !engine.check_connectivity().await {
        return Err(eyre!("Remote {} is unreachable", config.remote.url));
      }
      match engine.drain_sync_queue().await {
        Some(report) => println!(
          "succeeded {}, retried {}, dropped {}, remaining {}",
          report.succeeded, report.retried, report.dropped, report.remaining
        ),
        None => println!("a drain is already running"),
      }
      let failed = engine.failed_jobs().len();
      if failed > 0 {
        warn!(failed, "sync jobs permanently failed; see `lexsync failed`");
      }
    }
    Command::Failed { clear } => {
      print_json(&engine.failed_jobs())?;
      if clear {
        engine.clear_failed_jobs()?;
      }
    }
    Command::Watch => watch(&engine).await?,
  }

  Ok(())
}

async fn watch(engine: &OfflineEngine) -> Result<()> {
  let mut connectivity = engine.subscribe_connectivity();
  let mut events = engine.subscribe_sync_events();
  let probe = engine
    .start_probe()
    .ok_or_else(|| eyre!("No reachability probe configured"))?;
  info!(pending = engine.pending_jobs().len(), "watching for connectivity changes");

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      event = connectivity.recv() => match event {
        Ok(ConnectivityEvent::Online) => println!("online"),
        Ok(ConnectivityEvent::Offline) => println!("offline, working from local data"),
        Err(RecvError::Lagged(_)) => {}
        Err(RecvError::Closed) => break,
      },
      event = events.recv() => match event {
        Ok(SyncEvent::DrainFinished(report)) => println!(
          "drain: succeeded {}, dropped {}, remaining {}",
          report.succeeded, report.dropped, report.remaining
        ),
        Ok(SyncEvent::JobDropped(failed)) => {
          println!("job {} permanently failed: {}", failed.job.id, failed.error)
        }
        Ok(_) | Err(RecvError::Lagged(_)) => {}
        Err(RecvError::Closed) => break,
      },
    }
  }

  probe.abort();
  Ok(())
}
