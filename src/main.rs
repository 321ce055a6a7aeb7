use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use taskshell::cache::{CacheStore, MemoryStorage, SqliteStorage};
use taskshell::config::{Config, StorageBackend};
use taskshell::http::Request;
use taskshell::loader::{load_tasks, TaskSource};
use taskshell::network::HttpFetcher;
use taskshell::worker::{Event, Message, Outcome, ServiceWorker, State};

#[derive(Parser, Debug)]
#[command(name = "taskshell")]
#[command(about = "Offline caching worker for the task-list app")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./taskshell.yaml or $XDG_CONFIG_HOME/taskshell/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin the app is served from
  #[arg(short, long)]
  origin: Option<String>,

  /// Worker version tag (partition names derive from it)
  #[arg(long = "version-tag")]
  version_tag: Option<String>,

  /// Also write logs to a daily rolling file in this directory
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Cache the app shell for this version (and activate unless told to wait)
  Install,
  /// Sweep partitions of other versions and take over
  Activate,
  /// Route paths through the worker and print the responses
  Fetch {
    #[arg(required = true)]
    paths: Vec<String>,
    /// Print status lines only
    #[arg(short, long)]
    quiet: bool,
  },
  /// Load the task list through the worker
  Tasks,
  /// List cache partitions
  Partitions {
    /// Show the entries of each partition
    #[arg(short, long)]
    entries: bool,
  },
  /// Ask a waiting worker to take over immediately
  SkipWaiting,
  /// Serve the app locally with every request routed through the worker
  #[cfg(feature = "server")]
  Serve {
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: std::net::SocketAddr,
  },
}

/// Initialize the tracing subscriber for logging.
///
/// RUST_LOG controls the level (default: warn).
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
  let stderr = fmt::layer().with_writer(std::io::stderr);

  match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "taskshell.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .init();
      None
    }
  }
}

fn open_store(config: &Config) -> Result<CacheStore> {
  match config.storage.backend {
    StorageBackend::Memory => Ok(CacheStore::new(MemoryStorage::new())),
    StorageBackend::Sqlite => {
      let path = config.storage.database_path()?;
      let storage = SqliteStorage::open_at(&path)
        .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;
      Ok(CacheStore::new(storage))
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.log_dir.as_deref());

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(version) = args.version_tag {
    config.worker.version = version;
  }

  let origin = config.origin_url()?;
  let store = open_store(&config)?;
  let fetcher = Arc::new(HttpFetcher::new()?);
  let worker = ServiceWorker::new(config.worker.clone(), origin, store, fetcher)?;
  let state = worker.state()?;
  info!(version = %config.worker.version, state = state.as_str(), "Worker ready");

  match args.command {
    Command::Install => {
      if worker.state()? != State::Installing {
        println!("{} is already installed", config.worker.shell_partition());
      } else if let Outcome::Installed { assets } = worker.dispatch(Event::Install).await? {
        println!(
          "Installed {} shell assets into {}",
          assets,
          config.worker.shell_partition()
        );
      }
      println!("State: {}", worker.state()?.as_str());
    }
    Command::Activate => {
      if let Outcome::Activated { retired } = worker.dispatch(Event::Activate).await? {
        print_retired(&retired);
      }
      println!("State: {}", worker.state()?.as_str());
    }
    Command::Fetch { paths, quiet } => {
      worker.ensure_active().await?;
      for path in paths {
        let request = Request::get_path(worker.origin(), &path)?;
        let response = worker.fetch(request).await?;
        println!(
          "{} {} {} [{}]",
          path,
          response.status(),
          response.status_text(),
          response.source().as_str()
        );
        if !quiet {
          println!("{}", response.text()?);
        }
      }
    }
    Command::Tasks => {
      worker.ensure_active().await?;
      let loaded = load_tasks(&worker).await?;
      let stats = loaded.stats();
      let source = match loaded.source {
        TaskSource::Worker(source) => source.as_str(),
        TaskSource::LocalCopy => "local copy",
      };

      println!(
        "{} tasks ({} pending, {} completed, {} high priority) from {}",
        stats.total, stats.pending, stats.completed, stats.urgent, source
      );
      for task in &loaded.tasks {
        let mark = if task.completed { "✓" } else { "○" };
        println!("  {} {} [{}]", mark, task.task, task.priority.as_str());
      }
    }
    Command::Partitions { entries } => {
      for name in worker.store().keys()? {
        println!("{}", name);
        if entries {
          for entry in worker.store().partition(&name).entries()? {
            println!(
              "  {} {} {}B {}",
              entry.status,
              entry.key,
              entry.size,
              entry.stored_at.format("%Y-%m-%d %H:%M:%S")
            );
          }
        }
      }
    }
    Command::SkipWaiting => {
      if let Outcome::Activated { retired } =
        worker.dispatch(Event::Message(Message::SkipWaiting)).await?
      {
        print_retired(&retired);
      }
      println!("State: {}", worker.state()?.as_str());
    }
    #[cfg(feature = "server")]
    Command::Serve { listen } => {
      worker.ensure_active().await?;
      taskshell::server::serve(listen, Arc::new(worker)).await?;
    }
  }

  Ok(())
}

fn print_retired(retired: &[String]) {
  if retired.is_empty() {
    println!("No outdated partitions");
  }
  for name in retired {
    println!("Deleted {}", name);
  }
}
