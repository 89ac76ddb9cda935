use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use offline_relay::cache::{partition_name, PartitionKind, SqliteStorage};
use offline_relay::config::Config;
use offline_relay::db::Database;
use offline_relay::event::ConnectivityMonitor;
use offline_relay::logging;
use offline_relay::network::{HttpNetwork, Network};
use offline_relay::outbox::SqliteActionStore;
use offline_relay::relay::{Relay, RelayOptions};
use offline_relay::server;

#[derive(Parser, Debug)]
#[command(name = "offline-relay")]
#[command(about = "An offline-first caching proxy for web applications")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-relay/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin to forward requests to
  #[arg(long)]
  origin: Option<Url>,

  /// Address to serve the proxy on
  #[arg(long)]
  listen: Option<SocketAddr>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
  /// Run the proxy (default)
  Serve,
  /// Replay queued offline actions once and exit
  Replay,
  /// Show cached partitions and queued actions
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(listen) = args.listen {
    config.listen = listen;
  }

  let data_dir = config.data_dir()?;
  let _log_guard = logging::init(&config.log, &data_dir)?;

  let db = Database::open(&Database::default_path(&data_dir))?;
  let store = Arc::new(SqliteStorage::new(db.clone()));
  let actions = Arc::new(SqliteActionStore::new(db));
  let network: Arc<dyn Network> = Arc::new(HttpNetwork::new(config.request_timeout())?);
  let relay = Relay::new(
    RelayOptions::from(&config),
    store,
    actions,
    Arc::clone(&network),
  )?;

  match args.command.unwrap_or(Command::Serve) {
    Command::Serve => serve(&config, Arc::new(relay), network).await,
    Command::Replay => replay(&relay).await,
    Command::Status => status(&config, &relay).await,
  }
}

async fn serve(config: &Config, relay: Arc<Relay>, network: Arc<dyn Network>) -> Result<()> {
  if let Err(e) = relay.lifecycle().boot(&config.version).await {
    match relay.lifecycle().active_version().await {
      Some(active) => {
        warn!(version = %config.version, error = %e, "install failed, still serving {}", active)
      }
      None => return Err(eyre!("Failed to start version {}: {}", config.version, e)),
    }
  }

  match relay.outbox().replay_all().await {
    Ok(report) if !report.replayed.is_empty() || report.remaining > 0 => {
      info!(replayed = report.replayed.len(), remaining = report.remaining, "startup replay")
    }
    Ok(_) => {}
    Err(e) => warn!(error = %e, "startup replay failed"),
  }

  let mut monitor =
    ConnectivityMonitor::new(network, config.origin.clone(), config.probe_interval());
  let events = Arc::clone(&relay);
  tokio::spawn(async move {
    while let Some(event) = monitor.next().await {
      if let Err(e) = events.dispatch(event).await {
        warn!(error = %e, "event handling failed");
      }
    }
  });

  server::serve(relay, config.listen, shutdown_signal()).await
}

async fn replay(relay: &Relay) -> Result<()> {
  let report = relay
    .outbox()
    .replay_all()
    .await
    .map_err(|e| eyre!("Replay failed: {}", e))?;

  for id in &report.replayed {
    println!("replayed {}", id);
  }
  println!(
    "{} replayed, {} still queued",
    report.replayed.len(),
    report.remaining
  );
  Ok(())
}

async fn status(config: &Config, relay: &Relay) -> Result<()> {
  let status = relay
    .status()
    .await
    .map_err(|e| eyre!("Failed to read status: {}", e))?;

  let installed = status
    .partitions
    .iter()
    .any(|p| p.name == partition_name(PartitionKind::Static, &config.version));
  println!(
    "version {} ({})",
    config.version,
    if installed { "installed" } else { "not installed" }
  );
  for partition in &status.partitions {
    println!("  {:<24} {:>6} entries", partition.name, partition.entries);
  }
  println!("{} queued actions", status.queued_actions);
  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!(error = %e, "failed to listen for ctrl-c");
    std::future::pending::<()>().await;
  }
  info!("shutting down");
}
