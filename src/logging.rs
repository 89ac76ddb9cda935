//! Tracing setup: stderr output plus an optional rolling log file.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LogConfig;

/// Filter precedence: `OFFLINE_RELAY_LOG`, then `RUST_LOG`, then config.
fn filter(config: &LogConfig) -> EnvFilter {
  std::env::var("OFFLINE_RELAY_LOG")
    .or_else(|_| std::env::var("RUST_LOG"))
    .ok()
    .and_then(|directive| EnvFilter::try_new(directive).ok())
    .unwrap_or_else(|| EnvFilter::new(&config.level))
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer; keep it alive for the life of
/// the process.
pub fn init(config: &LogConfig, data_dir: &Path) -> Result<Option<WorkerGuard>> {
  let stderr = fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(true)
    .with_filter(filter(config));

  let (file, guard) = if config.file {
    let log_dir = data_dir.join("log");
    std::fs::create_dir_all(&log_dir)
      .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

    let appender = tracing_appender::rolling::daily(&log_dir, "offline-relay.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = fmt::layer()
      .with_writer(writer)
      .with_ansi(false)
      .with_target(true)
      .with_filter(filter(config));
    (Some(layer), Some(guard))
  } else {
    (None, None)
  };

  tracing_subscriber::registry()
    .with(stderr)
    .with(file)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
