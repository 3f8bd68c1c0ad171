//! Tracing setup for the binary.

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LogConfig;

/// Environment variable holding the filter directive.
pub const LOG_ENV: &str = "RESYNC_LOG";

fn default_log_dir() -> Option<PathBuf> {
  dirs::data_dir().map(|d| d.join("resync").join("logs"))
}

/// Install the global subscriber: a daily-rolling file plus optional stderr.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// lifetime of the process.
pub fn init(config: &LogConfig, verbose: bool) -> Result<WorkerGuard> {
  let dir = config
    .dir
    .clone()
    .or_else(default_log_dir)
    .ok_or_else(|| eyre!("Could not determine log directory"))?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&dir, "resync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let level = config.level.as_deref().unwrap_or("info");
  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level));

  let file = fmt::layer().with_writer(writer).with_ansi(false);
  let stderr = (config.stderr || verbose).then(|| {
    fmt::layer()
      .with_writer(std::io::stderr)
      .with_target(false)
      .boxed()
  });

  tracing_subscriber::registry()
    .with(filter)
    .with(file)
    .with(stderr)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  tracing::debug!(log_dir = %dir.display(), "Logging initialized");
  Ok(guard)
}
