use std::path::PathBuf;

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "PARROT_LOG";

const DEFAULT_FILTER: &str = "parrot=info";

/// Directory for rolling log files, `$XDG_DATA_HOME/parrot/logs`.
pub fn default_log_dir() -> Option<PathBuf> {
  dirs::data_dir().map(|d| d.join("parrot").join("logs"))
}

/// Install the global subscriber: stderr plus a daily file when `log_dir`
/// is given. Keep the returned guard alive or buffered file lines are lost.
pub fn init(log_dir: Option<PathBuf>) -> Result<Option<WorkerGuard>> {
  let filter = || EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| DEFAULT_FILTER.into());

  let stderr = fmt::layer().with_writer(std::io::stderr).with_filter(filter());

  let (file, guard) = match log_dir {
    Some(dir) if std::fs::create_dir_all(&dir).is_ok() => {
      let appender = tracing_appender::rolling::daily(dir, "parrot.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(filter());
      (Some(layer), Some(guard))
    }
    _ => (None, None),
  };

  tracing_subscriber::registry()
    .with(stderr)
    .with(file)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
