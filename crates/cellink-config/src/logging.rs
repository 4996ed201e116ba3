//! Tracing subscriber setup.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// The `[defaults.logging]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset, e.g. "info" or "cellink_core=debug".
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Also write to this file (appended, never rotated).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            file: None,
        }
    }
}

impl LoggingConfig {
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Install the global subscriber.
///
/// Returns the file writer guard when a log file is configured; keep it
/// alive for as long as logs should be flushed. Installing twice is a no-op.
pub fn init_tracing(config: &LoggingConfig) -> Option<WorkerGuard> {
    let stderr_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file_layer, guard) = match config.file.as_deref().and_then(split_log_path) {
        Some((dir, name)) => {
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(config.filter())
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .ok()?;

    guard
}

fn split_log_path(path: &std::path::Path) -> Option<(PathBuf, std::ffi::OsString)> {
    let name = path.file_name()?.to_owned();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Some((dir, name))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn bare_file_name_logs_to_the_working_directory() {
        let (dir, name) = split_log_path(Path::new("cellink.log")).unwrap();
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(name, "cellink.log");
    }

    #[test]
    fn nested_path_is_split() {
        let (dir, name) = split_log_path(Path::new("/var/log/cellink/press.log")).unwrap();
        assert_eq!(dir, PathBuf::from("/var/log/cellink"));
        assert_eq!(name, "press.log");
    }

    #[test]
    fn root_has_no_file_name() {
        assert!(split_log_path(Path::new("/")).is_none());
    }

    #[test]
    fn logging_table_fills_missing_keys() {
        let config: LoggingConfig = toml::from_str("json = true").unwrap();
        assert_eq!(config.level, "info");
        assert!(config.json);
        assert!(config.file.is_none());
    }
}
