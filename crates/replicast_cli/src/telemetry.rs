//! Logging setup.
//!
//! Two layers share one `EnvFilter`: human-readable output on stderr and a
//! persisted log file written through a non-blocking appender. The file is
//! truncated at start.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::metadata::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Default log file, relative to the working directory.
pub const DEFAULT_LOG_FILE: &str = "output.log";

/// Logging options taken from the command line.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Log at debug level instead of info.
    pub verbose: bool,
    /// Log file; `None` logs to stderr only.
    pub log_file: Option<PathBuf>,
}

impl TelemetryConfig {
    /// Creates a configuration writing to `log_file`.
    pub fn new(verbose: bool, log_file: Option<PathBuf>) -> Self {
        Self { verbose, log_file }
    }
}

/// Flushes the log file when dropped.
pub struct TelemetryGuard {
    _file: Option<WorkerGuard>,
}

/// Installs the global subscriber.
///
/// `RUST_LOG` overrides the verbosity. A log file that cannot be opened is
/// reported and logging continues on stderr.
pub fn init(config: TelemetryConfig) -> TelemetryGuard {
    let filter = EnvFilter::builder()
        .with_default_directive(level(config.verbose).into())
        .from_env_lossy();

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = vec![Box::new(
        tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(false),
    )];

    let mut file_guard = None;
    let mut file_error = None;
    if let Some(path) = &config.log_file {
        match open_log_file(path) {
            Ok(file) => {
                let (writer, guard) = tracing_appender::non_blocking(file);
                layers.push(Box::new(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true),
                ));
                file_guard = Some(guard);
            }
            Err(e) => file_error = Some(format!("cannot open log file {}: {e}", path.display())),
        }
    }

    layers.push(Box::new(filter));
    Registry::default().with(layers).init();

    if let Some(error) = file_error {
        tracing::warn!("{error}");
    }

    TelemetryGuard { _file: file_guard }
}

fn level(verbose: bool) -> LevelFilter {
    if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    }
}

/// Creates or truncates the log file, creating its directory if needed.
pub fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    File::create(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn log_file_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.log");
        fs::write(&path, "previous run\n").unwrap();

        let mut file = open_log_file(&path).unwrap();
        file.write_all(b"fresh\n").unwrap();
        drop(file);

        assert_eq!(fs::read_to_string(&path).unwrap(), "fresh\n");
    }

    #[test]
    fn log_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/nested/output.log");
        open_log_file(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn verbosity_levels() {
        assert_eq!(level(false), LevelFilter::INFO);
        assert_eq!(level(true), LevelFilter::DEBUG);
    }
}
