//! Structured logging for tori.
//!
//! The front-end logs to stderr. The daemon runs detached without a terminal,
//! so it additionally writes everything to a log file.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// How much reaches stderr
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Errors only
    #[default]
    Quiet,
    Normal,
    Verbose,
    Trace,
}

impl Verbosity {
    /// `-v` count to verbosity; anything past `-vv` is trace
    pub fn from_occurrences(count: u8) -> Self {
        match count {
            0 => Verbosity::Quiet,
            1 => Verbosity::Normal,
            2 => Verbosity::Verbose,
            _ => Verbosity::Trace,
        }
    }

    pub fn as_level_filter(&self) -> LevelFilter {
        match self {
            Verbosity::Quiet => LevelFilter::ERROR,
            Verbosity::Normal => LevelFilter::INFO,
            Verbosity::Verbose => LevelFilter::DEBUG,
            Verbosity::Trace => LevelFilter::TRACE,
        }
    }
}

/// Where a process sends its logs
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub verbosity: Verbosity,
    /// Debug-level copy of everything, for processes nobody watches
    pub log_file: Option<PathBuf>,
}

impl LogConfig {
    /// Short-lived front-end: stderr only
    pub fn front_end(verbose: u8) -> Self {
        Self {
            verbosity: Verbosity::from_occurrences(verbose),
            log_file: None,
        }
    }

    /// Detached daemon: at least info on stderr, plus the log file
    pub fn daemon(verbose: u8, log_file: impl Into<PathBuf>) -> Self {
        Self {
            verbosity: Verbosity::from_occurrences(verbose.max(1)),
            log_file: Some(log_file.into()),
        }
    }
}

/// Flushes the log file when dropped; hold it until the process exits
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Appender for `path`, creating its directory first
fn file_writer(path: &Path) -> (NonBlocking, WorkerGuard) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tori.log".to_string());

    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("Failed to create log directory {}: {}", dir.display(), e);
    }
    tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name))
}

/// Install the global subscriber described by `config`
///
/// `RUST_LOG` overrides the default level. Installing twice is a no-op.
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.verbosity.as_level_filter().into())
        .from_env_lossy();

    let (file_layer, file_guard) = match config.log_file.as_deref() {
        Some(path) => {
            let (writer, guard) = file_writer(path);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_writer(writer)
                .with_filter(LevelFilter::DEBUG);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stderr_layer = fmt::layer()
        .with_ansi(true)
        .with_target(false)
        .with_timer(fmt::time::uptime())
        .with_writer(std::io::stderr)
        .with_filter(config.verbosity.as_level_filter());

    // a respawned daemon or a test binary may already have one
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    LogGuard {
        _file_guard: file_guard,
    }
}
