//! Tracing initialization shared by the tether binaries.
//!
//! ```ignore
//! let mut log_config = LogConfig::from_env("info").with_stderr();
//! if cli.verbose {
//!     log_config = log_config.with_level("debug");
//! }
//! let _logging_guards = init_logging(&log_config)?;
//! ```
//!
//! `tether-bundle` must never log to stdout: its stdout carries the RPC
//! stream.

use std::fs::OpenOptions;
use std::path::PathBuf;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{EnvError, EnvParser};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to open log file {}: {source}", path.display())]
    OpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },

    #[error("logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Where and how to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: String,
    pub stderr: bool,
    pub file: Option<PathBuf>,
    pub json: bool,
}

impl LogConfig {
    /// Read `TETHER_LOG_LEVEL`, `TETHER_LOG_FILE` and `TETHER_LOG_JSON`.
    ///
    /// Invalid values fall back to defaults; the problems are returned by
    /// [`LogConfig::from_env_checked`] for callers that want to report them.
    pub fn from_env(default_level: &str) -> Self {
        Self::from_env_checked(default_level).0
    }

    pub fn from_env_checked(default_level: &str) -> (Self, Vec<EnvError>) {
        let mut parser = EnvParser::new();
        let config = Self {
            level: parser.get_log_level("LOG_LEVEL", default_level).value,
            stderr: false,
            file: parser.get_path("LOG_FILE").value,
            json: parser.get_bool("LOG_JSON", false).value,
        };
        (config, parser.take_errors())
    }

    #[must_use]
    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    #[must_use]
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// `RUST_LOG` wins over the configured level when set.
    pub fn filter_directives(&self) -> String {
        match std::env::var("RUST_LOG") {
            Ok(filter) if !filter.trim().is_empty() => filter,
            _ => self.level.clone(),
        }
    }
}

/// Keeps the non-blocking file writer alive; drop it last in `main`.
#[must_use = "dropping the guards stops file logging"]
#[derive(Default)]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards, LoggingError> {
    let directives = config.filter_directives();
    let filter = EnvFilter::try_new(&directives).map_err(|err| LoggingError::Filter {
        filter: directives.clone(),
        reason: err.to_string(),
    })?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guards = LoggingGuards::default();

    if config.stderr {
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true);
        layers.push(if config.json {
            layer.json().boxed()
        } else {
            layer.compact().boxed()
        });
    }

    if let Some(path) = &config.file {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| LoggingError::OpenFile {
                path: path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| LoggingError::OpenFile {
                path: path.clone(),
                source,
            })?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        guards._file = Some(guard);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false);
        layers.push(if config.json {
            layer.json().boxed()
        } else {
            layer.boxed()
        });
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|err| LoggingError::AlreadyInitialized(err.to_string()))?;

    Ok(guards)
}
