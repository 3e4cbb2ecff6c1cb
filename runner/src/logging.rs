//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! The filter comes from `--log-level` if given, then from `CHUNKSWEEP_LOG` (full `EnvFilter`
//! syntax), and defaults to `info`. Logs go to stderr, worker processes report their outcome
//! over stdout.

use clap::ValueEnum;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "CHUNKSWEEP_LOG";

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Initialise the global subscriber, later calls are ignored
pub fn init_logging(level: Option<LogLevel>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level.directive()),
        None => EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
