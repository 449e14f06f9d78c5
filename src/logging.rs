//! Logging setup.
//!
//! The crate logs through `tracing`. Applications that install their own
//! subscriber need nothing from this module; [`init_logging`] is a
//! convenience for callers that want the driver to set one up.
//!
//! Filter priority:
//!
//! 1. `log_level` connection parameter (a level such as `debug`, or a full
//!    filter directive such as `hyperarrow_rs::query=trace`)
//! 2. `RUST_LOG` environment variable
//! 3. `hyperarrow_rs=warn`
//!
//! ```no_run
//! use hyperarrow_rs::logging::{init_logging, LogConfig};
//!
//! init_logging(&LogConfig {
//!     level: Some("debug".to_string()),
//!     file: Some("/tmp/hyperarrow.log".into()),
//! });
//! ```

use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_subscriber::{
    fmt::{self, time::SystemTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

const DEFAULT_DIRECTIVE: &str = "hyperarrow_rs=warn";

/// Where and how much to log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// `off`, a level, or a filter directive
    pub level: Option<String>,
    /// Log file; stderr when unset
    pub file: Option<PathBuf>,
}

impl LogConfig {
    fn is_off(&self) -> bool {
        self.level
            .as_deref()
            .is_some_and(|level| level.eq_ignore_ascii_case("off"))
    }

    fn filter(&self) -> EnvFilter {
        match &self.level {
            Some(level) if level.contains('=') => EnvFilter::new(level),
            Some(level) => EnvFilter::new(format!("hyperarrow_rs={}", level.to_lowercase())),
            None => EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE)),
        }
    }
}

/// Install a global `tracing` subscriber.
///
/// Only the first call per process has an effect. Installation is skipped
/// when another subscriber is already set.
pub fn init_logging(config: &LogConfig) {
    LOGGING_INITIALIZED.get_or_init(|| {
        if config.is_off() {
            return;
        }
        let filter = config.filter();

        match &config.file {
            Some(path) => {
                let file = match std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                {
                    Ok(f) => f,
                    Err(e) => {
                        eprintln!(
                            "hyperarrow-rs: failed to open log file {}: {}",
                            path.display(),
                            e
                        );
                        return;
                    }
                };

                tracing_subscriber::registry()
                    .with(filter)
                    .with(
                        fmt::layer()
                            .with_writer(file)
                            .with_ansi(false)
                            .with_timer(SystemTime),
                    )
                    .try_init()
                    .ok();
            }
            None => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(
                        fmt::layer()
                            .with_writer(std::io::stderr)
                            .with_timer(SystemTime),
                    )
                    .try_init()
                    .ok();
            }
        }
    });
}
