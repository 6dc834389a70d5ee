//! Structured logging bootstrap built on `tracing-subscriber`.
//!
//! The library itself only emits `tracing` events; applications call
//! [`init_logging`] once at startup to install a subscriber driven by
//! [`LoggingConfig`]. `RUST_LOG`, when set, overrides the configured level.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::error::{EngineError, Result};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber described by `config`.
///
/// Fails with a `Config` error when the configuration is invalid, the log file
/// cannot be opened, or a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let problems = config.validate();
    if !problems.is_empty() {
        return Err(EngineError::Config(problems.join("; ")));
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string().to_lowercase()));

    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.log_to_console {
        layers.push(if config.json_format {
            Box::new(fmt::layer().json().with_target(true))
        } else {
            Box::new(fmt::layer().with_target(true))
        });
    }

    if config.log_to_file {
        if let Some(path) = &config.log_file_path {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| EngineError::Config(format!("Failed to open log file: {e}")))?;
            let writer = Mutex::new(file);
            layers.push(if config.json_format {
                Box::new(fmt::layer().json().with_writer(writer))
            } else {
                Box::new(fmt::layer().with_ansi(false).with_writer(writer))
            });
        }
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| EngineError::Config(format!("Failed to install subscriber: {e}")))?;

    info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}
