//! Structured logging setup driven by [`LoggingConfig`].
//!
//! The crate itself only emits `tracing` events; installing a subscriber is
//! left to the embedding application, which can call [`init`] with its
//! configuration. Calling it twice is harmless: the second call reports that a
//! global subscriber already exists and leaves it in place.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;

use crate::config::LoggingConfig;
use crate::error::{Result, TransportError};

/// Install a global `tracing` subscriber for `config`.
///
/// Returns `Ok(false)` when a subscriber was already installed.
pub fn init(config: &LoggingConfig) -> Result<bool> {
    let errors = config.validate();
    if !errors.is_empty() {
        return Err(TransportError::ConfigError(errors.join("; ")));
    }

    let level = LevelFilter::from_level(config.log_level);

    let installed = match (config.log_to_file, config.json_format) {
        (true, json) => {
            let path = config.log_file_path.as_deref().ok_or_else(|| {
                TransportError::ConfigError("log_file_path must be set".to_string())
            })?;
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let builder = fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            if json {
                builder.json().try_init().is_ok()
            } else {
                builder.try_init().is_ok()
            }
        }
        (false, true) => fmt().with_max_level(level).json().try_init().is_ok(),
        (false, false) => fmt().with_max_level(level).try_init().is_ok(),
    };

    if installed {
        tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    }

    Ok(installed)
}
