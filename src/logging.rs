//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins when set; otherwise the level is `info`, or `debug` when
//! `logging.debug` is on. Lines are JSON unless `logging.format = "text"`,
//! and go to stderr unless `logging.file` names a file to append to.

use crate::config::{LogFormat, LoggingSection};
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn filter(settings: &LoggingSection) -> EnvFilter {
    let default = if settings.debug { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns an error if the log file cannot be opened or a subscriber is
/// already installed.
pub fn init(settings: &LoggingSection) -> Result<()> {
    let writer = match &settings.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            fmt::writer::BoxMakeWriter::new(Arc::new(file))
        },
        None => fmt::writer::BoxMakeWriter::new(std::io::stderr),
    };

    let layer = match settings.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(writer)
            .boxed(),
        LogFormat::Text => fmt::layer().with_writer(writer).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter(settings))
        .with(layer)
        .try_init()
        .context("Failed to install tracing subscriber")
}

/// Plain stderr logging for one-shot commands that run before a config is loaded.
pub fn init_stderr() {
    let _ = tracing_subscriber::registry()
        .with(filter(&LoggingSection::default()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
