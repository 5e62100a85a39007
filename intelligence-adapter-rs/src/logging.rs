//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. JSON output is the production
//! default; the human readable format is meant for local runs. `RUST_LOG`
//! takes precedence over the configured level.

use std::sync::atomic::{AtomicBool, Ordering};

use config_rs::LoggingSettings;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, thiserror::Error)]
#[error("failed to install tracing subscriber: {0}")]
pub struct LoggingError(String);

/// Initializes the global subscriber. Later calls are no-ops.
pub fn init_logging(settings: &LoggingSettings, service_name: &str) -> Result<(), LoggingError> {
    if LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},rdkafka=warn,hyper=warn", settings.level)));

    let json_layer = settings.json_format.then(|| {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
    });
    let text_layer = (!settings.json_format).then(|| fmt::layer().with_target(true).with_thread_ids(true));

    let installed = Registry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init();

    if let Err(e) = installed {
        LOGGING_INITIALIZED.store(false, Ordering::SeqCst);
        return Err(LoggingError(e.to_string()));
    }

    info!(
        service = %service_name,
        level = %settings.level,
        json = %settings.json_format,
        "Logging initialized"
    );
    Ok(())
}
