//! Tracing subscriber setup
//!
//! `RUST_LOG` takes precedence over the configured filter. When a log
//! directory is configured a daily rolling file layer is added; the returned
//! guard must stay alive for buffered lines to be flushed.

use crate::config::LogSettings;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the filter from the environment, falling back to `settings.filter`
pub fn env_filter(settings: &LogSettings) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.filter))
}

/// Install the global subscriber.
///
/// Returns the file writer guard when file logging is enabled. Calling this
/// twice is harmless; the second registration is ignored.
pub fn init(settings: &LogSettings) -> Option<WorkerGuard> {
    let (file_layer, guard) = match &settings.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, &settings.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let result = tracing_subscriber::registry()
        .with(env_filter(settings))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .with(file_layer)
        .try_init();

    if let Err(e) = result {
        tracing::debug!("Tracing subscriber already installed: {}", e);
    }

    guard
}

/// Subscriber for tests: writes through the test harness capture
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
