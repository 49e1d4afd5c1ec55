//! Once-only tracing setup for tests.
//!
//! ```ignore
//! #[tokio::test]
//! async fn test_example() {
//!     tether_common::testing::init_test_logging();
//!     tracing::info!("captured by the test writer");
//! }
//! ```

use std::path::PathBuf;
use std::sync::{Mutex, Once};

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

static TEST_LOGGING_INIT: Once = Once::new();

/// Install a test subscriber; safe to call from every test.
///
/// - `TETHER_TEST_LOG_LEVEL`: level for the tether crates (default `info`)
/// - `TETHER_TEST_LOG_FILE`: also write JSON lines to this file
pub fn init_test_logging() {
    TEST_LOGGING_INIT.call_once(|| {
        let file_layer = open_log_file().map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_file(true)
                .with_line_number(true)
        });

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .compact();

        let level = std::env::var("TETHER_TEST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!(
            "tether={level},tether_common={level},tether_bundle={level}"
        ))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stderr_layer);

        // Another subscriber may already be installed by the test binary.
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn open_log_file() -> Option<std::fs::File> {
    let path = PathBuf::from(std::env::var("TETHER_TEST_LOG_FILE").ok()?);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_test_logging_is_idempotent() {
        init_test_logging();
        init_test_logging();
        tracing::info!(target: "tether_common", "logging initialized twice");
    }
}
