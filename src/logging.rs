// src/logging.rs
//! Tracing subscriber initialization helpers.
//!
//! Call one of these once at application startup, before `Server::serve`.
//! The log level is controlled by the `RUST_LOG` environment variable
//! (`RUST_LOG=uvhttp=debug` shows per-request traces).

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging with sensible defaults (`info` unless `RUST_LOG` is set).
///
/// # Panics
///
/// Panics if a global subscriber was already installed.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize logging with an explicit default level instead of `RUST_LOG`.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
