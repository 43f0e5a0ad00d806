//! Global logging facade
//!
//! Keeps the `logger::info("source", message)` calling convention used across
//! the codebase while delegating to `tracing` for output and filtering.

use tracing_subscriber::EnvFilter;

/// Install the tracing subscriber. Call once at startup.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

pub fn debug(source: &str, message: &str) {
    tracing::debug!(source = source, "{}", message);
}

pub fn info(source: &str, message: &str) {
    tracing::info!(source = source, "{}", message);
}

pub fn warn(source: &str, message: &str) {
    tracing::warn!(source = source, "{}", message);
}

pub fn error(source: &str, message: &str) {
    tracing::error!(source = source, "{}", message);
}
