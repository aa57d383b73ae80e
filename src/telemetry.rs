//! Tracing initialization.
//!
//! RUST_LOG takes precedence; the configured level is the fallback.

use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Initialize the tracing subscriber.
///
/// # Errors
///
/// Returns an error if a subscriber was already installed.
pub fn init_tracing(default_level: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))
}
