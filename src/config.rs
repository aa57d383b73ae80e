//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.

use chrono::Duration;

use crate::error::{Error, Result};
use crate::queue::DEFAULT_RETENTION_DAYS;

#[derive(Debug)]
pub struct Config {
    /// Path to the SQLite database file.
    pub database_path: String,
    /// Retention window for purge. Inactive checksheets older than this are
    /// eligible for deletion.
    pub retention: Duration,
    /// Keep-alive ping interval on subscriber streams.
    pub heartbeat_interval: std::time::Duration,
    /// Subscriber connections older than this are reclaimed as stale.
    pub stale_after: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_path: required_var("CHECKQ_DATABASE_PATH")?,
            retention: Duration::days(int_var(
                "CHECKQ_RETENTION_DAYS",
                DEFAULT_RETENTION_DAYS,
            )?),
            heartbeat_interval: std::time::Duration::from_secs(
                int_var("CHECKQ_HEARTBEAT_SECS", 10)? as u64,
            ),
            stale_after: Duration::days(int_var("CHECKQ_STALE_AFTER_DAYS", 3)?),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn int_var(name: &str, default: i64) -> Result<i64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("{name} must be an integer, got {raw:?}"))),
        Err(_) => Ok(default),
    }
}
