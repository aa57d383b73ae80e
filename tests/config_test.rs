//! Tests for environment-based configuration.
//!
//! The process environment is shared, so every test holds ENV_LOCK while it
//! mutates vars.

use std::sync::Mutex;

use checkq::config::Config;
use checkq::error::Error;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    unsafe {
        std::env::remove_var("CHECKQ_DATABASE_PATH");
        std::env::remove_var("CHECKQ_RETENTION_DAYS");
        std::env::remove_var("CHECKQ_HEARTBEAT_SECS");
        std::env::remove_var("CHECKQ_STALE_AFTER_DAYS");
        std::env::remove_var("LOG_LEVEL");
    }
}

#[test]
fn config_from_env_fails_without_database_path() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let result = Config::from_env();
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn config_from_env_applies_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    unsafe {
        std::env::set_var("CHECKQ_DATABASE_PATH", "/tmp/checkq-test.db");
    }

    let config = Config::from_env().unwrap();
    assert_eq!(config.database_path, "/tmp/checkq-test.db");
    assert_eq!(config.retention, chrono::Duration::days(7));
    assert_eq!(
        config.heartbeat_interval,
        std::time::Duration::from_secs(10)
    );
    assert_eq!(config.stale_after, chrono::Duration::days(3));
    assert_eq!(config.log_level, "info");

    clear_env();
}

#[test]
fn config_from_env_reads_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    unsafe {
        std::env::set_var("CHECKQ_DATABASE_PATH", "/tmp/checkq-test.db");
        std::env::set_var("CHECKQ_RETENTION_DAYS", "14");
        std::env::set_var("CHECKQ_HEARTBEAT_SECS", "5");
        std::env::set_var("CHECKQ_STALE_AFTER_DAYS", "1");
        std::env::set_var("LOG_LEVEL", "debug");
    }

    let config = Config::from_env().unwrap();
    assert_eq!(config.retention, chrono::Duration::days(14));
    assert_eq!(config.heartbeat_interval, std::time::Duration::from_secs(5));
    assert_eq!(config.stale_after, chrono::Duration::days(1));
    assert_eq!(config.log_level, "debug");

    clear_env();
}

#[test]
fn config_from_env_rejects_non_integer_days() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    unsafe {
        std::env::set_var("CHECKQ_DATABASE_PATH", "/tmp/checkq-test.db");
        std::env::set_var("CHECKQ_RETENTION_DAYS", "a week");
    }

    let result = Config::from_env();
    assert!(matches!(result, Err(Error::Config(_))));

    clear_env();
}
