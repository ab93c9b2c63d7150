//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use crate::engine::PoolConfig;
use crate::error::{Error, Result};
use secrecy::SecretString;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub pool: PoolConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// Pool sizing starts from [`PoolConfig::default`] and is overridden by
    /// `FANLOCK_POOL_CORE_SIZE`, `FANLOCK_POOL_MAX_SIZE`,
    /// `FANLOCK_POOL_QUEUE_CAPACITY` and `FANLOCK_POOL_GRACE_SECS`.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            pool: pool_from_env(PoolConfig::default())?,
        })
    }
}

fn pool_from_env(mut pool: PoolConfig) -> Result<PoolConfig> {
    if let Some(n) = optional_var("FANLOCK_POOL_CORE_SIZE")? {
        pool.core_size = n;
    }
    if let Some(n) = optional_var("FANLOCK_POOL_MAX_SIZE")? {
        pool.max_size = n;
    }
    if let Some(n) = optional_var("FANLOCK_POOL_QUEUE_CAPACITY")? {
        pool.queue_capacity = n;
    }
    if let Some(secs) = optional_var::<u64>("FANLOCK_POOL_GRACE_SECS")? {
        pool.shutdown_grace = Duration::from_secs(secs);
    }
    pool.validate()?;
    Ok(pool)
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("environment variable {name} is not valid: {raw}"))),
        Err(_) => Ok(None),
    }
}
