use std::{env, fmt::Display, fs::read_to_string, str::FromStr, time::Duration};

use tracing::{info, warn};

use crate::error::ConfigError;

pub const MEMORY_DATABASE: &str = "memory";

pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub database_max_connections: u32,
    pub database_busy_timeout: Duration,
    pub redis_url: Option<String>,
    pub identity_header: String,
    pub audit_reads: bool,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let busy_timeout_ms: u64 = try_load(&lookup, "DATABASE_BUSY_TIMEOUT_MS", "5000")?;

        Ok(Self {
            port: try_load(&lookup, "RUST_PORT", "1111")?,
            database_url: try_load(&lookup, "DATABASE_URL", "sqlite://data/engagement.db")?,
            database_max_connections: try_load(&lookup, "DATABASE_MAX_CONNECTIONS", "4")?,
            database_busy_timeout: Duration::from_millis(busy_timeout_ms),
            redis_url: var(&lookup, "REDIS_URL").or_else(|| read_secret("REDIS_URL")),
            identity_header: try_load(&lookup, "IDENTITY_HEADER", "x-user-id")?,
            audit_reads: try_load(&lookup, "AUDIT_READS", "false")?,
        })
    }

    pub fn uses_memory_store(&self) -> bool {
        self.database_url == MEMORY_DATABASE
    }
}

fn var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    let value = lookup(key).filter(|value| !value.trim().is_empty());

    if value.is_none() {
        warn!("Environment variable {key} not found");
    }

    value
}

fn try_load<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: &str,
) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    var(lookup, key)
        .unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .trim()
        .parse()
        .map_err(|e: T::Err| {
            warn!("Invalid {key} value: {e}");
            ConfigError::Invalid {
                key,
                reason: e.to_string(),
            }
        })
}

fn read_secret(secret_name: &str) -> Option<String> {
    let path = format!("/run/secrets/{secret_name}");

    read_to_string(&path)
        .map(|s| s.trim().to_string())
        .map_err(|e| {
            info!("No {secret_name} secret at {path}: {e}");
        })
        .ok()
        .filter(|s| !s.is_empty())
}
