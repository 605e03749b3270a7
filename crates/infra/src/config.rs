//! Environment-driven configuration for the updater and the Postgres store.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::store::{IsolationLevel, StoreError};

pub const MAX_ATTEMPTS_KEY: &str = "ISOSTOCK_MAX_ATTEMPTS";
pub const BASE_DELAY_MS_KEY: &str = "ISOSTOCK_BASE_DELAY_MS";
pub const MAX_DELAY_MS_KEY: &str = "ISOSTOCK_MAX_DELAY_MS";
pub const DEFAULT_ISOLATION_KEY: &str = "ISOSTOCK_DEFAULT_ISOLATION";
pub const DATABASE_URL_KEY: &str = "DATABASE_URL";
pub const DB_MAX_CONNECTIONS_KEY: &str = "ISOSTOCK_DB_MAX_CONNECTIONS";

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} is not set")]
    Missing(&'static str),
}

/// Settings for [`ConflictRetryingUpdater`](crate::updater::ConflictRetryingUpdater).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdaterConfig {
    pub retry: RetryPolicy,
    pub default_isolation: IsolationLevel,
}

impl UpdaterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(attempts) = parse::<u32>(&lookup, MAX_ATTEMPTS_KEY)? {
            if attempts == 0 {
                return Err(invalid(MAX_ATTEMPTS_KEY, "0", "at least one attempt is required"));
            }
            config.retry.max_attempts = attempts;
        }
        if let Some(ms) = parse::<u64>(&lookup, BASE_DELAY_MS_KEY)? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, MAX_DELAY_MS_KEY)? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(level) = parse::<IsolationLevel>(&lookup, DEFAULT_ISOLATION_KEY)? {
            config.default_isolation = level;
        }

        if config.retry.max_delay < config.retry.base_delay {
            return Err(invalid(
                MAX_DELAY_MS_KEY,
                &config.retry.max_delay.as_millis().to_string(),
                "must not be smaller than the base delay",
            ));
        }

        Ok(config)
    }
}

/// Connection settings for [`PostgresProductStore`](crate::store::PostgresProductStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup(DATABASE_URL_KEY).filter(|url| !url.trim().is_empty());
        let max_connections =
            parse::<u32>(&lookup, DB_MAX_CONNECTIONS_KEY)?.unwrap_or(DEFAULT_MAX_CONNECTIONS);
        if max_connections == 0 {
            return Err(invalid(DB_MAX_CONNECTIONS_KEY, "0", "pool needs at least one connection"));
        }

        Ok(Self {
            database_url,
            max_connections,
        })
    }

    /// Open a connection pool. Fails with [`ConfigError::Missing`] when no URL is set.
    pub async fn connect(&self) -> Result<PgPool, ConnectError> {
        let url = self
            .database_url
            .as_deref()
            .ok_or(ConfigError::Missing(DATABASE_URL_KEY))?;

        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(url)
            .await
            .map_err(|e| ConnectError::Store(StoreError::Unavailable(e.to_string())))
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, &raw, &e.to_string())),
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
