//! Store connection configuration.
//!
//! A single connection URI selects and configures the store:
//!
//! - `postgres://…` / `postgresql://…` — [`PostgresJobStore`]
//! - `memory://` — [`InMemoryJobStore`] (single process, not durable)
//!
//! A missing or malformed URI is a [`QueueError::Configuration`], which callers
//! treat as fatal at startup.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgConnectOptions;
use tracing::info;

use taskmill_core::{QueueError, QueueResult};

use crate::store::{InMemoryJobStore, JobStore, PostgresJobStore};

/// Environment variable read by [`StoreConfig::from_env`].
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Memory,
    Postgres(PostgresConfig),
}

impl StoreConfig {
    /// Parse a connection URI.
    pub fn from_url(url: &str) -> QueueResult<Self> {
        let url = url.trim();
        if url.is_empty() {
            return Err(QueueError::configuration("database url is empty"));
        }

        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| QueueError::configuration("database url has no scheme"))?;

        match scheme {
            "memory" if rest.is_empty() => Ok(StoreConfig::Memory),
            "memory" => Err(QueueError::configuration(
                "memory:// does not take a host or path",
            )),
            "postgres" | "postgresql" => Ok(StoreConfig::Postgres(PostgresConfig::new(url)?)),
            other => Err(QueueError::configuration(format!(
                "unsupported database scheme '{other}'"
            ))),
        }
    }

    /// Read the URI from `DATABASE_URL`.
    pub fn from_env() -> QueueResult<Self> {
        let url = std::env::var(DATABASE_URL_ENV).map_err(|_| {
            QueueError::configuration(format!("{DATABASE_URL_ENV} is not set"))
        })?;
        Self::from_url(&url)
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        if let StoreConfig::Postgres(pg) = &mut self {
            pg.max_connections = max;
        }
        self
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoreConfig::Memory => "memory",
            StoreConfig::Postgres(_) => "postgres",
        }
    }
}

impl FromStr for StoreConfig {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_url(s)
    }
}

/// PostgreSQL pool settings.
#[derive(Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PostgresConfig {
    pub fn new(url: impl Into<String>) -> QueueResult<Self> {
        let config = Self {
            url: url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        };
        // Validate eagerly so a typo fails at startup, not on first use.
        config.connect_options()?;
        Ok(config)
    }

    pub fn connect_options(&self) -> QueueResult<PgConnectOptions> {
        PgConnectOptions::from_str(&self.url)
            .map_err(|e| QueueError::configuration(format!("invalid postgres url: {e}")))
    }
}

impl core::fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

/// Build the store described by `config`. Postgres schemas are created if missing.
pub async fn connect(config: &StoreConfig) -> QueueResult<Arc<dyn JobStore>> {
    match config {
        StoreConfig::Memory => {
            info!(store = "memory", "using in-memory job store");
            Ok(Arc::new(InMemoryJobStore::new()))
        }
        StoreConfig::Postgres(pg) => {
            let store = PostgresJobStore::connect(pg).await?;
            store.migrate().await?;
            info!(store = "postgres", "connected to job store");
            Ok(Arc::new(store))
        }
    }
}
