// Server configuration
//
// Read once at startup from the process environment (after dotenvy has
// loaded any .env file).

use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use skyride_engine::{EngineConfig, StripeConfig};

/// Where records are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// PostgreSQL database (production)
    Postgres,
    /// Process-local store for development; everything is lost on restart
    Memory,
}

impl StorageBackend {
    /// Pick the backend from `STORAGE_BACKEND`. The in-memory store is only
    /// allowed in dev mode.
    pub fn resolve(value: Option<&str>, dev_mode: bool) -> Result<Self> {
        let backend = match value {
            Some(value) => value.parse().context("invalid STORAGE_BACKEND")?,
            None => Self::Postgres,
        };
        if backend.is_dev_mode() && !dev_mode {
            bail!("STORAGE_BACKEND=memory requires DEV_MODE=true");
        }
        Ok(backend)
    }

    pub fn is_dev_mode(&self) -> bool {
        matches!(self, Self::Memory)
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown storage backend: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server_address: String,
    pub storage_backend: StorageBackend,
    /// Required for the postgres backend
    pub database_url: Option<String>,
    /// Deadline applied to each booking request
    pub request_timeout: Duration,
    pub engine: EngineConfig,
    pub stripe: Option<StripeConfig>,
}

impl AppConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - SERVER_ADDRESS: Listen address (default: 0.0.0.0:9000)
    /// - STORAGE_BACKEND: postgres or memory (default: postgres)
    /// - DEV_MODE: must be true to use the memory backend
    /// - DATABASE_URL: Postgres connection string
    /// - REQUEST_TIMEOUT: Per-request deadline in seconds (default: 30)
    /// - STRIPE_KEY / STRIPE_API_BASE: see StripeConfig
    /// - IDEM_KEY_TIMEOUT, RIDE_PRICE_CENTS, RIDE_CURRENCY, GATEWAY_TOKEN_PREFIX:
    ///   see EngineConfig
    pub fn from_env() -> Result<Self> {
        let server_address =
            env::var("SERVER_ADDRESS").unwrap_or_else(|_| "0.0.0.0:9000".to_string());

        let storage_backend = StorageBackend::resolve(
            env::var("STORAGE_BACKEND").ok().as_deref(),
            env_flag("DEV_MODE"),
        )?;

        let request_timeout = env::var("REQUEST_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));

        Ok(Self {
            server_address,
            storage_backend,
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            request_timeout,
            engine: EngineConfig::from_env().context("invalid engine configuration")?,
            stripe: StripeConfig::from_env(),
        })
    }
}
