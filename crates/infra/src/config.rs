//! Service configuration.
//!
//! Layered: defaults in code, then `config/<environment>.toml` when present,
//! then `SHOPFLOOR_*` environment variables (`__` separates sections, e.g.
//! `SHOPFLOOR_DATABASE__URL`). A `.env` file is read first if one exists.

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::alerts::StockAlertRunner;

const ENV_PREFIX: &str = "SHOPFLOOR";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// `development`, `production`, ...; selects the config file.
    pub environment: String,
    pub database: DatabaseSettings,
    pub alerts: AlertSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    /// Run embedded migrations on startup.
    pub migrate: bool,
}

impl DatabaseSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
}

impl AlertSettings {
    pub fn runner(&self) -> StockAlertRunner {
        StockAlertRunner {
            interval: Duration::from_secs(self.interval_secs.max(1)),
            max_retries: self.max_retries,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    pub format: LogFormat,
    /// `tracing_subscriber::EnvFilter` directives; `RUST_LOG` wins when set.
    pub filter: String,
}

impl Settings {
    /// Load from `.env`, the environment's config file and `SHOPFLOOR_*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let environment =
            std::env::var("SHOPFLOOR_ENVIRONMENT").unwrap_or_else(|_| "development".into());
        Self::build(&environment, Environment::with_prefix(ENV_PREFIX))
    }

    /// Build from a given environment-variable source.
    pub fn build(environment: &str, env: Environment) -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("environment", environment)?
            .set_default("database.url", "postgres://localhost/shopfloor")?
            .set_default("database.max_connections", 10)?
            .set_default("database.acquire_timeout_secs", 30)?
            .set_default("database.migrate", true)?
            .set_default("alerts.enabled", true)?
            .set_default("alerts.interval_secs", 300)?
            .set_default("alerts.max_retries", 5)?
            .set_default("alerts.base_backoff_ms", 250)?
            .set_default("log.format", "pretty")?
            .set_default("log.filter", "info,sqlx=warn")?
            .add_source(File::with_name(&format!("config/{environment}")).required(false))
            .add_source(env.separator("__").try_parsing(true))
            .build()?
            .try_deserialize()
    }
}
