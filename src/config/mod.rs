//! Typed configuration from environment variables plus an optional TOML
//! file of tunables.
//!
//! Loads once at startup and fails fast if required vars are missing.
//! The database URL is wrapped in `SecretString` so it never reaches logs.

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::lock::LockConfig;
use crate::migration::MigrationConfig;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub settings: Settings,
}

impl Config {
    /// Load from environment variables, then the TOML file named by
    /// `HUNTSTORE_CONFIG` if set.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let settings = match std::env::var("HUNTSTORE_CONFIG") {
            Ok(path) => Settings::load(path)?,
            Err(_) => Settings::default(),
        };
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            settings,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

/// Contents of the TOML config file. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub coordination: CoordinationConfig,
    pub drive: DriveConfig,
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Lock and migration timing, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinationConfig {
    pub lock_ttl_ms: u64,
    pub lock_max_wait_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub renew_leases: bool,
    pub migration_lock_ttl_ms: u64,
    pub migration_max_wait_ms: u64,
    pub provision_lock_ttl_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: 30_000,
            lock_max_wait_ms: 60_000,
            backoff_initial_ms: 25,
            backoff_max_ms: 1_000,
            renew_leases: true,
            migration_lock_ttl_ms: 600_000,
            migration_max_wait_ms: 3_600_000,
            provision_lock_ttl_ms: 30_000,
        }
    }
}

impl CoordinationConfig {
    pub fn lock_config(&self) -> LockConfig {
        LockConfig {
            max_wait: Duration::from_millis(self.lock_max_wait_ms),
            initial_backoff: Duration::from_millis(self.backoff_initial_ms),
            max_backoff: Duration::from_millis(self.backoff_max_ms),
            renew: self.renew_leases,
        }
    }

    pub fn migration_config(&self) -> MigrationConfig {
        MigrationConfig {
            lock_ttl: Duration::from_millis(self.migration_lock_ttl_ms),
            max_wait: Duration::from_millis(self.migration_max_wait_ms),
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn provision_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.provision_lock_ttl_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriveConfig {
    /// Used in folder and document names.
    pub team_name: String,
    /// Parent folder for hunt folders; the drive root when unset.
    pub root_folder: Option<String>,
    pub templates: DocumentTemplates,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            team_name: "Hunt Team".to_string(),
            root_folder: None,
            templates: DocumentTemplates::default(),
        }
    }
}

/// Files copied for new puzzle documents, per document type. Unset types
/// start blank.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DocumentTemplates {
    pub spreadsheet: Option<String>,
    pub document: Option<String>,
}
