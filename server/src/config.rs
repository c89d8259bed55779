//! Configuration management for the server.
//!
//! Process settings come from environment variables (optionally via a
//! `.env` file). Entity schemas and named origins come from a JSON catalog
//! file whose path is itself an environment variable.

use crate::adapters::{MemoryAdapter, Origins, ProviderAdapter};
use crate::db::{create_pool, PgAdapter};
use crate::registry::DEFAULT_RETAINED_RUNS;
use crate::runner::{RetryPolicy, RunSettings, DEFAULT_BATCH_SIZE};
use converge_engine::{Catalog, EntityKind, EntitySchema};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Path of the JSON catalog file
    pub catalog_path: PathBuf,
    /// Bearer token required on run endpoints, if set
    pub auth_secret: Option<String>,
    /// Directory for per-run journals, if set
    pub journal_dir: Option<PathBuf>,
    /// Finished runs kept for inspection before the oldest are dropped
    pub retained_runs: usize,
    pub run: RunSettings,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let catalog_path = env::var("CATALOG_PATH")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::MissingCatalogPath)?;

        let auth_secret = env::var("AUTH_SECRET").ok().filter(|s| !s.is_empty());
        let journal_dir = env::var("JOURNAL_DIR").ok().map(PathBuf::from);
        let retained_runs = parse_var("RETAINED_RUNS", DEFAULT_RETAINED_RUNS)?;

        let defaults = RunSettings::default();
        let retry = RetryPolicy {
            max_attempts: parse_var("MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            initial_backoff_ms: parse_var("INITIAL_BACKOFF_MS", defaults.retry.initial_backoff_ms)?,
            ..defaults.retry
        };
        let run = RunSettings {
            call_timeout: Duration::from_millis(parse_var(
                "CALL_TIMEOUT_MS",
                defaults.call_timeout.as_millis() as u64,
            )?),
            confirmation_timeout: Duration::from_secs(parse_var(
                "CONFIRMATION_TIMEOUT_SECS",
                300,
            )?),
            retry,
            verify_batch_size: parse_var("VERIFY_BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
        };

        Ok(Self {
            host,
            port,
            catalog_path,
            auth_secret,
            journal_dir,
            retained_runs,
            run,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("CATALOG_PATH environment variable is required")]
    MissingCatalogPath,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid value for {0}")]
    InvalidValue(&'static str),

    #[error("Cannot read catalog file {path}: {source}")]
    CatalogRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid catalog file: {0}")]
    CatalogParse(#[from] serde_json::Error),

    #[error("Origin {origin}: environment variable {var} is not set")]
    MissingSecret { origin: String, var: String },

    #[error("Origin {origin}: {message}")]
    InvalidOrigin { origin: String, message: String },
}

/// One entity kind in the catalog file, with per-backend locations.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityConfig {
    #[serde(flatten)]
    pub schema: EntitySchema,
    /// Table name for store origins (defaults to the kind)
    #[serde(default)]
    pub table: Option<String>,
    /// Collection path for provider origins (defaults to the kind)
    #[serde(default)]
    pub path: Option<String>,
}

/// A named origin in the catalog file.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OriginConfig {
    /// PostgreSQL database
    #[serde(rename_all = "camelCase")]
    Store {
        database_url_env: String,
        #[serde(default)]
        max_connections: Option<u32>,
    },
    /// Scheduling provider HTTP API
    #[serde(rename_all = "camelCase")]
    Provider { base_url: String, token_env: String },
    /// In-process records, optionally seeded from the file
    #[serde(rename_all = "camelCase")]
    Memory {
        #[serde(default)]
        seed: BTreeMap<EntityKind, Vec<serde_json::Value>>,
    },
}

/// Contents of the catalog file. Entity order is dependency order.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogFile {
    pub entities: Vec<EntityConfig>,
    #[serde(default)]
    pub origins: BTreeMap<String, OriginConfig>,
}

impl CatalogFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::CatalogRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn catalog(&self) -> Catalog {
        Catalog::new(self.entities.iter().map(|e| e.schema.clone()).collect())
    }

    /// Build every configured origin. Secrets are read from the environment.
    pub fn origins(&self) -> Result<Origins, ConfigError> {
        let mut origins = Origins::new();
        for (name, origin) in &self.origins {
            origins.insert(self.build_origin(name, origin)?);
        }
        Ok(origins)
    }

    fn build_origin(
        &self,
        name: &str,
        origin: &OriginConfig,
    ) -> Result<Arc<dyn crate::adapters::StateSink>, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidOrigin {
            origin: name.to_string(),
            message,
        };

        Ok(match origin {
            OriginConfig::Store {
                database_url_env,
                max_connections,
            } => {
                let url = secret(name, database_url_env)?;
                let pool = create_pool(&url, *max_connections).map_err(|e| invalid(e.to_string()))?;
                let mut adapter = PgAdapter::new(name, pool);
                for entity in &self.entities {
                    if let Some(table) = &entity.table {
                        adapter = adapter.with_table(entity.schema.kind.clone(), table.clone());
                    }
                }
                Arc::new(adapter)
            }
            OriginConfig::Provider {
                base_url,
                token_env,
            } => {
                let token = secret(name, token_env)?;
                let mut adapter = ProviderAdapter::new(name, base_url.clone(), token);
                for entity in &self.entities {
                    if let Some(path) = &entity.path {
                        adapter = adapter.with_path(entity.schema.kind.clone(), path.clone());
                    }
                }
                Arc::new(adapter)
            }
            OriginConfig::Memory { seed } => {
                let adapter = MemoryAdapter::new(name, self.catalog());
                for (kind, values) in seed {
                    adapter
                        .seed(kind, values.clone())
                        .map_err(|e| invalid(e.to_string()))?;
                }
                Arc::new(adapter)
            }
        })
    }
}

fn secret(origin: &str, var: &str) -> Result<String, ConfigError> {
    env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingSecret {
            origin: origin.to_string(),
            var: var.to_string(),
        })
}
