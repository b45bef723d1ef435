//! Configuration parsing and validation.
//!
//! Imaging Records is configured via a TOML file (default:
//! `config/irec.toml`). Every section except `[db]` is optional and falls
//! back to the defaults below.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/irec.sqlite"
//! max_connections = 5
//! busy_timeout_ms = 5000
//!
//! [ingest]
//! max_retries = 5
//! base_delay_ms = 25
//! max_delay_ms = 1000
//!
//! [projects]
//! max_batch_size = 500
//!
//! [logging]
//! filter = "imaging_records=info"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use imaging_records_core::batch::DEFAULT_MAX_BATCH_SIZE;

use crate::retry::BackoffPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub projects: ProjectsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a writer waits on a held lock before the attempt fails
    /// as transient.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    5
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}

/// Retry policy shared by every mutating operation.
#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl IngestConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

fn default_max_retries() -> usize {
    5
}
fn default_base_delay_ms() -> u64 {
    25
}
fn default_max_delay_ms() -> u64 {
    1_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectsConfig {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

impl Default for ProjectsConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
        }
    }
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

fn default_filter() -> String {
    "imaging_records=info".to_string()
}

impl Config {
    /// Defaults for every section, pointed at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
                max_connections: default_max_connections(),
                busy_timeout_ms: default_busy_timeout_ms(),
            },
            ingest: IngestConfig::default(),
            projects: ProjectsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.db.max_connections == 0 {
            anyhow::bail!("db.max_connections must be >= 1");
        }
        if self.projects.max_batch_size == 0 {
            anyhow::bail!("projects.max_batch_size must be >= 1");
        }
        if self.ingest.base_delay_ms > self.ingest.max_delay_ms {
            anyhow::bail!(
                "ingest.base_delay_ms ({}) must not exceed ingest.max_delay_ms ({})",
                self.ingest.base_delay_ms,
                self.ingest.max_delay_ms
            );
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
