//! Configuration for pg-watch.
//!
//! The runner is configured from a YAML file with a top-level `slots`
//! mapping; database connection parameters come from the `database` section
//! or from `PG_*` environment variables, which take precedence so deploys
//! can keep credentials out of the file.
//!
//! # Example
//!
//! ```yaml
//! database:
//!   host: localhost
//!   port: 5432
//!   database: app
//!   username: replicator
//!   password: secret
//! slots:
//!   checkout:
//!     watcher: log
//!     publications: [checkout_pub]
//!     temporary: false
//!     worker: default
//!     retries: 10
//!     retry_backoff: 2.5
//!     retry_backoff_exponent: 2.0
//! ```

use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// PostgreSQL identifiers are limited to 63 bytes (NAMEDATALEN - 1).
const PG_MAX_IDENTIFIER_LEN: usize = 63;

/// Top-level configuration: connection parameters plus the slot map.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database: PostgresConfig,
    /// Interval between liveness pings that advance idle slots.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    pub slots: BTreeMap<String, SlotConfig>,
}

/// Connection parameters shared by every session the runtime opens:
/// replication, catalog metadata, liveness pings and the temporary-table
/// aggregation store.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub connect_timeout_secs: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: String::new(),
            username: String::new(),
            password: String::new(),
            connect_timeout_secs: 30,
        }
    }
}

impl PostgresConfig {
    /// Builds the tokio-postgres config for non-replication sessions.
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.username)
            .password(&self.password)
            .application_name("pg-watch")
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs));
        config
    }
}

/// Per-slot configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SlotConfig {
    /// Name of a watcher factory registered with the runner.
    pub watcher: String,
    pub publications: Vec<String>,
    /// Temporary slots are dropped by the server on disconnect; a random
    /// suffix is appended to the configured name for each run.
    #[serde(default)]
    pub temporary: bool,
    /// Worker group this slot runs in. Groups are isolated from each other:
    /// each gets its own runtime and its own connections.
    #[serde(default = "default_worker")]
    pub worker: String,
    /// Restart the slot after `replicate_forever` returns normally.
    #[serde(default = "default_auto_restart")]
    pub auto_restart: bool,
    /// Retry budget for failures; unbounded when absent.
    #[serde(default)]
    pub retries: Option<u32>,
    /// Base backoff in seconds between retries.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: f64,
    /// Exponent applied to the attempt counter; plain linear backoff when
    /// absent.
    #[serde(default)]
    pub retry_backoff_exponent: Option<f64>,
}

impl SlotConfig {
    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = match self.retry_backoff_exponent {
            Some(exponent) => (attempt as f64).powf(exponent),
            None => attempt as f64,
        };
        Duration::from_secs_f64((self.retry_backoff * factor).max(0.0))
    }
}

fn default_worker() -> String {
    "default".to_string()
}

fn default_auto_restart() -> bool {
    true
}

fn default_retry_backoff() -> f64 {
    5.0
}

fn default_ping_interval_secs() -> u64 {
    20
}

impl Config {
    /// Load configuration from a YAML file, apply environment overrides and
    /// validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "cannot read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Merge `PG_*` environment variables over the file's database section.
    pub fn apply_env(&mut self) {
        if let Ok(host) = env::var("PG_HOST") {
            self.database.host = host;
        }
        if let Ok(port) = env::var("PG_PORT") {
            if let Ok(port) = port.parse() {
                self.database.port = port;
            }
        }
        if let Ok(database) = env::var("PG_DATABASE") {
            self.database.database = database;
        }
        if let Ok(username) = env::var("PG_USERNAME") {
            self.database.username = username;
        }
        if let Ok(password) = env::var("PG_PASSWORD") {
            self.database.password = password;
        }
        if let Ok(timeout) = env::var("PG_CONNECT_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout.parse() {
                self.database.connect_timeout_secs = timeout;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.database.is_empty() {
            return Err(Error::Config(
                "database name is required (database.database or PG_DATABASE)".to_string(),
            ));
        }
        if self.database.username.is_empty() {
            return Err(Error::Config(
                "database username is required (database.username or PG_USERNAME)".to_string(),
            ));
        }
        if self.slots.is_empty() {
            return Err(Error::Config("at least one slot is required".to_string()));
        }
        for (name, slot) in &self.slots {
            validate_identifier(name, "slot name")?;
            if slot.publications.is_empty() {
                return Err(Error::Config(format!(
                    "slot '{name}' needs at least one publication"
                )));
            }
            for publication in &slot.publications {
                validate_identifier(publication, "publication")?;
            }
            if slot.watcher.is_empty() {
                return Err(Error::Config(format!("slot '{name}' needs a watcher")));
            }
        }
        Ok(())
    }
}

/// Slot and publication names are spliced into replication commands, so
/// they must stay plain identifiers.
fn validate_identifier(name: &str, what: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Config(format!("{what} must not be empty")));
    }
    if name.len() > PG_MAX_IDENTIFIER_LEN {
        return Err(Error::Config(format!(
            "{what} '{name}' exceeds the PostgreSQL identifier limit of {PG_MAX_IDENTIFIER_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(Error::Config(format!(
            "{what} '{name}' may only contain alphanumerics and underscores"
        )));
    }
    Ok(())
}
