use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::postgres::slot::{validate_plugin_name, validate_slot_name};
use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub replication: ReplicationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_application_name")]
    pub application_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    pub slot_name: String,
    #[serde(default = "default_plugin")]
    pub plugin: String,
    /// Options passed to the output plugin on START_REPLICATION.
    #[serde(default)]
    pub plugin_options: BTreeMap<String, String>,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ::config::ConfigError> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path.as_ref()))
            .add_source(
                ::config::Environment::with_prefix("PG_LOGICAL")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        settings.try_deserialize()
    }

    pub fn validate(&self) -> Result<()> {
        self.postgres.validate()?;
        self.replication.validate()
    }
}

impl PostgresConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("postgres.host must not be empty".to_string()));
        }
        if self.username.is_empty() {
            return Err(Error::Config("postgres.username must not be empty".to_string()));
        }
        if self.database.is_empty() {
            return Err(Error::Config("postgres.database must not be empty".to_string()));
        }
        Ok(())
    }
}

impl ReplicationConfig {
    /// Settings for `slot_name` with every interval at its default.
    pub fn new(slot_name: impl Into<String>) -> Self {
        Self {
            slot_name: slot_name.into(),
            plugin: default_plugin(),
            plugin_options: BTreeMap::new(),
            flush_interval_ms: default_flush_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }

    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = plugin.into();
        self
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        validate_slot_name(&self.slot_name)?;
        validate_plugin_name(&self.plugin)?;
        for (name, interval) in [
            ("flush_interval_ms", self.flush_interval_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("poll_timeout_ms", self.poll_timeout_ms),
        ] {
            if interval == 0 {
                return Err(Error::Config(format!(
                    "replication.{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_application_name() -> String {
    "pg-logical-stream".to_string()
}

fn default_plugin() -> String {
    "test_decoding".to_string()
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_poll_timeout_ms() -> u64 {
    100
}
