use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Resolves runtime configuration for anything that needs a store connection.
pub trait OptionsProvider {
    fn connection_string(&self) -> Result<String>;
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub connection_string: Option<String>,
    pub max_connections: Option<u32>,
    pub busy_timeout_secs: Option<u64>,
    pub succeeded_expiry_secs: Option<u64>,
    pub failed_expiry_secs: Option<u64>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Ok(envy::prefixed("CAPSTORE_").from_env::<Self>()?)
    }

    /// Configuration for a SQLite database file at `path`, created on first use.
    pub fn for_path(path: impl AsRef<std::path::Path>) -> Self {
        Self {
            connection_string: Some(format!("sqlite://{}", path.as_ref().display())),
            ..Self::default()
        }
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections.unwrap_or(10)
    }

    /// How long a statement waits on a held lock before failing.
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs.unwrap_or(5))
    }

    /// Retention of a `Succeeded` record.
    pub fn succeeded_expiry(&self) -> Result<TimeDelta> {
        retention(self.succeeded_expiry_secs.unwrap_or(24 * 3600), "succeeded_expiry_secs")
    }

    /// Retention of a `Failed` record.
    pub fn failed_expiry(&self) -> Result<TimeDelta> {
        retention(self.failed_expiry_secs.unwrap_or(15 * 24 * 3600), "failed_expiry_secs")
    }
}

/// Rejects retentions that would put the expiry past the representable date range.
fn retention(secs: u64, field: &str) -> Result<TimeDelta> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .filter(|delta| Utc::now().checked_add_signed(*delta).is_some())
        .ok_or_else(|| Error::configuration(format!("{field} is out of range: {secs}")))
}

impl OptionsProvider for Config {
    fn connection_string(&self) -> Result<String> {
        let conn = self
            .connection_string
            .as_deref()
            .unwrap_or("sqlite://capstore.db")
            .trim();

        if conn.is_empty() {
            return Err(Error::configuration("connection string is empty"));
        }

        Ok(conn.to_owned())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection_string: None,
            max_connections: None,
            busy_timeout_secs: None,
            succeeded_expiry_secs: None,
            failed_expiry_secs: None,
        }
    }
}
