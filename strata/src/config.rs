//! Migrator configuration.

use crate::core::DEFAULT_TABLE_NAME;
use serde::Deserialize;
use std::time::Duration;

/// How the migration lock is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Use a native advisory lock when the dialect has one, otherwise a lock row.
    #[default]
    Auto,
    /// Always use the dialect's advisory lock.
    Advisory,
    /// Always use a row in the `<table>_lock` companion table.
    Table,
}

/// Lock acquisition and lease policy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub mode: LockMode,
    /// How long to wait for another process to release the lock.
    /// `None` fails immediately with [Error::LockTimeout](crate::Error::LockTimeout).
    pub wait_timeout_secs: Option<u64>,
    /// First polling interval; doubled after each failed attempt.
    pub retry_interval_ms: u64,
    pub max_retry_interval_ms: u64,
    /// How long a row lock stays valid without a heartbeat. Only consulted when
    /// the dialect cannot tell whether the holder's session is still alive.
    pub lease_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            mode: LockMode::Auto,
            wait_timeout_secs: Some(300),
            retry_interval_ms: 100,
            max_retry_interval_ms: 5_000,
            lease_secs: 900,
        }
    }
}

impl LockConfig {
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_secs.map(Duration::from_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms.max(1))
    }

    pub fn max_retry_interval(&self) -> Duration {
        Duration::from_millis(self.max_retry_interval_ms.max(self.retry_interval_ms).max(1))
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

/// Everything a [Migrator](crate::Migrator) can be told about its target.
///
/// Deserializes from any serde format; every field is optional.
///
/// ```yaml
/// table: schema_history
/// schemas: [app, audit]
/// allow_out_of_order: true
/// lock:
///   mode: table
///   wait_timeout_secs: 60
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of the metadata table.
    pub table: String,
    /// Schemas managed by the migrator. The first one holds the metadata
    /// table. Empty means the connection's default schema.
    pub schemas: Vec<String>,
    pub allow_out_of_order: bool,
    pub ignore_missing_migrations: bool,
    pub clean_disabled: bool,
    /// Recorded as `installed_by`. Defaults to the database user.
    pub installed_by: Option<String>,
    pub lock: LockConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE_NAME.to_string(),
            schemas: vec![],
            allow_out_of_order: false,
            ignore_missing_migrations: false,
            clean_disabled: false,
            installed_by: None,
            lock: LockConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.table, "strata_schema_history");
        assert!(config.schemas.is_empty());
        assert!(!config.allow_out_of_order);
        assert_eq!(config.lock.mode, LockMode::Auto);
        assert_eq!(config.lock.wait_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(config.lock.lease(), Duration::from_secs(900));
    }

    #[test]
    fn retry_interval_never_exceeds_its_bounds() {
        let lock = LockConfig {
            retry_interval_ms: 0,
            max_retry_interval_ms: 0,
            ..LockConfig::default()
        };
        assert_eq!(lock.retry_interval(), Duration::from_millis(1));
        assert_eq!(lock.max_retry_interval(), Duration::from_millis(1));

        let lock = LockConfig {
            retry_interval_ms: 500,
            max_retry_interval_ms: 200,
            ..LockConfig::default()
        };
        assert_eq!(lock.max_retry_interval(), Duration::from_millis(500));
    }
}
