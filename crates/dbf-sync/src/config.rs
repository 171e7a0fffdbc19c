//! Configuration for dbf-sync
//!
//! Loaded from a YAML file. `${VAR}` and `${VAR:-default}` are expanded from
//! the environment before parsing, then every section is validated.
//!
//! ```yaml
//! database:
//!   host: localhost
//!   user: sync
//!   password: ${DBF_SYNC_PASSWORD}
//!   database: recibos_db
//! source:
//!   folder: /srv/dbf
//!   files: [recibos.dbf, cajas.dbf]
//! sync:
//!   scan_interval_secs: 60
//! ```

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::connection::{ConnectionConfig, RetryPolicy};
use crate::dialect::{dialect_for, SqlDialect};
use crate::error::{Error, Result};
use crate::reconcile::ReconcileOptions;
use crate::schema::{table_name_for, validate_table_name, SchemaOptions};

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// A string that is never printed or serialized in clear text
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into().into_boxed_str()))
    }

    /// Expose the secret value.
    ///
    /// Use only where the value is needed, e.g. to build a connection URL.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl Default for SensitiveString {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl std::fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Serialize as redacted to keep secrets out of config dumps
impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SyncConfig {
    /// Destination database
    #[validate(nested)]
    pub database: DatabaseConfig,

    /// Monitored DBF files
    #[validate(nested)]
    pub source: SourceConfig,

    /// Synchronization tuning
    #[serde(default)]
    #[validate(nested)]
    pub sync: SyncSettings,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// SQL flavour of the destination server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    /// MySQL
    Mysql,
    /// MariaDB
    #[default]
    Mariadb,
}

impl DialectKind {
    /// Dialect name as accepted by `dialect_for`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Mariadb => "mariadb",
        }
    }
}

/// Destination database connection settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DatabaseConfig {
    /// Server host name
    #[serde(default = "default_host")]
    #[validate(length(min = 1, max = 255))]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    /// User name
    #[validate(length(min = 1, max = 255))]
    pub user: String,

    /// Password
    #[serde(default)]
    pub password: SensitiveString,

    /// Database (schema) name
    #[validate(length(min = 1, max = 64))]
    pub database: String,

    /// SQL flavour
    #[serde(default)]
    pub dialect: DialectKind,

    /// Timeout for one connection attempt
    #[serde(default = "default_connect_timeout_ms")]
    #[validate(range(min = 100, max = 600_000))]
    pub connect_timeout_ms: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    3306
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl DatabaseConfig {
    /// Connection descriptor with the credentials percent-encoded into the URL
    pub fn to_connection_config(&self) -> Result<ConnectionConfig> {
        let mut url = url::Url::parse(&format!("mysql://{}:{}/", self.host, self.port))
            .map_err(|e| Error::config(format!("invalid database host '{}': {}", self.host, e)))?;
        url.set_path(&self.database);
        url.set_username(&self.user)
            .map_err(|_| Error::config("database user cannot be set on the connection URL"))?;
        if !self.password.expose_secret().is_empty() {
            url.set_password(Some(self.password.expose_secret()))
                .map_err(|_| Error::config("database password cannot be set on the connection URL"))?;
        }

        Ok(ConnectionConfig::new(url.to_string()).with_connect_timeout(self.connect_timeout_ms))
    }

    /// SQL dialect for the configured server
    pub fn sql_dialect(&self) -> Box<dyn SqlDialect> {
        dialect_for(self.dialect.as_str())
    }
}

/// Source files to synchronize
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SourceConfig {
    /// Folder holding the DBF files
    pub folder: PathBuf,

    /// File names, relative to `folder`
    #[validate(length(min = 1), custom(function = "validate_source_files"))]
    pub files: Vec<String>,
}

#[allow(clippy::ptr_arg)]
fn validate_source_files(files: &Vec<String>) -> std::result::Result<(), ValidationError> {
    for file in files {
        if validate_table_name(&table_name_for(file)).is_err() {
            let mut err = ValidationError::new("table_name");
            err.message = Some(format!("'{}' does not map to a valid table name", file).into());
            return Err(err);
        }
    }
    Ok(())
}

/// Synchronization tuning
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SyncSettings {
    /// Seconds between folder scans
    #[serde(default = "default_scan_interval_secs")]
    #[validate(range(min = 1, max = 86_400))]
    pub scan_interval_secs: u64,

    /// Records committed per transaction
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 100_000))]
    pub batch_size: usize,

    /// Connection attempts before giving up
    #[serde(default = "default_retries")]
    #[validate(range(min = 1, max = 100))]
    pub connect_retries: u32,

    /// Wait between connection attempts
    #[serde(default = "default_connect_retry_delay_ms")]
    #[validate(range(max = 600_000))]
    pub connect_retry_delay_ms: u64,

    /// CREATE TABLE attempts before giving up
    #[serde(default = "default_retries")]
    #[validate(range(min = 1, max = 100))]
    pub create_retries: u32,

    /// Wait between CREATE TABLE attempts
    #[serde(default = "default_create_retry_delay_ms")]
    #[validate(range(max = 600_000))]
    pub create_retry_delay_ms: u64,
}

fn default_scan_interval_secs() -> u64 {
    60
}

fn default_batch_size() -> usize {
    100
}

fn default_retries() -> u32 {
    3
}

fn default_connect_retry_delay_ms() -> u64 {
    2_000
}

fn default_create_retry_delay_ms() -> u64 {
    1_000
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval_secs(),
            batch_size: default_batch_size(),
            connect_retries: default_retries(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
            create_retries: default_retries(),
            create_retry_delay_ms: default_create_retry_delay_ms(),
        }
    }
}

impl SyncSettings {
    /// Time between folder scans
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    /// Connection retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.connect_retries,
            Duration::from_millis(self.connect_retry_delay_ms),
        )
    }

    /// Schema synchronizer settings
    pub fn schema_options(&self) -> SchemaOptions {
        SchemaOptions {
            create_retries: self.create_retries,
            create_retry_delay: Duration::from_millis(self.create_retry_delay_ms),
        }
    }

    /// Reconcile settings for one source file
    pub fn reconcile_options(&self, file_name: &str) -> ReconcileOptions {
        ReconcileOptions::default()
            .with_batch_size(self.batch_size)
            .with_source_file(file_name)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SyncConfig {
    /// Load, expand and validate a configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| Error::config(format!("Failed to parse config: {}", e)))?;

        config.check()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    pub fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate every section
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::config(format!("Invalid configuration: {}", e)))
    }
}
