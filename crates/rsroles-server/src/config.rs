//! Configuration management for the synchronization services.
//!
//! This module provides configuration loading with multiple sources:
//! 1. Default values (hardcoded)
//! 2. Configuration file (YAML)
//! 3. Environment variables (override)
//!
//! # Configuration Hierarchy
//!
//! Environment variables take precedence over config file values,
//! which take precedence over defaults.
//!
//! # Example
//!
//! ```ignore
//! use rsroles_server::config::ServiceConfig;
//!
//! // Load from file with env overrides
//! let config = ServiceConfig::load("rsroles.yaml")?;
//!
//! // Or load from environment only
//! let config = ServiceConfig::from_env()?;
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::sync::RetryPolicy;

const ENV_PREFIX: &str = "RSROLES";

/// Service configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ServiceConfig {
    /// Authorization server connection
    #[serde(default)]
    pub authz_server: AuthzServerSettings,

    /// Batch permission synchronization
    #[serde(default)]
    pub batch: BatchSettings,

    /// Reconciliation retries
    #[serde(default)]
    pub retry: RetrySettings,

    /// Catalog event delivery
    #[serde(default)]
    pub events: EventSettings,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Authorization server settings.
///
/// Environment overrides use the `RSROLES_` prefix and `__` separator:
///
/// - `RSROLES_AUTHZ_SERVER__BASE_URL=https://keycloak:8443`
/// - `RSROLES_AUTHZ_SERVER__CLIENT_SECRET=...`
/// - `RSROLES_AUTHZ_SERVER__TOKEN_TTL_SECS=30`
///
/// # Example YAML Configuration
///
/// ```yaml
/// authz_server:
///   base_url: https://keycloak:8443
///   client_id: rsroles-admin
///   client_secret: change-me
///   tenant_client_suffix: -application
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AuthzServerSettings {
    /// Base URL of the authorization server
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Client used to obtain admin tokens in every tenant realm
    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    /// Suffix appended to the tenant name to find the tenant's resource-server client
    #[serde(default = "default_tenant_client_suffix")]
    pub tenant_client_suffix: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// How long an admin token is reused before a new one is requested
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    /// How long a tenant's resolved client id is cached
    #[serde(default = "default_client_id_ttl")]
    pub client_id_ttl_secs: u64,
}

impl Default for AuthzServerSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            client_id: default_client_id(),
            client_secret: String::new(),
            tenant_client_suffix: default_tenant_client_suffix(),
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            token_ttl_secs: default_token_ttl(),
            client_id_ttl_secs: default_client_id_ttl(),
        }
    }
}

impl AuthzServerSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn client_id_ttl(&self) -> Duration {
        Duration::from_secs(self.client_id_ttl_secs)
    }
}

fn default_base_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_client_id() -> String {
    "rsroles-admin".to_string()
}

fn default_tenant_client_suffix() -> String {
    "-application".to_string()
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_read_timeout() -> u64 {
    30_000
}

fn default_token_ttl() -> u64 {
    60
}

fn default_client_id_ttl() -> u64 {
    3_600
}

/// Batch executor settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BatchSettings {
    /// Maximum number of in-flight permission tasks per batch
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_max_concurrency() -> usize {
    8
}

/// Reconciliation retry settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        RetryPolicy {
            max_attempts: settings.max_attempts,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            multiplier: settings.multiplier,
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_backoff() -> u64 {
    60_000
}

/// Catalog event settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct EventSettings {
    /// Capacity of the broadcast channel; slow listeners lag beyond it
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_channel_capacity() -> usize {
    1024
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingSettings {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON format (true for production, false for development)
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),

    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl ServiceConfig {
    /// Load configuration from a YAML file with environment variable overrides.
    ///
    /// Environment variables are prefixed with `RSROLES_` and use `__` as separator.
    /// For example:
    /// - `RSROLES_BATCH__MAX_CONCURRENCY=16` overrides `batch.max_concurrency`
    /// - `RSROLES_RETRY__MAX_ATTEMPTS=3` overrides `retry.max_attempts`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigLoadError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let config = Config::builder()
            .add_source(Config::try_from(&ServiceConfig::default())?)
            .add_source(File::from(path).format(FileFormat::Yaml))
            .add_source(environment())
            .build()?;

        let service_config: ServiceConfig = config.try_deserialize()?;
        service_config.validate()?;

        Ok(service_config)
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let config = Config::builder()
            .add_source(Config::try_from(&ServiceConfig::default())?)
            .add_source(environment())
            .build()?;

        let service_config: ServiceConfig = config.try_deserialize()?;
        service_config.validate()?;

        Ok(service_config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.authz_server.base_url.trim().is_empty() {
            return Err(invalid("authz_server.base_url must not be empty"));
        }

        if self.batch.max_concurrency == 0 {
            return Err(invalid("batch.max_concurrency must be greater than 0"));
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be greater than 0"));
        }

        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(invalid(format!(
                "retry.multiplier must be at least 1.0, got: {}",
                self.retry.multiplier
            )));
        }

        if self.events.channel_capacity == 0 {
            return Err(invalid("events.channel_capacity must be greater than 0"));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "logging.level must be one of: {:?}, got: {}",
                valid_levels, self.logging.level
            )));
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }
}

// RSROLES_BATCH__MAX_CONCURRENCY -> batch.max_concurrency
fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
}

fn invalid(message: impl Into<String>) -> ConfigLoadError {
    ConfigLoadError::Invalid {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Test: Can load config from YAML file
    #[test]
    #[serial]
    fn test_can_load_config_from_yaml_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
authz_server:
  base_url: "https://keycloak:8443"
  client_id: admin-cli
  token_ttl_secs: 30

batch:
  max_concurrency: 16

retry:
  max_attempts: 3
  initial_backoff_ms: 250
  multiplier: 1.5

logging:
  level: debug
  json: true
"#
        )
        .unwrap();

        let config = ServiceConfig::load(file.path()).unwrap();

        assert_eq!(config.authz_server.base_url, "https://keycloak:8443");
        assert_eq!(config.authz_server.client_id, "admin-cli");
        assert_eq!(config.authz_server.token_ttl(), Duration::from_secs(30));
        assert_eq!(config.batch.max_concurrency, 16);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.multiplier, 1.5);
        assert_eq!(config.retry.max_backoff_ms, 60_000); // default
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    /// Test: Can override config with env vars
    #[test]
    #[serial]
    fn test_can_override_config_with_env_vars() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
batch:
  max_concurrency: 4

retry:
  max_attempts: 2
"#
        )
        .unwrap();

        std::env::set_var("RSROLES_BATCH__MAX_CONCURRENCY", "32");
        std::env::set_var("RSROLES_LOGGING__LEVEL", "warn");

        let config = ServiceConfig::load(file.path());

        std::env::remove_var("RSROLES_BATCH__MAX_CONCURRENCY");
        std::env::remove_var("RSROLES_LOGGING__LEVEL");

        let config = config.unwrap();
        assert_eq!(config.batch.max_concurrency, 32); // Overridden by env
        assert_eq!(config.retry.max_attempts, 2); // From file
        assert_eq!(config.logging.level, "warn"); // Overridden by env
    }

    /// Test: Config validation catches errors
    #[test]
    fn test_config_validation_catches_errors() {
        let cases: Vec<(fn(&mut ServiceConfig), &str)> = vec![
            (|c| c.authz_server.base_url = "  ".to_string(), "base_url"),
            (|c| c.batch.max_concurrency = 0, "max_concurrency"),
            (|c| c.retry.max_attempts = 0, "max_attempts"),
            (|c| c.retry.multiplier = 0.5, "multiplier"),
            (|c| c.retry.multiplier = f64::NAN, "multiplier"),
            (|c| c.events.channel_capacity = 0, "channel_capacity"),
            (|c| c.logging.level = "verbose".to_string(), "logging.level"),
        ];

        for (mutate, field) in cases {
            let mut config = ServiceConfig::default();
            mutate(&mut config);

            let err = config.validate().unwrap_err();
            assert!(
                err.to_string().contains(field),
                "error for '{field}' should name it: {err}"
            );
        }
    }

    /// Test: Invalid config returns clear error
    #[test]
    fn test_invalid_config_returns_clear_error() {
        let result = ServiceConfig::load("/nonexistent/path/rsroles.yaml");
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigLoadError::FileNotFound { .. }));
        assert!(err.to_string().contains("not found"));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid: yaml: syntax: [").unwrap();

        let err = ServiceConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigLoadError::Load(_)));
    }

    /// Test: Default config is valid
    #[test]
    fn test_default_config_is_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_backoff, Duration::from_secs(1));
        assert_eq!(config.batch.max_concurrency, 8);
    }

    /// Test: from_env loads defaults with env overrides
    #[test]
    #[serial]
    fn test_from_env_loads_defaults_with_env_overrides() {
        std::env::set_var("RSROLES_AUTHZ_SERVER__BASE_URL", "http://authz:8080");

        let config = ServiceConfig::from_env();

        std::env::remove_var("RSROLES_AUTHZ_SERVER__BASE_URL");

        let config = config.unwrap();
        assert_eq!(config.authz_server.base_url, "http://authz:8080");
        assert_eq!(config.retry.max_attempts, 5); // default
    }
}
