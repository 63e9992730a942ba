//! Configuration system for Tillgate.
//!
//! Configuration is loaded from multiple sources with the following precedence:
//! 1. Environment variables (highest priority)
//! 2. `tillgate.toml` file (or a file passed to [`TillgateConfig::load_from`])
//! 3. Default values (lowest priority)
//!
//! # Environment Variables
//!
//! - `TILLGATE_SERVER_URL` - License server base URL
//! - `TILLGATE_REQUEST_TIMEOUT_MS` - Per-request timeout
//! - `TILLGATE_CACHE_TTL_SECS` - Session cache TTL
//! - `TILLGATE_OFFLINE_GRACE_SECS` - How long last-known-good data may be served offline
//! - `TILLGATE_CACHE_PERSIST` - Persist the cache record across restarts
//! - `TILLGATE_GRACE_DELAY_MS` - Wait between activation success and the forced refresh
//! - `TILLGATE_LOCATION_TIMEOUT_MS` - How long activation waits for a location hint
//! - `TILLGATE_BOOTSTRAP_CODE` - Code used by the automatic first-activation fallback
//! - `TILLGATE_LOGGING_ENABLED` - Enable logging
//! - `TILLGATE_LOG_LEVEL` - Log level (trace, debug, info, warn, error)

use config::{Config, ConfigError};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use crate::errors::{LicenseError, LicenseResult};

/// Global configuration singleton.
static CONFIG: OnceLock<TillgateConfig> = OnceLock::new();

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TillgateConfig {
    /// License server connection
    pub server: ServerConfig,
    /// License cache behaviour
    pub cache: CacheConfig,
    /// Activation flow tuning
    pub activation: ActivationConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// License server connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the license server
    pub base_url: String,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// License cache settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Session TTL in seconds
    pub ttl_secs: u64,
    /// Maximum age of last-known-good data served while the server is unreachable (0 = never)
    pub offline_grace_secs: u64,
    /// Persist the cache record across restarts
    pub persist: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            offline_grace_secs: 259_200,
            persist: true,
        }
    }
}

/// Activation flow settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActivationConfig {
    /// Delay between a successful activation and the forced status refresh
    pub grace_delay_ms: u64,
    /// How long to wait for a location hint before activating without one
    pub location_timeout_ms: u64,
    /// Code used when standard activation falls through to first activation
    pub bootstrap_code: Option<String>,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            grace_delay_ms: 1_500,
            location_timeout_ms: 3_000,
            bootstrap_code: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Enable logging
    pub enabled: bool,
    /// Log level: trace, debug, info, warn, error
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "info".to_string(),
        }
    }
}

fn config_err(e: ConfigError) -> LicenseError {
    LicenseError::ConfigError(e.to_string())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

impl TillgateConfig {
    /// Load configuration from `tillgate.toml` (optional) and the environment.
    pub fn load() -> LicenseResult<Self> {
        Self::build(config::File::with_name("tillgate").required(false))
    }

    /// Load configuration from an explicit file (required) and the environment.
    pub fn load_from(path: &Path) -> LicenseResult<Self> {
        Self::build(config::File::from(path).required(true))
    }

    fn build<S>(file: S) -> LicenseResult<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let builder = Config::builder()
            // Start with defaults
            .set_default("server.base_url", "http://127.0.0.1:8080")
            .map_err(config_err)?
            .set_default("server.request_timeout_ms", 10_000_i64)
            .map_err(config_err)?
            .set_default("cache.ttl_secs", 300_i64)
            .map_err(config_err)?
            .set_default("cache.offline_grace_secs", 259_200_i64)
            .map_err(config_err)?
            .set_default("cache.persist", true)
            .map_err(config_err)?
            .set_default("activation.grace_delay_ms", 1_500_i64)
            .map_err(config_err)?
            .set_default("activation.location_timeout_ms", 3_000_i64)
            .map_err(config_err)?
            .set_default("logging.enabled", false)
            .map_err(config_err)?
            .set_default("logging.level", "info")
            .map_err(config_err)?
            .add_source(file)
            // Override with environment variables
            .set_override_option("server.base_url", env::var("TILLGATE_SERVER_URL").ok())
            .map_err(config_err)?
            .set_override_option(
                "server.request_timeout_ms",
                env_parsed::<i64>("TILLGATE_REQUEST_TIMEOUT_MS"),
            )
            .map_err(config_err)?
            .set_override_option("cache.ttl_secs", env_parsed::<i64>("TILLGATE_CACHE_TTL_SECS"))
            .map_err(config_err)?
            .set_override_option(
                "cache.offline_grace_secs",
                env_parsed::<i64>("TILLGATE_OFFLINE_GRACE_SECS"),
            )
            .map_err(config_err)?
            .set_override_option("cache.persist", env_parsed::<bool>("TILLGATE_CACHE_PERSIST"))
            .map_err(config_err)?
            .set_override_option(
                "activation.grace_delay_ms",
                env_parsed::<i64>("TILLGATE_GRACE_DELAY_MS"),
            )
            .map_err(config_err)?
            .set_override_option(
                "activation.location_timeout_ms",
                env_parsed::<i64>("TILLGATE_LOCATION_TIMEOUT_MS"),
            )
            .map_err(config_err)?
            .set_override_option(
                "activation.bootstrap_code",
                env::var("TILLGATE_BOOTSTRAP_CODE").ok(),
            )
            .map_err(config_err)?
            .set_override_option(
                "logging.enabled",
                env_parsed::<bool>("TILLGATE_LOGGING_ENABLED"),
            )
            .map_err(config_err)?
            .set_override_option("logging.level", env::var("TILLGATE_LOG_LEVEL").ok())
            .map_err(config_err)?;

        let settings = builder
            .build()
            .map_err(|e| LicenseError::ConfigError(format!("failed to build config: {e}")))?;

        let config: TillgateConfig = settings
            .try_deserialize()
            .map_err(|e| LicenseError::ConfigError(format!("failed to deserialize config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> LicenseResult<()> {
        let url = self.server.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(LicenseError::ConfigError(format!(
                "server.base_url must be an http(s) URL, got '{url}'"
            )));
        }

        if self.server.request_timeout_ms == 0 {
            return Err(LicenseError::ConfigError(
                "server.request_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.cache.ttl_secs == 0 {
            return Err(LicenseError::ConfigError(
                "cache.ttl_secs must be greater than 0".to_string(),
            ));
        }

        if let Some(code) = &self.activation.bootstrap_code {
            if code.trim().is_empty() {
                return Err(LicenseError::ConfigError(
                    "activation.bootstrap_code cannot be blank".to_string(),
                ));
            }
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(LicenseError::ConfigError(format!(
                    "logging.level must be one of: trace, debug, info, warn, error. Got '{other}'"
                )));
            }
        }

        Ok(())
    }
}

/// Get the global configuration.
///
/// Loads on first access and caches the validated result.
pub fn get_config() -> LicenseResult<&'static TillgateConfig> {
    if let Some(config) = CONFIG.get() {
        return Ok(config);
    }

    let config = TillgateConfig::load()?;

    // Another thread may have won the race; either value is valid.
    let _ = CONFIG.set(config);

    CONFIG
        .get()
        .ok_or_else(|| LicenseError::ConfigError("configuration was not stored".to_string()))
}

/// Initialize configuration explicitly.
///
/// Call this early in your application to catch configuration errors.
pub fn init_config() -> LicenseResult<&'static TillgateConfig> {
    get_config()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TillgateConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.ttl_secs, 300);
        assert_eq!(config.server.request_timeout(), Duration::from_secs(10));
        assert!(config.activation.bootstrap_code.is_none());
    }

    #[test]
    fn rejects_non_http_url() {
        let mut config = TillgateConfig::default();
        config.server.base_url = "ftp://licenses.example".to_string();
        assert!(matches!(
            config.validate(),
            Err(LicenseError::ConfigError(_))
        ));
    }

    #[test]
    fn rejects_zero_ttl() {
        let mut config = TillgateConfig::default();
        config.cache.ttl_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_blank_bootstrap_code() {
        let mut config = TillgateConfig::default();
        config.activation.bootstrap_code = Some("   ".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut config = TillgateConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }
}
