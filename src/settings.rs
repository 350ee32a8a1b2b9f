//! Configuration read from the environment at startup.

use crate::error::Error;
use crate::policy::QuotaPolicy;
use crate::store::DEFAULT_STORE_TIMEOUT_MILLIS;
use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Environment variables are read as `RATE_LIMIT_<FIELD>`, e.g. `RATE_LIMIT_REDIS_URL`.
pub const ENV_PREFIX: &str = "RATE_LIMIT";

/// What to do with a request when the window store cannot be reached.
///
/// Has no default, every deployment must choose one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Admit the request without a decision.
    FailOpen,
    /// Answer with a server error.
    FailClosed,
}

impl StoreFailurePolicy {
    pub fn is_fail_open(self) -> bool {
        matches!(self, Self::FailOpen)
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Unable to load rate limit settings: {0}")]
    Load(
        #[source]
        #[from]
        ConfigError,
    ),
    #[error("Invalid default policy: {0}")]
    Policy(#[source] Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Namespace prepended to every rate limit key in the store.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: Option<String>,
    /// Default requests per window.
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default = "default_window_millis")]
    pub window_millis: u64,
    #[serde(default = "default_store_timeout_millis")]
    pub store_timeout_millis: u64,
    pub on_store_failure: StoreFailurePolicy,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> Option<String> {
    Some("rate:".to_string())
}

fn default_limit() -> u64 {
    100
}

fn default_window_millis() -> u64 {
    60_000
}

fn default_store_timeout_millis() -> u64 {
    DEFAULT_STORE_TIMEOUT_MILLIS
}

impl Settings {
    /// Load from `RATE_LIMIT_*` environment variables.
    ///
    /// `RATE_LIMIT_ON_STORE_FAILURE` (`fail_open` or `fail_closed`) is required, everything else
    /// has a default.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_env_prefixed(ENV_PREFIX)
    }

    fn from_env_prefixed(prefix: &str) -> Result<Self, SettingsError> {
        let config = Config::builder()
            .add_source(Environment::with_prefix(prefix).try_parsing(true))
            .build()?;
        Self::from_config(config)
    }

    pub fn from_config(config: Config) -> Result<Self, SettingsError> {
        let settings: Settings = config.try_deserialize()?;
        settings.policy()?;
        Ok(settings)
    }

    /// The default quota.
    pub fn policy(&self) -> Result<QuotaPolicy, SettingsError> {
        let policy = QuotaPolicy::new(self.limit, self.window_millis);
        policy.validate().map_err(SettingsError::Policy)?;
        Ok(policy)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::builder()
            .set_override("on_store_failure", "fail_closed")
            .unwrap()
            .build()
            .unwrap();
        let settings = Settings::from_config(config).unwrap();
        assert_eq!(settings.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(settings.key_prefix.as_deref(), Some("rate:"));
        assert_eq!(settings.policy().unwrap(), QuotaPolicy::new(100, 60_000));
        assert_eq!(settings.store_timeout(), Duration::from_millis(50));
        assert_eq!(settings.on_store_failure, StoreFailurePolicy::FailClosed);
    }

    #[test]
    fn test_failure_policy_is_required() {
        let config = Config::builder().build().unwrap();
        assert!(matches!(
            Settings::from_config(config),
            Err(SettingsError::Load(_))
        ));
    }

    #[test]
    fn test_zero_limit_rejected() {
        let config = Config::builder()
            .set_override("on_store_failure", "fail_open")
            .unwrap()
            .set_override("limit", 0)
            .unwrap()
            .build()
            .unwrap();
        assert!(matches!(
            Settings::from_config(config),
            Err(SettingsError::Policy(Error::InvalidPolicy { .. }))
        ));
    }

    #[test]
    fn test_from_env() {
        // A prefix of its own, so other tests reading the environment are unaffected
        let prefix = "RATE_LIMIT_SETTINGS_TEST";
        std::env::set_var("RATE_LIMIT_SETTINGS_TEST_ON_STORE_FAILURE", "fail_open");
        std::env::set_var("RATE_LIMIT_SETTINGS_TEST_LIMIT", "5");
        std::env::set_var("RATE_LIMIT_SETTINGS_TEST_REDIS_URL", "redis://cache:6379");
        let settings = Settings::from_env_prefixed(prefix).unwrap();
        assert!(settings.on_store_failure.is_fail_open());
        assert_eq!(settings.limit, 5);
        assert_eq!(settings.window_millis, 60_000);
        assert_eq!(settings.redis_url, "redis://cache:6379");
    }
}
