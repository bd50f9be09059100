//! Configuration of a [`DataStore`](crate::DataStore).

use crate::sync::{log_errors, AuthMode, AuthModeStrategy, ErrorHandler, RetryConfig};
use std::env;
use std::time::Duration;

/// Store configuration, built with `with_*` methods or loaded from the
/// environment.
#[derive(Clone)]
pub struct DataStoreConfig {
    /// Records requested per sync page
    pub sync_page_size: usize,
    /// Upper bound of records pulled per model
    pub max_records_to_sync: usize,
    pub auth_mode: AuthMode,
    pub auth_strategy: AuthModeStrategy,
    /// Keep surviving items of partially failed sync responses
    pub partial_data: bool,
    /// Default flush interval of unsynced query subscriptions
    pub observe_query_throttle: Duration,
    pub retry: RetryConfig,
    pub error_handler: ErrorHandler,
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        Self {
            sync_page_size: 1000,
            max_records_to_sync: 10_000,
            auth_mode: AuthMode::AmazonCognitoUserPools,
            auth_strategy: AuthModeStrategy::Default,
            partial_data: false,
            observe_query_throttle: Duration::from_secs(2),
            retry: RetryConfig::default(),
            error_handler: log_errors(),
        }
    }
}

impl DataStoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from `.env` and environment variables.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Ok(value) = env::var("DATASTORE_PARTIAL_DATA") {
            config.partial_data = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid("DATASTORE_PARTIAL_DATA", value))?;
        }
        if let Ok(value) = env::var("DATASTORE_SYNC_PAGE_SIZE") {
            config.sync_page_size = parse_count("DATASTORE_SYNC_PAGE_SIZE", value)?;
        }
        if let Ok(value) = env::var("DATASTORE_MAX_RECORDS_TO_SYNC") {
            config.max_records_to_sync = parse_count("DATASTORE_MAX_RECORDS_TO_SYNC", value)?;
        }
        if let Ok(value) = env::var("DATASTORE_AUTH_MODE") {
            config.auth_mode = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid("DATASTORE_AUTH_MODE", value))?;
        }
        if let Ok(value) = env::var("DATASTORE_MAX_RETRY_ATTEMPTS") {
            let attempts = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid("DATASTORE_MAX_RETRY_ATTEMPTS", value))?;
            config.retry.max_attempts = attempts;
        }

        Ok(config)
    }

    pub fn with_sync_page_size(mut self, size: usize) -> Self {
        self.sync_page_size = size;
        self
    }

    pub fn with_max_records_to_sync(mut self, max: usize) -> Self {
        self.max_records_to_sync = max;
        self
    }

    pub fn with_auth_mode(mut self, mode: AuthMode) -> Self {
        self.auth_mode = mode;
        self
    }

    pub fn with_auth_strategy(mut self, strategy: AuthModeStrategy) -> Self {
        self.auth_strategy = strategy;
        self
    }

    pub fn with_partial_data(mut self, enabled: bool) -> Self {
        self.partial_data = enabled;
        self
    }

    pub fn with_observe_query_throttle(mut self, throttle: Duration) -> Self {
        self.observe_query_throttle = throttle;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = handler;
        self
    }
}

impl std::fmt::Debug for DataStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStoreConfig")
            .field("sync_page_size", &self.sync_page_size)
            .field("max_records_to_sync", &self.max_records_to_sync)
            .field("auth_mode", &self.auth_mode)
            .field("auth_strategy", &self.auth_strategy)
            .field("partial_data", &self.partial_data)
            .field("observe_query_throttle", &self.observe_query_throttle)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn parse_count(name: &'static str, value: String) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::Invalid(name, value)),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid {0} value: {1}")]
    Invalid(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = DataStoreConfig::default();
        assert_eq!(config.sync_page_size, 1000);
        assert_eq!(config.max_records_to_sync, 10_000);
        assert_eq!(config.auth_mode, AuthMode::AmazonCognitoUserPools);
        assert!(!config.partial_data);
        assert_eq!(config.observe_query_throttle, Duration::from_secs(2));
        assert_eq!(config.retry.max_attempts, 10);
    }

    #[test]
    fn builders() {
        let config = DataStoreConfig::new()
            .with_partial_data(true)
            .with_sync_page_size(10)
            .with_auth_mode(AuthMode::ApiKey);
        assert!(config.partial_data);
        assert_eq!(config.sync_page_size, 10);
        assert_eq!(config.auth_mode, AuthMode::ApiKey);
    }

    #[test]
    fn count_parsing() {
        assert_eq!(parse_count("X", " 25 ".into()).unwrap(), 25);
        assert!(parse_count("X", "0".into()).is_err());
        let err = parse_count("DATASTORE_SYNC_PAGE_SIZE", "many".into()).unwrap_err();
        assert_eq!(err.to_string(), "Invalid DATASTORE_SYNC_PAGE_SIZE value: many");
    }

    #[test]
    fn from_env_overrides_defaults() {
        env::set_var("DATASTORE_PARTIAL_DATA", "true");
        env::set_var("DATASTORE_MAX_RETRY_ATTEMPTS", "3");
        let config = DataStoreConfig::from_env();

        env::set_var("DATASTORE_MAX_RETRY_ATTEMPTS", "often");
        let err = DataStoreConfig::from_env().unwrap_err();

        env::remove_var("DATASTORE_PARTIAL_DATA");
        env::remove_var("DATASTORE_MAX_RETRY_ATTEMPTS");

        let config = config.unwrap();
        assert!(config.partial_data);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.sync_page_size, 1000);
        assert_eq!(
            err.to_string(),
            "Invalid DATASTORE_MAX_RETRY_ATTEMPTS value: often"
        );
    }
}
