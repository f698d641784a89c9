// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Multiapps Core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Size of the bounded pool for parallel sub-operations
    pub max_parallel_operations: usize,
    /// Age after which an operation lock is considered stale
    pub lock_timeout: Duration,
    /// How often the stale lock sweeper runs
    pub lock_sweep_interval: Duration,
    /// Polling timeout for service broker jobs
    pub broker_poll_timeout: Duration,
    /// Process-wide fail-safe default (tolerate missing permissions)
    pub fail_safe: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `MULTIAPPS_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `MULTIAPPS_MAX_PARALLEL_OPERATIONS`: bounded pool size (default: 8)
    /// - `MULTIAPPS_LOCK_TIMEOUT_SECS`: stale lock age (default: 3600)
    /// - `MULTIAPPS_LOCK_SWEEP_INTERVAL_SECS`: sweeper period (default: 60)
    /// - `MULTIAPPS_BROKER_POLL_TIMEOUT_SECS`: broker job timeout (default: 1800)
    /// - `MULTIAPPS_FAIL_SAFE`: "true" or "1" to enable (default: false)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("MULTIAPPS_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("MULTIAPPS_DATABASE_URL"))?;

        let max_parallel_operations: usize = std::env::var("MULTIAPPS_MAX_PARALLEL_OPERATIONS")
            .unwrap_or_else(|_| "8".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "MULTIAPPS_MAX_PARALLEL_OPERATIONS",
                "must be a positive integer",
            ))?;

        let lock_timeout = secs_var("MULTIAPPS_LOCK_TIMEOUT_SECS", 3600)?;
        let lock_sweep_interval = secs_var("MULTIAPPS_LOCK_SWEEP_INTERVAL_SECS", 60)?;
        let broker_poll_timeout = secs_var("MULTIAPPS_BROKER_POLL_TIMEOUT_SECS", 1800)?;

        let fail_safe = std::env::var("MULTIAPPS_FAIL_SAFE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            database_url,
            max_parallel_operations,
            lock_timeout,
            lock_sweep_interval,
            broker_poll_timeout,
            fail_safe,
        })
    }
}

fn secs_var(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map(Duration::from_secs)
        .map_err(|_| ConfigError::Invalid(name, "must be a number of seconds"))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const OPTIONAL_VARS: [&str; 5] = [
        "MULTIAPPS_MAX_PARALLEL_OPERATIONS",
        "MULTIAPPS_LOCK_TIMEOUT_SECS",
        "MULTIAPPS_LOCK_SWEEP_INTERVAL_SECS",
        "MULTIAPPS_BROKER_POLL_TIMEOUT_SECS",
        "MULTIAPPS_FAIL_SAFE",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }

        fn clear_optional(&mut self) {
            for key in OPTIONAL_VARS {
                self.remove(key);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("MULTIAPPS_DATABASE_URL", "sqlite::memory:");
        guard.clear_optional();

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.max_parallel_operations, 8);
        assert_eq!(config.lock_timeout, Duration::from_secs(3600));
        assert_eq!(config.lock_sweep_interval, Duration::from_secs(60));
        assert_eq!(config.broker_poll_timeout, Duration::from_secs(1800));
        assert!(!config.fail_safe);
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("MULTIAPPS_DATABASE_URL", "postgres://user:pass@db:5432/prod");
        guard.set("MULTIAPPS_MAX_PARALLEL_OPERATIONS", "2");
        guard.set("MULTIAPPS_LOCK_TIMEOUT_SECS", "120");
        guard.set("MULTIAPPS_LOCK_SWEEP_INTERVAL_SECS", "5");
        guard.set("MULTIAPPS_BROKER_POLL_TIMEOUT_SECS", "600");
        guard.set("MULTIAPPS_FAIL_SAFE", "1");

        let config = Config::from_env().unwrap();

        assert_eq!(config.max_parallel_operations, 2);
        assert_eq!(config.lock_timeout, Duration::from_secs(120));
        assert_eq!(config.lock_sweep_interval, Duration::from_secs(5));
        assert_eq!(config.broker_poll_timeout, Duration::from_secs(600));
        assert!(config.fail_safe);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("MULTIAPPS_DATABASE_URL");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("MULTIAPPS_DATABASE_URL")));
        assert!(err.to_string().contains("MULTIAPPS_DATABASE_URL"));
    }

    #[test]
    fn test_config_zero_parallel_operations_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("MULTIAPPS_DATABASE_URL", "sqlite::memory:");
        guard.clear_optional();
        guard.set("MULTIAPPS_MAX_PARALLEL_OPERATIONS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("MULTIAPPS_MAX_PARALLEL_OPERATIONS", _)
        ));
    }

    #[test]
    fn test_config_invalid_lock_timeout() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("MULTIAPPS_DATABASE_URL", "sqlite::memory:");
        guard.clear_optional();
        guard.set("MULTIAPPS_LOCK_TIMEOUT_SECS", "-5");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("MULTIAPPS_LOCK_TIMEOUT_SECS", _)
        ));
    }

    #[test]
    fn test_fail_safe_accepts_only_true_or_one() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("MULTIAPPS_DATABASE_URL", "sqlite::memory:");
        guard.clear_optional();
        guard.set("MULTIAPPS_FAIL_SAFE", "yes");

        let config = Config::from_env().unwrap();
        assert!(!config.fail_safe);
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
