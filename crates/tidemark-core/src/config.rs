// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use crate::executor::RunnerOptions;
use crate::lock::LockOptions;

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Lease duration granted on each lock acquire/extend, in milliseconds
    pub lock_lease_millis: u64,
    /// Total budget for the lock acquire retry loop, in milliseconds
    pub lock_quit_trying_after_millis: u64,
    /// Pause between lock acquire retries, in milliseconds
    pub lock_retry_frequency_millis: u64,
    /// Abort the run on lock contention instead of ending it cleanly
    pub throw_on_lock_failure: bool,
    /// Keep the lease extended by a background task while executing
    pub enable_lock_refresh: bool,
    /// Pause between background lease extensions, in milliseconds
    pub lock_refresh_frequency_millis: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            lock_lease_millis: 60_000,
            lock_quit_trying_after_millis: 180_000,
            lock_retry_frequency_millis: 1_000,
            throw_on_lock_failure: true,
            enable_lock_refresh: true,
            lock_refresh_frequency_millis: 15_000,
        }
    }
}

impl RunnerConfig {
    /// Load configuration from environment variables.
    ///
    /// All optional (with defaults):
    /// - `TIDEMARK_LOCK_LEASE_MILLIS`: lease duration (default: 60000)
    /// - `TIDEMARK_LOCK_QUIT_TRYING_AFTER_MILLIS`: acquire retry budget (default: 180000)
    /// - `TIDEMARK_LOCK_RETRY_FREQUENCY_MILLIS`: pause between retries (default: 1000)
    /// - `TIDEMARK_THROW_ON_LOCK_FAILURE`: abort on contention (default: true)
    /// - `TIDEMARK_ENABLE_LOCK_REFRESH`: background lease refresh (default: true)
    /// - `TIDEMARK_LOCK_REFRESH_FREQUENCY_MILLIS`: refresh pause (default: 15000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let lock_lease_millis = env_u64(
            "TIDEMARK_LOCK_LEASE_MILLIS",
            defaults.lock_lease_millis,
        )?;
        if lock_lease_millis == 0 {
            return Err(ConfigError::Invalid(
                "TIDEMARK_LOCK_LEASE_MILLIS",
                "must be greater than zero",
            ));
        }

        let lock_quit_trying_after_millis = env_u64(
            "TIDEMARK_LOCK_QUIT_TRYING_AFTER_MILLIS",
            defaults.lock_quit_trying_after_millis,
        )?;

        let lock_retry_frequency_millis = env_u64(
            "TIDEMARK_LOCK_RETRY_FREQUENCY_MILLIS",
            defaults.lock_retry_frequency_millis,
        )?;
        if lock_retry_frequency_millis == 0 {
            return Err(ConfigError::Invalid(
                "TIDEMARK_LOCK_RETRY_FREQUENCY_MILLIS",
                "must be greater than zero",
            ));
        }

        let throw_on_lock_failure = env_bool(
            "TIDEMARK_THROW_ON_LOCK_FAILURE",
            defaults.throw_on_lock_failure,
        )?;

        let enable_lock_refresh = env_bool(
            "TIDEMARK_ENABLE_LOCK_REFRESH",
            defaults.enable_lock_refresh,
        )?;

        let lock_refresh_frequency_millis = env_u64(
            "TIDEMARK_LOCK_REFRESH_FREQUENCY_MILLIS",
            defaults.lock_refresh_frequency_millis,
        )?;

        Ok(Self {
            lock_lease_millis,
            lock_quit_trying_after_millis,
            lock_retry_frequency_millis,
            throw_on_lock_failure,
            enable_lock_refresh,
            lock_refresh_frequency_millis,
        })
    }

    /// The lock timing knobs of this configuration.
    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            lease_millis: self.lock_lease_millis,
            quit_trying_after_millis: self.lock_quit_trying_after_millis,
            retry_frequency_millis: self.lock_retry_frequency_millis,
        }
    }

    /// The run-loop knobs of this configuration.
    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            throw_on_lock_failure: self.throw_on_lock_failure,
            enable_lock_refresh: self.enable_lock_refresh,
            refresh_frequency: Duration::from_millis(self.lock_refresh_frequency_millis),
        }
    }
}

fn env_u64(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid(key, "must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(value) => match value.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(ConfigError::Invalid(key, "must be true or false")),
        },
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
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
    fn test_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.remove("TIDEMARK_LOCK_LEASE_MILLIS");
        guard.remove("TIDEMARK_LOCK_QUIT_TRYING_AFTER_MILLIS");
        guard.remove("TIDEMARK_LOCK_RETRY_FREQUENCY_MILLIS");
        guard.remove("TIDEMARK_THROW_ON_LOCK_FAILURE");
        guard.remove("TIDEMARK_ENABLE_LOCK_REFRESH");
        guard.remove("TIDEMARK_LOCK_REFRESH_FREQUENCY_MILLIS");

        let config = RunnerConfig::from_env().unwrap();
        assert_eq!(config.lock_lease_millis, 60_000);
        assert_eq!(config.lock_quit_trying_after_millis, 180_000);
        assert_eq!(config.lock_retry_frequency_millis, 1_000);
        assert!(config.throw_on_lock_failure);
        assert!(config.enable_lock_refresh);
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("TIDEMARK_LOCK_LEASE_MILLIS", "5000");
        guard.set("TIDEMARK_THROW_ON_LOCK_FAILURE", "false");
        guard.remove("TIDEMARK_LOCK_QUIT_TRYING_AFTER_MILLIS");
        guard.remove("TIDEMARK_LOCK_RETRY_FREQUENCY_MILLIS");
        guard.remove("TIDEMARK_ENABLE_LOCK_REFRESH");
        guard.remove("TIDEMARK_LOCK_REFRESH_FREQUENCY_MILLIS");

        let config = RunnerConfig::from_env().unwrap();
        assert_eq!(config.lock_lease_millis, 5_000);
        assert!(!config.throw_on_lock_failure);
        assert_eq!(config.lock_options().lease_millis, 5_000);
        assert!(!config.runner_options().throw_on_lock_failure);
    }

    #[test]
    fn test_config_rejects_invalid_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("TIDEMARK_LOCK_LEASE_MILLIS", "not-a-number");

        assert!(matches!(
            RunnerConfig::from_env(),
            Err(ConfigError::Invalid(_, _))
        ));
    }

    #[test]
    fn test_config_rejects_zero_lease() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("TIDEMARK_LOCK_LEASE_MILLIS", "0");

        assert!(matches!(
            RunnerConfig::from_env(),
            Err(ConfigError::Invalid(_, _))
        ));
    }
}
