// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Upper bound for insert attempts per run.
pub const MAX_INSERT_ATTEMPTS_CAP: u32 = 5;

/// Tasklane configuration
#[derive(Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Base URL of the remote job server (empty when not configured)
    pub remote_base_url: String,
    /// Bearer token for the remote job server (empty when not configured)
    pub remote_token: String,
    /// Interval between status polls
    pub poll_interval: Duration,
    /// Wall-clock budget for the poll loop
    pub poll_timeout: Duration,
    /// Timeout for a single remote request
    pub request_timeout: Duration,
    /// Attempts to allocate and insert a run row
    pub max_insert_attempts: u32,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url)
            .field("remote_base_url", &self.remote_base_url)
            .field(
                "remote_token",
                &if self.remote_token.is_empty() {
                    ""
                } else {
                    "<redacted>"
                },
            )
            .field("poll_interval", &self.poll_interval)
            .field("poll_timeout", &self.poll_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("max_insert_attempts", &self.max_insert_attempts)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `TASKLANE_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `TASKLANE_REMOTE_BASE_URL`: remote job server URL (default: empty)
    /// - `TASKLANE_REMOTE_TOKEN`: remote job server token (default: empty)
    /// - `TASKLANE_POLL_INTERVAL_SECS`: poll interval (default: 5)
    /// - `TASKLANE_POLL_TIMEOUT_SECS`: poll budget (default: 300)
    /// - `TASKLANE_REQUEST_TIMEOUT_SECS`: per-request timeout (default: 30)
    /// - `TASKLANE_MAX_INSERT_ATTEMPTS`: insert attempts, clamped to 1..=5 (default: 3)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("TASKLANE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("TASKLANE_DATABASE_URL"))?;

        let remote_base_url = std::env::var("TASKLANE_REMOTE_BASE_URL").unwrap_or_default();
        let remote_token = std::env::var("TASKLANE_REMOTE_TOKEN").unwrap_or_default();

        let poll_interval = secs_var("TASKLANE_POLL_INTERVAL_SECS", 5)?;
        let poll_timeout = secs_var("TASKLANE_POLL_TIMEOUT_SECS", 300)?;
        let request_timeout = secs_var("TASKLANE_REQUEST_TIMEOUT_SECS", 30)?;

        let max_insert_attempts: u32 = std::env::var("TASKLANE_MAX_INSERT_ATTEMPTS")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("TASKLANE_MAX_INSERT_ATTEMPTS", "must be a positive integer")
            })?;

        Ok(Self {
            database_url,
            remote_base_url,
            remote_token,
            poll_interval,
            poll_timeout,
            request_timeout,
            max_insert_attempts: max_insert_attempts.clamp(1, MAX_INSERT_ATTEMPTS_CAP),
        })
    }
}

fn secs_var(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let secs: u64 = std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(name, "must be a number of seconds"))?;

    if secs == 0 {
        return Err(ConfigError::Invalid(name, "must be greater than zero"));
    }

    Ok(Duration::from_secs(secs))
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

/// Timing and retry knobs for [`RunOrchestrator`](crate::orchestrator::RunOrchestrator).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Sleep between status polls.
    pub poll_interval: Duration,
    /// Wall-clock budget measured from the first poll.
    pub poll_timeout: Duration,
    /// Budget for the preflight connectivity probe.
    pub preflight_timeout: Duration,
    /// Budget for a best-effort remote cancel.
    pub cancel_timeout: Duration,
    /// Budget for any other single remote call.
    pub request_timeout: Duration,
    /// Allocation + insert attempts per run.
    pub max_insert_attempts: u32,
    /// Base for the randomized backoff between insert attempts.
    pub retry_backoff_base: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(300),
            preflight_timeout: Duration::from_secs(10),
            cancel_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_insert_attempts: 3,
            retry_backoff_base: Duration::from_millis(50),
        }
    }
}

impl From<&Config> for OrchestratorConfig {
    fn from(config: &Config) -> Self {
        let short = config.request_timeout.min(Duration::from_secs(10));
        Self {
            poll_interval: config.poll_interval,
            poll_timeout: config.poll_timeout,
            preflight_timeout: short,
            cancel_timeout: short,
            request_timeout: config.request_timeout,
            max_insert_attempts: config.max_insert_attempts.clamp(1, MAX_INSERT_ATTEMPTS_CAP),
            ..Default::default()
        }
    }
}
