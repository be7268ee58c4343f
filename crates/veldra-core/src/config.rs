// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine configuration and constants.

use std::time::Duration;

/// Retries for the source edge. Every other edge takes its retry count from
/// the step configuration; initialization gets a fixed, generous budget.
pub const SOURCE_EDGE_RETRIES: u32 = 20;

/// Maximum concurrent pause-matching tasks per incoming event.
pub const PAUSE_HANDLE_CONCURRENCY: usize = 100;

/// Candidate-pause count above which the aggregate matcher is used instead
/// of the linear scan.
pub const AGGREGATE_PAUSE_THRESHOLD: usize = 10;

/// How long a cancellation trigger stays armed when the definition does not
/// set a timeout.
pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Maximum number of stored steps per run before the run overflows.
pub const DEFAULT_MAX_STEP_LIMIT: usize = 1000;

/// Bounds for the evaluated priority factor, in seconds.
pub const PRIORITY_FACTOR_MIN: i64 = -600;
/// See [`PRIORITY_FACTOR_MIN`].
pub const PRIORITY_FACTOR_MAX: i64 = 600;

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cancellation window for triggers without an explicit timeout.
    pub cancel_timeout: Duration,
    /// Concurrency cap for pause matching.
    pub pause_handle_concurrency: usize,
    /// Threshold for switching to the aggregate pause matcher.
    pub aggregate_pause_threshold: usize,
    /// Step cap per run.
    pub max_step_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
            pause_handle_concurrency: PAUSE_HANDLE_CONCURRENCY,
            aggregate_pause_threshold: AGGREGATE_PAUSE_THRESHOLD,
            max_step_limit: DEFAULT_MAX_STEP_LIMIT,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `VELDRA_CANCEL_TIMEOUT_SECS`: cancellation window in seconds
    /// - `VELDRA_PAUSE_HANDLE_CONCURRENCY`: pause matching concurrency
    /// - `VELDRA_AGGREGATE_PAUSE_THRESHOLD`: aggregate matcher threshold
    /// - `VELDRA_MAX_STEP_LIMIT`: step cap per run
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Ok(v) = std::env::var("VELDRA_CANCEL_TIMEOUT_SECS") {
            let secs: u64 = v.parse().map_err(|_| {
                ConfigError::Invalid("VELDRA_CANCEL_TIMEOUT_SECS", "must be a positive integer")
            })?;
            config.cancel_timeout = Duration::from_secs(secs);
        }
        if let Ok(v) = std::env::var("VELDRA_PAUSE_HANDLE_CONCURRENCY") {
            config.pause_handle_concurrency = v.parse().map_err(|_| {
                ConfigError::Invalid(
                    "VELDRA_PAUSE_HANDLE_CONCURRENCY",
                    "must be a positive integer",
                )
            })?;
        }
        if let Ok(v) = std::env::var("VELDRA_AGGREGATE_PAUSE_THRESHOLD") {
            config.aggregate_pause_threshold = v.parse().map_err(|_| {
                ConfigError::Invalid(
                    "VELDRA_AGGREGATE_PAUSE_THRESHOLD",
                    "must be a positive integer",
                )
            })?;
        }
        if let Ok(v) = std::env::var("VELDRA_MAX_STEP_LIMIT") {
            config.max_step_limit = v.parse().map_err(|_| {
                ConfigError::Invalid("VELDRA_MAX_STEP_LIMIT", "must be a positive integer")
            })?;
        }

        Ok(config)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
