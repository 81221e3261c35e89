//! Startup configuration.
//!
//! Values come from CLI flags, with environment variables taking precedence
//! where set. There is no configuration file; the aggregator is a
//! short-lived operator tool.

use std::time::Duration;

use thiserror::Error;

use crate::logger::Level;

/// The listen address is fixed; only the port is configurable.
pub const LISTEN_ADDR: &str = "0.0.0.0";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("port must be non-zero")]
    InvalidPort,

    #[error("concurrency must be at least 1, got {0}")]
    InvalidConcurrency(usize),

    #[error("max_sessions must be at least 1, got {0}")]
    InvalidMaxSessions(usize),

    #[error("sweep interval must be non-zero")]
    InvalidSweepInterval,
}

/// Startup parameters for the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// TCP listen port.
    pub port: u16,

    /// Runtime worker thread count.
    pub concurrency: usize,

    /// Upper bound on registered sessions.
    pub max_sessions: usize,

    /// How often the liveness sweeper probes every session.
    pub sweep_interval: Duration,

    /// Initial console display threshold.
    pub log_level: Level,

    /// Start the graphical frontend stub instead of going straight to the
    /// CLI.
    pub gui: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 11451,
            concurrency: 50,
            max_sessions: usize::MAX,
            sweep_interval: Duration::from_secs(60),
            log_level: Level::Success,
            gui: false,
        }
    }
}

impl Config {
    /// Applies environment variable overrides.
    ///
    /// Variables that are set but do not parse are ignored with a warning.
    /// Supported: `AWDSHELLS_PORT`, `AWDSHELLS_MAX_SESSIONS`,
    /// `AWDSHELLS_LOG_LEVEL`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var("AWDSHELLS_PORT") {
            match raw.parse::<u16>() {
                Ok(port) => {
                    tracing::info!(port, "Overriding port from environment");
                    self.port = port;
                }
                Err(_) => tracing::warn!(value = %raw, "Ignoring unparseable AWDSHELLS_PORT"),
            }
        }

        if let Ok(raw) = std::env::var("AWDSHELLS_MAX_SESSIONS") {
            match raw.parse::<usize>() {
                Ok(max) => {
                    tracing::info!(max_sessions = max, "Overriding max_sessions from environment");
                    self.max_sessions = max;
                }
                Err(_) => {
                    tracing::warn!(value = %raw, "Ignoring unparseable AWDSHELLS_MAX_SESSIONS")
                }
            }
        }

        if let Ok(raw) = std::env::var("AWDSHELLS_LOG_LEVEL") {
            match raw.parse::<Level>() {
                Ok(level) => {
                    tracing::info!(level = %level, "Overriding log level from environment");
                    self.log_level = level;
                }
                Err(_) => tracing::warn!(value = %raw, "Ignoring unparseable AWDSHELLS_LOG_LEVEL"),
            }
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency(self.concurrency));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::InvalidMaxSessions(self.max_sessions));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidSweepInterval);
        }
        Ok(())
    }
}
