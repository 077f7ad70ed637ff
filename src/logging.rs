//! Tracing subscriber setup for Synod processes.
//!
//! Synod crates emit `tracing` events; this module installs a subscriber
//! configured from the environment:
//!
//! - `SYNOD_DEBUG=1` - Enable debug logging
//! - `SYNOD_LOG_LEVEL=trace|debug|info|warn|error|off` - Set log level
//! - `SYNOD_LOG_FORMAT=pretty|json|compact` - Set output format
//! - `SYNOD_LOG_COLOR=1|0` - Enable/disable colors
//!
//! `RUST_LOG`, when set, takes precedence over the level.

use std::env;
use thiserror::Error;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Errors installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("A global subscriber is already installed: {0}")]
    AlreadyInstalled(String),
}

/// Output format for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Multi-line human-readable format
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for structured logging
    Json,
}

impl Format {
    /// Get format from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pretty" => Some(Format::Pretty),
            "compact" => Some(Format::Compact),
            "json" => Some(Format::Json),
            _ => None,
        }
    }
}

const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Output format
    pub format: Format,
    /// Whether colors are enabled
    pub color: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Format::Json,
            color: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| lookup(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"));

        let debug = flag("SYNOD_DEBUG").unwrap_or(false);

        let level = lookup("SYNOD_LOG_LEVEL")
            .map(|s| s.to_lowercase())
            .filter(|s| LEVELS.contains(&s.as_str()))
            .unwrap_or_else(|| if debug { "debug" } else { "info" }.to_string());

        let format = lookup("SYNOD_LOG_FORMAT")
            .and_then(|s| Format::parse(&s))
            .unwrap_or(Format::Json);

        let color = flag("SYNOD_LOG_COLOR")
            .unwrap_or_else(|| lookup("NO_COLOR").is_none() && lookup("TERM").is_some());

        Self {
            level,
            format,
            color: color && format != Format::Json,
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }

    /// Install this configuration as the global subscriber.
    pub fn try_init(&self) -> Result<(), LoggingError> {
        let registry = tracing_subscriber::registry().with(self.filter());
        let result = match self.format {
            Format::Json => registry.with(fmt::layer().json()).try_init(),
            Format::Compact => registry
                .with(fmt::layer().compact().with_ansi(self.color))
                .try_init(),
            Format::Pretty => registry
                .with(fmt::layer().pretty().with_ansi(self.color))
                .try_init(),
        };
        result.map_err(|err| LoggingError::AlreadyInstalled(err.to_string()))
    }
}

/// Install a subscriber configured from the environment. Does nothing if one
/// is already installed.
pub fn init() {
    let _ = LogConfig::from_env().try_init();
}
