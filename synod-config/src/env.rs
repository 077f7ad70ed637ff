// Environment variable overrides

use crate::loader::{parse_bool, parse_millis};
use crate::{ConfigError, CoordinationConfiguration, Result, ServerEntry};
use std::env;

/// Default prefix for coordination environment variables.
pub const DEFAULT_ENV_PREFIX: &str = "SYNOD_COORDINATION";

/// Environment variable loader
///
/// Recognized keys (with the default prefix):
///
/// - `SYNOD_COORDINATION_ENABLED` - `true` / `false`
/// - `SYNOD_COORDINATION_SESSION_TIMEOUT` - milliseconds
/// - `SYNOD_COORDINATION_SERVERS` - `host[:port],host[:port]`
pub struct EnvLoader {
    prefix: String,
}

impl EnvLoader {
    /// Create a new environment loader
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Full variable name for a key
    pub fn var_name(&self, key: &str) -> String {
        format!("{}_{}", self.prefix, key.to_uppercase())
    }

    /// Load a specific environment variable
    pub fn load_var(&self, key: &str) -> Result<String> {
        env::var(self.var_name(key)).map_err(ConfigError::EnvError)
    }

    /// Load a variable if it is set
    fn optional_var(&self, key: &str) -> Option<String> {
        self.load_var(key).ok()
    }

    /// Apply any overrides present in the environment
    pub fn apply(&self, config: &mut CoordinationConfiguration) -> Result<()> {
        if let Some(value) = self.optional_var("ENABLED") {
            config.enabled = parse_bool(&self.var_name("ENABLED"), &value)?;
        }

        if let Some(value) = self.optional_var("SESSION_TIMEOUT") {
            config.session_timeout = parse_millis(&self.var_name("SESSION_TIMEOUT"), &value)?;
        }

        if let Some(value) = self.optional_var("SERVERS") {
            let servers = parse_server_list(&value)?;
            if servers.is_empty() {
                return Err(ConfigError::NoServers);
            }
            config.servers = servers;
        }

        Ok(())
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(DEFAULT_ENV_PREFIX)
    }
}

/// Parse a `host[:port],host[:port]` list
pub fn parse_server_list(value: &str) -> Result<Vec<ServerEntry>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::parse)
        .collect()
}
