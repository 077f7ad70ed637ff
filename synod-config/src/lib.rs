// Coordination client configuration for Synod
//
// Loads the coordination client XML file into a `CoordinationConfiguration`,
// applies environment overrides and validates the result before any
// connection is attempted.

pub mod env;
pub mod error;
pub mod loader;
pub mod validation;

pub use env::{DEFAULT_ENV_PREFIX, EnvLoader, parse_server_list};
pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, DEFAULT_MESSAGE_TIMEOUT, DEFAULT_ROOT_PATH, ROOT_ELEMENT};
pub use validation::{ConfigValidator, Validate};

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default session timeout used by the builder.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// A coordination store server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub host: String,
    pub port: Option<u16>,
}

impl ServerEntry {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => write!(f, "{}", self.host),
        }
    }
}

impl FromStr for ServerEntry {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => (host, Some(loader::parse_port("server port", port)?)),
            None => (s, None),
        };

        if host.trim().is_empty() {
            return Err(ConfigError::MissingElement("server host".to_string()));
        }

        Ok(Self::new(host.trim(), port))
    }
}

/// Coordination client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationConfiguration {
    /// Whether the coordination service should start at all
    pub enabled: bool,
    /// Session timeout negotiated with the store
    pub session_timeout: Duration,
    /// Store ensemble endpoints
    pub servers: Vec<ServerEntry>,
    /// Namespace under which all coordination nodes live
    pub root_path: String,
    /// Default wait budget for peer requests and lifetime of message nodes
    pub message_timeout: Duration,
}

impl CoordinationConfiguration {
    /// Create a builder.
    pub fn builder() -> CoordinationConfigurationBuilder {
        CoordinationConfigurationBuilder::new()
    }

    /// Parse an XML configuration document.
    pub fn from_xml(content: &str) -> Result<Self> {
        ConfigLoader::new().parse(content)
    }

    /// Load an XML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().load_file(path)
    }

    /// Load an XML configuration file and apply `SYNOD_COORDINATION_*`
    /// environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        EnvLoader::default().apply(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Whether the coordination service is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Render the server list as the store client's connection string.
    ///
    /// ```
    /// use synod_config::CoordinationConfiguration;
    ///
    /// let config = CoordinationConfiguration::builder()
    ///     .server("zk1", Some(2181))
    ///     .server("zk2", None)
    ///     .build()
    ///     .unwrap();
    ///
    /// assert_eq!(config.connection_string(), "zk1:2181,zk2");
    /// ```
    pub fn connection_string(&self) -> String {
        self.servers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Validate for CoordinationConfiguration {
    fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }

        for server in &self.servers {
            ConfigValidator::not_empty(&server.host, "server host")?;
            if let Some(port) = server.port {
                ConfigValidator::is_port(port, "server port")?;
            }
        }

        ConfigValidator::positive_duration(self.session_timeout, "sessionTimeout")?;
        ConfigValidator::positive_duration(self.message_timeout, "messageTimeout")?;
        ConfigValidator::is_absolute_path(&self.root_path, "rootPath")?;

        Ok(())
    }
}

/// Builder for coordination configuration.
pub struct CoordinationConfigurationBuilder {
    config: CoordinationConfiguration,
}

impl CoordinationConfigurationBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: CoordinationConfiguration {
                enabled: true,
                session_timeout: DEFAULT_SESSION_TIMEOUT,
                servers: Vec::new(),
                root_path: DEFAULT_ROOT_PATH.to_string(),
                message_timeout: DEFAULT_MESSAGE_TIMEOUT,
            },
        }
    }

    /// Enable or disable the service.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Set the session timeout.
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_timeout = timeout;
        self
    }

    /// Add a server endpoint.
    pub fn server(mut self, host: impl Into<String>, port: Option<u16>) -> Self {
        self.config.servers.push(ServerEntry::new(host, port));
        self
    }

    /// Replace the server list.
    pub fn servers(mut self, servers: Vec<ServerEntry>) -> Self {
        self.config.servers = servers;
        self
    }

    /// Set the namespace root.
    pub fn root_path(mut self, path: impl Into<String>) -> Self {
        self.config.root_path = path.into();
        self
    }

    /// Set the message timeout.
    pub fn message_timeout(mut self, timeout: Duration) -> Self {
        self.config.message_timeout = timeout;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<CoordinationConfiguration> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for CoordinationConfigurationBuilder {
    fn default() -> Self {
        Self::new()
    }
}
