// Error types for coordination configuration

use thiserror::Error;

/// Configuration error.
///
/// Every problem with the coordination client configuration is reported
/// through this single type. It is fatal at startup and never retried.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing configuration element: {0}")]
    MissingElement(String),

    #[error("Unexpected root element '{found}', expected '{expected}'")]
    UnexpectedRoot { expected: String, found: String },

    #[error("Invalid value for {field}: '{value}'")]
    InvalidValue { field: String, value: String },

    #[error("No coordination servers configured")]
    NoServers,

    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Environment variable error: {0}")]
    EnvError(#[from] std::env::VarError),
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
