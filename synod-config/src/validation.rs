// Configuration validation

use crate::{ConfigError, Result};
use std::time::Duration;

/// Trait for validating configuration
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// Configuration validator with rules
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate that a value is not empty
    pub fn not_empty(value: &str, field: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "{} cannot be empty",
                field
            )));
        }
        Ok(())
    }

    /// Validate port number
    pub fn is_port(value: u16, field: &str) -> Result<()> {
        if value == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{} must be a valid port number",
                field
            )));
        }
        Ok(())
    }

    /// Validate that a duration is non-zero
    pub fn positive_duration(value: Duration, field: &str) -> Result<()> {
        if value.is_zero() {
            return Err(ConfigError::ValidationError(format!(
                "{} must be greater than zero",
                field
            )));
        }
        Ok(())
    }

    /// Validate a store namespace path: absolute, no trailing slash, no empty segments
    pub fn is_absolute_path(value: &str, field: &str) -> Result<()> {
        let valid = value.len() > 1
            && value.starts_with('/')
            && !value.ends_with('/')
            && !value.contains("//");

        if !valid {
            return Err(ConfigError::ValidationError(format!(
                "{} must be an absolute path without a trailing slash",
                field
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_empty_validation() {
        assert!(ConfigValidator::not_empty("value", "field").is_ok());
        assert!(ConfigValidator::not_empty("", "field").is_err());
        assert!(ConfigValidator::not_empty("   ", "field").is_err());
    }

    #[test]
    fn test_port_validation() {
        assert!(ConfigValidator::is_port(2181, "field").is_ok());
        assert!(ConfigValidator::is_port(0, "field").is_err());
    }

    #[test]
    fn test_duration_validation() {
        assert!(ConfigValidator::positive_duration(Duration::from_millis(1), "field").is_ok());
        assert!(ConfigValidator::positive_duration(Duration::ZERO, "field").is_err());
    }

    #[test]
    fn test_path_validation() {
        assert!(ConfigValidator::is_absolute_path("/synod", "field").is_ok());
        assert!(ConfigValidator::is_absolute_path("/a/b", "field").is_ok());
        assert!(ConfigValidator::is_absolute_path("/", "field").is_err());
        assert!(ConfigValidator::is_absolute_path("synod", "field").is_err());
        assert!(ConfigValidator::is_absolute_path("/synod/", "field").is_err());
        assert!(ConfigValidator::is_absolute_path("/a//b", "field").is_err());
    }
}
