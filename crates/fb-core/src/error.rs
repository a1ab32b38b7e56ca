//! Configuration error types for fogbox
//!
//! Every failure that happens before a provider is contacted is reported
//! through [`ConfigError`].

use thiserror::Error;

/// Errors raised while loading configuration or resolving credentials
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The value is not one of the accepted shapes (map, path, open file)
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A required backend is not available in this build
    #[error("Missing dependency {dependency}: {hint}")]
    MissingDependency { dependency: String, hint: String },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config loading error: {0}")]
    Load(#[from] ::config::ConfigError),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    /// Build a missing-dependency error carrying an install hint
    pub fn missing_dependency(dependency: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::MissingDependency {
            dependency: dependency.into(),
            hint: hint.into(),
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ConfigError::InvalidConfiguration(_) => "invalid_configuration",
            ConfigError::MissingDependency { .. } => "missing_dependency",
            ConfigError::Template(_) => "template_error",
            ConfigError::Parse(_) => "parse_error",
            ConfigError::Io(_) => "io_error",
            ConfigError::Load(_) => "config_load_error",
        }
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
