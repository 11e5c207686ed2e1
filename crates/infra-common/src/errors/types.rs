use thiserror::Error;

/// Error type for infrastructure operations
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded or deserialized
    #[error("Configuration error: {0}")]
    Config(String),

    /// Logging subscriber could not be installed
    #[error("Logging error: {0}")]
    Logging(String),

    /// Task management error
    #[error("Task error: {0}")]
    Task(String),

    /// Error annotated with component/operation context
    #[error("{0}")]
    Custom(String),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type for infrastructure operations
pub type Result<T> = std::result::Result<T, Error>;
