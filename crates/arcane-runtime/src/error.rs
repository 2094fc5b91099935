//! Runtime error types.

use thiserror::Error;

/// Errors that can occur during configuration loading and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Extraction from the environment failed.
    #[error("configuration error: {0}")]
    Extraction(#[from] figment::Error),

    /// A value was present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors that can occur during runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A listener could not be bound or served.
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),

    /// Configuration problems surfaced at startup.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
