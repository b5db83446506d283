//! Error types for precomputed storage operations

use thiserror::Error;

/// Main error type for pyramid, codec and shard operations
#[derive(Error, Debug)]
pub enum PrecomputedError {
    /// Invalid level or sharding parameters, raised before any data is touched
    #[error("Configuration error: {0}")]
    Config(String),

    /// The voxel block is incompatible with the requested chunk encoding
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Corrupt or size-mismatched chunk bytes
    #[error("Data error: {0}")]
    Data(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Storage backend error: {0}")]
    Storage(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Misuse of the shard assembler (wrong state, duplicate chunk id)
    #[error("Shard assembly error: {0}")]
    Assembly(String),
}

/// Specialized Result type for precomputed operations
pub type Result<T> = std::result::Result<T, PrecomputedError>;

impl PrecomputedError {
    /// True for errors caused by a missing key in the accessor
    pub fn is_not_found(&self) -> bool {
        match self {
            PrecomputedError::NotFound(_) => true,
            PrecomputedError::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for PrecomputedError {
    fn from(err: serde_json::Error) -> Self {
        PrecomputedError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for PrecomputedError {
    fn from(err: tokio::task::JoinError) -> Self {
        PrecomputedError::Storage(format!("worker task failed: {}", err))
    }
}
