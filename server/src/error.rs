//! Error types for the semantic memory server.

use semantic_memory::MemoryError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the server and its CLI.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Config error in {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: MemoryError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ServerError {
    /// Process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) | Self::Config { .. } => 2,
            Self::NodeNotFound(_) => 3,
            Self::Memory(
                MemoryError::Validation(_)
                | MemoryError::Reference(_)
                | MemoryError::DimensionMismatch { .. },
            ) => 2,
            _ => 1,
        }
    }
}

/// Result type alias for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
