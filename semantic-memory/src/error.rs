//! Error types for semantic-memory

use thiserror::Error;

/// Errors that can occur in the memory system
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Rejected input (empty content, missing fields, bad limits)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Edge endpoint does not reference an existing node
    #[error("Reference error: {0}")]
    Reference(String),

    /// Vector length disagrees with the configured dimension
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transient I/O failure (worker retries, search fails the request)
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// RocksDB error
    #[error("Storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    /// Serialization error (bincode)
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored row could not be decoded
    #[error("Corrupt row {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Persisted index disagrees with the configured codec
    #[error("Incompatible index: {0}")]
    IncompatibleIndex(String),

    /// Model loading error
    #[error("Model error: {0}")]
    Model(String),

    /// Embedding generation error
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl MemoryError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a reference error
    pub fn reference(msg: impl Into<String>) -> Self {
        Self::Reference(msg.into())
    }

    /// Create a not found error
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    /// Create a transient I/O error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientIo(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Create an embedding error
    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::Embedding(msg.into())
    }

    /// Create an incompatible index error
    pub fn incompatible(msg: impl Into<String>) -> Self {
        Self::IncompatibleIndex(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether a background worker may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientIo(_) | Self::Storage(_) | Self::Io(_) | Self::Embedding(_)
        )
    }
}

/// Result type for memory operations
pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(MemoryError::transient("disk busy").is_retryable());
        assert!(MemoryError::embedding("model timeout").is_retryable());
        assert!(!MemoryError::validation("empty content").is_retryable());
        assert!(!MemoryError::reference("missing target").is_retryable());
        assert!(!MemoryError::DimensionMismatch {
            expected: 4,
            actual: 3
        }
        .is_retryable());
    }

    #[test]
    fn test_dimension_mismatch_message() {
        let err = MemoryError::DimensionMismatch {
            expected: 384,
            actual: 256,
        };
        assert_eq!(err.to_string(), "Dimension mismatch: expected 384, got 256");
    }
}
