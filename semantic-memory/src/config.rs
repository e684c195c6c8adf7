//! Runtime configuration
//!
//! All knobs have defaults; a JSON file may override any subset of them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MemoryError, Result};

/// Which embedding codec backs the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// Deterministic feature hashing, no model files required
    #[default]
    Hashing,
    /// fastembed BGE-Small-EN-v1.5 (requires the `fastembed` feature)
    Fastembed,
}

/// Memory layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Root directory for the graph database and index artifacts
    pub data_dir: PathBuf,
    /// Codec used to produce embeddings
    pub codec: CodecKind,
    /// Model identifier recorded with every embedding
    pub model_name: String,
    /// Embedding dimension D
    pub dimension: usize,
    /// Bounded capacity of the embedding task queue
    pub queue_capacity: usize,
    /// Most tasks the worker commits with one index save
    pub embedding_batch_size: usize,
    /// Entries kept in the text to vector LRU cache
    pub embedding_cache_size: usize,
    /// Attempts per embedding task before it is dropped
    pub max_attempts: u32,
    /// How long the worker waits on an empty queue before flushing
    pub dequeue_timeout_ms: u64,
    /// Pause between retries of a failed task
    pub retry_backoff_ms: u64,
    /// Legacy rows migrated per save() checkpoint
    pub migration_chunk_size: usize,
    /// HNSW construction beam width
    pub hnsw_ef_construction: usize,
    /// HNSW search beam width
    pub hnsw_ef_search: usize,
    /// HNSW level-assignment seed (fixed for reproducible graphs)
    pub hnsw_seed: u64,
    /// Start with an empty index instead of refusing an incompatible one
    pub reset_incompatible_index: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".semantic-memory"),
            codec: CodecKind::Hashing,
            model_name: "hashing-v1".to_string(),
            dimension: 384,
            queue_capacity: 1024,
            embedding_batch_size: 32,
            embedding_cache_size: 10_000,
            max_attempts: 3,
            dequeue_timeout_ms: 500,
            retry_backoff_ms: 50,
            migration_chunk_size: 256,
            hnsw_ef_construction: 100,
            hnsw_ef_search: 100,
            hnsw_seed: 0x5eed_cafe,
            reset_incompatible_index: false,
        }
    }
}

impl MemoryConfig {
    /// Config rooted at `data_dir` with defaults elsewhere
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load a JSON config file; missing keys fall back to defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Reject settings the components cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(MemoryError::validation("dimension must be positive"));
        }
        if self.queue_capacity == 0 {
            return Err(MemoryError::validation("queue_capacity must be positive"));
        }
        if self.embedding_batch_size == 0 {
            return Err(MemoryError::validation(
                "embedding_batch_size must be positive",
            ));
        }
        if self.max_attempts == 0 {
            return Err(MemoryError::validation("max_attempts must be positive"));
        }
        if self.migration_chunk_size == 0 {
            return Err(MemoryError::validation(
                "migration_chunk_size must be positive",
            ));
        }
        if self.model_name.trim().is_empty() {
            return Err(MemoryError::validation("model_name must not be empty"));
        }
        Ok(())
    }

    /// RocksDB directory
    pub fn graph_path(&self) -> PathBuf {
        self.data_dir.join("graph")
    }

    /// Serialized index structure
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join("index").join("vectors.bin")
    }

    /// JSON metadata sidecar for the index
    pub fn sidecar_path(&self) -> PathBuf {
        self.data_dir.join("index").join("vectors.meta.json")
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
