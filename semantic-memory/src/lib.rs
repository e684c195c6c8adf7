//! Semantic Memory
//!
//! Persistent graph of typed content nodes and labeled edges, with
//! embeddings for semantic retrieval.
//!
//! ## Features
//!
//! - **Graph store** - RocksDB-backed nodes and edges with an in-memory cache
//! - **Vector index** - HNSW (instant-distance) with stable handles and a JSON sidecar
//! - **Legacy scan index** - Brute-force cosine fallback kept for migration
//! - **Migration** - Chunked, resumable transfer from the legacy rows into the index
//! - **Task queue** - Bounded queue and one background worker keeping embeddings current
//!
//! ## Example
//!
//! ```ignore
//! use semantic_memory::{Database, GraphStore, Node};
//!
//! let db = Database::open(config.graph_path())?;
//! let graph = GraphStore::open(db)?;
//!
//! let node = Node::builder()
//!     .id("n1")
//!     .node_type("post")
//!     .content("the cat sat on the mat")
//!     .tag("pets")
//!     .build()?;
//!
//! graph.create_node(node)?;
//! ```

pub mod config;
pub mod embedding;
pub mod error;
pub mod graph;
pub mod index;
pub mod legacy;
pub mod migration;
pub mod node;
pub mod queue;
pub mod search;
pub mod storage;

// Re-exports for convenience
pub use config::{CodecKind, MemoryConfig};
pub use embedding::{EmbeddingCodec, HashingCodec, VectorEngine};
pub use error::{MemoryError, Result};
pub use graph::GraphStore;
pub use index::{
    BatchInsert, EntryMetadata, LoadOutcome, VectorHit, VectorIndex, VectorIndexConfig,
};
pub use legacy::{EmbeddingState, LegacyHit, LegacyRecord, LegacyScanIndex};
pub use migration::{MigrationCoordinator, MigrationReport, MigrationState, MigrationStatus};
pub use node::{Edge, EdgeId, Metadata, Node, NodeBuilder, NodeId, NodeQuery, NodeUpdate};
pub use queue::{EmbeddingTask, EmbeddingTaskQueue, QueueConfig, QueueStats};
pub use search::{MatchSource, SearchRequest, SearchResult, SemanticSearch};
pub use storage::Database;
