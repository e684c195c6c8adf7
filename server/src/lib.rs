//! Semantic Memory Server Library
//!
//! Process entry point for the semantic memory graph: owns the store, the
//! vector index and the embedding worker, and exposes them to the CLI.

pub mod error;
pub mod memory;

pub use error::{ServerError, ServerResult};
pub use memory::MemoryManager;
