//! Embedding module for semantic search
//!
//! The codec itself is an external collaborator behind `EmbeddingCodec`;
//! `VectorEngine` adds caching and dimension checks on top.

mod codec;
mod engine;
#[cfg(feature = "fastembed")]
mod fastembed_codec;
mod hashing;

pub use codec::{check_dimension, cosine_similarity, encode_blocking, l2_distance, EmbeddingCodec};
pub use engine::VectorEngine;
#[cfg(feature = "fastembed")]
pub use fastembed_codec::FastEmbedCodec;
pub use hashing::HashingCodec;
