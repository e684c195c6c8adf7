//! Vector embedding engine
//!
//! High-level API over a codec: caches embeddings in a bounded LRU and
//! enforces the configured output dimension.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

use super::codec::{check_dimension, EmbeddingCodec};
use super::hashing::HashingCodec;
use crate::config::{CodecKind, MemoryConfig};
use crate::error::{MemoryError, Result};

const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Vector embedding engine with caching
///
/// Wraps any codec with an LRU cache so repeated texts skip the model.
pub struct VectorEngine {
    codec: Arc<dyn EmbeddingCodec>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
    dimension: usize,
}

impl VectorEngine {
    /// Wrap a codec with the default cache capacity
    pub fn new(codec: Arc<dyn EmbeddingCodec>) -> Self {
        Self::with_cache_capacity(codec, DEFAULT_CACHE_CAPACITY)
    }

    /// Wrap a codec, keeping at most `capacity` cached vectors
    pub fn with_cache_capacity(codec: Arc<dyn EmbeddingCodec>, capacity: usize) -> Self {
        let dimension = codec.dimension();
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        log::info!(
            "VectorEngine ready ({}d, model {}, cache {})",
            dimension,
            codec.model_name(),
            capacity
        );
        Self {
            codec,
            cache: Mutex::new(LruCache::new(capacity)),
            dimension,
        }
    }

    /// Build the engine for the configured codec
    pub fn from_config(config: &MemoryConfig) -> Result<Self> {
        let codec: Arc<dyn EmbeddingCodec> = match config.codec {
            CodecKind::Hashing => Arc::new(HashingCodec::with_model_name(
                config.model_name.clone(),
                config.dimension,
            )),
            #[cfg(feature = "fastembed")]
            CodecKind::Fastembed => Arc::new(super::fastembed_codec::FastEmbedCodec::new()?),
            #[cfg(not(feature = "fastembed"))]
            CodecKind::Fastembed => {
                return Err(MemoryError::model(
                    "fastembed codec requested but the `fastembed` feature is disabled",
                ))
            }
        };

        if codec.dimension() != config.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: config.dimension,
                actual: codec.dimension(),
            });
        }
        Ok(Self::with_cache_capacity(codec, config.embedding_cache_size))
    }

    /// Get cache size
    pub fn cache_size(&self) -> usize {
        self.cache.lock().len()
    }

    /// Clear the cache
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}

impl EmbeddingCodec for VectorEngine {
    fn model_name(&self) -> &str {
        self.codec.model_name()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    /// Generate embedding with caching
    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self.cache.lock().get(text) {
            return Ok(cached.clone());
        }

        let embedding = self.codec.encode(text)?;
        check_dimension(&embedding, self.dimension)?;
        self.cache.lock().put(text.to_string(), embedding.clone());
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCodec {
        calls: AtomicUsize,
        output_len: usize,
    }

    impl EmbeddingCodec for CountingCodec {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dimension(&self) -> usize {
            4
        }
        fn encode(&self, _text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![0.5; self.output_len])
        }
    }

    #[test]
    fn test_cache_hits_skip_codec() {
        let codec = Arc::new(CountingCodec {
            calls: AtomicUsize::new(0),
            output_len: 4,
        });
        let engine = VectorEngine::new(codec.clone());

        engine.encode("hello").unwrap();
        engine.encode("hello").unwrap();
        engine.encode("world").unwrap();

        assert_eq!(codec.calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.cache_size(), 2);
        engine.clear_cache();
        assert_eq!(engine.cache_size(), 0);
    }

    #[test]
    fn test_cache_evicts_least_recently_used() {
        let codec = Arc::new(CountingCodec {
            calls: AtomicUsize::new(0),
            output_len: 4,
        });
        let engine = VectorEngine::with_cache_capacity(codec.clone(), 2);

        engine.encode("a").unwrap();
        engine.encode("b").unwrap();
        engine.encode("a").unwrap();
        engine.encode("c").unwrap();
        assert_eq!(engine.cache_size(), 2);
        assert_eq!(codec.calls.load(Ordering::SeqCst), 3);

        // "b" was the least recently used and had to go
        engine.encode("a").unwrap();
        engine.encode("b").unwrap();
        assert_eq!(codec.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_wrong_output_length_is_rejected() {
        let engine = VectorEngine::new(Arc::new(CountingCodec {
            calls: AtomicUsize::new(0),
            output_len: 3,
        }));
        assert!(matches!(
            engine.encode("x"),
            Err(MemoryError::DimensionMismatch { .. })
        ));
        assert_eq!(engine.cache_size(), 0);
    }

    #[test]
    fn test_from_config_hashing() {
        let config = MemoryConfig {
            dimension: 16,
            ..Default::default()
        };
        let engine = VectorEngine::from_config(&config).unwrap();
        assert_eq!(engine.dimension(), 16);
        assert_eq!(engine.model_name(), "hashing-v1");
        assert_eq!(engine.encode("some text").unwrap().len(), 16);
    }
}
