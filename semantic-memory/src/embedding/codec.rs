//! Embedding codec interface
//!
//! The codec is an external collaborator: a deterministic text to
//! fixed-length vector function. Calls may block for a long time, so async
//! callers go through `spawn_blocking`.

use std::sync::Arc;

use crate::error::{MemoryError, Result};

/// Text to vector function, deterministic per model version
pub trait EmbeddingCodec: Send + Sync {
    /// Identifier recorded alongside every vector
    fn model_name(&self) -> &str;

    /// Output dimension D
    fn dimension(&self) -> usize;

    /// Encode one text into a vector of length `dimension()`
    fn encode(&self, text: &str) -> Result<Vec<f32>>;
}

/// Run `encode` off the async executor
pub async fn encode_blocking(codec: Arc<dyn EmbeddingCodec>, text: String) -> Result<Vec<f32>> {
    tokio::task::spawn_blocking(move || codec.encode(&text))
        .await
        .map_err(|e| MemoryError::transient(format!("encode task failed: {}", e)))?
}

/// Reject vectors whose length disagrees with `expected`
pub fn check_dimension(vector: &[f32], expected: usize) -> Result<()> {
    if vector.len() != expected {
        return Err(MemoryError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Euclidean distance
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 0.001);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 0.001);
    }

    #[test]
    fn test_l2_distance() {
        assert_eq!(l2_distance(&[0.0, 0.0], &[3.0, 4.0]), 5.0);
        assert_eq!(l2_distance(&[1.0, 2.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_check_dimension() {
        assert!(check_dimension(&[0.0; 4], 4).is_ok());
        assert!(matches!(
            check_dimension(&[0.0; 3], 4),
            Err(MemoryError::DimensionMismatch {
                expected: 4,
                actual: 3
            })
        ));
    }
}
