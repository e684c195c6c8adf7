//! Feature-hashing codec
//!
//! Deterministic bag-of-words embedding: every token is hashed (FNV-1a) into
//! one of D buckets with a hash-derived sign, then the vector is L2
//! normalized. Needs no model files, so it backs offline installs and tests.

use super::codec::EmbeddingCodec;
use crate::error::{MemoryError, Result};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

pub struct HashingCodec {
    model_name: String,
    dimension: usize,
}

impl HashingCodec {
    pub fn new(dimension: usize) -> Self {
        Self::with_model_name("hashing-v1", dimension)
    }

    pub fn with_model_name(model_name: impl Into<String>, dimension: usize) -> Self {
        Self {
            model_name: model_name.into(),
            dimension: dimension.max(1),
        }
    }

    fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

impl EmbeddingCodec for HashingCodec {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(MemoryError::validation("cannot embed empty text"));
        }

        let mut vector = vec![0.0_f32; self.dimension];
        for token in Self::tokenize(text) {
            let hash = fnv1a(token.as_bytes());
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[test]
    fn test_deterministic() {
        let codec = HashingCodec::new(64);
        let a = codec.encode("The cat sat on the mat").unwrap();
        let b = codec.encode("the CAT sat, on the mat!").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_normalized() {
        let codec = HashingCodec::new(32);
        let v = codec.encode("hello world").unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_related_texts_are_closer() {
        let codec = HashingCodec::new(256);
        let cat = codec.encode("the cat sat on the mat").unwrap();
        let similar = codec.encode("a cat on a mat").unwrap();
        let other = codec.encode("quarterly revenue forecast spreadsheet").unwrap();
        assert!(cosine_similarity(&cat, &similar) > cosine_similarity(&cat, &other));
    }

    #[test]
    fn test_empty_text_rejected() {
        let codec = HashingCodec::new(8);
        assert!(matches!(
            codec.encode("  "),
            Err(MemoryError::Validation(_))
        ));
    }
}
