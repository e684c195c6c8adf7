//! fastembed codec (BGE-Small-EN-v1.5, 384 dimensions)

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use parking_lot::Mutex;

use super::codec::EmbeddingCodec;
use crate::error::{MemoryError, Result};

const MODEL_NAME: &str = "bge-small-en-v1.5";
const DIMENSION: usize = 384;

pub struct FastEmbedCodec {
    model: Mutex<TextEmbedding>,
}

impl FastEmbedCodec {
    /// Load the model, downloading it into the fastembed cache on first use
    pub fn new() -> Result<Self> {
        log::info!("Loading fastembed model {}", MODEL_NAME);
        let model = TextEmbedding::try_new(InitOptions::new(EmbeddingModel::BGESmallENV15))
            .map_err(|e| MemoryError::model(format!("Failed to load fastembed: {}", e)))?;
        Ok(Self {
            model: Mutex::new(model),
        })
    }
}

impl EmbeddingCodec for FastEmbedCodec {
    fn model_name(&self) -> &str {
        MODEL_NAME
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }

    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let model = self.model.lock();
        let mut embeddings = model
            .embed(vec![text], None)
            .map_err(|e| MemoryError::embedding(format!("Failed to encode text: {}", e)))?;
        embeddings
            .pop()
            .ok_or_else(|| MemoryError::embedding("fastembed returned no embedding"))
    }
}
