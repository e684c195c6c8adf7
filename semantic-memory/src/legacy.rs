//! Legacy scan index
//!
//! The original embedding backend: one bincode row per node in the
//! `embeddings` column family, searched by a brute-force cosine scan.
//! It is kept for backward compatibility and as the migration source; new
//! embeddings go to the vector index.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::embedding::{check_dimension, cosine_similarity};
use crate::error::Result;
use crate::node::NodeId;
use crate::storage::{Database, CF_EMBEDDINGS};

/// Where an embedding row stands in the migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingState {
    /// Only the legacy backend holds this vector
    Legacy,
    /// Copied into the vector index and saved; safe to purge
    Indexed,
}

/// One legacy embedding row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyRecord {
    pub node_id: NodeId,
    pub vector: Vec<f32>,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub state: EmbeddingState,
}

/// Linear-scan hit
#[derive(Debug, Clone)]
pub struct LegacyHit {
    pub node_id: NodeId,
    /// Cosine similarity
    pub similarity: f32,
}

/// Brute-force cosine index over the legacy embeddings table
pub struct LegacyScanIndex {
    db: Arc<Database>,
    records: DashMap<NodeId, LegacyRecord>,
    dimension: usize,
}

impl LegacyScanIndex {
    pub fn open(db: Arc<Database>, dimension: usize) -> Result<Self> {
        let index = Self {
            db,
            records: DashMap::new(),
            dimension,
        };
        index.load_cache()?;
        Ok(index)
    }

    fn load_cache(&self) -> Result<()> {
        let mut skipped = 0;
        for (key, value) in self.db.scan(CF_EMBEDDINGS)? {
            match bincode::deserialize::<LegacyRecord>(&value) {
                Ok(record) => {
                    self.records.insert(record.node_id.clone(), record);
                }
                Err(e) => {
                    log::warn!(
                        "Failed to deserialize legacy vector {}: {}. Skipping.",
                        String::from_utf8_lossy(&key),
                        e
                    );
                    skipped += 1;
                }
            }
        }

        if !self.records.is_empty() {
            log::info!("Loaded {} legacy vectors", self.records.len());
        }
        if skipped > 0 {
            log::warn!("Skipped {} legacy vectors due to decode errors", skipped);
        }
        Ok(())
    }

    /// Store (or overwrite) the vector for a node
    pub fn store(&self, node_id: &NodeId, vector: Vec<f32>, model: &str) -> Result<()> {
        check_dimension(&vector, self.dimension)?;

        let record = LegacyRecord {
            node_id: node_id.clone(),
            vector,
            model: model.to_string(),
            created_at: Utc::now(),
            state: EmbeddingState::Legacy,
        };
        self.persist(&record)?;
        self.records.insert(node_id.clone(), record);
        Ok(())
    }

    /// O(N) cosine scan, best first, dropping hits below the threshold
    pub fn linear_search(
        &self,
        query: &[f32],
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<LegacyHit>> {
        check_dimension(query, self.dimension)?;

        let mut results: Vec<LegacyHit> = self
            .records
            .iter()
            .map(|entry| LegacyHit {
                node_id: entry.key().clone(),
                similarity: cosine_similarity(query, &entry.value().vector),
            })
            .filter(|hit| hit.similarity >= min_similarity)
            .collect();

        results.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        results.truncate(k);
        Ok(results)
    }

    /// Every row, ordered by node id
    pub fn records(&self) -> Vec<LegacyRecord> {
        let mut records: Vec<LegacyRecord> =
            self.records.iter().map(|e| e.value().clone()).collect();
        records.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        records
    }

    pub fn get(&self, node_id: &NodeId) -> Option<LegacyRecord> {
        self.records.get(node_id).map(|e| e.clone())
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.records.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Flag rows as copied into the vector index
    pub(crate) fn mark_indexed(&self, node_ids: &[NodeId]) -> Result<()> {
        for node_id in node_ids {
            if let Some(mut entry) = self.records.get_mut(node_id) {
                let mut record = entry.value().clone();
                record.state = EmbeddingState::Indexed;
                self.persist(&record)?;
                *entry = record;
            }
        }
        self.db.flush()
    }

    /// Delete rows in one atomic write; returns how many existed
    pub(crate) fn remove(&self, node_ids: &[NodeId]) -> Result<usize> {
        let keys: Vec<Vec<u8>> = node_ids
            .iter()
            .map(|id| id.as_str().as_bytes().to_vec())
            .collect();
        self.db.delete_many(CF_EMBEDDINGS, &keys)?;

        Ok(node_ids
            .iter()
            .filter(|id| self.records.remove(*id).is_some())
            .count())
    }

    fn persist(&self, record: &LegacyRecord) -> Result<()> {
        let bytes = bincode::serialize(record)?;
        self.db
            .put_raw(CF_EMBEDDINGS, record.node_id.as_str().as_bytes(), &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MemoryError;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> LegacyScanIndex {
        let db = Database::open(dir.path()).unwrap();
        LegacyScanIndex::open(db, 3).unwrap()
    }

    #[test]
    fn test_store_and_linear_search() {
        let dir = TempDir::new().unwrap();
        let legacy = open(&dir);
        legacy.store(&"a".into(), vec![1.0, 0.0, 0.0], "m").unwrap();
        legacy.store(&"b".into(), vec![0.7, 0.7, 0.0], "m").unwrap();
        legacy.store(&"c".into(), vec![0.0, 0.0, 1.0], "m").unwrap();

        let hits = legacy.linear_search(&[1.0, 0.0, 0.0], 5, 0.5).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.node_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);

        let top = legacy.linear_search(&[1.0, 0.0, 0.0], 1, 0.0).unwrap();
        assert_eq!(top.len(), 1);
    }

    #[test]
    fn test_dimension_guard() {
        let dir = TempDir::new().unwrap();
        let legacy = open(&dir);
        assert!(matches!(
            legacy.store(&"a".into(), vec![1.0], "m"),
            Err(MemoryError::DimensionMismatch { .. })
        ));
        assert!(legacy.is_empty());
    }

    #[test]
    fn test_state_and_removal_persist() {
        let dir = TempDir::new().unwrap();
        {
            let legacy = open(&dir);
            legacy.store(&"a".into(), vec![1.0, 0.0, 0.0], "m").unwrap();
            legacy.store(&"b".into(), vec![0.0, 1.0, 0.0], "m").unwrap();
            legacy.mark_indexed(&[NodeId::from("a")]).unwrap();
            assert_eq!(legacy.remove(&[NodeId::from("b"), NodeId::from("zzz")]).unwrap(), 1);
        }

        let legacy = open(&dir);
        let records = legacy.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, EmbeddingState::Indexed);
        assert_eq!(records[0].model, "m");
    }
}
