//! Semantic search service
//!
//! Encodes the query text, asks the vector index for candidates and falls
//! back to the legacy scan while a migration is pending. Candidates are
//! hydrated from the graph; ids the graph no longer knows are dropped.

use serde::Serialize;
use std::sync::Arc;

use crate::embedding::{encode_blocking, EmbeddingCodec};
use crate::error::{MemoryError, Result};
use crate::graph::GraphStore;
use crate::index::VectorIndex;
use crate::legacy::LegacyScanIndex;
use crate::node::{Node, NodeId};

/// Candidates requested per result slot, leaving room for the type filter
const OVERFETCH_FACTOR: usize = 3;

/// Which backend produced a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchSource {
    Index,
    Legacy,
}

/// A hydrated search hit
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub node: Node,
    pub similarity: f32,
    pub source: MatchSource,
}

/// Query parameters for `SemanticSearch::search`
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub limit: usize,
    pub node_type: Option<String>,
    pub min_similarity: f32,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: 10,
            node_type: None,
            min_similarity: 0.0,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn node_type(mut self, node_type: impl Into<String>) -> Self {
        self.node_type = Some(node_type.into());
        self
    }

    pub fn min_similarity(mut self, min_similarity: f32) -> Self {
        self.min_similarity = min_similarity;
        self
    }
}

/// Codec + vector index + graph composed into ranked node retrieval
pub struct SemanticSearch {
    codec: Arc<dyn EmbeddingCodec>,
    index: Arc<VectorIndex>,
    legacy: Arc<LegacyScanIndex>,
    graph: Arc<GraphStore>,
}

impl SemanticSearch {
    pub fn new(
        codec: Arc<dyn EmbeddingCodec>,
        index: Arc<VectorIndex>,
        legacy: Arc<LegacyScanIndex>,
        graph: Arc<GraphStore>,
    ) -> Self {
        Self {
            codec,
            index,
            legacy,
            graph,
        }
    }

    /// Nodes most similar to `query`, best first
    ///
    /// Encoding blocks a worker thread; callers wrap this in their own
    /// timeout. Codec failures are returned as-is, never retried here.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        node_type: Option<&str>,
        min_similarity: f32,
    ) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Err(MemoryError::validation("search query must not be empty"));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let vector = encode_blocking(Arc::clone(&self.codec), query.to_string()).await?;
        self.search_vector(&vector, limit, node_type, min_similarity)
    }

    pub async fn search_request(&self, request: &SearchRequest) -> Result<Vec<SearchResult>> {
        self.search(
            &request.query,
            request.limit,
            request.node_type.as_deref(),
            request.min_similarity,
        )
        .await
    }

    /// Same pipeline for an already encoded query
    pub fn search_vector(
        &self,
        vector: &[f32],
        limit: usize,
        node_type: Option<&str>,
        min_similarity: f32,
    ) -> Result<Vec<SearchResult>> {
        let k = limit.saturating_mul(OVERFETCH_FACTOR);

        let mut candidates: Vec<(NodeId, f32, MatchSource)> = self
            .index
            .search(vector, k, min_similarity)?
            .into_iter()
            .map(|hit| (hit.node_id, hit.similarity, MatchSource::Index))
            .collect();

        if candidates.is_empty() && !self.legacy.is_empty() {
            log::debug!("Vector index returned nothing, scanning legacy embeddings");
            candidates = self
                .legacy
                .linear_search(vector, k, min_similarity)?
                .into_iter()
                .map(|hit| (hit.node_id, hit.similarity, MatchSource::Legacy))
                .collect();
        }

        let mut seen = std::collections::HashSet::new();
        let mut results: Vec<SearchResult> = candidates
            .into_iter()
            // A node re-embedded mid-flight can show up twice; keep the best
            .filter(|(node_id, _, _)| seen.insert(node_id.clone()))
            .filter_map(|(node_id, similarity, source)| {
                let Some(node) = self.graph.get_node(&node_id) else {
                    log::debug!("Dropping stale index hit for missing node {}", node_id);
                    return None;
                };
                Some(SearchResult {
                    node,
                    similarity,
                    source,
                })
            })
            .filter(|result| node_type.map_or(true, |t| result.node.node_type == t))
            .collect();

        results.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.node.id.cmp(&b.node.id))
        });
        results.truncate(limit);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingCodec;
    use crate::index::{EntryMetadata, VectorIndexConfig};
    use crate::storage::Database;
    use tempfile::TempDir;

    const DIM: usize = 64;

    struct Fixture {
        _dir: TempDir,
        codec: Arc<HashingCodec>,
        graph: Arc<GraphStore>,
        legacy: Arc<LegacyScanIndex>,
        index: Arc<VectorIndex>,
        search: SemanticSearch,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("graph")).unwrap();
        let graph = Arc::new(GraphStore::open(db.clone()).unwrap());
        let legacy = Arc::new(LegacyScanIndex::open(db, DIM).unwrap());
        let index = Arc::new(VectorIndex::new(VectorIndexConfig {
            dimension: DIM,
            model_name: "hashing-v1".into(),
            index_path: dir.path().join("index").join("vectors.bin"),
            sidecar_path: dir.path().join("index").join("vectors.meta.json"),
            ef_construction: 100,
            ef_search: 100,
            seed: 11,
            reset_incompatible: false,
        }));
        let codec = Arc::new(HashingCodec::new(DIM));
        let search = SemanticSearch::new(
            codec.clone(),
            index.clone(),
            legacy.clone(),
            graph.clone(),
        );
        Fixture {
            _dir: dir,
            codec,
            graph,
            legacy,
            index,
            search,
        }
    }

    impl Fixture {
        fn indexed(&self, id: &str, node_type: &str, content: &str) {
            let node = Node::builder()
                .id(id)
                .node_type(node_type)
                .content(content)
                .build()
                .unwrap();
            self.graph.create_node(node.clone()).unwrap();
            let vector = self.codec.encode(&node.searchable_text()).unwrap();
            self.index
                .replace(vector, EntryMetadata::for_node(&node))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_search_ranks_closest_first() {
        let fx = fixture();
        fx.indexed("cat", "note", "the cat sat on the mat");
        fx.indexed("rust", "note", "rust borrow checker lifetimes");
        fx.indexed("dog", "note", "a dog ran in the park");

        let results = fx.search.search("a cat on a mat", 5, None, 0.3).await.unwrap();
        assert_eq!(results[0].node.id.as_str(), "cat");
        assert_eq!(results[0].source, MatchSource::Index);
        assert!(results
            .windows(2)
            .all(|w| w[0].similarity >= w[1].similarity));
    }

    #[tokio::test]
    async fn test_type_filter_and_limit() {
        let fx = fixture();
        fx.indexed("a", "post", "shared words here");
        fx.indexed("b", "comment", "shared words here too");
        fx.indexed("c", "post", "shared words again");

        let posts = fx
            .search
            .search("shared words", 10, Some("post"), 0.0)
            .await
            .unwrap();
        assert_eq!(posts.len(), 2);
        assert!(posts.iter().all(|r| r.node.node_type == "post"));

        let one = fx.search.search("shared words", 1, None, 0.0).await.unwrap();
        assert_eq!(one.len(), 1);
    }

    #[tokio::test]
    async fn test_falls_back_to_legacy_when_index_empty() {
        let fx = fixture();
        let node = Node::builder().id("old").content("legacy cat").build().unwrap();
        fx.graph.create_node(node.clone()).unwrap();
        fx.legacy
            .store(&node.id, fx.codec.encode("legacy cat").unwrap(), "hashing-v1")
            .unwrap();

        let results = fx.search.search("legacy cat", 5, None, 0.5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, MatchSource::Legacy);
    }

    #[tokio::test]
    async fn test_stale_hits_are_dropped() {
        let fx = fixture();
        let vector = fx.codec.encode("ghost node").unwrap();
        fx.index.add(vector, EntryMetadata::new("ghost")).unwrap();

        let results = fx.search.search("ghost node", 5, None, 0.0).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_empty_query_is_rejected() {
        let fx = fixture();
        let err = fx.search.search("  ", 5, None, 0.0).await.unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));

        let request = SearchRequest::new("anything").limit(0);
        assert!(fx.search.search_request(&request).await.unwrap().is_empty());
    }
}
