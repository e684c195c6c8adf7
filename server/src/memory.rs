//! Memory manager for the server process
//!
//! Owns every memory component for the lifetime of the process and wires
//! node writes to the embedding queue.

use std::sync::Arc;

use semantic_memory::embedding::encode_blocking;
use semantic_memory::{
    Database, Edge, EmbeddingCodec, EmbeddingTaskQueue, GraphStore, LegacyScanIndex, LoadOutcome,
    MemoryConfig, MemoryError, MigrationCoordinator, MigrationReport, MigrationStatus, Node,
    NodeId, NodeQuery, NodeUpdate, QueueConfig, QueueStats, SearchResult, SemanticSearch,
    VectorEngine, VectorIndex, VectorIndexConfig,
};

use crate::error::{ServerError, ServerResult};

/// Process-wide handle to the memory graph, index, queue and search
pub struct MemoryManager {
    config: MemoryConfig,
    db: Arc<Database>,
    graph: Arc<GraphStore>,
    index: Arc<VectorIndex>,
    legacy: Arc<LegacyScanIndex>,
    engine: Arc<VectorEngine>,
    queue: EmbeddingTaskQueue,
    search: SemanticSearch,
    migration: Arc<MigrationCoordinator>,
    load_outcome: LoadOutcome,
}

impl MemoryManager {
    /// Open storage, load the index and start the embedding worker
    ///
    /// Must run inside a tokio runtime. The index is loaded here, before
    /// anything else can touch it.
    pub async fn open(config: MemoryConfig) -> ServerResult<Self> {
        config.validate()?;
        tracing::info!("Opening memory store at {:?}", config.data_dir);
        std::fs::create_dir_all(&config.data_dir)?;

        let db = Database::open(config.graph_path())?;
        let graph = Arc::new(GraphStore::open(Arc::clone(&db))?);
        let legacy = Arc::new(LegacyScanIndex::open(Arc::clone(&db), config.dimension)?);

        let engine = Arc::new(VectorEngine::from_config(&config)?);
        let index_config = VectorIndexConfig {
            model_name: engine.model_name().to_string(),
            ..VectorIndexConfig::from(&config)
        };
        let (index, load_outcome) = VectorIndex::open(index_config)?;
        let index = Arc::new(index);

        let migration = Arc::new(MigrationCoordinator::new(
            Arc::clone(&db),
            Arc::clone(&graph),
            Arc::clone(&legacy),
            Arc::clone(&index),
            config.migration_chunk_size,
        ));

        let codec: Arc<dyn EmbeddingCodec> = engine.clone();
        let queue = EmbeddingTaskQueue::start(
            QueueConfig::from(&config),
            Arc::clone(&codec),
            Arc::clone(&index),
            Arc::clone(&legacy),
            Arc::clone(&graph),
        );
        let search = SemanticSearch::new(
            codec,
            Arc::clone(&index),
            Arc::clone(&legacy),
            Arc::clone(&graph),
        );

        let manager = Self {
            config,
            db,
            graph,
            index,
            legacy,
            engine,
            queue,
            search,
            migration,
            load_outcome,
        };

        match &manager.load_outcome {
            LoadOutcome::Fresh => tracing::info!("Vector index starting fresh"),
            LoadOutcome::Loaded(count) => tracing::info!("Vector index loaded ({} entries)", count),
            LoadOutcome::Degraded(reason) => tracing::warn!("Vector index degraded: {}", reason),
            LoadOutcome::Reset(reason) => {
                tracing::warn!("Vector index reset: {}", reason);
                manager.migration.reset()?;
            }
        }
        manager.forget_lost_embeddings()?;

        tracing::info!(
            "Memory store ready: {} nodes, {} edges, {} indexed vectors, {} legacy vectors",
            manager.graph.node_count(),
            manager.graph.edge_count(),
            manager.index.len(),
            manager.legacy.len()
        );
        Ok(manager)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn load_outcome(&self) -> &LoadOutcome {
        &self.load_outcome
    }

    /// Store a node and queue its embedding. Existing ids are left untouched.
    pub async fn create_node(&self, node: Node) -> ServerResult<NodeId> {
        let existed = self.graph.contains_node(&node.id);
        let id = self.graph.create_node(node)?;
        if !existed {
            self.enqueue(&id);
        }
        Ok(id)
    }

    pub async fn get_node(&self, id: &NodeId) -> Option<Node> {
        self.graph.get_node(id)
    }

    /// Merge an update; re-queues the embedding when the text changed
    pub async fn update_node(&self, id: &NodeId, update: NodeUpdate) -> ServerResult<bool> {
        if !self.graph.update_node(id, update)? {
            return Ok(false);
        }
        if self
            .graph
            .get_node(id)
            .is_some_and(|node| !node.has_embedding)
        {
            self.enqueue(id);
        }
        Ok(true)
    }

    pub async fn create_edge(&self, edge: Edge) -> ServerResult<bool> {
        Ok(self.graph.create_edge(edge)?)
    }

    pub async fn query(&self, query: &NodeQuery) -> Vec<Node> {
        self.graph.query_nodes(query)
    }

    pub async fn neighbors(&self, id: &NodeId) -> ServerResult<Vec<Node>> {
        if !self.graph.contains_node(id) {
            return Err(ServerError::NodeNotFound(id.to_string()));
        }
        Ok(self.graph.neighbors(id))
    }

    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        node_type: Option<&str>,
        min_similarity: f32,
    ) -> ServerResult<Vec<SearchResult>> {
        Ok(self
            .search
            .search(query, limit, node_type, min_similarity)
            .await?)
    }

    /// Run the legacy migration on a blocking thread
    pub async fn migrate(&self) -> ServerResult<MigrationReport> {
        let migration = Arc::clone(&self.migration);
        tokio::task::spawn_blocking(move || migration.migrate_all())
            .await
            .map_err(|e| MemoryError::transient(format!("migration task failed: {}", e)).into())
    }

    pub fn migration_status(&self) -> MigrationStatus {
        self.migration.status()
    }

    /// Encode a node's text straight into the legacy backend
    ///
    /// Operator tool for seeding data that predates the vector index.
    pub async fn import_legacy(&self, id: &NodeId) -> ServerResult<()> {
        let node = self
            .graph
            .get_node(id)
            .ok_or_else(|| ServerError::NodeNotFound(id.to_string()))?;
        if self.index.contains(id) {
            return Err(MemoryError::validation(format!(
                "node {} already has an indexed embedding",
                id
            ))
            .into());
        }

        let codec: Arc<dyn EmbeddingCodec> = self.engine.clone();
        let vector = encode_blocking(codec, node.searchable_text()).await?;
        self.legacy.store(id, vector, self.engine.model_name())?;
        self.graph
            .update_node(id, NodeUpdate::new().has_embedding(true))?;
        tracing::info!("Imported legacy embedding for {}", id);
        Ok(())
    }

    /// Queue every node still missing an embedding; returns how many were accepted
    pub async fn reembed_pending(&self) -> usize {
        let pending = self.graph.pending_embedding();
        let accepted = pending.iter().filter(|id| self.enqueue(id)).count();
        if accepted < pending.len() {
            tracing::warn!(
                "Queued {} of {} pending embeddings; the rest wait for the next run",
                accepted,
                pending.len()
            );
        } else if accepted > 0 {
            tracing::info!("Queued {} pending embeddings", accepted);
        }
        accepted
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub async fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "graph": self.graph.stats(),
            "index": {
                "entries": self.index.len(),
                "dimension": self.index.dimension(),
                "model": self.index.model_name(),
                "dirty": self.index.is_dirty(),
            },
            "legacy": {
                "entries": self.legacy.len(),
            },
            "queue": self.queue.stats(),
            "migration": self.migration.status(),
            "embeddingCache": self.engine.cache_size(),
        })
    }

    /// Drain the queue, persist the index and flush storage
    pub async fn shutdown(&self) -> ServerResult<()> {
        tracing::info!("Shutting down memory store");
        self.queue.shutdown().await;
        if self.index.is_dirty() {
            self.index.save()?;
        }
        self.db.flush()?;
        Ok(())
    }

    fn enqueue(&self, id: &NodeId) -> bool {
        let Some(node) = self.graph.get_node(id) else {
            return false;
        };
        let accepted = self.queue.enqueue_node(&node);
        if !accepted {
            tracing::warn!("Embedding queue rejected {}; it stays pending", id);
        }
        accepted
    }

    /// Unflag nodes whose vector is in neither backend
    ///
    /// Happens when the index artifacts were lost, corrupted or discarded.
    /// Cleared nodes are picked up again by `reembed_pending`.
    fn forget_lost_embeddings(&self) -> ServerResult<usize> {
        let indexed = self.index.indexed_nodes();
        let mut cleared = 0;
        for node in self.graph.query_nodes(&NodeQuery::all()) {
            if node.has_embedding
                && !indexed.contains(&node.id)
                && !self.legacy.contains(&node.id)
            {
                self.graph
                    .update_node(&node.id, NodeUpdate::new().has_embedding(false))?;
                cleared += 1;
            }
        }
        if cleared > 0 {
            tracing::warn!(
                "Cleared embedding flag on {} nodes with no stored vector; run reembed",
                cleared
            );
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semantic_memory::{MatchSource, MigrationState};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> MemoryConfig {
        MemoryConfig {
            dimension: 64,
            dequeue_timeout_ms: 20,
            retry_backoff_ms: 1,
            ..MemoryConfig::with_data_dir(dir.path())
        }
    }

    fn node(id: &str, content: &str) -> Node {
        Node::builder().id(id).content(content).build().unwrap()
    }

    #[tokio::test]
    async fn test_create_embed_and_search() {
        let dir = TempDir::new().unwrap();
        let manager = MemoryManager::open(config(&dir)).await.unwrap();
        assert!(matches!(manager.load_outcome(), LoadOutcome::Fresh));

        manager
            .create_node(node("n1", "the cat sat on the mat"))
            .await
            .unwrap();
        manager.shutdown().await.unwrap();

        let n1 = manager.get_node(&"n1".into()).await.unwrap();
        assert!(n1.has_embedding);

        let results = manager.search("a cat on a mat", 5, None, 0.3).await.unwrap();
        assert!(results.iter().any(|r| r.node.id.as_str() == "n1"));
        assert_eq!(results[0].source, MatchSource::Index);
    }

    #[tokio::test]
    async fn test_update_reembeds_and_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let manager = MemoryManager::open(config(&dir)).await.unwrap();
            manager.create_node(node("n1", "first draft")).await.unwrap();
            manager
                .update_node(&"n1".into(), NodeUpdate::new().content("final text"))
                .await
                .unwrap();
            manager.shutdown().await.unwrap();
            assert!(manager.get_node(&"n1".into()).await.unwrap().has_embedding);
        }

        let manager = MemoryManager::open(config(&dir)).await.unwrap();
        assert!(matches!(manager.load_outcome(), LoadOutcome::Loaded(1)));
        let results = manager.search("final text", 5, None, 0.0).await.unwrap();
        assert_eq!(results[0].node.content, "final text");
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_import_legacy_then_migrate() {
        let dir = TempDir::new().unwrap();
        let manager = MemoryManager::open(config(&dir)).await.unwrap();
        // Stop the worker so the node only gets the legacy copy
        manager.queue.shutdown().await;
        manager.graph.create_node(node("old", "archived post")).unwrap();

        manager.import_legacy(&"old".into()).await.unwrap();
        let results = manager.search("archived post", 5, None, 0.5).await.unwrap();
        assert_eq!(results[0].source, MatchSource::Legacy);

        let report = manager.migrate().await.unwrap();
        assert_eq!(report.state, MigrationState::Completed);
        assert_eq!(report.migrated_count, 1);
        assert_eq!(manager.migration_status().state, MigrationState::Completed);

        let results = manager.search("archived post", 5, None, 0.5).await.unwrap();
        assert_eq!(results[0].source, MatchSource::Index);
        assert!(manager.get_node(&"old".into()).await.unwrap().has_embedding);
    }

    #[tokio::test]
    async fn test_edges_and_neighbors() {
        let dir = TempDir::new().unwrap();
        let manager = MemoryManager::open(config(&dir)).await.unwrap();
        manager.create_node(node("a", "alpha")).await.unwrap();
        manager.create_node(node("b", "beta")).await.unwrap();

        assert!(manager
            .create_edge(Edge::new("a", "b", "replies_to"))
            .await
            .unwrap());
        let err = manager
            .create_edge(Edge::new("a", "missing", "replies_to"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Memory(MemoryError::Reference(_))));

        let neighbors = manager.neighbors(&"a".into()).await.unwrap();
        assert_eq!(neighbors.len(), 1);
        assert!(matches!(
            manager.neighbors(&"zzz".into()).await,
            Err(ServerError::NodeNotFound(_))
        ));
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_incompatible_index_refused_or_reset() {
        let dir = TempDir::new().unwrap();
        {
            let manager = MemoryManager::open(config(&dir)).await.unwrap();
            manager.create_node(node("n1", "some text")).await.unwrap();
            manager.shutdown().await.unwrap();
        }

        let wider = MemoryConfig {
            dimension: 128,
            ..config(&dir)
        };
        let err = MemoryManager::open(wider.clone()).await.err().unwrap();
        assert!(matches!(
            err,
            ServerError::Memory(MemoryError::IncompatibleIndex(_))
        ));

        let reset = MemoryConfig {
            reset_incompatible_index: true,
            ..wider
        };
        let manager = MemoryManager::open(reset).await.unwrap();
        assert!(matches!(manager.load_outcome(), LoadOutcome::Reset(_)));
        assert!(!manager.get_node(&"n1".into()).await.unwrap().has_embedding);
        assert_eq!(manager.migration_status().state, MigrationState::NotStarted);

        assert_eq!(manager.reembed_pending().await, 1);
        manager.shutdown().await.unwrap();
        assert!(manager.get_node(&"n1".into()).await.unwrap().has_embedding);
    }

    #[tokio::test]
    async fn test_lost_sidecar_unflags_and_reembeds() {
        let dir = TempDir::new().unwrap();
        {
            let manager = MemoryManager::open(config(&dir)).await.unwrap();
            manager.create_node(node("n1", "kept forever")).await.unwrap();
            manager.shutdown().await.unwrap();
            assert!(manager.get_node(&"n1".into()).await.unwrap().has_embedding);
        }
        std::fs::remove_file(config(&dir).sidecar_path()).unwrap();

        let manager = MemoryManager::open(config(&dir)).await.unwrap();
        assert!(matches!(manager.load_outcome(), LoadOutcome::Degraded(_)));
        assert!(!manager.get_node(&"n1".into()).await.unwrap().has_embedding);
        assert!(manager.search("kept forever", 5, None, 0.0).await.unwrap().is_empty());

        assert_eq!(manager.reembed_pending().await, 1);
        manager.shutdown().await.unwrap();
        assert!(manager.get_node(&"n1".into()).await.unwrap().has_embedding);
        let results = manager.search("kept forever", 5, None, 0.0).await.unwrap();
        assert_eq!(results[0].node.id.as_str(), "n1");
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let dir = TempDir::new().unwrap();
        let manager = MemoryManager::open(config(&dir)).await.unwrap();
        manager.create_node(node("n1", "hello")).await.unwrap();
        manager.shutdown().await.unwrap();

        let stats = manager.stats().await;
        assert_eq!(stats["graph"]["totalNodes"], 1);
        assert_eq!(stats["index"]["entries"], 1);
        assert_eq!(stats["queue"]["processed"], 1);
        assert_eq!(stats["migration"]["state"], "NOT_STARTED");
    }
}
