//! Graph store
//!
//! Nodes and edges persisted as JSON rows in their RocksDB column families,
//! fronted by DashMap caches loaded at startup. Each write is atomic for the
//! single row it touches; nothing spans rows.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{MemoryError, Result};
use crate::node::{Edge, EdgeId, Node, NodeId, NodeQuery, NodeUpdate};
use crate::storage::{Database, CF_EDGES, CF_NODES};

/// Persistent store for nodes and edges
pub struct GraphStore {
    db: Arc<Database>,
    nodes: DashMap<NodeId, Node>,
    edges: DashMap<EdgeId, Edge>,
}

impl GraphStore {
    /// Open the store over an already opened database
    pub fn open(db: Arc<Database>) -> Result<Self> {
        let store = Self {
            db,
            nodes: DashMap::new(),
            edges: DashMap::new(),
        };
        store.load_cache()?;
        Ok(store)
    }

    /// Load existing rows into cache on startup
    fn load_cache(&self) -> Result<()> {
        let mut skipped = 0;

        for (key, value) in self.db.scan(CF_NODES)? {
            match decode_row::<Node>("node", &key, &value) {
                Ok(node) => {
                    self.nodes.insert(node.id.clone(), node);
                }
                Err(e) => {
                    log::warn!("{}. Skipping.", e);
                    skipped += 1;
                }
            }
        }

        for (key, value) in self.db.scan(CF_EDGES)? {
            match decode_row::<Edge>("edge", &key, &value) {
                Ok(edge) => {
                    self.edges.insert(edge.id.clone(), edge);
                }
                Err(e) => {
                    log::warn!("{}. Skipping.", e);
                    skipped += 1;
                }
            }
        }

        log::info!(
            "Loaded {} nodes and {} edges from disk",
            self.nodes.len(),
            self.edges.len()
        );
        if skipped > 0 {
            log::warn!("Skipped {} rows due to decode errors", skipped);
        }
        Ok(())
    }

    /// Insert a node. A second create with the same id is a no-op returning that id.
    pub fn create_node(&self, node: Node) -> Result<NodeId> {
        node.validate()?;

        match self.nodes.entry(node.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                log::debug!("Node {} already exists, create is a no-op", existing.key());
                Ok(existing.key().clone())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                self.persist_node(&node)?;
                let id = node.id.clone();
                slot.insert(node);
                Ok(id)
            }
        }
    }

    /// Get a node by ID
    pub fn get_node(&self, id: &NodeId) -> Option<Node> {
        self.nodes.get(id).map(|e| e.clone())
    }

    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Merge a partial update. Returns false when the node does not exist.
    ///
    /// Content, tag or metadata changes clear `has_embedding`.
    pub fn update_node(&self, id: &NodeId, update: NodeUpdate) -> Result<bool> {
        let Some(mut entry) = self.nodes.get_mut(id) else {
            return Ok(false);
        };

        let mut updated = entry.value().clone();
        let changed = update.apply(&mut updated)?;
        self.persist_node(&updated)?;
        *entry = updated;

        if changed {
            log::debug!("Node {} changed, embedding flag cleared", id);
        }
        Ok(true)
    }

    /// Set `has_embedding` only if the node still embeds to `text`
    ///
    /// Returns false when the node is gone or its content moved on.
    pub fn mark_embedded(&self, id: &NodeId, text: &str) -> Result<bool> {
        let Some(mut entry) = self.nodes.get_mut(id) else {
            return Ok(false);
        };
        if entry.searchable_text() != text {
            return Ok(false);
        }
        if entry.has_embedding {
            return Ok(true);
        }

        let mut updated = entry.value().clone();
        NodeUpdate::new().has_embedding(true).apply(&mut updated)?;
        self.persist_node(&updated)?;
        *entry = updated;
        Ok(true)
    }

    /// Filter nodes, newest first, then page with offset/limit
    pub fn query_nodes(&self, query: &NodeQuery) -> Vec<Node> {
        let mut matched: Vec<Node> = self
            .nodes
            .iter()
            .filter(|e| query.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();

        matched.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        matched
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect()
    }

    /// Insert an edge between two existing nodes
    ///
    /// Returns false when an edge with the same id already exists.
    pub fn create_edge(&self, edge: Edge) -> Result<bool> {
        edge.validate()?;

        for endpoint in [&edge.source_node_id, &edge.target_node_id] {
            if !self.nodes.contains_key(endpoint) {
                return Err(MemoryError::reference(format!(
                    "edge {} references missing node {}",
                    edge.id, endpoint
                )));
            }
        }

        match self.edges.entry(edge.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let bytes = serde_json::to_vec(&edge)?;
                self.db
                    .put_raw(CF_EDGES, edge.id.as_str().as_bytes(), &bytes)?;
                slot.insert(edge);
                Ok(true)
            }
        }
    }

    pub fn get_edge(&self, id: &EdgeId) -> Option<Edge> {
        self.edges.get(id).map(|e| e.clone())
    }

    /// Outgoing edges of a node
    pub fn edges_from(&self, id: &NodeId) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self
            .edges
            .iter()
            .filter(|e| &e.value().source_node_id == id)
            .map(|e| e.value().clone())
            .collect();
        edges.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        edges
    }

    /// Incoming edges of a node
    pub fn edges_to(&self, id: &NodeId) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self
            .edges
            .iter()
            .filter(|e| &e.value().target_node_id == id)
            .map(|e| e.value().clone())
            .collect();
        edges.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        edges
    }

    /// Nodes one hop away in either direction
    pub fn neighbors(&self, id: &NodeId) -> Vec<Node> {
        let mut seen = std::collections::BTreeSet::new();
        for edge in self.edges.iter() {
            let edge = edge.value();
            if &edge.source_node_id == id {
                seen.insert(edge.target_node_id.clone());
            } else if &edge.target_node_id == id {
                seen.insert(edge.source_node_id.clone());
            }
        }
        seen.iter().filter_map(|n| self.get_node(n)).collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Nodes still waiting for an embedding
    pub fn pending_embedding(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|e| !e.value().has_embedding)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Get store statistics
    pub fn stats(&self) -> serde_json::Value {
        let mut by_type: HashMap<String, usize> = HashMap::new();
        let mut by_tag: HashMap<String, usize> = HashMap::new();
        let mut embedded = 0;

        for entry in self.nodes.iter() {
            let node = entry.value();
            *by_type.entry(node.node_type.clone()).or_insert(0) += 1;
            for tag in &node.tags {
                *by_tag.entry(tag.clone()).or_insert(0) += 1;
            }
            if node.has_embedding {
                embedded += 1;
            }
        }

        serde_json::json!({
            "totalNodes": self.nodes.len(),
            "totalEdges": self.edges.len(),
            "embeddedNodes": embedded,
            "byType": by_type,
            "byTag": by_tag,
        })
    }

    fn persist_node(&self, node: &Node) -> Result<()> {
        let bytes = serde_json::to_vec(node)?;
        self.db
            .put_raw(CF_NODES, node.id.as_str().as_bytes(), &bytes)
    }
}

fn decode_row<T: serde::de::DeserializeOwned>(kind: &str, key: &[u8], value: &[u8]) -> Result<T> {
    serde_json::from_slice(value).map_err(|source| MemoryError::Decode {
        key: format!("{}:{}", kind, String::from_utf8_lossy(key)),
        source,
    })
}
