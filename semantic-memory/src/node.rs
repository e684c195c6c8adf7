//! Graph node and edge types
//!
//! Core types for representing content nodes and their relationships.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::error::{MemoryError, Result};

/// Opaque per-node / per-edge metadata
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Unique identifier for graph nodes
///
/// Collaborators usually supply their own ids; a UUID is generated otherwise.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Create a new random NodeId
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Unique identifier for edges
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(pub String);

impl EdgeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EdgeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EdgeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A typed unit of content in the memory graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Immutable identifier
    pub id: NodeId,
    /// Free-form type string supplied by the producer
    #[serde(rename = "type")]
    pub node_type: String,
    /// Required text content
    pub content: String,
    /// Ordered, de-duplicated tags
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// True once the current content has an embedding in exactly one backend
    #[serde(default)]
    pub has_embedding: bool,
}

impl Node {
    /// Create a new builder for Node
    pub fn builder() -> NodeBuilder {
        NodeBuilder::default()
    }

    /// Text handed to the embedding codec
    pub fn searchable_text(&self) -> String {
        if self.tags.is_empty() {
            return self.content.clone();
        }
        let tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
        format!("{} {}", self.content, tags.join(" "))
    }

    /// Reject nodes the store will not persist
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(MemoryError::validation("node id must not be empty"));
        }
        if self.node_type.trim().is_empty() {
            return Err(MemoryError::validation("node type must not be empty"));
        }
        if self.content.trim().is_empty() {
            return Err(MemoryError::validation(format!(
                "node {} has empty content",
                self.id
            )));
        }
        Ok(())
    }
}

/// Builder for Node with fluent API
#[derive(Debug, Default)]
pub struct NodeBuilder {
    id: Option<NodeId>,
    node_type: Option<String>,
    content: Option<String>,
    tags: BTreeSet<String>,
    metadata: Metadata,
    created_at: Option<DateTime<Utc>>,
}

impl NodeBuilder {
    /// Set the node ID (auto-generated if not set)
    pub fn id(mut self, id: impl Into<NodeId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn node_type(mut self, node_type: impl Into<String>) -> Self {
        self.node_type = Some(node_type.into());
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Add a tag
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Set multiple tags
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Set one metadata entry
    pub fn meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Backdate the node (imports, tests)
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Build the Node
    pub fn build(self) -> Result<Node> {
        let node_type = self.node_type.unwrap_or_else(|| "note".to_string());
        let content = self
            .content
            .ok_or_else(|| MemoryError::validation("Missing required field: content"))?;
        let created_at = self.created_at.unwrap_or_else(Utc::now);

        let node = Node {
            id: self.id.unwrap_or_default(),
            node_type,
            content,
            tags: self.tags,
            metadata: self.metadata,
            created_at,
            updated_at: created_at,
            has_embedding: false,
        };
        node.validate()?;
        Ok(node)
    }
}

/// Partial update merged into an existing node
#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
    pub content: Option<String>,
    /// Replaces the tag set
    pub tags: Option<BTreeSet<String>>,
    /// Merged key-wise into existing metadata
    pub metadata: Option<Metadata>,
    pub has_embedding: Option<bool>,
}

impl NodeUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(Metadata::new)
            .insert(key.into(), value);
        self
    }

    pub fn has_embedding(mut self, value: bool) -> Self {
        self.has_embedding = Some(value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.tags.is_none()
            && self.metadata.is_none()
            && self.has_embedding.is_none()
    }

    /// Merge into `node`. Returns true when embedded text or metadata changed.
    pub(crate) fn apply(self, node: &mut Node) -> Result<bool> {
        let mut changed = false;

        if let Some(content) = self.content {
            if content.trim().is_empty() {
                return Err(MemoryError::validation(format!(
                    "node {} update has empty content",
                    node.id
                )));
            }
            if content != node.content {
                node.content = content;
                changed = true;
            }
        }
        if let Some(tags) = self.tags {
            if tags != node.tags {
                node.tags = tags;
                changed = true;
            }
        }
        if let Some(metadata) = self.metadata {
            for (key, value) in metadata {
                if node.metadata.get(&key) != Some(&value) {
                    node.metadata.insert(key, value);
                    changed = true;
                }
            }
        }

        if changed {
            node.has_embedding = false;
        } else if let Some(flag) = self.has_embedding {
            node.has_embedding = flag;
        }
        node.updated_at = Utc::now();
        Ok(changed)
    }
}

/// A labeled, weighted, directed relationship between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub label: String,
    pub weight: f32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Edge {
    /// New edge with weight 1.0
    pub fn new(
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            id: EdgeId::new(),
            source_node_id: source.into(),
            target_node_id: target.into(),
            label: label.into(),
            weight: 1.0,
            created_at: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<EdgeId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.label.trim().is_empty() {
            return Err(MemoryError::validation("edge label must not be empty"));
        }
        if !self.weight.is_finite() {
            return Err(MemoryError::validation(format!(
                "edge weight must be finite, got {}",
                self.weight
            )));
        }
        Ok(())
    }
}

/// Filter for `GraphStore::query_nodes`
///
/// Results come back ordered by `created_at`, newest first.
#[derive(Debug, Clone)]
pub struct NodeQuery {
    pub node_type: Option<String>,
    /// Every tag must be present
    pub tags: Vec<String>,
    /// Inclusive lower bound on created_at
    pub created_after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on created_at
    pub created_before: Option<DateTime<Utc>>,
    /// Case-insensitive substring of content
    pub contains: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for NodeQuery {
    fn default() -> Self {
        Self {
            node_type: None,
            tags: Vec::new(),
            created_after: None,
            created_before: None,
            contains: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl NodeQuery {
    /// Every node, no paging
    pub fn all() -> Self {
        Self {
            limit: usize::MAX,
            ..Default::default()
        }
    }

    pub fn matches(&self, node: &Node) -> bool {
        if let Some(node_type) = &self.node_type {
            if &node.node_type != node_type {
                return false;
            }
        }
        if !self.tags.iter().all(|t| node.tags.contains(t)) {
            return false;
        }
        if let Some(after) = self.created_after {
            if node.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if node.created_at >= before {
                return false;
            }
        }
        if let Some(needle) = &self.contains {
            if !node
                .content
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        true
    }
}
