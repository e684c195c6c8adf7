//! HNSW vector index
//!
//! Approximate nearest neighbour index over node embeddings using
//! instant-distance. Every vector gets a sequential handle; the handle maps
//! to a metadata entry that names the owning node.
//!
//! Persisted as two independent artifacts: a bincode blob with the vectors
//! and a JSON sidecar with `handle -> {node_id, metadata, added_at}` plus the
//! model name and dimension used for compatibility checks.

use chrono::{DateTime, Utc};
use instant_distance::{Builder, HnswMap, Point, Search};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::config::MemoryConfig;
use crate::embedding::{check_dimension, l2_distance};
use crate::error::{MemoryError, Result};
use crate::node::{Metadata, Node, NodeId};

const BLOB_FORMAT_VERSION: u32 = 1;

/// HNSW point wrapper
#[derive(Clone)]
struct IndexPoint(Vec<f32>);

impl Point for IndexPoint {
    fn distance(&self, other: &Self) -> f32 {
        l2_distance(&self.0, &other.0)
    }
}

/// Metadata passed to `add`; must name the owning node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub node_id: NodeId,
    #[serde(default)]
    pub fields: Metadata,
}

impl EntryMetadata {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            fields: Metadata::new(),
        }
    }

    /// Snapshot of the node attributes worth keeping next to its vector
    pub fn for_node(node: &Node) -> Self {
        let mut fields = node.metadata.clone();
        fields.insert("type".into(), serde_json::json!(node.node_type));
        fields.insert("tags".into(), serde_json::json!(node.tags));
        fields.insert(
            "created_at".into(),
            serde_json::json!(node.created_at.to_rfc3339()),
        );
        Self {
            node_id: node.id.clone(),
            fields,
        }
    }
}

/// Sidecar entry for one handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub node_id: NodeId,
    #[serde(default)]
    pub metadata: Metadata,
    pub added_at: DateTime<Utc>,
}

/// One search hit
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub handle: u64,
    pub node_id: NodeId,
    /// 1 / (1 + L2 distance)
    pub similarity: f32,
    pub metadata: Metadata,
}

/// Result of `add_missing`
#[derive(Debug, Clone, Default)]
pub struct BatchInsert {
    /// Handles of the inserted vectors, in input order
    pub handles: Vec<u64>,
    /// Nodes that already had a vector and were left alone
    pub skipped: Vec<NodeId>,
}

/// What `load` found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No artifacts, started empty
    Fresh,
    /// Artifacts restored with this many entries
    Loaded(usize),
    /// Artifacts missing or corrupt, started empty
    Degraded(String),
    /// Incompatible artifacts discarded; needs re-migration
    Reset(String),
}

#[derive(Serialize, Deserialize)]
struct IndexBlob {
    format_version: u32,
    dimension: usize,
    next_handle: u64,
    vectors: Vec<(u64, Vec<f32>)>,
}

#[derive(Serialize, Deserialize)]
struct IndexSidecar {
    model: String,
    dimension: usize,
    next_handle: u64,
    saved_at: DateTime<Utc>,
    entries: BTreeMap<u64, IndexEntry>,
}

/// Index tuning and artifact locations
#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    pub dimension: usize,
    pub model_name: String,
    pub index_path: PathBuf,
    pub sidecar_path: PathBuf,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub seed: u64,
    pub reset_incompatible: bool,
}

impl From<&MemoryConfig> for VectorIndexConfig {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            dimension: config.dimension,
            model_name: config.model_name.clone(),
            index_path: config.index_path(),
            sidecar_path: config.sidecar_path(),
            ef_construction: config.hnsw_ef_construction,
            ef_search: config.hnsw_ef_search,
            seed: config.hnsw_seed,
            reset_incompatible: config.reset_incompatible_index,
        }
    }
}

#[derive(Default)]
struct IndexState {
    vectors: BTreeMap<u64, Vec<f32>>,
    entries: BTreeMap<u64, IndexEntry>,
    next_handle: u64,
    hnsw: Option<HnswMap<IndexPoint, u64>>,
    dirty: bool,
    /// Bumped on every mutation so a save can tell if it went stale
    generation: u64,
}

/// Durable ANN index with stable integer handles
///
/// Mutations and load take the exclusive lock; searches and save share it.
pub struct VectorIndex {
    config: VectorIndexConfig,
    state: RwLock<IndexState>,
    /// Serializes writers of the artifact files
    save_lock: Mutex<()>,
}

impl VectorIndex {
    /// Empty in-memory index
    pub fn new(config: VectorIndexConfig) -> Self {
        Self {
            config,
            state: RwLock::new(IndexState::default()),
            save_lock: Mutex::new(()),
        }
    }

    /// Create the index and restore persisted artifacts
    pub fn open(config: VectorIndexConfig) -> Result<(Self, LoadOutcome)> {
        let index = Self::new(config);
        let outcome = index.load()?;
        Ok((index, outcome))
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    pub fn model_name(&self) -> &str {
        &self.config.model_name
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unsaved mutations pending
    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.state
            .read()
            .entries
            .values()
            .any(|e| &e.node_id == node_id)
    }

    /// Every node that owns at least one vector
    pub fn indexed_nodes(&self) -> HashSet<NodeId> {
        self.state
            .read()
            .entries
            .values()
            .map(|e| e.node_id.clone())
            .collect()
    }

    pub fn handles_for(&self, node_id: &NodeId) -> Vec<u64> {
        self.state
            .read()
            .entries
            .iter()
            .filter(|(_, e)| &e.node_id == node_id)
            .map(|(handle, _)| *handle)
            .collect()
    }

    pub fn entry(&self, handle: u64) -> Option<IndexEntry> {
        self.state.read().entries.get(&handle).cloned()
    }

    /// Add one vector, returning its new handle
    pub fn add(&self, vector: Vec<f32>, metadata: EntryMetadata) -> Result<u64> {
        self.validate_vector(&vector)?;

        let mut state = self.state.write();
        let handle = Self::insert(&mut state, vector, metadata);
        self.rebuild(&mut state);
        Ok(handle)
    }

    /// Add vectors only for nodes the index does not hold yet
    ///
    /// One rebuild for the whole batch; all or nothing on validation.
    /// The presence check and the insert happen under one write lock, so a
    /// concurrent `replace` cannot leave a node with two vectors.
    pub fn add_missing(&self, items: Vec<(Vec<f32>, EntryMetadata)>) -> Result<BatchInsert> {
        for (vector, _) in &items {
            self.validate_vector(vector)?;
        }

        let mut state = self.state.write();
        let mut present: HashSet<NodeId> =
            state.entries.values().map(|e| e.node_id.clone()).collect();
        let mut outcome = BatchInsert::default();
        for (vector, metadata) in items {
            if present.contains(&metadata.node_id) {
                outcome.skipped.push(metadata.node_id);
                continue;
            }
            present.insert(metadata.node_id.clone());
            outcome
                .handles
                .push(Self::insert(&mut state, vector, metadata));
        }
        if !outcome.handles.is_empty() {
            self.rebuild(&mut state);
        }
        Ok(outcome)
    }

    /// Swap whatever the node had for a single new vector
    pub fn replace(&self, vector: Vec<f32>, metadata: EntryMetadata) -> Result<u64> {
        self.validate_vector(&vector)?;

        let mut state = self.state.write();
        Self::remove_node(&mut state, &metadata.node_id);
        let handle = Self::insert(&mut state, vector, metadata);
        self.rebuild(&mut state);
        Ok(handle)
    }

    /// `replace` for many nodes with a single rebuild. All or nothing on validation.
    pub fn replace_batch(&self, items: Vec<(Vec<f32>, EntryMetadata)>) -> Result<Vec<u64>> {
        for (vector, _) in &items {
            self.validate_vector(vector)?;
        }
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let mut state = self.state.write();
        let handles = items
            .into_iter()
            .map(|(vector, metadata)| {
                Self::remove_node(&mut state, &metadata.node_id);
                Self::insert(&mut state, vector, metadata)
            })
            .collect();
        self.rebuild(&mut state);
        Ok(handles)
    }

    /// Remove every handle owned by `node_id`; returns how many went
    pub fn delete(&self, node_id: &NodeId) -> usize {
        let mut state = self.state.write();
        let removed = Self::remove_node(&mut state, node_id);
        if removed > 0 {
            self.rebuild(&mut state);
        }
        removed
    }

    /// Top-k nodes by similarity = 1 / (1 + L2), dropping hits below the threshold
    ///
    /// Ties keep ascending handle order.
    pub fn search(&self, query: &[f32], k: usize, min_similarity: f32) -> Result<Vec<VectorHit>> {
        check_dimension(query, self.config.dimension)?;

        let state = self.state.read();
        if k == 0 || state.entries.is_empty() {
            return Ok(Vec::new());
        }

        let candidates: Vec<(u64, f32)> = match state.hnsw.as_ref() {
            Some(hnsw) if k < state.vectors.len() && k < self.config.ef_search => {
                let point = IndexPoint(query.to_vec());
                let mut search = Search::default();
                hnsw.search(&point, &mut search)
                    .map(|item| (*item.value, item.distance))
                    .collect()
            }
            _ => state
                .vectors
                .iter()
                .map(|(handle, vector)| (*handle, l2_distance(query, vector)))
                .collect(),
        };

        let mut hits: Vec<VectorHit> = candidates
            .into_iter()
            .filter_map(|(handle, distance)| {
                let similarity = 1.0 / (1.0 + distance);
                if similarity < min_similarity {
                    return None;
                }
                let entry = state.entries.get(&handle)?;
                Some(VectorHit {
                    handle,
                    node_id: entry.node_id.clone(),
                    similarity,
                    metadata: entry.metadata.clone(),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.handle.cmp(&b.handle))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Persist the blob and the sidecar
    ///
    /// Files are written under the shared lock so searches keep running.
    pub fn save(&self) -> Result<()> {
        let _saving = self.save_lock.lock();
        let state = self.state.read();
        let generation = state.generation;

        let blob = IndexBlob {
            format_version: BLOB_FORMAT_VERSION,
            dimension: self.config.dimension,
            next_handle: state.next_handle,
            vectors: state
                .vectors
                .iter()
                .map(|(handle, vector)| (*handle, vector.clone()))
                .collect(),
        };
        write_atomic(&self.config.index_path, &bincode::serialize(&blob)?)?;

        let sidecar = IndexSidecar {
            model: self.config.model_name.clone(),
            dimension: self.config.dimension,
            next_handle: state.next_handle,
            saved_at: Utc::now(),
            entries: state.entries.clone(),
        };
        let count = state.entries.len();
        write_atomic(
            &self.config.sidecar_path,
            &serde_json::to_vec_pretty(&sidecar)?,
        )?;
        drop(state);

        let mut state = self.state.write();
        if state.generation == generation {
            state.dirty = false;
        }
        log::debug!(
            "Saved vector index ({} entries) to {}",
            count,
            self.config.index_path.display()
        );
        Ok(())
    }

    /// Replace in-memory state with the persisted artifacts
    ///
    /// Missing or corrupt artifacts start the index empty with a warning.
    /// A dimension or model mismatch is refused unless the config allows a
    /// reset, in which case the index starts empty and reports `Reset`.
    pub fn load(&self) -> Result<LoadOutcome> {
        let mut state = self.state.write();
        *state = IndexState {
            generation: state.generation + 1,
            ..IndexState::default()
        };

        let index_exists = self.config.index_path.exists();
        let sidecar_exists = self.config.sidecar_path.exists();
        if !index_exists && !sidecar_exists {
            log::info!("No vector index on disk, starting empty");
            return Ok(LoadOutcome::Fresh);
        }

        let sidecar = match read_sidecar(&self.config.sidecar_path) {
            Ok(sidecar) => sidecar,
            Err(e) => {
                let reason = format!("index sidecar unreadable ({}), reinitializing empty", e);
                log::warn!("{}", reason);
                return Ok(LoadOutcome::Degraded(reason));
            }
        };

        if sidecar.dimension != self.config.dimension || sidecar.model != self.config.model_name {
            let reason = format!(
                "stored index is {}d/{} but codec is {}d/{}",
                sidecar.dimension,
                sidecar.model,
                self.config.dimension,
                self.config.model_name
            );
            return self.incompatible(reason);
        }

        let blob = match read_blob(&self.config.index_path) {
            Ok(blob) => blob,
            Err(e) => {
                let reason = format!("index blob unreadable ({}), reinitializing empty", e);
                log::warn!("{}", reason);
                return Ok(LoadOutcome::Degraded(reason));
            }
        };
        if blob.dimension != self.config.dimension {
            let reason = format!(
                "stored index blob is {}d but codec is {}d",
                blob.dimension, self.config.dimension
            );
            return self.incompatible(reason);
        }

        let mut entries = sidecar.entries;
        let mut max_handle = None;
        for (handle, vector) in blob.vectors {
            if vector.len() != self.config.dimension {
                log::warn!("Dropping handle {} with malformed vector", handle);
                continue;
            }
            let Some(entry) = entries.remove(&handle) else {
                log::warn!("Dropping handle {} missing from sidecar", handle);
                continue;
            };
            state.vectors.insert(handle, vector);
            state.entries.insert(handle, entry);
            max_handle = max_handle.max(Some(handle));
        }
        if !entries.is_empty() {
            log::warn!(
                "Dropping {} sidecar entries without vectors",
                entries.len()
            );
        }

        state.next_handle = blob
            .next_handle
            .max(sidecar.next_handle)
            .max(max_handle.map_or(0, |h| h + 1));
        self.rebuild(&mut state);
        state.dirty = false;

        let count = state.entries.len();
        log::info!("Loaded vector index with {} entries", count);
        Ok(LoadOutcome::Loaded(count))
    }

    fn incompatible(&self, reason: String) -> Result<LoadOutcome> {
        if self.config.reset_incompatible {
            log::warn!("{}; discarding index, re-migration required", reason);
            Ok(LoadOutcome::Reset(reason))
        } else {
            Err(MemoryError::incompatible(reason))
        }
    }

    /// Dimension and finiteness checks applied to every stored vector
    pub fn validate_vector(&self, vector: &[f32]) -> Result<()> {
        check_dimension(vector, self.config.dimension)?;
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(MemoryError::validation("vector contains non-finite values"));
        }
        Ok(())
    }

    fn insert(state: &mut IndexState, vector: Vec<f32>, metadata: EntryMetadata) -> u64 {
        let handle = state.next_handle;
        state.next_handle += 1;
        state.vectors.insert(handle, vector);
        state.entries.insert(
            handle,
            IndexEntry {
                node_id: metadata.node_id,
                metadata: metadata.fields,
                added_at: Utc::now(),
            },
        );
        state.dirty = true;
        state.generation += 1;
        handle
    }

    fn remove_node(state: &mut IndexState, node_id: &NodeId) -> usize {
        let handles: Vec<u64> = state
            .entries
            .iter()
            .filter(|(_, e)| &e.node_id == node_id)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in &handles {
            state.entries.remove(handle);
            state.vectors.remove(handle);
        }
        if !handles.is_empty() {
            state.dirty = true;
            state.generation += 1;
        }
        handles.len()
    }

    /// Rebuild HNSW index
    fn rebuild(&self, state: &mut IndexState) {
        if state.vectors.is_empty() {
            state.hnsw = None;
            return;
        }

        let (values, points): (Vec<u64>, Vec<IndexPoint>) = state
            .vectors
            .iter()
            .map(|(handle, vector)| (*handle, IndexPoint(vector.clone())))
            .unzip();

        let hnsw = Builder::default()
            .ef_construction(self.config.ef_construction)
            .ef_search(self.config.ef_search)
            .seed(self.config.seed)
            .build(points, values);
        state.hnsw = Some(hnsw);
    }
}

fn read_sidecar(path: &Path) -> Result<IndexSidecar> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn read_blob(path: &Path) -> Result<IndexBlob> {
    let bytes = std::fs::read(path)?;
    let blob: IndexBlob = bincode::deserialize(&bytes)?;
    if blob.format_version != BLOB_FORMAT_VERSION {
        return Err(MemoryError::incompatible(format!(
            "unknown index format version {}",
            blob.format_version
        )));
    }
    Ok(blob)
}

/// Write through a temp file so a crash never leaves a torn artifact
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingCodec, HashingCodec};
    use tempfile::TempDir;

    fn config(dir: &TempDir, dimension: usize) -> VectorIndexConfig {
        VectorIndexConfig {
            dimension,
            model_name: "test-model".into(),
            index_path: dir.path().join("index").join("vectors.bin"),
            sidecar_path: dir.path().join("index").join("vectors.meta.json"),
            ef_construction: 100,
            ef_search: 100,
            seed: 7,
            reset_incompatible: false,
        }
    }

    fn unit(dimension: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dimension];
        v[axis] = 1.0;
        v
    }

    #[test]
    fn test_self_search_has_similarity_one() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::new(config(&dir, 64));
        let codec = HashingCodec::new(64);

        let texts = ["the cat sat on the mat", "stock prices fell", "rust borrow checker"];
        for (i, text) in texts.iter().enumerate() {
            index
                .add(codec.encode(text).unwrap(), EntryMetadata::new(format!("n{}", i)))
                .unwrap();
        }

        let query = codec.encode("the cat sat on the mat").unwrap();
        let hits = index.search(&query, 1, 0.0).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].node_id.as_str(), "n0");
        assert_eq!(hits[0].similarity, 1.0);
    }

    #[test]
    fn test_wrong_dimension_rejected() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::new(config(&dir, 4));
        index.add(unit(4, 0), EntryMetadata::new("a")).unwrap();

        let result = index.add(vec![1.0, 0.0, 0.0], EntryMetadata::new("b"));
        assert!(matches!(
            result,
            Err(MemoryError::DimensionMismatch {
                expected: 4,
                actual: 3
            })
        ));
        assert_eq!(index.len(), 1);

        let batch = index.add_missing(vec![
            (unit(4, 1), EntryMetadata::new("c")),
            (vec![0.0; 5], EntryMetadata::new("d")),
        ]);
        assert!(batch.is_err());
        assert_eq!(index.len(), 1);

        assert!(matches!(
            index.search(&[1.0], 1, 0.0),
            Err(MemoryError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_threshold_and_ordering() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::new(config(&dir, 4));
        index.add(unit(4, 0), EntryMetadata::new("exact")).unwrap();
        index.add(vec![0.9, 0.1, 0.0, 0.0], EntryMetadata::new("near")).unwrap();
        index.add(unit(4, 2), EntryMetadata::new("far")).unwrap();

        let query = unit(4, 0);
        let loose = index.search(&query, 10, 0.5).unwrap();
        let strict = index.search(&query, 10, 0.99).unwrap();

        let ids: Vec<&str> = loose.iter().map(|h| h.node_id.as_str()).collect();
        assert_eq!(ids, vec!["exact", "near"]);
        assert_eq!(strict.len(), 1);
        for hit in &strict {
            assert!(loose.iter().any(|h| h.handle == hit.handle));
        }
    }

    #[test]
    fn test_ties_broken_by_handle() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::new(config(&dir, 2));
        for id in ["first", "second", "third"] {
            index.add(vec![1.0, 0.0], EntryMetadata::new(id)).unwrap();
        }
        let hits = index.search(&[1.0, 0.0], 2, 0.0).unwrap();
        assert_eq!(hits[0].node_id.as_str(), "first");
        assert_eq!(hits[1].node_id.as_str(), "second");
    }

    #[test]
    fn test_delete_and_handles_not_reused() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::new(config(&dir, 2));
        let a = index.add(vec![1.0, 0.0], EntryMetadata::new("a")).unwrap();
        index.add(vec![0.0, 1.0], EntryMetadata::new("a")).unwrap();
        index.add(vec![0.5, 0.5], EntryMetadata::new("b")).unwrap();

        assert_eq!(index.delete(&NodeId::from("a")), 2);
        assert!(!index.contains(&NodeId::from("a")));
        assert!(index.entry(a).is_none());

        let next = index.add(vec![1.0, 0.0], EntryMetadata::new("c")).unwrap();
        assert_eq!(next, 3);
        assert_eq!(index.delete(&NodeId::from("missing")), 0);
    }

    #[test]
    fn test_replace_keeps_single_copy() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::new(config(&dir, 2));
        index.add(vec![1.0, 0.0], EntryMetadata::new("a")).unwrap();
        let handle = index.replace(vec![0.0, 1.0], EntryMetadata::new("a")).unwrap();

        assert_eq!(index.handles_for(&NodeId::from("a")), vec![handle]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_replace_batch_one_rebuild_per_node() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::new(config(&dir, 2));
        index.add(vec![1.0, 0.0], EntryMetadata::new("a")).unwrap();

        let handles = index
            .replace_batch(vec![
                (vec![0.0, 1.0], EntryMetadata::new("a")),
                (vec![0.5, 0.5], EntryMetadata::new("b")),
            ])
            .unwrap();
        assert_eq!(handles, vec![1, 2]);
        assert_eq!(index.handles_for(&NodeId::from("a")), vec![1]);
        assert_eq!(index.len(), 2);

        let bad = index.replace_batch(vec![
            (vec![1.0, 1.0], EntryMetadata::new("a")),
            (vec![f32::NAN, 0.0], EntryMetadata::new("c")),
        ]);
        assert!(bad.is_err());
        assert_eq!(index.handles_for(&NodeId::from("a")), vec![1]);
    }

    #[test]
    fn test_add_missing_leaves_present_nodes_alone() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::new(config(&dir, 2));
        let fresh = index.replace(vec![0.0, 1.0], EntryMetadata::new("a")).unwrap();

        let outcome = index
            .add_missing(vec![
                (vec![1.0, 0.0], EntryMetadata::new("a")),
                (vec![0.5, 0.5], EntryMetadata::new("b")),
                (vec![0.4, 0.6], EntryMetadata::new("b")),
            ])
            .unwrap();

        assert_eq!(outcome.handles.len(), 1);
        assert_eq!(
            outcome.skipped,
            vec![NodeId::from("a"), NodeId::from("b")]
        );
        assert_eq!(index.handles_for(&NodeId::from("a")), vec![fresh]);
        assert_eq!(index.handles_for(&NodeId::from("b")).len(), 1);
        assert_eq!(
            index.indexed_nodes(),
            HashSet::from([NodeId::from("a"), NodeId::from("b")])
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        {
            let index = VectorIndex::new(config(&dir, 3));
            let mut meta = EntryMetadata::new("a");
            meta.fields.insert("type".into(), serde_json::json!("post"));
            index.add(vec![1.0, 0.0, 0.0], meta).unwrap();
            index.add(vec![0.0, 1.0, 0.0], EntryMetadata::new("b")).unwrap();
            index.delete(&NodeId::from("b"));
            assert!(index.is_dirty());
            index.save().unwrap();
            assert!(!index.is_dirty());
        }

        let (index, outcome) = VectorIndex::open(config(&dir, 3)).unwrap();
        assert_eq!(outcome, LoadOutcome::Loaded(1));
        let hits = index.search(&[1.0, 0.0, 0.0], 1, 0.0).unwrap();
        assert_eq!(hits[0].node_id.as_str(), "a");
        assert_eq!(hits[0].metadata["type"], serde_json::json!("post"));

        // handle 1 was used before the save, so the next one is 2
        let next = index.add(vec![0.0, 0.0, 1.0], EntryMetadata::new("c")).unwrap();
        assert_eq!(next, 2);
    }

    #[test]
    fn test_missing_sidecar_starts_empty() {
        let dir = TempDir::new().unwrap();
        {
            let index = VectorIndex::new(config(&dir, 2));
            index.add(vec![1.0, 0.0], EntryMetadata::new("a")).unwrap();
            index.save().unwrap();
        }
        std::fs::remove_file(dir.path().join("index").join("vectors.meta.json")).unwrap();

        let (index, outcome) = VectorIndex::open(config(&dir, 2)).unwrap();
        assert!(matches!(outcome, LoadOutcome::Degraded(_)));
        assert!(index.is_empty());
    }

    #[test]
    fn test_corrupt_sidecar_starts_empty() {
        let dir = TempDir::new().unwrap();
        {
            let index = VectorIndex::new(config(&dir, 2));
            index.add(vec![1.0, 0.0], EntryMetadata::new("a")).unwrap();
            index.save().unwrap();
        }
        std::fs::write(dir.path().join("index").join("vectors.meta.json"), b"{garbage").unwrap();

        let (index, outcome) = VectorIndex::open(config(&dir, 2)).unwrap();
        assert!(matches!(outcome, LoadOutcome::Degraded(_)));
        assert!(index.is_empty());
    }

    #[test]
    fn test_dimension_change_refused_or_reset() {
        let dir = TempDir::new().unwrap();
        {
            let index = VectorIndex::new(config(&dir, 2));
            index.add(vec![1.0, 0.0], EntryMetadata::new("a")).unwrap();
            index.save().unwrap();
        }

        let refused = VectorIndex::open(config(&dir, 3));
        assert!(matches!(refused, Err(MemoryError::IncompatibleIndex(_))));

        let mut reset_config = config(&dir, 3);
        reset_config.reset_incompatible = true;
        let (index, outcome) = VectorIndex::open(reset_config).unwrap();
        assert!(matches!(outcome, LoadOutcome::Reset(_)));
        assert!(index.is_empty());
    }

    #[test]
    fn test_fresh_directory() {
        let dir = TempDir::new().unwrap();
        let (index, outcome) = VectorIndex::open(config(&dir, 2)).unwrap();
        assert_eq!(outcome, LoadOutcome::Fresh);
        assert!(index.search(&[1.0, 0.0], 5, 0.0).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_searches() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::new(config(&dir, 4));
        for i in 0..50 {
            let v = vec![i as f32, 1.0, 0.0, 0.0];
            index.add(v, EntryMetadata::new(format!("d{}", i))).unwrap();
        }

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let hits = index.search(&[7.0, 1.0, 0.0, 0.0], 3, 0.0).unwrap();
                    assert_eq!(hits[0].node_id.as_str(), "d7");
                    assert_eq!(hits[0].similarity, 1.0);
                });
            }
        });
    }
}
