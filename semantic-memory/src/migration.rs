//! Legacy to vector index migration
//!
//! Moves every legacy embedding row into the vector index in bounded chunks.
//! A chunk's legacy rows are flagged `Indexed` and purged only after the
//! chunk is in the index and `VectorIndex::save()` succeeded, so a crash at
//! any point leaves at least one copy of every vector. Re-running from
//! scratch is always safe.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::graph::GraphStore;
use crate::index::{EntryMetadata, VectorIndex};
use crate::legacy::{EmbeddingState, LegacyRecord, LegacyScanIndex};
use crate::node::{NodeId, NodeUpdate};
use crate::storage::Database;

const MIGRATION_STATE_KEY: &str = "migration_state";

/// Migration lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationState {
    NotStarted,
    InProgress,
    Completed,
    /// Retryable by running `migrate_all` again
    Failed,
}

/// Persisted migration status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub state: MigrationState,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Default for MigrationStatus {
    fn default() -> Self {
        Self {
            state: MigrationState::NotStarted,
            updated_at: Utc::now(),
            last_error: None,
        }
    }
}

/// Outcome of one `migrate_all` run
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub migrated_count: usize,
    pub failed_count: usize,
    /// Rows found already indexed (earlier interrupted run)
    pub already_indexed_count: usize,
    pub state: MigrationState,
    pub message: String,
}

/// Operator-triggered mover from the legacy backend into the vector index
pub struct MigrationCoordinator {
    db: Arc<Database>,
    graph: Arc<GraphStore>,
    legacy: Arc<LegacyScanIndex>,
    index: Arc<VectorIndex>,
    chunk_size: usize,
    running: Mutex<()>,
}

impl MigrationCoordinator {
    pub fn new(
        db: Arc<Database>,
        graph: Arc<GraphStore>,
        legacy: Arc<LegacyScanIndex>,
        index: Arc<VectorIndex>,
        chunk_size: usize,
    ) -> Self {
        Self {
            db,
            graph,
            legacy,
            index,
            chunk_size: chunk_size.max(1),
            running: Mutex::new(()),
        }
    }

    /// Last persisted status
    pub fn status(&self) -> MigrationStatus {
        match self.db.get_meta::<MigrationStatus>(MIGRATION_STATE_KEY) {
            Ok(Some(status)) => status,
            Ok(None) => MigrationStatus::default(),
            Err(e) => {
                log::warn!("Unreadable migration status ({}), assuming not started", e);
                MigrationStatus::default()
            }
        }
    }

    /// Force the next run to start from scratch (index was discarded)
    pub fn reset(&self) -> Result<()> {
        self.set_state(MigrationState::NotStarted, None)
    }

    /// Migrate every legacy row. Never returns an error; failures land in the report.
    pub fn migrate_all(&self) -> MigrationReport {
        let Some(_guard) = self.running.try_lock() else {
            return MigrationReport {
                migrated_count: 0,
                failed_count: 0,
                already_indexed_count: 0,
                state: MigrationState::InProgress,
                message: "migration already running".to_string(),
            };
        };

        let mut report = MigrationReport {
            migrated_count: 0,
            failed_count: 0,
            already_indexed_count: 0,
            state: MigrationState::InProgress,
            message: String::new(),
        };

        if let Err(e) = self.set_state(MigrationState::InProgress, None) {
            return self.fail(report, format!("could not record migration start: {}", e));
        }

        let records = self.legacy.records();
        log::info!(
            "Migrating {} legacy vectors in chunks of {}",
            records.len(),
            self.chunk_size
        );

        for (chunk_no, chunk) in records.chunks(self.chunk_size).enumerate() {
            if let Err(e) = self.migrate_chunk(chunk, &mut report) {
                let message = format!("chunk {} failed: {}", chunk_no, e);
                return self.fail(report, message);
            }
            log::info!(
                "Migration chunk {} done ({} migrated, {} failed so far)",
                chunk_no,
                report.migrated_count,
                report.failed_count
            );
        }

        if let Err(e) = self.set_state(MigrationState::Completed, None) {
            return self.fail(report, format!("could not record completion: {}", e));
        }

        report.state = MigrationState::Completed;
        report.message = format!(
            "migrated {} vectors, {} failed, {} already indexed",
            report.migrated_count, report.failed_count, report.already_indexed_count
        );
        log::info!("Migration completed: {}", report.message);
        report
    }

    fn migrate_chunk(&self, chunk: &[LegacyRecord], report: &mut MigrationReport) -> Result<()> {
        let mut batch = Vec::new();
        let mut confirmed: Vec<NodeId> = Vec::new();
        let mut resumed = 0;
        let indexed = self.index.indexed_nodes();

        for record in chunk {
            // Already in the index: an interrupted run got this far, only purge.
            // An `Indexed` row whose index was discarded is re-added below.
            if indexed.contains(&record.node_id) {
                if record.state == EmbeddingState::Legacy {
                    log::debug!("{} already indexed, purging legacy copy", record.node_id);
                }
                resumed += 1;
                confirmed.push(record.node_id.clone());
                continue;
            }

            let Some(node) = self.graph.get_node(&record.node_id) else {
                log::warn!(
                    "Skipping orphaned legacy vector for missing node {}",
                    record.node_id
                );
                report.failed_count += 1;
                continue;
            };

            if record.vector.len() != self.index.dimension() {
                log::warn!(
                    "Skipping legacy vector for {}: {}d, index is {}d",
                    record.node_id,
                    record.vector.len(),
                    self.index.dimension()
                );
                report.failed_count += 1;
                continue;
            }

            let mut metadata = EntryMetadata::for_node(&node);
            metadata
                .fields
                .insert("model".into(), serde_json::json!(record.model));
            batch.push((record.vector.clone(), metadata));
            confirmed.push(record.node_id.clone());
        }

        // Nodes the worker indexed since the snapshot keep their newer vector
        let inserted = self.index.add_missing(batch)?;
        self.index.save()?;

        // Index is durable; only now may the legacy copies go
        self.legacy.mark_indexed(&confirmed)?;
        self.legacy.remove(&confirmed)?;

        for node_id in &confirmed {
            self.graph
                .update_node(node_id, NodeUpdate::new().has_embedding(true))?;
        }

        report.migrated_count += inserted.handles.len();
        report.already_indexed_count += resumed + inserted.skipped.len();
        Ok(())
    }

    fn fail(&self, mut report: MigrationReport, message: String) -> MigrationReport {
        log::error!("Migration failed: {}", message);
        if let Err(e) = self.set_state(MigrationState::Failed, Some(message.clone())) {
            log::error!("Could not record migration failure: {}", e);
        }
        report.state = MigrationState::Failed;
        report.message = message;
        report
    }

    fn set_state(&self, state: MigrationState, last_error: Option<String>) -> Result<()> {
        let status = MigrationStatus {
            state,
            updated_at: Utc::now(),
            last_error,
        };
        self.db.put_meta(MIGRATION_STATE_KEY, &status)
    }
}
