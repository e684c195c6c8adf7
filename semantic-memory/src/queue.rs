//! Embedding task queue
//!
//! Bounded FIFO in front of a single background worker. The worker drains a
//! burst of tasks, encodes each text off the executor, then commits the
//! whole burst to the index and saves it on a blocking thread. Only after
//! that save does it purge superseded legacy rows and flip `has_embedding`,
//! so a set flag always has a durable vector behind it.
//!
//! `enqueue` never blocks: it returns false when the queue is full, stopped,
//! or the task is incomplete.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::MemoryConfig;
use crate::embedding::{encode_blocking, EmbeddingCodec};
use crate::error::{MemoryError, Result};
use crate::graph::GraphStore;
use crate::index::{EntryMetadata, VectorIndex};
use crate::legacy::LegacyScanIndex;
use crate::node::{Node, NodeId};

/// One unit of embedding work
#[derive(Debug, Clone)]
pub struct EmbeddingTask {
    pub node_id: NodeId,
    /// Text to encode; normally `Node::searchable_text()`
    pub text: String,
    pub metadata: EntryMetadata,
    /// Failed attempts so far
    pub attempts: u32,
}

impl EmbeddingTask {
    pub fn new(node_id: impl Into<NodeId>, text: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            metadata: EntryMetadata::new(node_id.clone()),
            node_id,
            text: text.into(),
            attempts: 0,
        }
    }

    pub fn for_node(node: &Node) -> Self {
        Self {
            node_id: node.id.clone(),
            text: node.searchable_text(),
            metadata: EntryMetadata::for_node(node),
            attempts: 0,
        }
    }

    fn is_complete(&self) -> bool {
        !self.node_id.as_str().trim().is_empty()
            && !self.text.trim().is_empty()
            && self.metadata.node_id == self.node_id
    }
}

/// Worker tuning
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub capacity: usize,
    /// Most tasks committed with one rebuild and one save
    pub batch_size: usize,
    pub max_attempts: u32,
    pub dequeue_timeout: Duration,
    pub retry_backoff: Duration,
}

impl From<&MemoryConfig> for QueueConfig {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            capacity: config.queue_capacity,
            batch_size: config.embedding_batch_size,
            max_attempts: config.max_attempts,
            dequeue_timeout: config.dequeue_timeout(),
            retry_backoff: config.retry_backoff(),
        }
    }
}

/// Snapshot of worker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub processed: u64,
    pub retried: u64,
    pub dropped: u64,
    /// Tasks whose node vanished or changed before the flag could be set
    pub stale: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    processed: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    stale: AtomicU64,
}

struct Worker {
    config: QueueConfig,
    codec: Arc<dyn EmbeddingCodec>,
    index: Arc<VectorIndex>,
    legacy: Arc<LegacyScanIndex>,
    graph: Arc<GraphStore>,
    counters: Arc<Counters>,
}

/// Handle to the background embedding worker
pub struct EmbeddingTaskQueue {
    sender: Mutex<Option<mpsc::Sender<EmbeddingTask>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl EmbeddingTaskQueue {
    /// Spawn the worker on the current tokio runtime
    pub fn start(
        config: QueueConfig,
        codec: Arc<dyn EmbeddingCodec>,
        index: Arc<VectorIndex>,
        legacy: Arc<LegacyScanIndex>,
        graph: Arc<GraphStore>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters::default());

        let worker = Worker {
            config,
            codec,
            index,
            legacy,
            graph,
            counters: Arc::clone(&counters),
        };
        let running_flag = Arc::clone(&running);
        let handle = tokio::spawn(async move {
            worker.run(rx).await;
            running_flag.store(false, Ordering::SeqCst);
        });

        Self {
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
            running,
            counters,
        }
    }

    /// Queue a task without waiting. False when full, stopped or incomplete.
    pub fn enqueue(&self, task: EmbeddingTask) -> bool {
        if !task.is_complete() {
            log::warn!("Rejecting incomplete embedding task for {:?}", task.node_id);
            return false;
        }
        if !self.is_running() {
            return false;
        }

        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return false;
        };
        match sender.try_send(task) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(task)) => {
                log::warn!("Embedding queue full, dropping task for {}", task.node_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn enqueue_node(&self, node: &Node) -> bool {
        self.enqueue(EmbeddingTask::for_node(node))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.sender.lock().is_some()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            stale: self.counters.stale.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work, drain what is queued, save the index, join the worker
    pub async fn shutdown(&self) {
        // Dropping the only sender closes the channel once it is drained
        drop(self.sender.lock().take());

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("Embedding worker panicked: {}", e);
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

/// An encoded task waiting for the burst commit
struct Encoded {
    task: EmbeddingTask,
    vector: Vec<f32>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<EmbeddingTask>) {
        log::info!("Embedding worker started");
        loop {
            let first = match tokio::time::timeout(self.config.dequeue_timeout, rx.recv()).await {
                Ok(Some(task)) => task,
                Ok(None) => break,
                // Idle: persist whatever other writers left unsaved
                Err(_) => {
                    self.flush().await;
                    continue;
                }
            };

            let mut burst = vec![first];
            while burst.len() < self.config.batch_size.max(1) {
                match rx.try_recv() {
                    Ok(task) => burst.push(task),
                    Err(_) => break,
                }
            }
            self.process_burst(burst).await;
        }
        self.flush().await;
        log::info!("Embedding worker stopped");
    }

    async fn process_burst(&self, burst: Vec<EmbeddingTask>) {
        let mut encoded = Vec::with_capacity(burst.len());
        for task in burst {
            if let Some(item) = self.encode(task).await {
                encoded.push(item);
            }
        }
        if encoded.is_empty() {
            return;
        }

        if let Err(e) = self.commit(&encoded).await {
            self.counters
                .dropped
                .fetch_add(encoded.len() as u64, Ordering::Relaxed);
            log::error!(
                "Dropping {} embeddings, index commit failed: {}",
                encoded.len(),
                e
            );
            return;
        }

        for item in &encoded {
            self.finish(item);
        }
    }

    /// Encode with retries; None when the task is stale or dropped
    async fn encode(&self, mut task: EmbeddingTask) -> Option<Encoded> {
        loop {
            if !self.is_current(&task) {
                self.counters.stale.fetch_add(1, Ordering::Relaxed);
                log::debug!("Embedding task for {} is stale, skipped", task.node_id);
                return None;
            }

            let attempt = encode_blocking(Arc::clone(&self.codec), task.text.clone())
                .await
                .and_then(|vector| {
                    self.index.validate_vector(&vector)?;
                    Ok(vector)
                });
            let e = match attempt {
                Ok(vector) => return Some(Encoded { task, vector }),
                Err(e) => e,
            };

            task.attempts += 1;
            if e.is_retryable() && task.attempts < self.config.max_attempts {
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Embedding {} failed (attempt {}/{}): {}",
                    task.node_id,
                    task.attempts,
                    self.config.max_attempts,
                    e
                );
                tokio::time::sleep(self.config.retry_backoff).await;
                continue;
            }
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            log::error!(
                "Dropping embedding task for {} after {} attempts: {}",
                task.node_id,
                task.attempts,
                e
            );
            return None;
        }
    }

    /// The node still exists and still embeds to `task.text`
    fn is_current(&self, task: &EmbeddingTask) -> bool {
        self.graph
            .get_node(&task.node_id)
            .is_some_and(|node| node.searchable_text() == task.text)
    }

    /// Put the burst into the index and save it, off the executor
    async fn commit(&self, encoded: &[Encoded]) -> Result<()> {
        let items: Vec<(Vec<f32>, EntryMetadata)> = encoded
            .iter()
            .map(|item| {
                let mut metadata = item.task.metadata.clone();
                metadata
                    .fields
                    .insert("model".into(), serde_json::json!(self.codec.model_name()));
                (item.vector.clone(), metadata)
            })
            .collect();

        let mut attempts = 0;
        loop {
            let index = Arc::clone(&self.index);
            let batch = items.clone();
            let result = tokio::task::spawn_blocking(move || {
                index.replace_batch(batch)?;
                index.save()
            })
            .await
            .map_err(|e| MemoryError::transient(format!("index commit task failed: {}", e)))
            .and_then(|saved| saved);

            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempts += 1;
                    if !e.is_retryable() || attempts >= self.config.max_attempts {
                        return Err(e);
                    }
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Index commit failed (attempt {}): {}", attempts, e);
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
            }
        }
    }

    /// The vector is durable: drop the legacy copy and flip the flag
    fn finish(&self, item: &Encoded) {
        let node_id = &item.task.node_id;
        if self.legacy.contains(node_id) {
            if let Err(e) = self.legacy.remove(std::slice::from_ref(node_id)) {
                log::warn!("Could not purge legacy vector for {}: {}", node_id, e);
            }
        }

        match self.graph.mark_embedded(node_id, &item.task.text) {
            Ok(true) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                log::debug!("Embedded node {}", node_id);
            }
            Ok(false) => {
                self.counters.stale.fetch_add(1, Ordering::Relaxed);
                log::debug!("Node {} changed during embedding, flag left unset", node_id);
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::error!("Could not flag {} as embedded: {}", node_id, e);
            }
        }
    }

    async fn flush(&self) {
        if !self.index.is_dirty() {
            return;
        }
        let index = Arc::clone(&self.index);
        match tokio::task::spawn_blocking(move || index.save()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("Failed to save vector index: {}", e),
            Err(e) => log::warn!("Index save task failed: {}", e),
        }
    }
}
