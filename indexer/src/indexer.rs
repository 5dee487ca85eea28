//! Incremental reconciliation of files into the vector index.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use codelens_embeddings::{AnnConfig, EmbeddingError, EmbeddingGateway, IndexEntry, VectorIndex};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::chunker::Chunker;
use crate::error::{IndexerError, Result};
use crate::manifest::{FileMetadata, FileRecord, IndexManifest, fingerprint, write_atomic};

/// Manifest snapshot file name inside a data directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Vector index snapshot file name inside a data directory.
pub const INDEX_FILE: &str = "vectors.json";

/// Id of the vector for chunk `chunk_index` of `path`.
pub fn vector_id(path: &str, chunk_index: usize) -> String {
    format!("{path}#{chunk_index}")
}

/// One file handed to [`Indexer::reconcile_all`].
#[derive(Debug, Clone)]
pub struct FileInput {
    pub path: String,
    pub content: String,
    pub metadata: FileMetadata,
}

impl FileInput {
    /// Create an input.
    pub fn new(path: impl Into<String>, content: impl Into<String>, metadata: FileMetadata) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            metadata,
        }
    }
}

/// What [`Indexer::reconcile`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ReconcileOutcome {
    /// Fingerprint matched; no vectors were touched.
    Unchanged,
    /// Fingerprint matched but the file metadata changed.
    MetadataUpdated,
    /// First time this path was indexed.
    Created { added: usize },
    /// Content changed; old vectors replaced.
    Updated { removed: usize, added: usize },
    /// Manifest and index disagreed; the path was recomputed from scratch.
    Healed { removed: usize, added: usize },
}

/// What [`Indexer::remove`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RemoveOutcome {
    /// The record and its vectors were deleted.
    Removed { vectors: usize },
    /// Nothing was indexed for the path.
    NotIndexed,
}

/// A path whose manifest ids differ from the index's ids for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Divergence {
    pub path: String,
    /// Recorded in the manifest but absent from the index.
    pub missing_from_index: Vec<String>,
    /// In the index under this path but not recorded in the manifest.
    pub unexpected_in_index: Vec<String>,
}

impl Divergence {
    fn detail(&self) -> String {
        format!(
            "{} recorded ids missing from index, {} unrecorded ids in index",
            self.missing_from_index.len(),
            self.unexpected_in_index.len()
        )
    }
}

/// Result of [`Indexer::reconcile_all`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexRunStats {
    /// Files in the manifest after the run.
    pub total_files: usize,

    /// Number of new files.
    pub new_files: usize,

    /// Number of updated files.
    pub updated_files: usize,

    /// Number of files skipped by fingerprint.
    pub unchanged_files: usize,

    /// Number of files recomputed after divergence.
    pub healed_files: usize,

    /// Number of removed files.
    pub removed_files: usize,

    /// Paths that failed to index.
    pub failed_files: Vec<String>,

    /// Time taken in milliseconds.
    pub duration_ms: u64,
}

/// Keeps a [`VectorIndex`] and an [`IndexManifest`] in agreement.
///
/// Writes to one path are serialized by a per-path lock; different paths
/// proceed independently. Chunking and embedding run with no index lock
/// held. The staged diff is then applied to the index and the manifest
/// under both write guards, always taken index first, with no await point
/// between the two mutations. Approximate-search retraining runs afterwards
/// on a blocking thread, outside every lock.
pub struct Indexer {
    index: Arc<RwLock<VectorIndex>>,
    manifest: Arc<RwLock<IndexManifest>>,
    gateway: Arc<EmbeddingGateway>,
    chunker: Arc<dyn Chunker>,
    path_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Indexer {
    /// Create an indexer over existing state.
    pub fn new(
        index: VectorIndex,
        manifest: IndexManifest,
        gateway: Arc<EmbeddingGateway>,
        chunker: Arc<dyn Chunker>,
    ) -> Self {
        Self {
            index: Arc::new(RwLock::new(index)),
            manifest: Arc::new(RwLock::new(manifest)),
            gateway,
            chunker,
            path_locks: DashMap::new(),
        }
    }

    /// Open persisted state from `data_dir`, starting empty when no
    /// snapshot exists, and repair any divergence left by an interrupted
    /// process.
    pub async fn open(
        data_dir: impl AsRef<Path>,
        dimension: usize,
        ann: AnnConfig,
        gateway: Arc<EmbeddingGateway>,
        chunker: Arc<dyn Chunker>,
    ) -> Result<Self> {
        let data_dir = data_dir.as_ref();

        let manifest = match read_snapshot(&data_dir.join(MANIFEST_FILE)).await? {
            Some(json) => IndexManifest::from_json(&json).map_err(|e| {
                IndexerError::IndexUnavailable(format!("corrupt manifest snapshot: {e}"))
            })?,
            None => IndexManifest::new(),
        };

        let index = match read_snapshot(&data_dir.join(INDEX_FILE)).await? {
            Some(json) => {
                let mut index = VectorIndex::from_json(&json).map_err(|e| {
                    IndexerError::IndexUnavailable(format!("corrupt vector index snapshot: {e}"))
                })?;
                if index.dimension() != dimension {
                    return Err(EmbeddingError::DimensionMismatch {
                        expected: dimension,
                        actual: index.dimension(),
                    }
                    .into());
                }
                index.set_ann_config(ann);
                index
            }
            None => VectorIndex::new(dimension).with_ann_config(ann),
        };

        info!(
            "Opened index at {:?}: {} files, {} vectors",
            data_dir,
            manifest.len(),
            index.len()
        );

        let indexer = Self::new(index, manifest, gateway, chunker);
        let repaired = indexer.repair().await?;
        if repaired > 0 {
            warn!("Repaired {repaired} paths left inconsistent by a previous run");
        }
        indexer.refresh_ann().await;
        Ok(indexer)
    }

    /// Write manifest and index snapshots to `data_dir`.
    pub async fn persist(&self, data_dir: impl AsRef<Path>) -> Result<()> {
        let data_dir = data_dir.as_ref();
        let (index_json, manifest_json) = {
            let index = self.index.read().await;
            let manifest = self.manifest.read().await;
            (index.to_json()?, manifest.to_json()?)
        };

        write_atomic(&data_dir.join(INDEX_FILE), &index_json).await?;
        write_atomic(&data_dir.join(MANIFEST_FILE), &manifest_json).await?;
        Ok(())
    }

    /// Shared vector index.
    pub fn index(&self) -> &Arc<RwLock<VectorIndex>> {
        &self.index
    }

    /// Shared manifest.
    pub fn manifest(&self) -> &Arc<RwLock<IndexManifest>> {
        &self.manifest
    }

    /// Gateway used to embed chunks.
    pub fn gateway(&self) -> &Arc<EmbeddingGateway> {
        &self.gateway
    }

    /// Bring the index and manifest for `path` in line with `content`.
    pub async fn reconcile(
        &self,
        path: &str,
        content: &str,
        metadata: FileMetadata,
    ) -> Result<ReconcileOutcome> {
        let outcome = {
            let lock = self.path_lock(path);
            let _guard = lock.lock().await;
            self.reconcile_locked(path, content, metadata).await?
        };
        if matches!(
            outcome,
            ReconcileOutcome::Created { .. }
                | ReconcileOutcome::Updated { .. }
                | ReconcileOutcome::Healed { .. }
        ) {
            self.refresh_ann().await;
        }
        Ok(outcome)
    }

    async fn reconcile_locked(
        &self,
        path: &str,
        content: &str,
        metadata: FileMetadata,
    ) -> Result<ReconcileOutcome> {
        let fingerprint = fingerprint(content);
        let (previous, divergence) = {
            let index = self.index.read().await;
            let manifest = self.manifest.read().await;
            let previous = manifest.get(path).cloned();
            let divergence = diverge(path, previous.as_ref(), &index.ids_for_origin(path));
            (previous, divergence)
        };

        if let (Some(record), None) = (&previous, &divergence) {
            if record.fingerprint == fingerprint {
                if record.metadata == metadata {
                    return Ok(ReconcileOutcome::Unchanged);
                }
                self.manifest.write().await.update_metadata(path, metadata);
                debug!("Refreshed metadata for unchanged {path}");
                return Ok(ReconcileOutcome::MetadataUpdated);
            }
        }

        if let Some(divergence) = &divergence {
            let err = IndexerError::ManifestInconsistency {
                path: path.to_string(),
                detail: divergence.detail(),
            };
            warn!("{err}; recomputing from scratch");
        }

        // Stage: everything that can fail or suspend happens before mutation.
        let chunks = self.chunker.chunk(path, content)?;
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.gateway.embed_batch(&texts).await?;

        let inserts: Vec<IndexEntry> = chunks
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (chunk, vector))| {
                IndexEntry::new(vector_id(path, i), vector)
                    .with_origin(path)
                    .with_metadata(chunk.metadata)
            })
            .collect();
        let vector_ids: BTreeSet<String> = inserts.iter().map(|e| e.id.clone()).collect();
        let added = inserts.len();

        let removed = {
            let mut index = self.index.write().await;
            let mut manifest = self.manifest.write().await;

            let stale = stale_ids(path, &index, &manifest);
            index.apply(&stale, inserts)?;
            manifest.insert(FileRecord {
                path: path.to_string(),
                fingerprint,
                vector_ids,
                last_indexed_at: Utc::now(),
                metadata,
            });
            stale.len()
        };

        let outcome = match (&previous, &divergence) {
            (_, Some(_)) => ReconcileOutcome::Healed { removed, added },
            (Some(_), None) => ReconcileOutcome::Updated { removed, added },
            (None, None) => ReconcileOutcome::Created { added },
        };
        info!("Reconciled {path}: {outcome:?}");
        Ok(outcome)
    }

    /// Delete every vector of `path` and its manifest record.
    pub async fn remove(&self, path: &str) -> Result<RemoveOutcome> {
        let outcome = {
            let lock = self.path_lock(path);
            let _guard = lock.lock().await;
            self.remove_locked(path).await
        };
        self.prune_path_lock(path);

        let outcome = outcome?;
        if outcome != RemoveOutcome::NotIndexed {
            self.refresh_ann().await;
        }
        Ok(outcome)
    }

    async fn remove_locked(&self, path: &str) -> Result<RemoveOutcome> {
        let mut index = self.index.write().await;
        let mut manifest = self.manifest.write().await;

        let stale = stale_ids(path, &index, &manifest);
        index.apply(&stale, Vec::new())?;
        let had_record = manifest.remove(path).is_some();

        if !had_record && stale.is_empty() {
            return Ok(RemoveOutcome::NotIndexed);
        }
        info!("Removed {path} ({} vectors)", stale.len());
        Ok(RemoveOutcome::Removed {
            vectors: stale.len(),
        })
    }

    /// Paths whose manifest ids differ from the ids the index holds for them.
    pub async fn audit(&self) -> Vec<Divergence> {
        let index = self.index.read().await;
        let manifest = self.manifest.read().await;
        find_divergences(&index, &manifest)
    }

    /// Drop the record and vectors of every divergent path so the next
    /// reconcile recomputes it. Returns the number of paths repaired.
    pub async fn repair(&self) -> Result<usize> {
        let repaired = {
            let mut index = self.index.write().await;
            let mut manifest = self.manifest.write().await;

            let divergent = find_divergences(&index, &manifest);
            for divergence in &divergent {
                warn!("Repairing {}: {}", divergence.path, divergence.detail());
                let stale = stale_ids(&divergence.path, &index, &manifest);
                index.apply(&stale, Vec::new())?;
                manifest.remove(&divergence.path);
            }
            divergent.len()
        };
        if repaired > 0 {
            self.refresh_ann().await;
        }
        Ok(repaired)
    }

    /// Retrain approximate search if the index has drifted past its
    /// rebuild threshold.
    ///
    /// The index lock is held only to snapshot the vectors and to swap the
    /// result in. Training runs on a blocking thread, and searches keep
    /// using the previous clusters and pending set meanwhile. Returns
    /// whether a new structure was installed.
    pub async fn refresh_ann(&self) -> bool {
        let Some(job) = self.index.write().await.start_rebuild() else {
            return false;
        };
        let ticket = job.id();
        debug!("Training vector index on {} vectors", job.len());

        match tokio::task::spawn_blocking(move || job.train()).await {
            Ok(trained) => self.index.write().await.install_rebuild(trained),
            Err(e) => {
                warn!("Vector index training failed: {e}");
                self.index.write().await.abandon_rebuild(ticket);
                false
            }
        }
    }

    /// Reconcile a full corpus: every input is reconciled and manifest
    /// paths absent from `inputs` are removed. A failing file is logged and
    /// reported without stopping the run.
    pub async fn reconcile_all(&self, inputs: Vec<FileInput>) -> IndexRunStats {
        let start = std::time::Instant::now();
        let mut stats = IndexRunStats::default();
        let seen: HashSet<String> = inputs.iter().map(|f| f.path.clone()).collect();

        for input in inputs {
            match self
                .reconcile(&input.path, &input.content, input.metadata)
                .await
            {
                Ok(ReconcileOutcome::Unchanged | ReconcileOutcome::MetadataUpdated) => {
                    stats.unchanged_files += 1
                }
                Ok(ReconcileOutcome::Created { .. }) => stats.new_files += 1,
                Ok(ReconcileOutcome::Updated { .. }) => stats.updated_files += 1,
                Ok(ReconcileOutcome::Healed { .. }) => stats.healed_files += 1,
                Err(e) => {
                    warn!("Failed to index {}: {}", input.path, e);
                    stats.failed_files.push(input.path);
                }
            }
        }

        let gone: Vec<String> = self
            .manifest
            .read()
            .await
            .paths()
            .into_iter()
            .filter(|p| !seen.contains(p))
            .collect();
        for path in gone {
            match self.remove(&path).await {
                Ok(RemoveOutcome::Removed { .. }) => stats.removed_files += 1,
                Ok(RemoveOutcome::NotIndexed) => {}
                Err(e) => {
                    warn!("Failed to remove {path}: {e}");
                    stats.failed_files.push(path);
                }
            }
        }

        stats.total_files = self.manifest.read().await.len();
        stats.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Indexed {} files in {}ms (new: {}, updated: {}, unchanged: {}, removed: {}, failed: {})",
            stats.total_files,
            stats.duration_ms,
            stats.new_files,
            stats.updated_files,
            stats.unchanged_files,
            stats.removed_files,
            stats.failed_files.len()
        );
        stats
    }

    fn path_lock(&self, path: &str) -> Arc<Mutex<()>> {
        self.path_locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget the lock for `path` unless another task still holds it.
    fn prune_path_lock(&self, path: &str) {
        self.path_locks.remove_if(path, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Number of paths with a live write lock entry.
    pub fn tracked_paths(&self) -> usize {
        self.path_locks.len()
    }
}

/// Every id to delete for `path`: recorded ones plus any the index holds.
fn stale_ids(path: &str, index: &VectorIndex, manifest: &IndexManifest) -> Vec<String> {
    let mut ids = index.ids_for_origin(path);
    if let Some(record) = manifest.get(path) {
        ids.extend(record.vector_ids.iter().cloned());
    }
    ids.into_iter().collect()
}

fn diverge(path: &str, record: Option<&FileRecord>, actual: &BTreeSet<String>) -> Option<Divergence> {
    let empty = BTreeSet::new();
    let recorded = record.map_or(&empty, |r| &r.vector_ids);
    if recorded == actual {
        return None;
    }
    Some(Divergence {
        path: path.to_string(),
        missing_from_index: recorded.difference(actual).cloned().collect(),
        unexpected_in_index: actual.difference(recorded).cloned().collect(),
    })
}

fn find_divergences(index: &VectorIndex, manifest: &IndexManifest) -> Vec<Divergence> {
    let mut paths: BTreeSet<String> = manifest.paths().into_iter().collect();
    paths.extend(index.origins());
    paths
        .iter()
        .filter_map(|path| diverge(path, manifest.get(path), &index.ids_for_origin(path)))
        .collect()
}

async fn read_snapshot(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => Ok(Some(json)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(IndexerError::IndexUnavailable(format!(
            "cannot read {}: {e}",
            path.display()
        ))),
    }
}
