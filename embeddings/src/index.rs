//! Vector index with exact and approximate top-k search.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::Embedding;
use crate::error::{EmbeddingError, Result};
use crate::ivf::IvfIndex;
use crate::similarity::{SimilarityResult, dot_product, normalize, rank_top_k};

/// An entry in the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Unique identifier.
    pub id: String,

    /// The embedding vector (normalized on insert).
    pub embedding: Embedding,

    /// Source this vector was produced from, e.g. a file path.
    #[serde(default)]
    pub origin: Option<String>,

    /// Associated metadata.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl IndexEntry {
    /// Create an entry without origin or metadata.
    pub fn new(id: impl Into<String>, embedding: Embedding) -> Self {
        Self {
            id: id.into(),
            embedding,
            origin: None,
            metadata: None,
        }
    }

    /// Set the origin.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Set the metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Tuning for the approximate search structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnConfig {
    /// Fraction of the trained size that may change before a rebuild.
    pub rebuild_threshold: f64,

    /// Clusters scanned per query.
    pub nprobe: usize,

    /// Below this many vectors approximate search runs exactly.
    pub min_training_size: usize,

    /// Upper bound on the number of clusters.
    pub max_clusters: usize,

    /// Seed for cluster initialization.
    pub seed: u64,
}

impl Default for AnnConfig {
    fn default() -> Self {
        Self {
            rebuild_threshold: 0.2,
            nprobe: 10,
            min_training_size: 64,
            max_clusters: 1024,
            seed: 0x5eed,
        }
    }
}

/// Index statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    /// Number of stored vectors.
    pub vectors: usize,

    /// Vector dimension.
    pub dimension: usize,

    /// Distinct origins.
    pub origins: usize,

    /// Clusters in the approximate structure (0 when untrained).
    pub clusters: usize,

    /// Vectors inserted since the last build.
    pub pending: usize,

    /// Inserts and deletes since the last build.
    pub mutations_since_build: usize,
}

/// Vectors captured for retraining the approximate structure away from
/// the index lock. Produced by [`VectorIndex::start_rebuild`].
pub struct RebuildJob {
    id: u64,
    points: Vec<(String, Embedding)>,
    max_clusters: usize,
    seed: u64,
}

impl RebuildJob {
    /// Ticket identifying this job to [`VectorIndex::abandon_rebuild`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of vectors being trained on.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the job has no vectors.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Run k-means. CPU-bound: call it from a blocking thread.
    pub fn train(self) -> TrainedIvf {
        let refs: Vec<(&str, &[f32])> = self
            .points
            .iter()
            .map(|(id, v)| (id.as_str(), v.as_slice()))
            .collect();
        let ivf = IvfIndex::train(&refs, self.max_clusters, self.seed);
        TrainedIvf {
            id: self.id,
            ivf,
            trained_on: self.points.len(),
        }
    }
}

/// A trained structure waiting for [`VectorIndex::install_rebuild`].
pub struct TrainedIvf {
    id: u64,
    ivf: IvfIndex,
    trained_on: usize,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    dimension: usize,
    ann: AnnConfig,
    entries: Vec<IndexEntry>,
}

/// Vector index over chunk embeddings.
///
/// Exact search scores every vector. Approximate search scores the members
/// of the nearest IVF clusters. Mutations never retrain inline: once enough
/// of the index has drifted, [`VectorIndex::needs_rebuild`] turns true and
/// the owner trains a [`RebuildJob`] off-lock, then installs the result.
/// Until then the old clusters plus the pending set keep search complete.
pub struct VectorIndex {
    /// Stored entries.
    entries: HashMap<String, IndexEntry>,

    /// Ids grouped by origin.
    by_origin: HashMap<String, BTreeSet<String>>,

    /// Required length of every vector.
    dimension: usize,

    ann: AnnConfig,
    ivf: Option<IvfIndex>,
    size_at_build: usize,
    mutations_since_build: usize,

    /// Last issued rebuild ticket.
    rebuild_seq: u64,
    /// Ticket of the job whose result will be accepted.
    active_rebuild: Option<u64>,
    /// Ids mutated since the active job took its snapshot.
    touched: BTreeSet<String>,
}

impl VectorIndex {
    /// Create an empty index.
    pub fn new(dimension: usize) -> Self {
        Self {
            entries: HashMap::new(),
            by_origin: HashMap::new(),
            dimension,
            ann: AnnConfig::default(),
            ivf: None,
            size_at_build: 0,
            mutations_since_build: 0,
            rebuild_seq: 0,
            active_rebuild: None,
            touched: BTreeSet::new(),
        }
    }

    /// Set approximate-search tuning.
    pub fn with_ann_config(mut self, ann: AnnConfig) -> Self {
        self.ann = ann;
        self
    }

    /// Replace approximate-search tuning. A change drops the trained
    /// structure and any rebuild in flight.
    pub fn set_ann_config(&mut self, ann: AnnConfig) {
        if self.ann != ann {
            self.ann = ann;
            self.ivf = None;
            self.active_rebuild = None;
            self.touched.clear();
        }
    }

    /// Approximate-search tuning in use.
    pub fn ann_config(&self) -> &AnnConfig {
        &self.ann
    }

    /// Vector dimension.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of vectors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check if an id is present.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Get an entry by id.
    pub fn get(&self, id: &str) -> Option<&IndexEntry> {
        self.entries.get(id)
    }

    /// Ids produced from `origin`, sorted.
    pub fn ids_for_origin(&self, origin: &str) -> BTreeSet<String> {
        self.by_origin.get(origin).cloned().unwrap_or_default()
    }

    /// Every origin with at least one vector.
    pub fn origins(&self) -> Vec<String> {
        let mut origins: Vec<String> = self.by_origin.keys().cloned().collect();
        origins.sort();
        origins
    }

    /// Insert a vector, replacing any vector with the same id.
    pub fn insert(&mut self, entry: IndexEntry) -> Result<()> {
        self.check_dimension(&entry.embedding)?;
        self.insert_unchecked(entry);
        self.drop_undersized_ivf();
        Ok(())
    }

    /// Delete a vector. Returns whether it existed; unknown ids are a no-op.
    pub fn delete(&mut self, id: &str) -> bool {
        let existed = self.delete_entry(id);
        if existed {
            self.drop_undersized_ivf();
        }
        existed
    }

    /// Apply a staged diff: deletes first, then inserts.
    ///
    /// Every insert is validated before anything is mutated, so a rejected
    /// diff leaves the index untouched.
    pub fn apply(&mut self, deletes: &[String], inserts: Vec<IndexEntry>) -> Result<()> {
        for entry in &inserts {
            self.check_dimension(&entry.embedding)?;
        }

        let mut removed = 0;
        for id in deletes {
            if self.delete_entry(id) {
                removed += 1;
            }
        }
        let added = inserts.len();
        for entry in inserts {
            self.insert_unchecked(entry);
        }

        debug!("Applied index diff: -{removed} +{added}");
        self.drop_undersized_ivf();
        Ok(())
    }

    /// Top-`k` vectors most similar to `query`, ordered by score descending
    /// and then id ascending.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        use_approximate: bool,
    ) -> Result<Vec<SimilarityResult>> {
        self.check_dimension(query)?;
        if k == 0 || self.entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut unit = query.to_vec();
        normalize(&mut unit);

        let scored: Vec<SimilarityResult> = match (&self.ivf, use_approximate) {
            (Some(ivf), true) if self.entries.len() >= self.ann.min_training_size => ivf
                .candidates(&unit, self.ann.nprobe, k)
                .into_iter()
                .filter_map(|id| self.entries.get(id))
                .map(|entry| self.score(&unit, entry))
                .collect::<Result<_>>()?,
            _ => self
                .entries
                .values()
                .map(|entry| self.score(&unit, entry))
                .collect::<Result<_>>()?,
        };

        Ok(rank_top_k(scored, k))
    }

    /// Whether the approximate structure is missing or has drifted past
    /// the rebuild threshold.
    pub fn needs_rebuild(&self) -> bool {
        if self.entries.len() < self.ann.min_training_size {
            return false;
        }
        let drift_limit = self.ann.rebuild_threshold * self.size_at_build.max(1) as f64;
        self.ivf.is_none() || self.mutations_since_build as f64 >= drift_limit
    }

    /// Snapshot the vectors for an off-lock retrain.
    ///
    /// Returns `None` when no rebuild is due or one is already in flight.
    pub fn start_rebuild(&mut self) -> Option<RebuildJob> {
        if self.active_rebuild.is_some() || !self.needs_rebuild() {
            return None;
        }
        Some(self.snapshot_job())
    }

    /// Swap in a trained structure. Ids changed while it trained are pulled
    /// out of their clusters and, if still present, scanned as pending.
    ///
    /// Returns false when the job was superseded or the index shrank below
    /// the training size in the meantime.
    pub fn install_rebuild(&mut self, trained: TrainedIvf) -> bool {
        if self.active_rebuild != Some(trained.id) {
            debug!("Discarding superseded vector index rebuild {}", trained.id);
            return false;
        }
        self.active_rebuild = None;
        let touched = std::mem::take(&mut self.touched);
        if self.entries.len() < self.ann.min_training_size {
            return false;
        }

        self.swap_in(trained, &touched);
        true
    }

    /// Give up on job `id` so a later [`VectorIndex::start_rebuild`] can run.
    pub fn abandon_rebuild(&mut self, id: u64) {
        if self.active_rebuild == Some(id) {
            self.active_rebuild = None;
            self.touched.clear();
        }
    }

    /// Retrain in place, superseding any job in flight. Blocks for the
    /// whole training run.
    pub fn rebuild(&mut self) {
        let trained = self.snapshot_job().train();
        self.active_rebuild = None;
        self.touched.clear();
        self.swap_in(trained, &BTreeSet::new());
    }

    fn snapshot_job(&mut self) -> RebuildJob {
        self.rebuild_seq += 1;
        self.active_rebuild = Some(self.rebuild_seq);
        self.touched.clear();

        let mut points: Vec<(String, Embedding)> = self
            .entries
            .values()
            .map(|e| (e.id.clone(), e.embedding.clone()))
            .collect();
        points.sort_by(|a, b| a.0.cmp(&b.0));

        RebuildJob {
            id: self.rebuild_seq,
            points,
            max_clusters: self.ann.max_clusters,
            seed: self.ann.seed,
        }
    }

    fn swap_in(&mut self, trained: TrainedIvf, touched: &BTreeSet<String>) {
        let mut ivf = trained.ivf;
        for id in touched {
            ivf.remove(id);
            if self.entries.contains_key(id) {
                ivf.add_pending(id);
            }
        }
        info!(
            "Rebuilt vector index: {} vectors in {} clusters, {} changed during training",
            trained.trained_on,
            ivf.cluster_count(),
            touched.len()
        );

        self.ivf = Some(ivf);
        self.size_at_build = trained.trained_on;
        self.mutations_since_build = touched.len();
    }

    /// Index statistics.
    pub fn stats(&self) -> IndexStats {
        IndexStats {
            vectors: self.entries.len(),
            dimension: self.dimension,
            origins: self.by_origin.len(),
            clusters: self.ivf.as_ref().map_or(0, IvfIndex::cluster_count),
            pending: self.ivf.as_ref().map_or(0, IvfIndex::pending_count),
            mutations_since_build: self.mutations_since_build,
        }
    }

    /// Serialize the index to JSON.
    pub fn to_json(&self) -> Result<String> {
        let mut entries: Vec<IndexEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        let snapshot = Snapshot {
            dimension: self.dimension,
            ann: self.ann.clone(),
            entries,
        };
        Ok(serde_json::to_string(&snapshot)?)
    }

    /// Deserialize an index from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Snapshot = serde_json::from_str(json)?;
        let mut index = Self::new(snapshot.dimension).with_ann_config(snapshot.ann);
        index.apply(&[], snapshot.entries)?;
        Ok(index)
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    fn score(&self, unit_query: &[f32], entry: &IndexEntry) -> Result<SimilarityResult> {
        let score = dot_product(unit_query, &entry.embedding)?;
        let result = SimilarityResult::new(entry.id.clone(), score);
        Ok(match &entry.metadata {
            Some(metadata) => result.with_metadata(metadata.clone()),
            None => result,
        })
    }

    fn insert_unchecked(&mut self, mut entry: IndexEntry) {
        normalize(&mut entry.embedding);
        // Replacement happens under one &mut borrow, so no reader sees both.
        self.delete_entry(&entry.id);

        if let Some(origin) = &entry.origin {
            self.by_origin
                .entry(origin.clone())
                .or_default()
                .insert(entry.id.clone());
        }
        if let Some(ivf) = &mut self.ivf {
            ivf.add_pending(&entry.id);
        }
        if self.active_rebuild.is_some() {
            self.touched.insert(entry.id.clone());
        }
        self.mutations_since_build += 1;
        self.entries.insert(entry.id.clone(), entry);
    }

    fn delete_entry(&mut self, id: &str) -> bool {
        let Some(entry) = self.entries.remove(id) else {
            return false;
        };

        if let Some(origin) = &entry.origin {
            if let Some(ids) = self.by_origin.get_mut(origin) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_origin.remove(origin);
                }
            }
        }
        if let Some(ivf) = &mut self.ivf {
            ivf.remove(id);
        }
        if self.active_rebuild.is_some() {
            self.touched.insert(id.to_string());
        }
        self.mutations_since_build += 1;
        true
    }

    fn drop_undersized_ivf(&mut self) {
        if self.entries.len() < self.ann.min_training_size && self.ivf.take().is_some() {
            debug!("Vector index below training size; approximate search runs exactly");
        }
    }
}
