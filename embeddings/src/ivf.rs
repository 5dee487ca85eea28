//! Inverted-file clustering for approximate search.
//!
//! Vectors are partitioned with spherical k-means; a query only scores the
//! members of its nearest clusters. Vectors inserted after training sit in a
//! pending set that every query scans until the next rebuild.

use std::collections::{BTreeSet, HashMap};

use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::Embedding;
use crate::similarity::{normalize, squared_distance};

const MAX_ITERATIONS: usize = 10;

pub(crate) struct IvfIndex {
    centroids: Vec<Embedding>,
    lists: Vec<Vec<String>>,
    cluster_of: HashMap<String, usize>,
    pending: BTreeSet<String>,
}

impl IvfIndex {
    /// Train over `points`, which must be sorted by id for reproducibility.
    pub(crate) fn train(points: &[(&str, &[f32])], max_clusters: usize, seed: u64) -> Self {
        let unit: Vec<Embedding> = points
            .iter()
            .map(|(_, v)| {
                let mut v = v.to_vec();
                normalize(&mut v);
                v
            })
            .collect();

        let k = cluster_count(unit.len(), max_clusters);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut centroids = seed_centroids(&unit, k, &mut rng);
        let mut assignment = vec![usize::MAX; unit.len()];

        for _ in 0..MAX_ITERATIONS {
            let mut changed = false;
            for (i, v) in unit.iter().enumerate() {
                let nearest = nearest_centroid(&centroids, v);
                if assignment[i] != nearest {
                    assignment[i] = nearest;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
            recompute_centroids(&mut centroids, &unit, &assignment);
        }

        let mut lists = vec![Vec::new(); centroids.len()];
        let mut cluster_of = HashMap::with_capacity(points.len());
        for ((id, _), &cluster) in points.iter().zip(&assignment) {
            lists[cluster].push((*id).to_string());
            cluster_of.insert((*id).to_string(), cluster);
        }

        Self {
            centroids,
            lists,
            cluster_of,
            pending: BTreeSet::new(),
        }
    }

    pub(crate) fn add_pending(&mut self, id: &str) {
        self.remove(id);
        self.pending.insert(id.to_string());
    }

    pub(crate) fn remove(&mut self, id: &str) {
        if let Some(cluster) = self.cluster_of.remove(id) {
            self.lists[cluster].retain(|member| member != id);
        }
        self.pending.remove(id);
    }

    /// Ids worth scoring for `query`: members of the `nprobe` nearest
    /// clusters, widened until at least `min_candidates` are gathered, plus
    /// every pending id.
    pub(crate) fn candidates(&self, query: &[f32], nprobe: usize, min_candidates: usize) -> Vec<&str> {
        let mut unit = query.to_vec();
        normalize(&mut unit);

        let mut order: Vec<(OrderedFloat<f32>, usize)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (OrderedFloat(squared_distance(c, &unit)), i))
            .collect();
        order.sort();

        let mut out: Vec<&str> = self.pending.iter().map(String::as_str).collect();
        for (visited, (_, cluster)) in order.into_iter().enumerate() {
            if visited >= nprobe.max(1) && out.len() >= min_candidates {
                break;
            }
            out.extend(self.lists[cluster].iter().map(String::as_str));
        }
        out
    }

    pub(crate) fn cluster_count(&self) -> usize {
        self.centroids.len()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// ceil(sqrt(n)), clamped to `[1, max_clusters]` and never above `n`.
fn cluster_count(n: usize, max_clusters: usize) -> usize {
    let k = (n as f64).sqrt().ceil() as usize;
    k.clamp(1, max_clusters.max(1)).min(n.max(1))
}

fn nearest_centroid(centroids: &[Embedding], v: &[f32]) -> usize {
    centroids
        .iter()
        .enumerate()
        .min_by_key(|(_, c)| OrderedFloat(squared_distance(c, v)))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// k-means++ seeding.
fn seed_centroids(points: &[Embedding], k: usize, rng: &mut StdRng) -> Vec<Embedding> {
    let mut centroids: Vec<Embedding> = Vec::with_capacity(k);
    if points.is_empty() {
        return centroids;
    }

    centroids.push(points[rng.random_range(0..points.len())].clone());
    let mut nearest: Vec<f32> = points
        .iter()
        .map(|p| squared_distance(p, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total: f32 = nearest.iter().sum();
        let next = if total <= f32::EPSILON {
            rng.random_range(0..points.len())
        } else {
            let mut target = rng.random::<f32>() * total;
            let mut chosen = points.len() - 1;
            for (i, d) in nearest.iter().enumerate() {
                if target < *d {
                    chosen = i;
                    break;
                }
                target -= d;
            }
            chosen
        };

        let centroid = points[next].clone();
        for (d, p) in nearest.iter_mut().zip(points) {
            *d = d.min(squared_distance(p, &centroid));
        }
        centroids.push(centroid);
    }
    centroids
}

/// Move each centroid to the normalized mean of its members. Empty clusters
/// keep their previous centroid.
fn recompute_centroids(centroids: &mut [Embedding], points: &[Embedding], assignment: &[usize]) {
    let dim = centroids.first().map_or(0, Vec::len);
    let mut sums = vec![vec![0.0f32; dim]; centroids.len()];
    let mut counts = vec![0usize; centroids.len()];

    for (p, &cluster) in points.iter().zip(assignment) {
        counts[cluster] += 1;
        for (s, x) in sums[cluster].iter_mut().zip(p) {
            *s += x;
        }
    }

    for ((centroid, mut sum), count) in centroids.iter_mut().zip(sums).zip(counts) {
        if count > 0 {
            normalize(&mut sum);
            *centroid = sum;
        }
    }
}
