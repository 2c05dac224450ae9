//! Covisibility graph construction.
//!
//! Pipeline for `N` unit-norm embeddings:
//! 1. cosine similarity `S = E * E^T`
//! 2. threshold edges where `S[i, j] > threshold`
//! 3. symmetric edges to each view's `k` most similar other views
//! 4. self loops
//! 5. connectivity repair (consecutive chain, or component bridging)

use log::debug;
use ndarray::{Array2, ArrayView2};
use std::sync::Arc;

use crate::backend::{ComputeBackend, CpuBackend};
use crate::config::{ConnectivityRepair, SparseConfig};
use crate::error::{CovisError, Result};

/// How many undirected off-diagonal edges each construction rule added.
/// A pair is credited to the first rule that set it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub threshold_edges: usize,
    pub knn_edges: usize,
    pub repair_edges: usize,
}

/// Symmetric binary `N x N` adjacency over the views of one batch.
///
/// Invariants: diagonal set, `m[i][j] == m[j][i]`, one connected component.
#[derive(Debug, Clone, PartialEq)]
pub struct CovisibilityMask {
    adjacency: Array2<bool>,
    stats: BuildStats,
}

impl CovisibilityMask {
    pub fn num_views(&self) -> usize {
        self.adjacency.nrows()
    }

    pub fn get(&self, i: usize, j: usize) -> bool {
        self.adjacency[[i, j]]
    }

    /// Neighbours of `i`, excluding `i` itself.
    pub fn degree(&self, i: usize) -> usize {
        self.neighbors(i).count()
    }

    pub fn neighbors(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        self.adjacency
            .row(i)
            .into_iter()
            .enumerate()
            .filter(move |&(j, &on)| on && j != i)
            .map(|(j, _)| j)
    }

    /// Number of set entries, diagonal included (`sum(M)`).
    pub fn edge_count(&self) -> usize {
        self.adjacency.iter().filter(|&&on| on).count()
    }

    /// Fraction of entries that are masked out.
    pub fn sparsity(&self) -> f64 {
        let total = self.adjacency.len();
        1.0 - self.edge_count() as f64 / total as f64
    }

    pub fn is_symmetric(&self) -> bool {
        self.adjacency == self.adjacency.t()
    }

    /// Connected components, each sorted, ordered by smallest member.
    pub fn connected_components(&self) -> Vec<Vec<usize>> {
        let n = self.num_views();
        let mut set = DisjointSet::new(n);
        for ((i, j), &on) in self.adjacency.indexed_iter() {
            if on {
                set.union(i, j);
            }
        }
        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut slot = vec![usize::MAX; n];
        for v in 0..n {
            let root = set.find(v);
            if slot[root] == usize::MAX {
                slot[root] = groups.len();
                groups.push(Vec::new());
            }
            groups[slot[root]].push(v);
        }
        groups
    }

    pub fn stats(&self) -> BuildStats {
        self.stats
    }

    pub fn as_array(&self) -> ArrayView2<'_, bool> {
        self.adjacency.view()
    }

    /// Mask as `0.0 / 1.0` values.
    pub fn to_f32(&self) -> Array2<f32> {
        self.adjacency.mapv(|on| if on { 1.0 } else { 0.0 })
    }
}

/// Build a covisibility mask with the default chain repair on the CPU.
pub fn build_covisibility_mask(
    embeddings: ArrayView2<f32>,
    threshold: f32,
    k_nearest: usize,
) -> Result<CovisibilityMask> {
    CovisibilityBuilder::new(threshold, k_nearest).build(embeddings)
}

/// One mask per scene of a multi-scene batch.
pub fn build_batch_masks(scenes: &[Array2<f32>], config: &SparseConfig) -> Result<Vec<CovisibilityMask>> {
    if scenes.is_empty() {
        return Err(CovisError::EmptyBatch);
    }
    let builder = CovisibilityBuilder::from_config(config)?;
    scenes.iter().map(|scene| builder.build(scene.view())).collect()
}

/// Stack per-view vectors into an `(N, D)` matrix, rejecting ragged input.
pub fn embeddings_from_rows(rows: &[Vec<f32>]) -> Result<Array2<f32>> {
    let first = rows.first().ok_or(CovisError::EmptyBatch)?;
    let dim = first.len();
    for (index, row) in rows.iter().enumerate() {
        if row.len() != dim {
            return Err(CovisError::DimensionMismatch {
                index,
                expected: dim,
                actual: row.len(),
            });
        }
    }
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((rows.len(), dim), flat)
        .map_err(|e| CovisError::ShapeMismatch(e.to_string()))
}

/// Configurable mask builder.
#[derive(Clone)]
pub struct CovisibilityBuilder {
    threshold: f32,
    k_nearest: usize,
    repair: ConnectivityRepair,
    backend: Arc<dyn ComputeBackend>,
}

impl CovisibilityBuilder {
    pub fn new(threshold: f32, k_nearest: usize) -> Self {
        Self {
            threshold,
            k_nearest,
            repair: ConnectivityRepair::Chain,
            backend: Arc::new(CpuBackend),
        }
    }

    pub fn from_config(config: &SparseConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config.threshold, config.k_nearest).with_repair(config.repair))
    }

    pub fn with_repair(mut self, repair: ConnectivityRepair) -> Self {
        self.repair = repair;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn ComputeBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn build(&self, embeddings: ArrayView2<f32>) -> Result<CovisibilityMask> {
        let (n, dim) = embeddings.dim();
        if n == 0 {
            return Err(CovisError::EmptyBatch);
        }
        if dim == 0 {
            return Err(CovisError::DimensionMismatch {
                index: 0,
                expected: 1,
                actual: 0,
            });
        }

        let similarity = self.backend.pairwise_similarity(embeddings)?;
        if similarity.dim() != (n, n) {
            return Err(CovisError::Backend(format!(
                "{} returned a {:?} similarity matrix for {n} views",
                self.backend.name(),
                similarity.dim()
            )));
        }

        let mut adjacency = Array2::from_elem((n, n), false);
        let mut stats = BuildStats::default();

        for i in 0..n {
            for j in (i + 1)..n {
                if similarity[[i, j]] > self.threshold {
                    stats.threshold_edges += link(&mut adjacency, i, j) as usize;
                }
            }
        }

        let k = self.k_nearest.min(n - 1);
        if k > 0 {
            for i in 0..n {
                for j in nearest(&similarity, i, k) {
                    stats.knn_edges += link(&mut adjacency, i, j) as usize;
                }
            }
        }

        for i in 0..n {
            adjacency[[i, i]] = true;
        }

        stats.repair_edges = match self.repair {
            ConnectivityRepair::Chain => chain(&mut adjacency),
            ConnectivityRepair::BridgeComponents => bridge(&mut adjacency, &similarity),
        };

        let mask = CovisibilityMask { adjacency, stats };
        debug!(
            "Covisibility mask for {n} views: {} threshold, {} knn, {} repair edges, sparsity {:.2}",
            stats.threshold_edges,
            stats.knn_edges,
            stats.repair_edges,
            mask.sparsity()
        );
        Ok(mask)
    }
}

/// Set both directions of `(i, j)`. Returns whether the pair was new.
fn link(adjacency: &mut Array2<bool>, i: usize, j: usize) -> bool {
    let fresh = !adjacency[[i, j]];
    adjacency[[i, j]] = true;
    adjacency[[j, i]] = true;
    fresh
}

/// The `k` most similar views to `i`, excluding `i`. Ties keep index order.
fn nearest(similarity: &Array2<f32>, i: usize, k: usize) -> Vec<usize> {
    let row = similarity.row(i);
    let mut candidates: Vec<usize> = (0..row.len()).filter(|&j| j != i).collect();
    candidates.sort_by(|&a, &b| row[b].total_cmp(&row[a]));
    candidates.truncate(k);
    candidates
}

fn chain(adjacency: &mut Array2<bool>) -> usize {
    let n = adjacency.nrows();
    (1..n).filter(|&i| link(adjacency, i - 1, i)).count()
}

/// Join components along their most similar cross pairs (maximum spanning
/// forest over the component graph).
fn bridge(adjacency: &mut Array2<bool>, similarity: &Array2<f32>) -> usize {
    let n = adjacency.nrows();
    let mut set = DisjointSet::new(n);
    for ((i, j), &on) in adjacency.indexed_iter() {
        if on {
            set.union(i, j);
        }
    }
    if set.components == 1 {
        return 0;
    }

    let mut pairs: Vec<(usize, usize)> = Vec::new();
    for i in 0..n {
        for j in (i + 1)..n {
            if set.find(i) != set.find(j) {
                pairs.push((i, j));
            }
        }
    }
    pairs.sort_by(|&(a, b), &(c, d)| similarity[[c, d]].total_cmp(&similarity[[a, b]]));

    let mut added = 0;
    for (i, j) in pairs {
        if set.components == 1 {
            break;
        }
        if set.union(i, j) {
            link(adjacency, i, j);
            added += 1;
        }
    }
    added
}

struct DisjointSet {
    parent: Vec<usize>,
    components: usize,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            components: n,
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        self.parent[ra.max(rb)] = ra.min(rb);
        self.components -= 1;
        true
    }
}

/// Attention pair counts for dense versus gated attention over `n` views.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttentionFootprint {
    pub num_views: usize,
    pub dense_pairs: usize,
    pub sparse_pairs: usize,
}

impl AttentionFootprint {
    pub fn for_mask(mask: &CovisibilityMask) -> Self {
        let n = mask.num_views();
        Self {
            num_views: n,
            dense_pairs: n * n,
            sparse_pairs: mask.edge_count(),
        }
    }

    /// Estimate `n^2` against `n * k`.
    pub fn estimate(n: usize, k: usize) -> Self {
        Self {
            num_views: n,
            dense_pairs: n * n,
            sparse_pairs: (n * k).min(n * n),
        }
    }

    pub fn savings(&self) -> f64 {
        self.dense_pairs as f64 / self.sparse_pairs.max(1) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn nearest_breaks_ties_by_index() {
        let s = array![[1.0, 0.5, 0.5, 0.5], [0.5, 1.0, 0.2, 0.1], [0.5, 0.2, 1.0, 0.3], [0.5, 0.1, 0.3, 1.0]];
        assert_eq!(nearest(&s, 0, 2), vec![1, 2]);
        assert_eq!(nearest(&s, 3, 1), vec![0]);
    }

    #[test]
    fn bridge_joins_isolated_groups() {
        let mut adjacency = Array2::from_elem((4, 4), false);
        for i in 0..4 {
            adjacency[[i, i]] = true;
        }
        link(&mut adjacency, 0, 1);
        link(&mut adjacency, 2, 3);
        let s = array![[1.0, 0.9, 0.1, 0.4], [0.9, 1.0, 0.2, 0.1], [0.1, 0.2, 1.0, 0.9], [0.4, 0.1, 0.9, 1.0]];
        assert_eq!(bridge(&mut adjacency, &s), 1);
        assert!(adjacency[[0, 3]] && adjacency[[3, 0]]);
    }

    #[test]
    fn footprint_estimate_caps_at_dense() {
        let f = AttentionFootprint::estimate(100, 10);
        assert_eq!(f.dense_pairs, 10_000);
        assert_eq!(f.sparse_pairs, 1_000);
        assert!((f.savings() - 10.0).abs() < 1e-9);
        assert_eq!(AttentionFootprint::estimate(4, 10).sparse_pairs, 16);
    }
}
