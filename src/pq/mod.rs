//! Product-quantization index.
//!
//! Vectors are cut into `m` contiguous subspaces; each subspace gets its own
//! codebook of `k_c` centroids trained by k-means. A stored vector is
//! represented by its raw coordinates plus one centroid id per subspace.
//!
//! Queries precompute a distance table from each query slice to every
//! centroid, then score a database entry as the **sum of per-subspace
//! distances** to its coded centroids. This asymmetric estimate is not a
//! Euclidean distance (the per-subspace terms are unsquared); it ranks
//! candidates well but its magnitude is only comparable to itself. Use
//! [`PqIndex::k_nearest_refined`] when true-distance ordering matters — it
//! over-fetches by 3x and re-scores exactly.
//!
//! [`PqIndex::k_nearest_concurrent`] fans the scan out over the machine's
//! available parallelism; each worker keeps a local bounded heap over its
//! chunk and the partial results merge at the end, so there is no lock on
//! the hot path.
//!
//! # References
//!
//! - Jégou, Douze, Schmid (2011): "Product quantization for nearest
//!   neighbor search"

mod kmeans;

use crate::distance::euclidean;
use crate::error::{ensure_k, ensure_radius, IndexError, Result};
use crate::heap::BoundedHeap;
use crate::snapshot::{self, IndexKind};
use crate::traits::{RangeSearch, Snapshot, VectorIndex};
use crate::vector::{ensure_dim, Vector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::thread;

/// Per-vector centroid ids, one per subspace.
type CodeWord = SmallVec<[u16; 16]>;

/// Construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PqParams {
    /// Number of subspaces (`m`). The vector dimension must be divisible
    /// by it.
    pub num_subspaces: usize,

    /// Centroids per subspace codebook (`k_c`).
    pub codebook_size: usize,

    /// Interval search: how many of the closest centroids to probe per
    /// subspace when generating candidates.
    pub probe_centroids: usize,

    /// Interval search: a centroid contributes candidates only when its
    /// distance to the query slice is within `range_expansion * max_dist`.
    pub range_expansion: f64,
}

impl Default for PqParams {
    fn default() -> Self {
        Self {
            num_subspaces: 8,
            codebook_size: 256,
            probe_centroids: 3,
            range_expansion: 3.0,
        }
    }
}

/// Product-quantization index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PqIndex {
    params: PqParams,
    /// `[subspace][centroid][coordinate]`; empty until trained.
    codebooks: Vec<Vec<Vec<f64>>>,
    /// Stored vectors in insertion order.
    db: Vec<Vector>,
    /// `codes[i][j]` is vector i's centroid id in subspace j.
    codes: Vec<CodeWord>,
    /// Vector id -> index into `db`.
    id_lookup: HashMap<i64, usize>,
    dimension: Option<usize>,
    seed: Option<u64>,
}

impl PqIndex {
    /// Create an untrained index.
    pub fn new(params: PqParams) -> Result<Self> {
        if params.num_subspaces == 0 {
            return Err(IndexError::InvalidParameter(
                "num_subspaces must be at least 1".to_string(),
            ));
        }
        if params.codebook_size == 0 || params.codebook_size > usize::from(u16::MAX) + 1 {
            return Err(IndexError::InvalidParameter(format!(
                "codebook_size must be in 1..={}",
                usize::from(u16::MAX) + 1
            )));
        }
        if params.probe_centroids == 0 {
            return Err(IndexError::InvalidParameter(
                "probe_centroids must be at least 1".to_string(),
            ));
        }
        if !(params.range_expansion > 0.0 && params.range_expansion.is_finite()) {
            return Err(IndexError::InvalidParameter(
                "range_expansion must be a positive finite number".to_string(),
            ));
        }

        Ok(Self {
            params,
            codebooks: Vec::new(),
            db: Vec::new(),
            codes: Vec::new(),
            id_lookup: HashMap::new(),
            dimension: None,
            seed: None,
        })
    }

    /// Configure a deterministic seed for codebook training.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Construction parameters.
    #[must_use]
    pub fn params(&self) -> &PqParams {
        &self.params
    }

    /// Number of stored vectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.db.len()
    }

    /// True when the index holds no vectors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    /// True once `train` has produced the codebooks.
    #[must_use]
    pub fn is_trained(&self) -> bool {
        !self.codebooks.is_empty()
    }

    fn ensure_trained(&self) -> Result<()> {
        if self.is_trained() {
            Ok(())
        } else {
            Err(IndexError::UntrainedCodebook)
        }
    }

    fn subspace_dim(&self) -> usize {
        self.dimension.unwrap_or(0) / self.params.num_subspaces
    }

    /// Train the per-subspace codebooks on `vectors` for up to `epochs`
    /// k-means iterations each.
    ///
    /// Retraining is allowed; vectors already stored are re-encoded against
    /// the fresh codebooks. Removing individual training vectors from an
    /// existing codebook is not supported — retrain instead.
    pub fn train(&mut self, vectors: &[Vector], epochs: usize) -> Result<()> {
        if vectors.is_empty() {
            return Err(IndexError::InvalidParameter(
                "training set must not be empty".to_string(),
            ));
        }
        if epochs == 0 {
            return Err(IndexError::InvalidParameter(
                "epochs must be at least 1".to_string(),
            ));
        }
        if vectors.len() < self.params.codebook_size {
            return Err(IndexError::InvalidParameter(format!(
                "training set of {} vectors cannot seed {} centroids",
                vectors.len(),
                self.params.codebook_size
            )));
        }

        let mut dimension = self.dimension;
        for vec in vectors {
            ensure_dim(dimension, vec.dim())?;
            dimension.get_or_insert(vec.dim());
        }
        let dim = dimension.unwrap_or(0);
        if dim == 0 || dim % self.params.num_subspaces != 0 {
            return Err(IndexError::InvalidParameter(format!(
                "dimension {dim} is not divisible into {} subspaces",
                self.params.num_subspaces
            )));
        }
        self.dimension = dimension;

        let sub_dim = dim / self.params.num_subspaces;
        let mut rng = StdRng::seed_from_u64(match self.seed {
            Some(seed) => seed,
            None => rand::rng().random(),
        });

        tracing::debug!(
            subspaces = self.params.num_subspaces,
            centroids = self.params.codebook_size,
            training_vectors = vectors.len(),
            epochs,
            "training codebooks"
        );

        let mut codebooks = Vec::with_capacity(self.params.num_subspaces);
        for j in 0..self.params.num_subspaces {
            let start = j * sub_dim;
            let slices: Vec<&[f64]> = vectors
                .iter()
                .map(|v| &v.values[start..start + sub_dim])
                .collect();
            codebooks.push(kmeans::train_codebook(
                &slices,
                self.params.codebook_size,
                epochs,
                &mut rng,
            ));
        }
        self.codebooks = codebooks;

        // Stale codes would point into the old codebooks.
        self.codes = self.db.iter().map(|v| self.quantize(v)).collect();
        Ok(())
    }

    /// Nearest-centroid code for each subspace of `vec`.
    fn quantize(&self, vec: &Vector) -> CodeWord {
        let sub_dim = self.subspace_dim();
        (0..self.params.num_subspaces)
            .map(|j| {
                let start = j * sub_dim;
                let slice = &vec.values[start..start + sub_dim];
                kmeans::nearest_centroid(slice, &self.codebooks[j]) as u16
            })
            .collect()
    }

    /// Distances from every query slice to every centroid: `table[j][c]`.
    fn distance_table(&self, query: &[f64]) -> Vec<Vec<f64>> {
        let sub_dim = self.subspace_dim();
        self.codebooks
            .iter()
            .enumerate()
            .map(|(j, codebook)| {
                let start = j * sub_dim;
                let slice = &query[start..start + sub_dim];
                codebook.iter().map(|c| euclidean(slice, c)).collect()
            })
            .collect()
    }

    /// Exact re-scoring over a 3x candidate set; the recommended accurate
    /// query path.
    pub fn k_nearest_refined(&self, query: &Vector, k: usize) -> Result<Vec<Vector>> {
        ensure_k(k)?;
        let candidates = self.k_nearest(query, k.saturating_mul(3))?;

        let mut heap = BoundedHeap::new(k);
        for vec in candidates {
            heap.push(euclidean(&query.values, &vec.values), vec);
        }
        Ok(heap.into_sorted().into_iter().map(|(_, v)| v).collect())
    }

    /// ADC scan parallelized over equal database chunks, one worker per
    /// unit of available hardware parallelism. Workers keep local bounded
    /// heaps; the partial results merge in chunk order, so the output is
    /// deterministic for a fixed database.
    pub fn k_nearest_concurrent(&self, query: &Vector, k: usize) -> Result<Vec<Vector>> {
        ensure_k(k)?;
        self.ensure_trained()?;
        ensure_dim(self.dimension, query.dim())?;

        if self.db.is_empty() {
            return Ok(Vec::new());
        }

        let table = self.distance_table(&query.values);
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(self.db.len());
        let chunk_len = self.db.len().div_ceil(workers);
        let num_chunks = self.db.len().div_ceil(chunk_len);

        let mut partials: Vec<Vec<(f64, usize)>> = vec![Vec::new(); num_chunks];
        thread::scope(|scope| {
            for (w, (slot, chunk)) in partials
                .iter_mut()
                .zip(self.codes.chunks(chunk_len))
                .enumerate()
            {
                let table = &table;
                scope.spawn(move || {
                    let mut heap = BoundedHeap::new(k);
                    for (i, code) in chunk.iter().enumerate() {
                        heap.push(adc_estimate(code, table), w * chunk_len + i);
                    }
                    *slot = heap.into_sorted();
                });
            }
        });

        let mut merged = BoundedHeap::new(k);
        for partial in partials {
            for (dist, idx) in partial {
                merged.push(dist, idx);
            }
        }

        Ok(merged
            .into_sorted()
            .into_iter()
            .map(|(_, idx)| self.db[idx].clone())
            .collect())
    }

    /// Every stored vector whose exact distance to `query` lies in
    /// `[min_dist, max_dist]`, unordered.
    ///
    /// Candidates come from the [`PqParams::probe_centroids`] closest
    /// centroids per subspace, filtered by the
    /// [`PqParams::range_expansion`] threshold, then verified exactly.
    pub fn search_within_interval(
        &self,
        query: &Vector,
        min_dist: f64,
        max_dist: f64,
    ) -> Result<Vec<Vector>> {
        self.ensure_trained()?;
        ensure_dim(self.dimension, query.dim())?;
        ensure_radius(min_dist)?;
        if !(max_dist >= min_dist) {
            return Err(IndexError::InvalidParameter(format!(
                "empty interval [{min_dist}, {max_dist}]"
            )));
        }

        let sub_dim = self.subspace_dim();
        let mut candidates: HashSet<usize> = HashSet::new();

        for j in 0..self.params.num_subspaces {
            let start = j * sub_dim;
            let slice = &query.values[start..start + sub_dim];

            let mut scored: Vec<(f64, usize)> = self.codebooks[j]
                .iter()
                .enumerate()
                .map(|(c, centroid)| (euclidean(slice, centroid), c))
                .collect();
            scored.sort_by(|a, b| a.0.total_cmp(&b.0));

            for &(dist, c) in scored.iter().take(self.params.probe_centroids) {
                if dist > self.params.range_expansion * max_dist {
                    continue;
                }
                for (i, code) in self.codes.iter().enumerate() {
                    if usize::from(code[j]) == c {
                        candidates.insert(i);
                    }
                }
            }
        }

        Ok(candidates
            .into_iter()
            .filter_map(|i| {
                let dist = euclidean(&query.values, &self.db[i].values);
                (dist >= min_dist && dist <= max_dist).then(|| self.db[i].clone())
            })
            .collect())
    }
}

/// Estimated distance: the sum of per-subspace centroid distances.
fn adc_estimate(code: &CodeWord, table: &[Vec<f64>]) -> f64 {
    code.iter()
        .zip(table)
        .map(|(&c, row)| row[usize::from(c)])
        .sum()
}

impl VectorIndex for PqIndex {
    fn insert(&mut self, vec: Vector) -> Result<()> {
        self.ensure_trained()?;
        ensure_dim(self.dimension, vec.dim())?;
        if self.id_lookup.contains_key(&vec.id) {
            return Err(IndexError::Duplicate(vec.id));
        }

        self.id_lookup.insert(vec.id, self.db.len());
        self.codes.push(self.quantize(&vec));
        self.db.push(vec);
        Ok(())
    }

    /// Delete by id; coordinates are ignored.
    fn delete(&mut self, vec: &Vector) -> Result<()> {
        let Some(idx) = self.id_lookup.remove(&vec.id) else {
            return Err(IndexError::NotFound);
        };

        self.db.remove(idx);
        self.codes.remove(idx);
        for i in idx..self.db.len() {
            self.id_lookup.insert(self.db[i].id, i);
        }
        Ok(())
    }

    fn nearest(&self, query: &Vector) -> Result<Vector> {
        self.ensure_trained()?;
        ensure_dim(self.dimension, query.dim())?;

        let table = self.distance_table(&query.values);
        self.codes
            .iter()
            .enumerate()
            .map(|(i, code)| (adc_estimate(code, &table), i))
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, i)| self.db[i].clone())
            .ok_or(IndexError::Empty)
    }

    /// Raw ADC ranking; approximate by construction.
    fn k_nearest(&self, query: &Vector, k: usize) -> Result<Vec<Vector>> {
        ensure_k(k)?;
        self.ensure_trained()?;
        ensure_dim(self.dimension, query.dim())?;

        let table = self.distance_table(&query.values);
        let mut heap = BoundedHeap::new(k);
        for (i, code) in self.codes.iter().enumerate() {
            heap.push(adc_estimate(code, &table), i);
        }

        Ok(heap
            .into_sorted()
            .into_iter()
            .map(|(_, i)| self.db[i].clone())
            .collect())
    }

    fn vectors(&self) -> Vec<Vector> {
        self.db.clone()
    }
}

impl RangeSearch for PqIndex {
    fn search_within_range(&self, query: &Vector, radius: f64) -> Result<Vec<Vector>> {
        ensure_radius(radius)?;
        self.search_within_interval(query, 0.0, radius)
    }
}

impl Snapshot for PqIndex {
    fn save_to_file(&self, path: &Path) -> Result<()> {
        snapshot::save(path, IndexKind::Pq, self)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        snapshot::load(path, IndexKind::Pq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::euclidean_vec;

    fn small_params() -> PqParams {
        PqParams {
            num_subspaces: 2,
            codebook_size: 4,
            ..PqParams::default()
        }
    }

    fn training_set(count: usize, dim: usize) -> Vec<Vector> {
        let mut rng = StdRng::seed_from_u64(5);
        (0..count)
            .map(|i| Vector::random(&mut rng, i as i64, dim, -10.0, 10.0))
            .collect()
    }

    fn trained_index() -> PqIndex {
        let vectors = training_set(64, 4);
        let mut index = PqIndex::new(small_params()).unwrap().with_seed(11);
        index.train(&vectors, 25).unwrap();
        index.insert_batch(vectors).unwrap();
        index
    }

    #[test]
    fn queries_before_training_fail() {
        let index = PqIndex::new(small_params()).unwrap();
        let query = Vector::new(-1, vec![0.0; 4]);
        assert!(matches!(
            index.nearest(&query),
            Err(IndexError::UntrainedCodebook)
        ));
        assert!(matches!(
            index.k_nearest(&query, 3),
            Err(IndexError::UntrainedCodebook)
        ));
    }

    #[test]
    fn insert_before_training_fails() {
        let mut index = PqIndex::new(small_params()).unwrap();
        assert!(matches!(
            index.insert(Vector::new(0, vec![0.0; 4])),
            Err(IndexError::UntrainedCodebook)
        ));
    }

    #[test]
    fn dimension_must_divide_into_subspaces() {
        let mut index = PqIndex::new(PqParams {
            num_subspaces: 3,
            codebook_size: 2,
            ..PqParams::default()
        })
        .unwrap();
        let err = index.train(&training_set(8, 4), 5).unwrap_err();
        assert!(matches!(err, IndexError::InvalidParameter(_)));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut index = trained_index();
        assert!(matches!(
            index.insert(Vector::new(0, vec![1.0; 4])),
            Err(IndexError::Duplicate(0))
        ));
    }

    #[test]
    fn delete_shifts_the_id_lookup() {
        let mut index = trained_index();
        let len = index.len();

        index.delete(&Vector::new(10, vec![])).unwrap();
        assert_eq!(index.len(), len - 1);
        assert!(index.vectors().iter().all(|v| v.id != 10));

        // Later vectors are still deletable through the shifted lookup.
        index.delete(&Vector::new(63, vec![])).unwrap();
        assert_eq!(index.len(), len - 2);

        assert!(matches!(
            index.delete(&Vector::new(10, vec![])),
            Err(IndexError::NotFound)
        ));
    }

    #[test]
    fn k_nearest_returns_sorted_estimates() {
        let index = trained_index();
        let query = Vector::new(-1, vec![0.5, -0.5, 1.5, -1.5]);

        let hits = index.k_nearest(&query, 8).unwrap();
        assert_eq!(hits.len(), 8);
    }

    #[test]
    fn refined_search_is_exact_on_the_candidates() {
        let index = trained_index();
        let query = Vector::new(-1, vec![0.5, -0.5, 1.5, -1.5]);

        let hits = index.k_nearest_refined(&query, 5).unwrap();
        assert_eq!(hits.len(), 5);
        let dists: Vec<f64> = hits.iter().map(|v| euclidean_vec(&query, v)).collect();
        assert!(dists.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn concurrent_search_matches_the_serial_scan() {
        let index = trained_index();
        let query = Vector::new(-1, vec![2.0, -3.0, 0.0, 4.0]);

        let serial: Vec<i64> = index
            .k_nearest(&query, 10)
            .unwrap()
            .iter()
            .map(|v| v.id)
            .collect();
        let concurrent: Vec<i64> = index
            .k_nearest_concurrent(&query, 10)
            .unwrap()
            .iter()
            .map(|v| v.id)
            .collect();

        // Same estimate, same partition order: identical results up to
        // equal-distance ties.
        let serial_set: HashSet<i64> = serial.iter().copied().collect();
        let concurrent_set: HashSet<i64> = concurrent.iter().copied().collect();
        assert_eq!(serial_set, concurrent_set);
    }

    #[test]
    fn interval_search_filters_exactly() {
        let index = trained_index();
        let query = index.vectors()[7].clone();

        let hits = index.search_within_interval(&query, 0.0, 6.0).unwrap();
        assert!(hits.iter().all(|v| euclidean_vec(&query, v) <= 6.0));
        // The query is itself a stored vector, always within its own range.
        assert!(hits.iter().any(|v| v.id == query.id));

        assert!(matches!(
            index.search_within_interval(&query, 5.0, 1.0),
            Err(IndexError::InvalidParameter(_))
        ));
    }

    #[test]
    fn retraining_reencodes_stored_vectors() {
        let mut index = trained_index();
        let before = index.len();

        let fresh = training_set(64, 4);
        index.train(&fresh, 10).unwrap();
        assert_eq!(index.len(), before);

        // Codes must reference the new codebooks.
        let query = Vector::new(-1, vec![1.0, 1.0, 1.0, 1.0]);
        assert_eq!(index.k_nearest(&query, 4).unwrap().len(), 4);
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pq.snap");

        let index = trained_index();
        index.save_to_file(&path).unwrap();
        let loaded = PqIndex::load_from_file(&path).unwrap();

        assert_eq!(loaded.len(), index.len());
        let query = Vector::new(-1, vec![0.5, -0.5, 1.5, -1.5]);
        assert_eq!(
            loaded
                .k_nearest(&query, 6)
                .unwrap()
                .iter()
                .map(|v| v.id)
                .collect::<Vec<_>>(),
            index
                .k_nearest(&query, 6)
                .unwrap()
                .iter()
                .map(|v| v.id)
                .collect::<Vec<_>>()
        );
    }
}
