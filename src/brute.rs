//! Brute-force linear-scan index.
//!
//! The exact oracle: every query walks the full store. Quadratic in
//! aggregate and unbeatable below a few thousand vectors, it is the
//! reference the approximate indexes are tested against and the exact
//! refinement stage behind [`crate::pq::PqIndex::k_nearest_refined`].

use crate::distance::euclidean_vec;
use crate::error::{ensure_k, ensure_radius, IndexError, Result};
use crate::snapshot::{self, IndexKind};
use crate::traits::{RangeSearch, Snapshot, VectorIndex};
use crate::vector::{ensure_dim, Vector};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Insertion-ordered exact index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BruteForce {
    data: Vec<Vector>,
    dimension: Option<usize>,
}

impl BruteForce {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an index holding `vectors`, preserving their order.
    pub fn with_vectors(vectors: Vec<Vector>) -> Result<Self> {
        let mut index = Self::new();
        index.insert_batch(vectors)?;
        Ok(index)
    }

    /// Number of stored vectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the index holds no vectors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl VectorIndex for BruteForce {
    fn insert(&mut self, vec: Vector) -> Result<()> {
        ensure_dim(self.dimension, vec.dim())?;
        self.dimension.get_or_insert(vec.dim());
        self.data.push(vec);
        Ok(())
    }

    fn delete(&mut self, vec: &Vector) -> Result<()> {
        ensure_dim(self.dimension, vec.dim())?;
        match self.data.iter().position(|v| v.approx_eq(vec)) {
            Some(i) => {
                self.data.remove(i);
                Ok(())
            }
            None => Err(IndexError::NotFound),
        }
    }

    fn nearest(&self, query: &Vector) -> Result<Vector> {
        ensure_dim(self.dimension, query.dim())?;
        self.data
            .iter()
            .map(|v| (euclidean_vec(query, v), v))
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, v)| v.clone())
            .ok_or(IndexError::Empty)
    }

    fn k_nearest(&self, query: &Vector, k: usize) -> Result<Vec<Vector>> {
        ensure_k(k)?;
        ensure_dim(self.dimension, query.dim())?;

        let mut scored: Vec<(f64, &Vector)> = self
            .data
            .iter()
            .map(|v| (euclidean_vec(query, v), v))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        scored.truncate(k);

        Ok(scored.into_iter().map(|(_, v)| v.clone()).collect())
    }

    fn vectors(&self) -> Vec<Vector> {
        self.data.clone()
    }
}

impl RangeSearch for BruteForce {
    fn search_within_range(&self, query: &Vector, radius: f64) -> Result<Vec<Vector>> {
        ensure_radius(radius)?;
        ensure_dim(self.dimension, query.dim())?;

        let results: Vec<Vector> = self
            .data
            .iter()
            .filter(|v| euclidean_vec(query, v) <= radius)
            .cloned()
            .collect();

        if results.is_empty() {
            return Err(IndexError::NoMatch);
        }
        Ok(results)
    }
}

impl Snapshot for BruteForce {
    fn save_to_file(&self, path: &Path) -> Result<()> {
        snapshot::save(path, IndexKind::Brute, self)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        snapshot::load(path, IndexKind::Brute)
    }
}
