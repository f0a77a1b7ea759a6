//! Locality-sensitive hashing index.
//!
//! `L` hash tables, each keyed by a distance-based hash: table `i` draws a
//! reference point `r_i` uniformly from `[0, 1)²` and hashes a vector to
//! `floor(dist(r_i, x))`. Reference points are 2-dimensional regardless of
//! the input dimension, so for d > 2 the hash is a projection onto the
//! first two coordinates. That weakens bucket selectivity in higher
//! dimensions but keeps hash values reproducible from the stored reference
//! points alone, which is what snapshots rely on.
//!
//! Buckets are capped at `bucket_size`; a full bucket silently drops the
//! insert for that table only, so a vector's recall degrades gracefully as
//! tables saturate.
//!
//! Queries are resolved against the union of the query's buckets across all
//! tables, deduplicated by id, then scored exactly.
//!
//! # References
//!
//! - Indyk & Motwani (1998): "Approximate nearest neighbors: towards
//!   removing the curse of dimensionality"

use crate::distance::euclidean_vec;
use crate::error::{ensure_k, ensure_radius, IndexError, Result};
use crate::snapshot::{self, IndexKind};
use crate::traits::{RangeSearch, Snapshot, VectorIndex};
use crate::vector::{ensure_dim, Vector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Dimensionality of the reference points the hash functions are built on.
const REFERENCE_DIM: usize = 2;

/// Multi-table LSH index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LshIndex {
    /// One bucket map per hash function.
    tables: Vec<HashMap<i64, Vec<Vector>>>,
    /// The hash functions, materialized as their reference points.
    reference_points: Vec<Vector>,
    bucket_size: usize,
    dimension: Option<usize>,
}

impl LshIndex {
    /// Create an index with `num_tables` hash tables and a per-bucket cap
    /// of `bucket_size`, seeding the reference points from entropy.
    pub fn new(num_tables: usize, bucket_size: usize) -> Result<Self> {
        if num_tables == 0 {
            return Err(IndexError::InvalidParameter(
                "num_tables must be at least 1".to_string(),
            ));
        }
        if bucket_size == 0 {
            return Err(IndexError::InvalidParameter(
                "bucket_size must be at least 1".to_string(),
            ));
        }

        let mut rng = StdRng::seed_from_u64(rand::rng().random());
        Ok(Self {
            tables: vec![HashMap::new(); num_tables],
            reference_points: draw_reference_points(&mut rng, num_tables),
            bucket_size,
            dimension: None,
        })
    }

    /// Redraw the reference points from a deterministic seed.
    ///
    /// Call before the first insert: rehashing is not retroactive.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        self.reference_points = draw_reference_points(&mut rng, self.tables.len());
        self
    }

    /// Number of hash tables.
    #[must_use]
    pub fn num_tables(&self) -> usize {
        self.tables.len()
    }

    /// Per-bucket capacity.
    #[must_use]
    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    fn hash(&self, table: usize, vec: &Vector) -> i64 {
        euclidean_vec(&self.reference_points[table], vec).floor() as i64
    }

    /// Union of the query's buckets across all tables, deduplicated by id.
    fn candidates(&self, query: &Vector) -> Vec<Vector> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (i, table) in self.tables.iter().enumerate() {
            let Some(bucket) = table.get(&self.hash(i, query)) else {
                continue;
            };
            for vec in bucket {
                if seen.insert(vec.id) {
                    out.push(vec.clone());
                }
            }
        }
        out
    }
}

fn draw_reference_points(rng: &mut StdRng, count: usize) -> Vec<Vector> {
    (0..count)
        .map(|i| Vector::random(rng, i as i64, REFERENCE_DIM, 0.0, 1.0))
        .collect()
}

impl VectorIndex for LshIndex {
    fn insert(&mut self, vec: Vector) -> Result<()> {
        ensure_dim(self.dimension, vec.dim())?;
        self.dimension.get_or_insert(vec.dim());

        for i in 0..self.tables.len() {
            let key = self.hash(i, &vec);
            let bucket = self.tables[i].entry(key).or_default();
            // A full bucket drops the insert for this table only.
            if bucket.len() >= self.bucket_size {
                continue;
            }
            bucket.push(vec.clone());
        }
        Ok(())
    }

    /// Delete by id from every bucket the vector hashes to.
    fn delete(&mut self, vec: &Vector) -> Result<()> {
        ensure_dim(self.dimension, vec.dim())?;

        let mut deleted = false;
        for i in 0..self.tables.len() {
            let key = self.hash(i, vec);
            let Some(bucket) = self.tables[i].get_mut(&key) else {
                continue;
            };
            let before = bucket.len();
            bucket.retain(|v| v.id != vec.id);
            if bucket.len() < before {
                deleted = true;
            }
            if bucket.is_empty() {
                self.tables[i].remove(&key);
            }
        }

        if !deleted {
            return Err(IndexError::NotFound);
        }
        Ok(())
    }

    fn nearest(&self, query: &Vector) -> Result<Vector> {
        ensure_dim(self.dimension, query.dim())?;
        self.candidates(query)
            .into_iter()
            .map(|v| (euclidean_vec(query, &v), v))
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, v)| v)
            .ok_or(IndexError::Empty)
    }

    fn k_nearest(&self, query: &Vector, k: usize) -> Result<Vec<Vector>> {
        ensure_k(k)?;
        ensure_dim(self.dimension, query.dim())?;

        let mut candidates = self.candidates(query);
        if candidates.len() < k {
            return Err(IndexError::Insufficient {
                needed: k,
                got: candidates.len(),
            });
        }

        candidates.sort_by(|a, b| euclidean_vec(query, a).total_cmp(&euclidean_vec(query, b)));
        candidates.truncate(k);
        Ok(candidates)
    }

    fn vectors(&self) -> Vec<Vector> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for table in &self.tables {
            for bucket in table.values() {
                for vec in bucket {
                    if seen.insert(vec.id) {
                        out.push(vec.clone());
                    }
                }
            }
        }
        out
    }
}

impl RangeSearch for LshIndex {
    fn search_within_range(&self, query: &Vector, radius: f64) -> Result<Vec<Vector>> {
        ensure_radius(radius)?;
        ensure_dim(self.dimension, query.dim())?;

        let results: Vec<Vector> = self
            .candidates(query)
            .into_iter()
            .filter(|v| euclidean_vec(query, v) <= radius)
            .collect();

        if results.is_empty() {
            return Err(IndexError::NoMatch);
        }
        Ok(results)
    }
}

impl Snapshot for LshIndex {
    fn save_to_file(&self, path: &Path) -> Result<()> {
        snapshot::save(path, IndexKind::Lsh, self)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        snapshot::load(path, IndexKind::Lsh)
    }
}
