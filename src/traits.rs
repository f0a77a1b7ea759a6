//! Capability traits shared by the index family.
//!
//! Each index implements the capabilities it supports; there is no common
//! base type. Generic code (the test oracle, benchmarks) bounds on the
//! traits it needs.

use crate::error::Result;
use crate::vector::Vector;
use std::path::Path;

/// Core mutation and nearest-neighbor contract.
pub trait VectorIndex {
    /// Insert one vector.
    fn insert(&mut self, vec: Vector) -> Result<()>;

    /// Delete the vector located by coordinate equality
    /// ([`Vector::approx_eq`]); PQ deletes by id instead.
    fn delete(&mut self, vec: &Vector) -> Result<()>;

    /// The single closest vector to `query` by Euclidean distance.
    fn nearest(&self, query: &Vector) -> Result<Vector>;

    /// At most `k` vectors sorted ascending by distance to `query`.
    ///
    /// An index holding `n < k` vectors returns all `n`, except LSH which
    /// may fail with `Insufficient` when its candidate set is too small.
    fn k_nearest(&self, query: &Vector, k: usize) -> Result<Vec<Vector>>;

    /// Every currently indexed vector exactly once, order unspecified.
    fn vectors(&self) -> Vec<Vector>;

    /// Insert a batch; the first failure aborts without rolling back
    /// earlier successes.
    fn insert_batch(&mut self, vecs: Vec<Vector>) -> Result<()> {
        for vec in vecs {
            self.insert(vec)?;
        }
        Ok(())
    }

    /// Delete a batch; the first failure aborts without rolling back
    /// earlier successes.
    fn delete_batch(&mut self, vecs: &[Vector]) -> Result<()> {
        for vec in vecs {
            self.delete(vec)?;
        }
        Ok(())
    }
}

/// Radius search capability.
pub trait RangeSearch {
    /// Every indexed vector within `radius` of `query`, unordered.
    fn search_within_range(&self, query: &Vector, radius: f64) -> Result<Vec<Vector>>;
}

/// Durable point-in-time snapshots.
///
/// The format is an opaque byte stream produced and consumed by the same
/// implementation; partial writes leave the destination undefined.
pub trait Snapshot: Sized {
    /// Write the complete index state to `path`.
    fn save_to_file(&self, path: &Path) -> Result<()>;

    /// Reconstruct an index from a file previously written by
    /// [`Snapshot::save_to_file`].
    fn load_from_file(path: &Path) -> Result<Self>;
}
