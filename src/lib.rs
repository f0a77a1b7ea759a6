//! vantage: exact and approximate nearest-neighbor indexes over dense
//! `f64` vectors under Euclidean distance.
//!
//! Six independent index structures share one capability contract
//! ([`VectorIndex`], [`RangeSearch`], [`Snapshot`]): insert and delete
//! identified vectors, query the single nearest, the top-k, or everything
//! within a radius, and round-trip the index state through an on-disk
//! snapshot. A client picks one index per collection.
//!
//! # Which Index Should I Use?
//!
//! | Situation | Recommendation |
//! |-----------|----------------|
//! | **Correctness baseline / tiny data** | [`BruteForce`] |
//! | **Low dimensions (d < 20), exact** | [`KdTree`] |
//! | **Medium dimensions, exact** | [`BallTree`] (batch-built) |
//! | **Generic metric pruning, exact** | [`VpTree`] (batch-built) |
//! | **Heavy insert/delete churn** | [`CoverTree`] |
//! | **Cheap approximate candidates** | [`LshIndex`] |
//! | **Large collections, approximate** | [`PqIndex`] |
//!
//! The trees answer exactly; LSH and PQ trade recall for speed. PQ's
//! [`PqIndex::k_nearest_refined`] re-scores an over-fetched candidate set
//! with true distances and is the recommended accurate path;
//! [`PqIndex::k_nearest_concurrent`] spreads the scan over all cores.
//!
//! # Determinism
//!
//! The randomized components (LSH reference points, PQ codebook training)
//! seed from entropy by default and accept a fixed seed through
//! `with_seed` for reproducible runs.
//!
//! ```
//! use vantage::{KdTree, Vector, VectorIndex};
//!
//! let mut tree = KdTree::new();
//! tree.insert(Vector::new(1, vec![0.0, 1.0]))?;
//! tree.insert(Vector::new(2, vec![3.0, 4.0]))?;
//!
//! let hit = tree.nearest(&Vector::new(-1, vec![2.5, 3.5]))?;
//! assert_eq!(hit.id, 2);
//! # Ok::<(), vantage::IndexError>(())
//! ```

pub mod brute;
pub mod distance;
pub mod error;
mod heap;
pub mod lsh;
pub mod pq;
mod snapshot;
pub mod traits;
pub mod trees;
pub mod vector;

pub use brute::BruteForce;
pub use error::{IndexError, Result};
pub use lsh::LshIndex;
pub use pq::{PqIndex, PqParams};
pub use traits::{RangeSearch, Snapshot, VectorIndex};
pub use trees::{BallTree, CoverTree, KdTree, VpTree};
pub use vector::Vector;
