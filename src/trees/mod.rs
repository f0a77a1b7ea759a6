//! Metric-tree indexes.
//!
//! Four exact-by-construction trees over the same branch-and-bound skeleton:
//! descend the promising side first, keep the k best candidates in a bounded
//! heap, and prune a subtree when its distance lower bound cannot beat the
//! current worst candidate.

pub mod balltree;
pub mod covertree;
pub mod kdtree;
pub mod vptree;

pub use balltree::BallTree;
pub use covertree::CoverTree;
pub use kdtree::KdTree;
pub use vptree::VpTree;
