//! Ball-tree index.
//!
//! Space partitioning by hyperspheres: internal nodes carry the bounding
//! sphere of their subtree, leaves carry a single vector. Preferable to the
//! KD-tree once dimensionality grows past ~20.
//!
//! Batch construction splits on the first vector's first coordinate — a
//! cheap pivot rule that keeps both sides non-empty but makes no balance
//! promise. Incremental inserts descend by ball containment and do not
//! re-expand ancestor radii, so bulk data should go through
//! [`BallTree::with_vectors`].
//!
//! Deleting clears the leaf's payload and leaves the empty leaf in place;
//! traversals skip such leaves.
//!
//! # References
//!
//! - Omohundro (1989): "Five balltree construction algorithms"

use crate::distance::euclidean;
use crate::error::{ensure_k, ensure_radius, IndexError, Result};
use crate::heap::BoundedHeap;
use crate::snapshot::{self, IndexKind};
use crate::traits::{RangeSearch, Snapshot, VectorIndex};
use crate::vector::{ensure_dim, Vector};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Ball-tree over owned child nodes.
#[derive(Debug)]
pub struct BallTree {
    root: Option<Box<BallNode>>,
    dimension: Option<usize>,
    len: usize,
}

#[derive(Debug)]
enum BallNode {
    Internal {
        center: Vec<f64>,
        radius: f64,
        left: Option<Box<BallNode>>,
        right: Option<Box<BallNode>>,
    },
    /// `payload: None` marks a leaf whose vector was deleted.
    Leaf { payload: Option<Vector> },
}

impl BallTree {
    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: None,
            dimension: None,
            len: 0,
        }
    }

    /// Bulk-build a tree from `vectors`.
    pub fn with_vectors(vectors: Vec<Vector>) -> Result<Self> {
        let mut dimension = None;
        for vec in &vectors {
            ensure_dim(dimension, vec.dim())?;
            dimension.get_or_insert(vec.dim());
        }

        let len = vectors.len();
        let root = if vectors.is_empty() {
            None
        } else {
            Some(Box::new(build_node(vectors)))
        };

        Ok(Self {
            root,
            dimension,
            len,
        })
    }

    /// Number of stored vectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the tree holds no vectors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for BallTree {
    fn default() -> Self {
        Self::new()
    }
}

fn build_node(vectors: Vec<Vector>) -> BallNode {
    if vectors.len() <= 1 {
        return BallNode::Leaf {
            payload: vectors.into_iter().next(),
        };
    }

    let (center, radius) = bounding_sphere(&vectors);
    let (left, right) = split_first_coord(vectors);

    BallNode::Internal {
        center,
        radius,
        left: Some(Box::new(build_node(left))),
        right: Some(Box::new(build_node(right))),
    }
}

/// Coordinate-wise mean and the maximum distance from it.
fn bounding_sphere(vectors: &[Vector]) -> (Vec<f64>, f64) {
    let dim = vectors[0].dim();
    let mut center = vec![0.0; dim];
    for vec in vectors {
        for (c, v) in center.iter_mut().zip(&vec.values) {
            *c += v;
        }
    }
    let count = vectors.len() as f64;
    for c in center.iter_mut() {
        *c /= count;
    }

    let radius = vectors
        .iter()
        .map(|v| euclidean(&center, &v.values))
        .fold(0.0, f64::max);

    (center, radius)
}

/// Partition on the first vector's first coordinate. The pivot vector joins
/// the smaller side, so both halves are non-empty for any input of two or
/// more vectors.
fn split_first_coord(mut vectors: Vec<Vector>) -> (Vec<Vector>, Vec<Vector>) {
    let pivot_vec = vectors.remove(0);
    let pivot = pivot_vec.values[0];

    let mut left = Vec::new();
    let mut right = Vec::new();
    for vec in vectors {
        if vec.values[0] < pivot {
            left.push(vec);
        } else {
            right.push(vec);
        }
    }

    if left.len() < right.len() {
        left.push(pivot_vec);
    } else {
        right.push(pivot_vec);
    }

    (left, right)
}

fn insert_node(node: &mut BallNode, vec: Vector) {
    match node {
        BallNode::Leaf { payload } => match payload.take() {
            // A delete left this leaf empty; reclaim it.
            None => *payload = Some(vec),
            Some(existing) => {
                let pair = vec![existing, vec];
                let (center, radius) = bounding_sphere(&pair);
                let (left, right) = split_first_coord(pair);
                *node = BallNode::Internal {
                    center,
                    radius,
                    left: Some(Box::new(build_node(left))),
                    right: Some(Box::new(build_node(right))),
                };
            }
        },
        BallNode::Internal {
            center,
            radius,
            left,
            right,
        } => {
            let child = if euclidean(center, &vec.values) <= *radius {
                left
            } else {
                right
            };
            match child {
                Some(child) => insert_node(child, vec),
                None => {
                    *child = Some(Box::new(BallNode::Leaf { payload: Some(vec) }));
                }
            }
        }
    }
}

/// Lower bound on the distance from `query` to any vector under `node`.
fn min_bound(node: Option<&BallNode>, query: &[f64]) -> f64 {
    match node {
        None | Some(BallNode::Leaf { payload: None }) => f64::INFINITY,
        Some(BallNode::Leaf { payload: Some(p) }) => euclidean(query, &p.values),
        Some(BallNode::Internal { center, radius, .. }) => {
            (euclidean(query, center) - radius).max(0.0)
        }
    }
}

fn k_nearest_node<'a>(node: &'a BallNode, query: &[f64], heap: &mut BoundedHeap<&'a Vector>) {
    match node {
        BallNode::Leaf { payload } => {
            if let Some(p) = payload {
                heap.push(euclidean(query, &p.values), p);
            }
        }
        BallNode::Internal { left, right, .. } => {
            let left_bound = min_bound(left.as_deref(), query);
            let right_bound = min_bound(right.as_deref(), query);

            let (near, far, far_bound) = if left_bound < right_bound {
                (left, right, right_bound)
            } else {
                (right, left, left_bound)
            };

            if let Some(near) = near.as_deref() {
                k_nearest_node(near, query, heap);
            }
            if far_bound < heap.tau() {
                if let Some(far) = far.as_deref() {
                    k_nearest_node(far, query, heap);
                }
            }
        }
    }
}

fn delete_node(node: &mut BallNode, target: &Vector) -> bool {
    match node {
        BallNode::Leaf { payload } => {
            if payload.as_ref().is_some_and(|p| p.approx_eq(target)) {
                *payload = None;
                true
            } else {
                false
            }
        }
        BallNode::Internal { left, right, .. } => {
            left.as_deref_mut().is_some_and(|l| delete_node(l, target))
                || right.as_deref_mut().is_some_and(|r| delete_node(r, target))
        }
    }
}

fn collect(node: &BallNode, out: &mut Vec<Vector>) {
    match node {
        BallNode::Leaf { payload } => {
            if let Some(p) = payload {
                out.push(p.clone());
            }
        }
        BallNode::Internal { left, right, .. } => {
            if let Some(left) = left.as_deref() {
                collect(left, out);
            }
            if let Some(right) = right.as_deref() {
                collect(right, out);
            }
        }
    }
}

fn collect_in_range(node: &BallNode, query: &[f64], radius: f64, out: &mut Vec<Vector>) {
    match node {
        BallNode::Leaf { payload } => {
            if let Some(p) = payload {
                if euclidean(query, &p.values) <= radius {
                    out.push(p.clone());
                }
            }
        }
        BallNode::Internal { left, right, .. } => {
            if let Some(left) = left.as_deref() {
                collect_in_range(left, query, radius, out);
            }
            if let Some(right) = right.as_deref() {
                collect_in_range(right, query, radius, out);
            }
        }
    }
}

impl VectorIndex for BallTree {
    fn insert(&mut self, vec: Vector) -> Result<()> {
        ensure_dim(self.dimension, vec.dim())?;
        self.dimension.get_or_insert(vec.dim());

        match self.root.as_deref_mut() {
            None => {
                self.root = Some(Box::new(BallNode::Leaf { payload: Some(vec) }));
            }
            Some(root) => insert_node(root, vec),
        }
        self.len += 1;
        Ok(())
    }

    fn delete(&mut self, vec: &Vector) -> Result<()> {
        ensure_dim(self.dimension, vec.dim())?;
        let deleted = self
            .root
            .as_deref_mut()
            .is_some_and(|root| delete_node(root, vec));
        if !deleted {
            return Err(IndexError::NotFound);
        }
        self.len -= 1;
        Ok(())
    }

    /// Defined as the first element of `k_nearest(query, 1)`, so the two
    /// entry points can never disagree.
    fn nearest(&self, query: &Vector) -> Result<Vector> {
        self.k_nearest(query, 1)?
            .into_iter()
            .next()
            .ok_or(IndexError::Empty)
    }

    fn k_nearest(&self, query: &Vector, k: usize) -> Result<Vec<Vector>> {
        ensure_k(k)?;
        ensure_dim(self.dimension, query.dim())?;

        let mut heap = BoundedHeap::new(k);
        if let Some(root) = self.root.as_deref() {
            k_nearest_node(root, &query.values, &mut heap);
        }

        Ok(heap
            .into_sorted()
            .into_iter()
            .map(|(_, v)| v.clone())
            .collect())
    }

    fn vectors(&self) -> Vec<Vector> {
        let mut out = Vec::with_capacity(self.len);
        if let Some(root) = self.root.as_deref() {
            collect(root, &mut out);
        }
        out
    }
}

impl RangeSearch for BallTree {
    fn search_within_range(&self, query: &Vector, radius: f64) -> Result<Vec<Vector>> {
        ensure_radius(radius)?;
        ensure_dim(self.dimension, query.dim())?;

        let mut out = Vec::new();
        if let Some(root) = self.root.as_deref() {
            collect_in_range(root, &query.values, radius, &mut out);
        }
        Ok(out)
    }
}

#[derive(Serialize, Deserialize)]
struct BallTreeState {
    dimension: Option<usize>,
    /// Preorder node list; children always carry higher indexes than their
    /// parent.
    nodes: Vec<BallNodeState>,
}

#[derive(Serialize, Deserialize)]
enum BallNodeState {
    Internal {
        center: Vec<f64>,
        radius: f64,
        left: Option<u32>,
        right: Option<u32>,
    },
    Leaf { payload: Option<Vector> },
}

fn flatten(node: &BallNode, nodes: &mut Vec<BallNodeState>) -> u32 {
    let idx = nodes.len() as u32;
    match node {
        BallNode::Leaf { payload } => {
            nodes.push(BallNodeState::Leaf {
                payload: payload.clone(),
            });
        }
        BallNode::Internal {
            center,
            radius,
            left,
            right,
        } => {
            nodes.push(BallNodeState::Internal {
                center: center.clone(),
                radius: *radius,
                left: None,
                right: None,
            });
            let left_idx = left.as_deref().map(|l| flatten(l, nodes));
            let right_idx = right.as_deref().map(|r| flatten(r, nodes));
            if let BallNodeState::Internal { left, right, .. } = &mut nodes[idx as usize] {
                *left = left_idx;
                *right = right_idx;
            }
        }
    }
    idx
}

fn rebuild(nodes: &[BallNodeState], idx: usize) -> Result<Box<BallNode>> {
    let node = match &nodes[idx] {
        BallNodeState::Leaf { payload } => BallNode::Leaf {
            payload: payload.clone(),
        },
        BallNodeState::Internal {
            center,
            radius,
            left,
            right,
        } => BallNode::Internal {
            center: center.clone(),
            radius: *radius,
            left: rebuild_child(nodes, *left, idx)?,
            right: rebuild_child(nodes, *right, idx)?,
        },
    };
    Ok(Box::new(node))
}

fn rebuild_child(
    nodes: &[BallNodeState],
    child: Option<u32>,
    parent: usize,
) -> Result<Option<Box<BallNode>>> {
    match child {
        None => Ok(None),
        Some(idx) => {
            let idx = idx as usize;
            if idx <= parent || idx >= nodes.len() {
                return Err(IndexError::Codec(format!(
                    "invalid child index {idx} under node {parent}"
                )));
            }
            rebuild(nodes, idx).map(Some)
        }
    }
}

impl Snapshot for BallTree {
    fn save_to_file(&self, path: &Path) -> Result<()> {
        let mut nodes = Vec::new();
        if let Some(root) = self.root.as_deref() {
            flatten(root, &mut nodes);
        }
        let state = BallTreeState {
            dimension: self.dimension,
            nodes,
        };
        snapshot::save(path, IndexKind::Ball, &state)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let state: BallTreeState = snapshot::load(path, IndexKind::Ball)?;
        let root = if state.nodes.is_empty() {
            None
        } else {
            Some(rebuild(&state.nodes, 0)?)
        };
        let mut tree = Self {
            root,
            dimension: state.dimension,
            len: 0,
        };
        tree.len = tree.vectors().len();
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::euclidean_vec;

    fn sample() -> BallTree {
        BallTree::with_vectors(vec![
            Vector::new(0, vec![2.0, 3.0]),
            Vector::new(1, vec![5.0, 4.0]),
            Vector::new(2, vec![9.0, 6.0]),
        ])
        .unwrap()
    }

    #[test]
    fn range_search_finds_exactly_the_ball() {
        let tree = sample();
        let hits = tree
            .search_within_range(&Vector::new(-1, vec![5.0, 5.0]), 3.0)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 1);
    }

    #[test]
    fn nearest_agrees_with_k_nearest() {
        let tree = sample();
        let query = Vector::new(-1, vec![8.0, 5.0]);
        let nearest = tree.nearest(&query).unwrap();
        let top = tree.k_nearest(&query, 1).unwrap();
        assert_eq!(nearest.id, top[0].id);
    }

    #[test]
    fn k_nearest_is_sorted_ascending() {
        let mut tree = sample();
        tree.insert(Vector::new(3, vec![4.0, 7.0])).unwrap();
        tree.insert(Vector::new(4, vec![8.0, 1.0])).unwrap();

        let query = Vector::new(-1, vec![6.0, 4.0]);
        let hits = tree.k_nearest(&query, 5).unwrap();
        assert_eq!(hits.len(), 5);
        let dists: Vec<f64> = hits.iter().map(|v| euclidean_vec(&query, v)).collect();
        assert!(dists.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn delete_leaves_an_empty_leaf_that_insert_reclaims() {
        let mut tree = sample();
        tree.delete(&Vector::new(2, vec![9.0, 6.0])).unwrap();
        assert_eq!(tree.len(), 2);
        assert!(tree.vectors().iter().all(|v| v.id != 2));

        tree.insert(Vector::new(5, vec![9.5, 6.5])).unwrap();
        assert_eq!(tree.len(), 3);
        assert!(tree.vectors().iter().any(|v| v.id == 5));
    }

    #[test]
    fn delete_missing_vector_fails() {
        let mut tree = sample();
        assert!(matches!(
            tree.delete(&Vector::new(0, vec![0.0, 0.0])),
            Err(IndexError::NotFound)
        ));
    }

    #[test]
    fn incremental_build_from_empty() {
        let mut tree = BallTree::new();
        for (i, coords) in [[1.0, 1.0], [2.0, 2.0], [3.0, 3.0], [10.0, 10.0]]
            .iter()
            .enumerate()
        {
            tree.insert(Vector::new(i as i64, coords.to_vec())).unwrap();
        }
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.vectors().len(), 4);

        let hit = tree.nearest(&Vector::new(-1, vec![9.0, 9.0])).unwrap();
        assert_eq!(hit.id, 3);
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ball.snap");

        let mut tree = sample();
        tree.delete(&Vector::new(0, vec![2.0, 3.0])).unwrap();
        tree.save_to_file(&path).unwrap();

        let loaded = BallTree::load_from_file(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        let query = Vector::new(-1, vec![5.0, 5.0]);
        assert_eq!(
            loaded.nearest(&query).unwrap().id,
            tree.nearest(&query).unwrap().id
        );
    }
}
