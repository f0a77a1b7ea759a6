//! KD-tree index.
//!
//! Axis-aligned binary space partitioning; the splitting axis cycles with
//! depth. Exact for nearest, k-NN, and range queries, and the best pick of
//! the tree family for low dimensions (d < 20).
//!
//! The tree is built by repeated insertion, so its shape depends on insert
//! order; there is no bulk median partitioning step.
//!
//! # References
//!
//! - Bentley (1975): "Multidimensional binary search trees used for
//!   associative searching"

use crate::distance::euclidean;
use crate::error::{ensure_k, ensure_radius, IndexError, Result};
use crate::heap::BoundedHeap;
use crate::snapshot::{self, IndexKind};
use crate::traits::{RangeSearch, Snapshot, VectorIndex};
use crate::vector::{ensure_dim, Vector};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// KD-tree over owned child nodes.
#[derive(Debug)]
pub struct KdTree {
    root: Option<Box<KdNode>>,
    dimension: Option<usize>,
    len: usize,
}

#[derive(Debug)]
struct KdNode {
    vector: Vector,
    /// Splitting axis; equals depth mod d by construction.
    axis: usize,
    left: Option<Box<KdNode>>,
    right: Option<Box<KdNode>>,
}

impl KdTree {
    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: None,
            dimension: None,
            len: 0,
        }
    }

    /// Create a tree by inserting `vectors` in order.
    pub fn with_vectors(vectors: Vec<Vector>) -> Result<Self> {
        let mut tree = Self::new();
        tree.insert_batch(vectors)?;
        Ok(tree)
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

impl Default for KdTree {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_node(slot: &mut Option<Box<KdNode>>, vec: Vector, axis: usize, dim: usize) {
    match slot {
        None => {
            *slot = Some(Box::new(KdNode {
                vector: vec,
                axis,
                left: None,
                right: None,
            }));
        }
        Some(node) => {
            let next = (node.axis + 1) % dim;
            if vec.values[node.axis] < node.vector.values[node.axis] {
                insert_node(&mut node.left, vec, next, dim);
            } else {
                insert_node(&mut node.right, vec, next, dim);
            }
        }
    }
}

fn nearest_node<'a>(
    node: Option<&'a KdNode>,
    query: &[f64],
    mut best: Option<(f64, &'a Vector)>,
) -> Option<(f64, &'a Vector)> {
    let Some(node) = node else {
        return best;
    };

    let dist = euclidean(&node.vector.values, query);
    if best.map_or(true, |(b, _)| dist < b) {
        best = Some((dist, &node.vector));
    }

    let (near, far) = if query[node.axis] < node.vector.values[node.axis] {
        (node.left.as_deref(), node.right.as_deref())
    } else {
        (node.right.as_deref(), node.left.as_deref())
    };

    best = nearest_node(near, query, best);

    // The far half-space can only improve on the best candidate when the
    // splitting plane is closer than it.
    let plane = (query[node.axis] - node.vector.values[node.axis]).abs();
    if best.map_or(true, |(b, _)| plane < b) {
        best = nearest_node(far, query, best);
    }

    best
}

fn k_nearest_node<'a>(node: Option<&'a KdNode>, query: &[f64], heap: &mut BoundedHeap<&'a Vector>) {
    let Some(node) = node else {
        return;
    };

    heap.push(euclidean(&node.vector.values, query), &node.vector);

    let (near, far) = if query[node.axis] > node.vector.values[node.axis] {
        (node.right.as_deref(), node.left.as_deref())
    } else {
        (node.left.as_deref(), node.right.as_deref())
    };

    k_nearest_node(near, query, heap);

    if (node.vector.values[node.axis] - query[node.axis]).abs() < heap.tau() {
        k_nearest_node(far, query, heap);
    }
}

/// Node with the minimum coordinate on `axis` in the subtree.
fn find_min<'a>(node: &'a KdNode, axis: usize) -> &'a KdNode {
    if node.axis == axis {
        // The right subtree cannot hold a smaller value on this axis.
        match node.left.as_deref() {
            None => node,
            Some(left) => find_min(left, axis),
        }
    } else {
        let mut min = node;
        if let Some(left) = node.left.as_deref() {
            let candidate = find_min(left, axis);
            if candidate.vector.values[axis] < min.vector.values[axis] {
                min = candidate;
            }
        }
        if let Some(right) = node.right.as_deref() {
            let candidate = find_min(right, axis);
            if candidate.vector.values[axis] < min.vector.values[axis] {
                min = candidate;
            }
        }
        min
    }
}

fn delete_node(node: Option<Box<KdNode>>, target: &Vector) -> (Option<Box<KdNode>>, bool) {
    let Some(mut node) = node else {
        return (None, false);
    };

    if node.vector.approx_eq(target) {
        if let Some(right) = node.right.as_deref() {
            // Replace with the right subtree's minimum on this node's axis,
            // then remove that minimum from the right subtree.
            let replacement = find_min(right, node.axis).vector.clone();
            let (new_right, _) = delete_node(node.right.take(), &replacement);
            node.right = new_right;
            node.vector = replacement;
            (Some(node), true)
        } else if node.left.is_some() {
            (node.left.take(), true)
        } else {
            (None, true)
        }
    } else if target.values[node.axis] < node.vector.values[node.axis] {
        let (new_left, deleted) = delete_node(node.left.take(), target);
        node.left = new_left;
        (Some(node), deleted)
    } else {
        let (new_right, deleted) = delete_node(node.right.take(), target);
        node.right = new_right;
        (Some(node), deleted)
    }
}

fn collect(node: Option<&KdNode>, out: &mut Vec<Vector>) {
    let Some(node) = node else {
        return;
    };
    out.push(node.vector.clone());
    collect(node.left.as_deref(), out);
    collect(node.right.as_deref(), out);
}

fn collect_in_range(node: Option<&KdNode>, query: &[f64], radius: f64, out: &mut Vec<Vector>) {
    let Some(node) = node else {
        return;
    };

    if euclidean(&node.vector.values, query) <= radius {
        out.push(node.vector.clone());
    }

    let split = node.vector.values[node.axis];
    // Left holds values below the plane, right holds values at or above it;
    // recurse only where the query ball overlaps.
    if query[node.axis] - radius <= split {
        collect_in_range(node.left.as_deref(), query, radius, out);
    }
    if query[node.axis] + radius >= split {
        collect_in_range(node.right.as_deref(), query, radius, out);
    }
}

impl VectorIndex for KdTree {
    fn insert(&mut self, vec: Vector) -> Result<()> {
        ensure_dim(self.dimension, vec.dim())?;
        let dim = *self.dimension.get_or_insert(vec.dim());
        insert_node(&mut self.root, vec, 0, dim);
        self.len += 1;
        Ok(())
    }

    fn delete(&mut self, vec: &Vector) -> Result<()> {
        ensure_dim(self.dimension, vec.dim())?;
        let (new_root, deleted) = delete_node(self.root.take(), vec);
        self.root = new_root;
        if !deleted {
            return Err(IndexError::NotFound);
        }
        self.len -= 1;
        Ok(())
    }

    fn nearest(&self, query: &Vector) -> Result<Vector> {
        ensure_dim(self.dimension, query.dim())?;
        nearest_node(self.root.as_deref(), &query.values, None)
            .map(|(_, v)| v.clone())
            .ok_or(IndexError::Empty)
    }

    fn k_nearest(&self, query: &Vector, k: usize) -> Result<Vec<Vector>> {
        ensure_k(k)?;
        ensure_dim(self.dimension, query.dim())?;

        let mut heap = BoundedHeap::new(k);
        k_nearest_node(self.root.as_deref(), &query.values, &mut heap);

        Ok(heap
            .into_sorted()
            .into_iter()
            .map(|(_, v)| v.clone())
            .collect())
    }

    fn vectors(&self) -> Vec<Vector> {
        let mut out = Vec::with_capacity(self.len);
        collect(self.root.as_deref(), &mut out);
        out
    }
}

impl RangeSearch for KdTree {
    fn search_within_range(&self, query: &Vector, radius: f64) -> Result<Vec<Vector>> {
        ensure_radius(radius)?;
        ensure_dim(self.dimension, query.dim())?;

        let mut out = Vec::new();
        collect_in_range(self.root.as_deref(), &query.values, radius, &mut out);
        Ok(out)
    }
}

#[derive(Serialize, Deserialize)]
struct KdTreeState {
    dimension: Option<usize>,
    /// Preorder node list; the root, when present, is index 0 and children
    /// always carry higher indexes than their parent.
    nodes: Vec<KdNodeState>,
}

#[derive(Serialize, Deserialize)]
struct KdNodeState {
    vector: Vector,
    axis: u32,
    left: Option<u32>,
    right: Option<u32>,
}

fn flatten(node: &KdNode, nodes: &mut Vec<KdNodeState>) -> u32 {
    let idx = nodes.len() as u32;
    nodes.push(KdNodeState {
        vector: node.vector.clone(),
        axis: node.axis as u32,
        left: None,
        right: None,
    });
    if let Some(left) = node.left.as_deref() {
        let child = flatten(left, nodes);
        nodes[idx as usize].left = Some(child);
    }
    if let Some(right) = node.right.as_deref() {
        let child = flatten(right, nodes);
        nodes[idx as usize].right = Some(child);
    }
    idx
}

fn rebuild(nodes: &[KdNodeState], idx: usize) -> Result<Box<KdNode>> {
    let state = &nodes[idx];
    Ok(Box::new(KdNode {
        vector: state.vector.clone(),
        axis: state.axis as usize,
        left: rebuild_child(nodes, state.left, idx)?,
        right: rebuild_child(nodes, state.right, idx)?,
    }))
}

fn rebuild_child(
    nodes: &[KdNodeState],
    child: Option<u32>,
    parent: usize,
) -> Result<Option<Box<KdNode>>> {
    match child {
        None => Ok(None),
        Some(idx) => {
            let idx = idx as usize;
            // Preorder guarantees children follow their parent; anything
            // else is a corrupt or cyclic encoding.
            if idx <= parent || idx >= nodes.len() {
                return Err(IndexError::Codec(format!(
                    "invalid child index {idx} under node {parent}"
                )));
            }
            rebuild(nodes, idx).map(Some)
        }
    }
}

impl Snapshot for KdTree {
    fn save_to_file(&self, path: &Path) -> Result<()> {
        let mut nodes = Vec::with_capacity(self.len);
        if let Some(root) = self.root.as_deref() {
            flatten(root, &mut nodes);
        }
        let state = KdTreeState {
            dimension: self.dimension,
            nodes,
        };
        snapshot::save(path, IndexKind::Kd, &state)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let state: KdTreeState = snapshot::load(path, IndexKind::Kd)?;
        let len = state.nodes.len();
        let root = if state.nodes.is_empty() {
            None
        } else {
            Some(rebuild(&state.nodes, 0)?)
        };
        Ok(Self {
            root,
            dimension: state.dimension,
            len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::euclidean_vec;

    fn six_points() -> Vec<Vector> {
        vec![
            Vector::new(0, vec![2.0, 3.0]),
            Vector::new(1, vec![5.0, 4.0]),
            Vector::new(2, vec![9.0, 6.0]),
            Vector::new(3, vec![4.0, 7.0]),
            Vector::new(4, vec![8.0, 1.0]),
            Vector::new(5, vec![7.0, 2.0]),
        ]
    }

    #[test]
    fn nearest_on_the_classic_example() {
        let tree = KdTree::with_vectors(six_points()).unwrap();
        let hit = tree.nearest(&Vector::new(-1, vec![8.1, 1.1])).unwrap();
        assert_eq!(hit.id, 4);
    }

    #[test]
    fn k_nearest_is_sorted_ascending() {
        let tree = KdTree::with_vectors(six_points()).unwrap();
        let query = Vector::new(-1, vec![6.0, 3.0]);
        let hits = tree.k_nearest(&query, 4).unwrap();
        assert_eq!(hits.len(), 4);
        let dists: Vec<f64> = hits.iter().map(|v| euclidean_vec(&query, v)).collect();
        assert!(dists.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn delete_replaces_internal_nodes() {
        let mut tree = KdTree::with_vectors(six_points()).unwrap();

        tree.delete(&Vector::new(2, vec![9.0, 6.0])).unwrap();
        assert_eq!(tree.len(), 5);
        tree.delete(&Vector::new(5, vec![7.0, 2.0])).unwrap();
        assert_eq!(tree.len(), 4);
        tree.insert(Vector::new(5, vec![7.0, 2.0])).unwrap();
        assert_eq!(tree.len(), 5);

        // The deleted point no longer surfaces anywhere.
        let all = tree.vectors();
        assert!(all.iter().all(|v| v.id != 2));
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn delete_root_of_single_node_tree() {
        let mut tree = KdTree::new();
        tree.insert(Vector::new(1, vec![1.0, 1.0])).unwrap();
        tree.delete(&Vector::new(1, vec![1.0, 1.0])).unwrap();
        assert!(tree.is_empty());
        assert!(matches!(
            tree.nearest(&Vector::new(-1, vec![0.0, 0.0])),
            Err(IndexError::Empty)
        ));
    }

    #[test]
    fn delete_missing_vector_fails() {
        let mut tree = KdTree::with_vectors(six_points()).unwrap();
        assert!(matches!(
            tree.delete(&Vector::new(9, vec![0.0, 0.0])),
            Err(IndexError::NotFound)
        ));
        assert_eq!(tree.len(), 6);
    }

    #[test]
    fn range_search_collects_exactly_the_ball() {
        let tree = KdTree::with_vectors(six_points()).unwrap();
        let query = Vector::new(-1, vec![8.0, 2.0]);
        let mut ids: Vec<i64> = tree
            .search_within_range(&query, 1.5)
            .unwrap()
            .iter()
            .map(|v| v.id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![4, 5]);
    }

    #[test]
    fn snapshot_preserves_structure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kd.snap");

        let tree = KdTree::with_vectors(six_points()).unwrap();
        tree.save_to_file(&path).unwrap();
        let loaded = KdTree::load_from_file(&path).unwrap();

        assert_eq!(loaded.len(), tree.len());
        let query = Vector::new(-1, vec![8.1, 1.1]);
        assert_eq!(
            loaded.k_nearest(&query, 6).unwrap().iter().map(|v| v.id).collect::<Vec<_>>(),
            tree.k_nearest(&query, 6).unwrap().iter().map(|v| v.id).collect::<Vec<_>>(),
        );
    }
}
