//! Vantage-point tree index.
//!
//! Metric-space partitioning: each node picks a vantage point and splits
//! the remaining vectors by their distance to it against the median μ.
//! Batch construction produces balanced splits; incremental inserts descend
//! without rebalancing, so bulk data should go through
//! [`VpTree::with_vectors`].
//!
//! The k-NN pruning bounds are `d + μ ≤ τ` for the far-right visit and
//! `d − μ ≤ τ` for the far-left visit. On batch-built trees these are exact
//! in practice and the oracle tests hold them to it; after unbalanced
//! incremental inserts k-NN is best treated as approximate.
//!
//! # References
//!
//! - Yianilos (1993): "Data structures and algorithms for nearest neighbor
//!   search in general metric spaces"

use crate::distance::{euclidean, euclidean_vec, median};
use crate::error::{ensure_k, ensure_radius, IndexError, Result};
use crate::heap::BoundedHeap;
use crate::snapshot::{self, IndexKind};
use crate::traits::{RangeSearch, Snapshot, VectorIndex};
use crate::vector::{ensure_dim, Vector};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Vantage-point tree over owned child nodes.
#[derive(Debug)]
pub struct VpTree {
    root: Option<Box<VpNode>>,
    dimension: Option<usize>,
    len: usize,
}

#[derive(Debug)]
struct VpNode {
    vp: Vector,
    /// Distance threshold: the left subtree holds vectors with
    /// `dist(vp, x) < mu`, the right subtree those with `dist(vp, x) >= mu`.
    mu: f64,
    left: Option<Box<VpNode>>,
    right: Option<Box<VpNode>>,
}

impl VpTree {
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
        Ok(Self {
            root: build_node(vectors),
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

impl Default for VpTree {
    fn default() -> Self {
        Self::new()
    }
}

fn build_node(mut vectors: Vec<Vector>) -> Option<Box<VpNode>> {
    if vectors.is_empty() {
        return None;
    }

    let vp = vectors.remove(0);
    if vectors.is_empty() {
        return Some(Box::new(VpNode {
            vp,
            mu: 0.0,
            left: None,
            right: None,
        }));
    }

    let distances: Vec<f64> = vectors.iter().map(|v| euclidean_vec(&vp, v)).collect();
    let mu = median(&distances);

    let mut left_set = Vec::new();
    let mut right_set = Vec::new();
    for (vec, dist) in vectors.into_iter().zip(distances) {
        if dist < mu {
            left_set.push(vec);
        } else {
            right_set.push(vec);
        }
    }

    Some(Box::new(VpNode {
        vp,
        mu,
        left: build_node(left_set),
        right: build_node(right_set),
    }))
}

fn insert_node(slot: &mut Option<Box<VpNode>>, vec: Vector) {
    match slot {
        None => {
            *slot = Some(Box::new(VpNode {
                vp: vec,
                mu: 0.0,
                left: None,
                right: None,
            }));
        }
        Some(node) => {
            if euclidean_vec(&vec, &node.vp) < node.mu {
                insert_node(&mut node.left, vec);
            } else {
                insert_node(&mut node.right, vec);
            }
        }
    }
}

fn k_nearest_node<'a>(node: Option<&'a VpNode>, query: &[f64], heap: &mut BoundedHeap<&'a Vector>) {
    let Some(node) = node else {
        return;
    };

    let d = euclidean(query, &node.vp.values);
    heap.push(d, &node.vp);

    if d < node.mu {
        k_nearest_node(node.left.as_deref(), query, heap);
        if d + node.mu <= heap.tau() {
            k_nearest_node(node.right.as_deref(), query, heap);
        }
    } else {
        k_nearest_node(node.right.as_deref(), query, heap);
        if d - node.mu <= heap.tau() {
            k_nearest_node(node.left.as_deref(), query, heap);
        }
    }
}

fn collect(node: Option<&VpNode>, out: &mut Vec<Vector>) {
    let Some(node) = node else {
        return;
    };
    collect(node.left.as_deref(), out);
    out.push(node.vp.clone());
    collect(node.right.as_deref(), out);
}

/// Delete by locating the node whose vantage point matches, then rebuilding
/// that whole subtree without the target. O(subtree size), but the partition
/// invariant survives without any rotation machinery.
fn delete_node(slot: &mut Option<Box<VpNode>>, target: &Vector) -> bool {
    let Some(node) = slot.as_deref_mut() else {
        return false;
    };

    if node.vp.approx_eq(target) {
        let mut remaining = Vec::new();
        collect(Some(&*node), &mut remaining);
        if let Some(pos) = remaining.iter().position(|v| v.approx_eq(target)) {
            remaining.remove(pos);
        }
        *slot = build_node(remaining);
        true
    } else if euclidean_vec(&node.vp, target) < node.mu {
        delete_node(&mut node.left, target)
    } else {
        delete_node(&mut node.right, target)
    }
}

fn collect_in_range(node: Option<&VpNode>, query: &[f64], radius: f64, out: &mut Vec<Vector>) {
    let Some(node) = node else {
        return;
    };

    let d = euclidean(query, &node.vp.values);
    if d <= radius {
        out.push(node.vp.clone());
    }

    if d - radius < node.mu {
        collect_in_range(node.left.as_deref(), query, radius, out);
    }
    if d + radius >= node.mu {
        collect_in_range(node.right.as_deref(), query, radius, out);
    }
}

impl VectorIndex for VpTree {
    fn insert(&mut self, vec: Vector) -> Result<()> {
        ensure_dim(self.dimension, vec.dim())?;
        self.dimension.get_or_insert(vec.dim());
        insert_node(&mut self.root, vec);
        self.len += 1;
        Ok(())
    }

    fn delete(&mut self, vec: &Vector) -> Result<()> {
        ensure_dim(self.dimension, vec.dim())?;
        if !delete_node(&mut self.root, vec) {
            return Err(IndexError::NotFound);
        }
        self.len -= 1;
        Ok(())
    }

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

impl RangeSearch for VpTree {
    fn search_within_range(&self, query: &Vector, radius: f64) -> Result<Vec<Vector>> {
        ensure_radius(radius)?;
        ensure_dim(self.dimension, query.dim())?;

        let mut out = Vec::new();
        collect_in_range(self.root.as_deref(), &query.values, radius, &mut out);
        Ok(out)
    }
}

#[derive(Serialize, Deserialize)]
struct VpTreeState {
    dimension: Option<usize>,
    /// Preorder node list; children always carry higher indexes than their
    /// parent.
    nodes: Vec<VpNodeState>,
}

#[derive(Serialize, Deserialize)]
struct VpNodeState {
    vp: Vector,
    mu: f64,
    left: Option<u32>,
    right: Option<u32>,
}

fn flatten(node: &VpNode, nodes: &mut Vec<VpNodeState>) -> u32 {
    let idx = nodes.len() as u32;
    nodes.push(VpNodeState {
        vp: node.vp.clone(),
        mu: node.mu,
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

fn rebuild(nodes: &[VpNodeState], idx: usize) -> Result<Box<VpNode>> {
    let state = &nodes[idx];
    Ok(Box::new(VpNode {
        vp: state.vp.clone(),
        mu: state.mu,
        left: rebuild_child(nodes, state.left, idx)?,
        right: rebuild_child(nodes, state.right, idx)?,
    }))
}

fn rebuild_child(
    nodes: &[VpNodeState],
    child: Option<u32>,
    parent: usize,
) -> Result<Option<Box<VpNode>>> {
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

impl Snapshot for VpTree {
    fn save_to_file(&self, path: &Path) -> Result<()> {
        let mut nodes = Vec::with_capacity(self.len);
        if let Some(root) = self.root.as_deref() {
            flatten(root, &mut nodes);
        }
        let state = VpTreeState {
            dimension: self.dimension,
            nodes,
        };
        snapshot::save(path, IndexKind::Vp, &state)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let state: VpTreeState = snapshot::load(path, IndexKind::Vp)?;
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
