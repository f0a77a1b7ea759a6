//! Cover-tree index.
//!
//! A leveled metric tree: children of a node at level `l` sit at level
//! `l - 1`, and every child lies within `base^(l - 1)` of its parent. The
//! base (> 1) is a construction parameter trading tree width against depth;
//! 1.1–2.0 are the practical choices.
//!
//! Inserting a point no existing subtree can cover lifts the root: the new
//! point becomes a root one level up with the previous root as its only
//! child. Inserting a point at distance exactly zero from an existing one
//! is rejected as a duplicate.
//!
//! # References
//!
//! - Beygelzimer, Kakade, Langford (2006): "Cover trees for nearest
//!   neighbor"

use crate::distance::{euclidean, euclidean_vec};
use crate::error::{ensure_k, ensure_radius, IndexError, Result};
use crate::snapshot::{self, IndexKind};
use crate::traits::{RangeSearch, Snapshot, VectorIndex};
use crate::vector::{ensure_dim, Vector};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Cover tree with a configurable expansion base.
#[derive(Debug)]
pub struct CoverTree {
    root: Option<Box<CoverNode>>,
    base: f64,
    dimension: Option<usize>,
    len: usize,
}

#[derive(Debug)]
struct CoverNode {
    point: Vector,
    level: i32,
    children: Vec<CoverNode>,
}

/// Outcome of a covered-subtree insertion attempt.
enum InsertOutcome {
    Inserted,
    /// The point is outside this subtree's covering radius.
    NotCovered,
}

impl CoverTree {
    /// Create an empty tree with the given expansion base.
    pub fn new(base: f64) -> Result<Self> {
        if !(base > 1.0) {
            return Err(IndexError::InvalidParameter(format!(
                "cover tree base must be greater than 1, got {base}"
            )));
        }
        Ok(Self {
            root: None,
            base,
            dimension: None,
            len: 0,
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

    /// The expansion base configured at construction.
    #[must_use]
    pub fn base(&self) -> f64 {
        self.base
    }

    /// Insert without touching `len` or the established dimension; used for
    /// both client inserts and delete-time re-insertion of displaced points.
    fn insert_point(&mut self, vec: Vector) -> Result<()> {
        let Some(root) = self.root.as_deref_mut() else {
            self.root = Some(Box::new(CoverNode {
                point: vec,
                level: 0,
                children: Vec::new(),
            }));
            return Ok(());
        };

        if let InsertOutcome::Inserted = try_insert(root, &vec, self.base)? {
            return Ok(());
        }

        // Nothing can cover the point; lift the root one level with the new
        // point on top.
        if let Some(old_root) = self.root.take() {
            let level = old_root.level + 1;
            self.root = Some(Box::new(CoverNode {
                point: vec,
                level,
                children: vec![*old_root],
            }));
        }
        Ok(())
    }
}

fn try_insert(node: &mut CoverNode, vec: &Vector, base: f64) -> Result<InsertOutcome> {
    let d = euclidean_vec(&node.point, vec);
    if d == 0.0 {
        return Err(IndexError::Duplicate(vec.id));
    }

    let child_level = node.level - 1;
    if d < base.powi(child_level) {
        for child in &mut node.children {
            if let InsertOutcome::Inserted = try_insert(child, vec, base)? {
                return Ok(InsertOutcome::Inserted);
            }
        }
        node.children.push(CoverNode {
            point: vec.clone(),
            level: child_level,
            children: Vec::new(),
        });
        Ok(InsertOutcome::Inserted)
    } else {
        Ok(InsertOutcome::NotCovered)
    }
}

fn nearest_node<'a>(
    node: &'a CoverNode,
    query: &[f64],
    best: &mut (f64, Option<&'a Vector>),
    base: f64,
) {
    let d = euclidean(&node.point.values, query);
    if d < best.0 {
        *best = (d, Some(&node.point));
    }

    for child in &node.children {
        // base^level bounds how far anything in the child's subtree can
        // stray from the child's point.
        let bound = euclidean(&child.point.values, query) - base.powi(child.level);
        if bound < best.0 {
            nearest_node(child, query, best, base);
        }
    }
}

fn k_nearest_node<'a>(
    node: &'a CoverNode,
    query: &[f64],
    best: &mut Vec<(f64, &'a Vector)>,
    k: usize,
    base: f64,
) {
    let d = euclidean(&node.point.values, query);

    if best.len() < k {
        best.push((d, &node.point));
        bubble_back(best);
    } else if d < best[k - 1].0 {
        best[k - 1] = (d, &node.point);
        bubble_back(best);
    }

    if best.len() == k && d - base.powi(node.level) >= best[k - 1].0 {
        // Nothing in this subtree can beat the current worst.
        return;
    }

    for child in &node.children {
        k_nearest_node(child, query, best, k, base);
    }
}

/// Restore ascending order after the last element was appended or the worst
/// slot overwritten.
fn bubble_back(best: &mut [(f64, &Vector)]) {
    let mut i = best.len() - 1;
    while i > 0 && best[i].0 < best[i - 1].0 {
        best.swap(i, i - 1);
        i -= 1;
    }
}

fn collect(node: &CoverNode, out: &mut Vec<Vector>) {
    out.push(node.point.clone());
    for child in &node.children {
        collect(child, out);
    }
}

/// Remove the child matching `target` somewhere under `node`.
///
/// When the removed child has children of its own, its first child is
/// promoted into its slot and every point from the remaining child subtrees
/// is pushed onto `displaced` for re-insertion from the root (re-inserting
/// at the containing parent alone could fail its covering bound).
fn delete_node(node: &mut CoverNode, target: &Vector, displaced: &mut Vec<Vector>) -> bool {
    for i in 0..node.children.len() {
        if node.children[i].point.approx_eq(target) {
            let removed = node.children.remove(i);
            let mut orphans = removed.children.into_iter();
            if let Some(promoted) = orphans.next() {
                node.children.insert(i, promoted);
            }
            for orphan in orphans {
                collect(&orphan, displaced);
            }
            return true;
        }
    }

    for child in &mut node.children {
        if delete_node(child, target, displaced) {
            return true;
        }
    }
    false
}

fn collect_in_range(node: &CoverNode, query: &[f64], radius: f64, base: f64, out: &mut Vec<Vector>) {
    if euclidean(&node.point.values, query) <= radius {
        out.push(node.point.clone());
    }

    for child in &node.children {
        let bound = euclidean(&child.point.values, query) - base.powi(child.level);
        if bound <= radius {
            collect_in_range(child, query, radius, base, out);
        }
    }
}

impl VectorIndex for CoverTree {
    fn insert(&mut self, vec: Vector) -> Result<()> {
        ensure_dim(self.dimension, vec.dim())?;
        self.dimension.get_or_insert(vec.dim());
        self.insert_point(vec)?;
        self.len += 1;
        Ok(())
    }

    fn delete(&mut self, vec: &Vector) -> Result<()> {
        ensure_dim(self.dimension, vec.dim())?;
        let root_matches = match self.root.as_deref() {
            None => return Err(IndexError::Empty),
            Some(root) => root.point.approx_eq(vec),
        };

        let mut displaced = Vec::new();
        let deleted = if root_matches {
            if let Some(old_root) = self.root.take() {
                let mut children = old_root.children.into_iter();
                if let Some(new_root) = children.next() {
                    self.root = Some(Box::new(new_root));
                    for child in children {
                        collect(&child, &mut displaced);
                    }
                }
            }
            true
        } else if let Some(root) = self.root.as_deref_mut() {
            delete_node(root, vec, &mut displaced)
        } else {
            false
        };

        if !deleted {
            return Err(IndexError::NotFound);
        }

        for point in displaced {
            self.insert_point(point)?;
        }
        self.len -= 1;
        Ok(())
    }

    fn nearest(&self, query: &Vector) -> Result<Vector> {
        ensure_dim(self.dimension, query.dim())?;
        let root = self.root.as_deref().ok_or(IndexError::Empty)?;

        let mut best = (f64::INFINITY, None);
        nearest_node(root, &query.values, &mut best, self.base);
        best.1.cloned().ok_or(IndexError::Empty)
    }

    fn k_nearest(&self, query: &Vector, k: usize) -> Result<Vec<Vector>> {
        ensure_k(k)?;
        ensure_dim(self.dimension, query.dim())?;
        let root = self.root.as_deref().ok_or(IndexError::Empty)?;

        let mut best = Vec::with_capacity(k);
        k_nearest_node(root, &query.values, &mut best, k, self.base);
        Ok(best.into_iter().map(|(_, v)| v.clone()).collect())
    }

    fn vectors(&self) -> Vec<Vector> {
        let mut out = Vec::with_capacity(self.len);
        if let Some(root) = self.root.as_deref() {
            collect(root, &mut out);
        }
        out
    }
}

impl RangeSearch for CoverTree {
    fn search_within_range(&self, query: &Vector, radius: f64) -> Result<Vec<Vector>> {
        ensure_radius(radius)?;
        ensure_dim(self.dimension, query.dim())?;

        let mut out = Vec::new();
        if let Some(root) = self.root.as_deref() {
            collect_in_range(root, &query.values, radius, self.base, &mut out);
        }
        Ok(out)
    }
}

#[derive(Serialize, Deserialize)]
struct CoverTreeState {
    base: f64,
    dimension: Option<usize>,
    /// Preorder node list; child indexes are strictly increasing and always
    /// greater than their parent's.
    nodes: Vec<CoverNodeState>,
}

#[derive(Serialize, Deserialize)]
struct CoverNodeState {
    point: Vector,
    level: i32,
    children: Vec<u32>,
}

fn flatten(node: &CoverNode, nodes: &mut Vec<CoverNodeState>) -> u32 {
    let idx = nodes.len() as u32;
    nodes.push(CoverNodeState {
        point: node.point.clone(),
        level: node.level,
        children: Vec::with_capacity(node.children.len()),
    });
    for child in &node.children {
        let child_idx = flatten(child, nodes);
        nodes[idx as usize].children.push(child_idx);
    }
    idx
}

fn rebuild(nodes: &[CoverNodeState], idx: usize) -> Result<CoverNode> {
    let state = &nodes[idx];
    let mut children = Vec::with_capacity(state.children.len());
    for &child in &state.children {
        let child = child as usize;
        if child <= idx || child >= nodes.len() {
            return Err(IndexError::Codec(format!(
                "invalid child index {child} under node {idx}"
            )));
        }
        children.push(rebuild(nodes, child)?);
    }
    Ok(CoverNode {
        point: state.point.clone(),
        level: state.level,
        children,
    })
}

impl Snapshot for CoverTree {
    fn save_to_file(&self, path: &Path) -> Result<()> {
        let mut nodes = Vec::with_capacity(self.len);
        if let Some(root) = self.root.as_deref() {
            flatten(root, &mut nodes);
        }
        let state = CoverTreeState {
            base: self.base,
            dimension: self.dimension,
            nodes,
        };
        snapshot::save(path, IndexKind::Cover, &state)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let state: CoverTreeState = snapshot::load(path, IndexKind::Cover)?;
        let len = state.nodes.len();
        let root = if state.nodes.is_empty() {
            None
        } else {
            Some(Box::new(rebuild(&state.nodes, 0)?))
        };
        Ok(Self {
            root,
            base: state.base,
            dimension: state.dimension,
            len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CoverTree {
        let mut tree = CoverTree::new(2.0).unwrap();
        for (i, coords) in [
            [2.0, 3.0],
            [5.0, 4.0],
            [9.0, 6.0],
            [4.0, 7.0],
            [8.0, 1.0],
            [7.0, 2.0],
        ]
        .iter()
        .enumerate()
        {
            tree.insert(Vector::new(i as i64, coords.to_vec())).unwrap();
        }
        tree
    }

    #[test]
    fn base_must_exceed_one() {
        assert!(matches!(
            CoverTree::new(1.0),
            Err(IndexError::InvalidParameter(_))
        ));
        assert!(CoverTree::new(1.3).is_ok());
    }

    #[test]
    fn nearest_finds_the_closest() {
        let tree = sample();
        let hit = tree.nearest(&Vector::new(-1, vec![8.1, 1.1])).unwrap();
        assert_eq!(hit.id, 4);
    }

    #[test]
    fn duplicate_point_is_rejected() {
        let mut tree = sample();
        assert!(matches!(
            tree.insert(Vector::new(99, vec![9.0, 6.0])),
            Err(IndexError::Duplicate(99))
        ));
        assert_eq!(tree.len(), 6);
    }

    #[test]
    fn k_nearest_is_sorted_and_complete() {
        let tree = sample();
        let query = Vector::new(-1, vec![6.0, 3.0]);
        let hits = tree.k_nearest(&query, 6).unwrap();
        assert_eq!(hits.len(), 6);
        let dists: Vec<f64> = hits.iter().map(|v| euclidean_vec(&query, v)).collect();
        assert!(dists.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn delete_keeps_every_other_point() {
        let mut tree = sample();
        tree.delete(&Vector::new(1, vec![5.0, 4.0])).unwrap();
        assert_eq!(tree.len(), 5);

        let mut ids: Vec<i64> = tree.vectors().iter().map(|v| v.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 2, 3, 4, 5]);
    }

    #[test]
    fn delete_root_promotes_a_child() {
        let mut tree = sample();
        // Repeated root lifts during construction leave the last far point,
        // (8, 1), on top.
        tree.delete(&Vector::new(4, vec![8.0, 1.0])).unwrap();
        assert_eq!(tree.len(), 5);
        assert!(tree.vectors().iter().all(|v| v.id != 4));

        let mut ids: Vec<i64> = tree.vectors().iter().map(|v| v.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3, 5]);
    }

    #[test]
    fn delete_on_empty_tree_fails() {
        let mut tree = CoverTree::new(2.0).unwrap();
        assert!(matches!(
            tree.delete(&Vector::new(0, vec![1.0, 1.0])),
            Err(IndexError::Empty)
        ));
    }

    #[test]
    fn range_search_matches_a_linear_scan() {
        let tree = sample();
        let query = Vector::new(-1, vec![7.5, 1.5]);
        let radius = 2.0;

        let mut ids: Vec<i64> = tree
            .search_within_range(&query, radius)
            .unwrap()
            .iter()
            .map(|v| v.id)
            .collect();
        ids.sort_unstable();

        let mut expected: Vec<i64> = tree
            .vectors()
            .iter()
            .filter(|v| euclidean_vec(&query, v) <= radius)
            .map(|v| v.id)
            .collect();
        expected.sort_unstable();

        assert_eq!(ids, expected);
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cover.snap");

        let tree = sample();
        tree.save_to_file(&path).unwrap();
        let loaded = CoverTree::load_from_file(&path).unwrap();

        assert_eq!(loaded.len(), 6);
        assert_eq!(loaded.base(), 2.0);
        let query = Vector::new(-1, vec![8.1, 1.1]);
        assert_eq!(
            loaded.nearest(&query).unwrap().id,
            tree.nearest(&query).unwrap().id
        );
    }
}
