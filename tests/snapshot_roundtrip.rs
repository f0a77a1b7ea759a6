//! Snapshot round-trips for every index.
//!
//! The contract: a loaded snapshot answers queries identically to the index
//! that wrote it, modulo permutation in unordered results.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use vantage::{
    BallTree, BruteForce, CoverTree, IndexError, KdTree, LshIndex, PqIndex, PqParams,
    RangeSearch, Snapshot, Vector, VectorIndex, VpTree,
};

fn random_vectors(seed: u64, count: usize, dim: usize) -> Vec<Vector> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| Vector::random(&mut rng, i as i64, dim, -10.0, 10.0))
        .collect()
}

fn id_set(vectors: &[Vector]) -> HashSet<i64> {
    vectors.iter().map(|v| v.id).collect()
}

fn assert_same_answers<I>(a: &I, b: &I, queries: &[Vector])
where
    I: VectorIndex + RangeSearch,
{
    assert_eq!(id_set(&a.vectors()), id_set(&b.vectors()));
    for query in queries {
        let lhs: Vec<i64> = a.k_nearest(query, 5).unwrap().iter().map(|v| v.id).collect();
        let rhs: Vec<i64> = b.k_nearest(query, 5).unwrap().iter().map(|v| v.id).collect();
        assert_eq!(lhs, rhs);

        let lhs_range = a.search_within_range(query, 5.0).unwrap_or_default();
        let rhs_range = b.search_within_range(query, 5.0).unwrap_or_default();
        assert_eq!(id_set(&lhs_range), id_set(&rhs_range));
    }
}

fn queries(seed: u64, count: usize, dim: usize) -> Vec<Vector> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| Vector::random(&mut rng, -(i as i64) - 1, dim, -10.0, 10.0))
        .collect()
}

#[test]
fn brute_force_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("brute.snap");

    let index = BruteForce::with_vectors(random_vectors(1, 80, 4)).unwrap();
    index.save_to_file(&path).unwrap();
    let loaded = BruteForce::load_from_file(&path).unwrap();

    assert_same_answers(&index, &loaded, &queries(2, 5, 4));
}

#[test]
fn kd_tree_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kd.snap");

    let mut index = KdTree::with_vectors(random_vectors(3, 120, 4)).unwrap();
    // Mutate before saving so the snapshot covers a post-delete shape.
    let victims: Vec<Vector> = index.vectors().into_iter().take(10).collect();
    index.delete_batch(&victims).unwrap();

    index.save_to_file(&path).unwrap();
    let loaded = KdTree::load_from_file(&path).unwrap();

    assert_eq!(loaded.len(), index.len());
    assert_same_answers(&index, &loaded, &queries(4, 5, 4));
}

#[test]
fn ball_tree_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ball.snap");

    let mut index = BallTree::with_vectors(random_vectors(5, 100, 4)).unwrap();
    let victims: Vec<Vector> = index.vectors().into_iter().take(5).collect();
    index.delete_batch(&victims).unwrap();

    index.save_to_file(&path).unwrap();
    let loaded = BallTree::load_from_file(&path).unwrap();

    assert_eq!(loaded.len(), index.len());
    assert_same_answers(&index, &loaded, &queries(6, 5, 4));
}

#[test]
fn vp_tree_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vp.snap");

    let index = VpTree::with_vectors(random_vectors(7, 100, 4)).unwrap();
    index.save_to_file(&path).unwrap();
    let loaded = VpTree::load_from_file(&path).unwrap();

    assert_eq!(loaded.len(), index.len());
    assert_same_answers(&index, &loaded, &queries(8, 5, 4));
}

#[test]
fn cover_tree_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cover.snap");

    let mut index = CoverTree::new(1.5).unwrap();
    index.insert_batch(random_vectors(9, 80, 4)).unwrap();

    index.save_to_file(&path).unwrap();
    let loaded = CoverTree::load_from_file(&path).unwrap();

    assert_eq!(loaded.len(), index.len());
    assert_eq!(loaded.base(), index.base());
    assert_same_answers(&index, &loaded, &queries(10, 5, 4));
}

#[test]
fn lsh_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lsh.snap");

    let mut index = LshIndex::new(128, 32).unwrap().with_seed(11);
    index.insert_batch(random_vectors(12, 60, 4)).unwrap();

    index.save_to_file(&path).unwrap();
    let loaded = LshIndex::load_from_file(&path).unwrap();

    assert_eq!(id_set(&loaded.vectors()), id_set(&index.vectors()));
    // Candidate generation must be identical since the hash functions are
    // reconstituted from the persisted reference points.
    for query in queries(13, 5, 4) {
        let lhs = index.k_nearest(&query, 3);
        let rhs = loaded.k_nearest(&query, 3);
        match (lhs, rhs) {
            (Ok(a), Ok(b)) => assert_eq!(
                a.iter().map(|v| v.id).collect::<Vec<_>>(),
                b.iter().map(|v| v.id).collect::<Vec<_>>()
            ),
            (Err(IndexError::Insufficient { .. }), Err(IndexError::Insufficient { .. })) => {}
            (lhs, rhs) => panic!("snapshot diverged: {lhs:?} vs {rhs:?}"),
        }
    }
}

#[test]
fn pq_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pq.snap");

    let vectors = random_vectors(14, 200, 8);
    let mut index = PqIndex::new(PqParams {
        num_subspaces: 4,
        codebook_size: 16,
        ..PqParams::default()
    })
    .unwrap()
    .with_seed(15);
    index.train(&vectors, 15).unwrap();
    index.insert_batch(vectors).unwrap();

    index.save_to_file(&path).unwrap();
    let loaded = PqIndex::load_from_file(&path).unwrap();

    assert_eq!(loaded.len(), index.len());
    for query in queries(16, 5, 8) {
        assert_eq!(
            index
                .k_nearest(&query, 10)
                .unwrap()
                .iter()
                .map(|v| v.id)
                .collect::<Vec<_>>(),
            loaded
                .k_nearest(&query, 10)
                .unwrap()
                .iter()
                .map(|v| v.id)
                .collect::<Vec<_>>()
        );
    }
}

#[test]
fn snapshots_are_not_interchangeable_across_kinds() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kd.snap");

    let index = KdTree::with_vectors(random_vectors(17, 10, 3)).unwrap();
    index.save_to_file(&path).unwrap();

    assert!(matches!(
        VpTree::load_from_file(&path),
        Err(IndexError::Codec(_))
    ));
}
