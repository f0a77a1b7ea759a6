//! k-means codebook trainer.
//!
//! Plain Lloyd iterations with shuffle-and-take initialization: shuffle the
//! training slices, take the first k as seeds, then alternate assignment
//! and mean updates. A centroid that loses all its members is re-seeded
//! from a random training slice. Iteration stops early once an update
//! leaves every centroid coordinate-wise unchanged.

use crate::distance::euclidean;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

/// Index of the centroid closest to `slice` by L2 distance.
pub(crate) fn nearest_centroid(slice: &[f64], centroids: &[Vec<f64>]) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (i, centroid) in centroids.iter().enumerate() {
        let dist = euclidean(slice, centroid);
        if dist < best_dist {
            best_dist = dist;
            best = i;
        }
    }
    best
}

/// Train one subspace codebook of `k` centroids over `slices`.
///
/// Callers guarantee `slices.len() >= k` and a uniform slice length.
pub(crate) fn train_codebook(
    slices: &[&[f64]],
    k: usize,
    epochs: usize,
    rng: &mut StdRng,
) -> Vec<Vec<f64>> {
    let sub_dim = slices[0].len();

    let mut order: Vec<usize> = (0..slices.len()).collect();
    order.shuffle(rng);
    let mut centroids: Vec<Vec<f64>> = order.iter().take(k).map(|&i| slices[i].to_vec()).collect();

    for epoch in 0..epochs {
        if epoch % 10 == 0 {
            tracing::debug!(epoch, "k-means refinement epoch");
        }

        let mut sums = vec![vec![0.0; sub_dim]; k];
        let mut counts = vec![0usize; k];
        for slice in slices {
            let assigned = nearest_centroid(slice, &centroids);
            counts[assigned] += 1;
            for (sum, value) in sums[assigned].iter_mut().zip(slice.iter()) {
                *sum += *value;
            }
        }

        let mut next = Vec::with_capacity(k);
        for (sum, &count) in sums.iter().zip(&counts) {
            if count == 0 {
                // Dead centroid; re-seed from a random training slice.
                let pick = rng.random_range(0..slices.len());
                next.push(slices[pick].to_vec());
            } else {
                next.push(sum.iter().map(|s| s / count as f64).collect());
            }
        }

        if next == centroids {
            tracing::debug!(epoch, "k-means converged");
            break;
        }
        centroids = next;
    }

    centroids
}
