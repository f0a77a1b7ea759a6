//! Dense vector records.

use crate::error::{IndexError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coordinate comparison tolerance used by [`Vector::approx_eq`].
pub const EPSILON: f64 = 1e-9;

/// A dense vector with a stable 64-bit identifier.
///
/// The id is assigned by the client and never interpreted by the indexes
/// beyond candidate deduplication (LSH) and id-keyed storage (PQ).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vector {
    /// Client-assigned identifier.
    pub id: i64,
    /// Coordinates. The length is fixed per index once the first vector
    /// is inserted.
    pub values: Vec<f64>,
}

impl Vector {
    /// Create a vector from an id and its coordinates.
    pub fn new(id: i64, values: Vec<f64>) -> Self {
        Self { id, values }
    }

    /// Number of coordinates.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Coordinate-wise equality within [`EPSILON`]. Ids are not compared.
    ///
    /// This is the equality every index uses to locate delete targets.
    /// It is deliberately not a `PartialEq` impl: tolerance comparison is
    /// not transitive.
    #[must_use]
    pub fn approx_eq(&self, other: &Vector) -> bool {
        self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| float_eq(*a, *b))
    }

    /// Generate a vector with coordinates drawn uniformly from `[min, max)`.
    pub fn random<R: Rng + ?Sized>(rng: &mut R, id: i64, dim: usize, min: f64, max: f64) -> Self {
        let values = (0..dim)
            .map(|_| rng.random::<f64>() * (max - min) + min)
            .collect();
        Self { id, values }
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vector#{} [", self.id)?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v:.2}")?;
        }
        write!(f, "]")
    }
}

#[inline]
fn float_eq(a: f64, b: f64) -> bool {
    (a - b).abs() < EPSILON
}

/// Check a vector's dimension against an index's established dimension.
/// Zero-dimensional vectors are rejected outright.
pub(crate) fn ensure_dim(expected: Option<usize>, got: usize) -> Result<()> {
    if got == 0 {
        return Err(IndexError::InvalidParameter(
            "vector must have at least one dimension".to_string(),
        ));
    }
    match expected {
        Some(d) if d != got => Err(IndexError::DimensionMismatch { expected: d, got }),
        _ => Ok(()),
    }
}
