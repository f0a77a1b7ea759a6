//! Error types for vantage.

use thiserror::Error;

/// Errors that can occur during index mutation, search, or snapshot I/O.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Queried an index that contains no vectors.
    #[error("index is empty")]
    Empty,

    /// Delete target is not present in the index.
    #[error("vector not found")]
    NotFound,

    /// Insert would duplicate an existing point or id.
    #[error("duplicate vector (id {0})")]
    Duplicate(i64),

    /// Vector dimension conflicts with the index's established dimension.
    #[error("dimension mismatch: index has {expected} dimensions, vector has {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// PQ query issued before `train`.
    #[error("codebook is not trained")]
    UntrainedCodebook,

    /// LSH could not assemble enough candidates for a k-NN query.
    #[error("insufficient candidates: needed {needed}, found {got}")]
    Insufficient { needed: usize, got: usize },

    /// Range search produced no matches.
    ///
    /// Only the brute-force and LSH indexes report this; the tree indexes
    /// and PQ return an empty result set instead.
    #[error("no vectors within range")]
    NoMatch,

    /// Invalid query or constructor parameter.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Snapshot file I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot payload could not be decoded.
    #[error("snapshot codec error: {0}")]
    Codec(String),
}

impl From<postcard::Error> for IndexError {
    fn from(e: postcard::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

/// Result type alias for vantage operations.
pub type Result<T> = std::result::Result<T, IndexError>;

pub(crate) fn ensure_k(k: usize) -> Result<()> {
    if k == 0 {
        return Err(IndexError::InvalidParameter(
            "k must be at least 1".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn ensure_radius(radius: f64) -> Result<()> {
    if !(radius >= 0.0) {
        return Err(IndexError::InvalidParameter(format!(
            "radius must be non-negative, got {radius}"
        )));
    }
    Ok(())
}
