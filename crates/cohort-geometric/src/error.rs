//! Partitioner error types.

use thiserror::Error;

/// Errors from partitioning or coloring.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeometricError {
    /// Dimensionality must be at least one.
    #[error("invalid dimension count: {0}")]
    InvalidDimensions(usize),

    /// A point's coordinate count did not match the partitioner.
    #[error("point {id} has {got} coordinates, expected {expected}")]
    DimensionMismatch {
        id: String,
        expected: usize,
        got: usize,
    },

    /// The partitioner has no points to split.
    #[error("no points to partition")]
    EmptyPointSet,

    /// The tree has not been built yet.
    #[error("partition not built")]
    NotBuilt,

    /// No 4-coloring exists for the adjacency graph. Expected only for
    /// dimensionalities above two, where planarity is not guaranteed;
    /// callers fall back to serial execution.
    #[error("adjacency graph is not 4-colorable")]
    Uncolorable,
}
