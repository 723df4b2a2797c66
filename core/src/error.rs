//! Error types for noise map fitting, grid queries, and particle filtering.
//!
//! Every failure the library can detect on caller-supplied data is surfaced as a [`UwbError`]
//! rather than a panic. The orchestrator decides whether to skip a cycle, stop, or fall back.

use thiserror::Error;

use crate::grid::CellIndex;

/// Errors produced by the `uwb` toolbox
#[derive(Debug, Error)]
pub enum UwbError {
    /// A grid cell does not hold enough samples to estimate its model
    #[error("insufficient data in cell {cell}: {samples} samples, at least {required} required")]
    InsufficientData {
        cell: CellIndex,
        samples: usize,
        required: usize,
    },
    /// The weight normalizer is zero or non-finite after an update
    #[error("degenerate particle weights: normalizer is {sum}")]
    DegenerateWeights { sum: f64 },
    /// Batch sizes or dimensionality disagree
    #[error("shape mismatch for {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },
    /// The queried map (or cell of the map) has no model to evaluate
    #[error("missing model: {context}")]
    MissingModel { context: String },
    /// A covariance matrix could not be factored for density evaluation
    #[error("singular covariance: {context}")]
    SingularCovariance { context: String },
    /// A caller supplied parameter is out of range
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: String, reason: String },
    /// The grid source did not visit every cell exactly once while fitting
    #[error("incomplete grid traversal: visited {visited} of {expected} cells")]
    IncompleteTraversal { visited: usize, expected: usize },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("configuration error: {0}")]
    Config(String),
}

impl UwbError {
    pub(crate) fn shape(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        UwbError::ShapeMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }
    pub(crate) fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        UwbError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, UwbError>;
