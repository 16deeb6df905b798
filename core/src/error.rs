//! Error taxonomy shared by every layer.
//!
//! Structurally invalid calls are errors; numerically unsafe ones are not.
//! A near-zero denominator in the division layer is gated to 0, never raised.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EqlError {
    /// Input (or gradient) shape disagrees with the shape fixed at build time.
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    Shape { expected: Vec<usize>, found: Vec<usize> },

    /// Invalid construction or setter argument.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A hypothesis-set assignment or mask coordinate is out of range.
    #[error("index {index} out of range (len={len})")]
    Index { index: usize, len: usize },
}

impl EqlError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        EqlError::Config(msg.into())
    }
}
