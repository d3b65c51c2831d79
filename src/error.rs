//! Error type for the tensor / model core.
//!
//! Shape violations inside forward and backward passes are programmer errors
//! and panic. The variants here cover the contracts that callers are expected
//! to handle: views, configuration and parameter restoration.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TensorError {
    #[error("shape mismatch: expected {expected:?} ({expected_size} elements), got {got:?} ({got_size} elements)")]
    ShapeMismatch {
        expected: Vec<usize>,
        expected_size: usize,
        got: Vec<usize>,
        got_size: usize,
    },

    #[error("data length {len} does not match shape {shape:?}")]
    DataLength { len: usize, shape: Vec<usize> },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("corpus has {tokens} tokens, need more than block_size = {block_size}")]
    DataTooShort { tokens: usize, block_size: usize },
}

impl TensorError {
    pub(crate) fn shape_mismatch(expected: &[usize], got: &[usize]) -> Self {
        TensorError::ShapeMismatch {
            expected: expected.to_vec(),
            expected_size: expected.iter().product(),
            got: got.to_vec(),
            got_size: got.iter().product(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TensorError>;
