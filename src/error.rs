//! Error types for network construction, configuration, and persistence.
//!
//! Kernel-level shape mismatches are programmer errors and panic with a
//! descriptive assertion message instead; everything that depends on runtime
//! input (config files, checkpoints, architecture descriptions) surfaces
//! through [`Error`].

use crate::tensor::Precision;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by network construction, configuration parsing, and
/// checkpoint IO.
#[derive(Debug, Error)]
pub enum Error {
    /// A batch normalization mode string was neither "train" nor "test".
    #[error("invalid batchnorm mode \"{0}\": expected \"train\" or \"test\"")]
    InvalidBatchNormMode(String),

    /// A precision string was neither "single" nor "double".
    #[error("invalid precision \"{0}\": expected \"single\" or \"double\"")]
    InvalidPrecision(String),

    /// A constructed network ended up with the wrong number of learnable
    /// tensors for the requested architecture.
    #[error("network has {got} learnable parameters; expected {expected}")]
    ParameterCountMismatch { got: usize, expected: usize },

    /// A constructed parameter does not match the network's precision.
    #[error("parameter \"{name}\" has precision {actual:?}; expected {expected:?}")]
    PrecisionMismatch {
        name: String,
        actual: Precision,
        expected: Precision,
    },

    /// A deep network needs at least one convolutional macro layer.
    #[error("num_filters must name at least one macro layer")]
    EmptyFilterList,

    /// A pooling index referred to a macro layer that does not exist.
    #[error("max pool index {index} out of range for {layers} macro layers")]
    PoolIndexOutOfRange { index: usize, layers: usize },

    /// A configuration field failed validation.
    #[error("invalid config field \"{field}\": {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
