use std::path::PathBuf;

use tensor_core::TensorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Tensor error: {0}")]
    Tensor(#[from] TensorError),
    /// Forward was called with a number of inputs other than one.
    #[error("VisionTransformer forward expects exactly 1 input, got {0}")]
    Arity(usize),
    #[error("Could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A raw parameter file does not hold the expected number of floats.
    #[error("{file}: expected {expected} f32 values, found {actual_bytes} bytes")]
    ElementCount {
        file: String,
        expected: usize,
        actual_bytes: usize,
    },
    #[error("Weight not found: {0}")]
    WeightNotFound(String),
    #[error("Invalid weight shape: {0}")]
    InvalidWeightShape(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Safetensors error: {0}")]
    Safetensors(String),
}

pub type Result<T> = std::result::Result<T, BlockError>;
