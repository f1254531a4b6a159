//! A single pre-norm Vision Transformer encoder block on a host tensor
//! engine, with raw-dump and safetensors checkpoint loading.
//!
//! Activations are `[model_dim, tokens, batch]` tensors. Every forward call
//! takes a [`Mode`]; training mode carries the random source used for
//! dropout and drop-path masks.

pub mod activation;
pub mod attention;
pub mod block;
pub mod checkpoint;
pub mod config;
pub mod drop_path;
pub mod error;
pub mod mlp;
pub mod mode;
pub mod nn;
pub mod params;
pub mod random;

pub use activation::gelu;
pub use attention::SelfAttention;
pub use block::Block;
pub use config::{ModelConfig, ModelDataType};
pub use drop_path::DropPath;
pub use error::{BlockError, Result};
pub use mlp::FeedForward;
pub use mode::Mode;
pub use params::Parameter;
pub use random::{seeded, RandomSource, ScriptedSource};
pub use tensor_core::{Tensor, TensorError};
