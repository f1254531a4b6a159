//! Sublayers composed by the block: affine projection, layer norm, dropout.

pub mod dropout;
pub mod linear;
pub mod norm;

pub use dropout::dropout;
pub use linear::Linear;
pub use norm::LayerNorm;
