use std::fmt;

use log::debug;
use num_traits::Float;
use tensor_core::{Tensor, TensorError};

use crate::attention::SelfAttention;
use crate::config::ModelConfig;
use crate::drop_path::DropPath;
use crate::error::{BlockError, Result};
use crate::mlp::FeedForward;
use crate::mode::Mode;
use crate::nn::LayerNorm;
use crate::params::Parameter;
use crate::random::RandomSource;

/// Pre-norm ViT encoder block:
///
/// ```text
/// y = x + drop_path(attention(norm1(x)))
/// z = y + drop_path(mlp(norm2(y)))
/// ```
///
/// Activations are `[model_dim, tokens, batch]`.
#[derive(Debug, Clone)]
pub struct Block<T = f32> {
    config: ModelConfig,
    pub(crate) attn: SelfAttention<T>,
    pub(crate) mlp: FeedForward<T>,
    pub(crate) norm1: LayerNorm<T>,
    pub(crate) norm2: LayerNorm<T>,
    drop_path: DropPath,
}

impl<T: Float> Block<T> {
    /// Randomly initialized block: truncated-normal projections, zero biases,
    /// unit norm scales.
    pub fn new(config: ModelConfig, rng: &mut dyn RandomSource) -> Result<Self> {
        config.validate()?;
        let mlp = FeedForward::init(&config, rng)?;
        let attn = SelfAttention::init(&config, rng)?;
        let norm1 = LayerNorm::new("norm1", config.model_dim);
        let norm2 = LayerNorm::new("norm2", config.model_dim);
        debug!("initialized block {:?}", config);
        Ok(Block::from_parts(config, attn, mlp, norm1, norm2))
    }

    pub(crate) fn from_parts(
        config: ModelConfig,
        attn: SelfAttention<T>,
        mlp: FeedForward<T>,
        norm1: LayerNorm<T>,
        norm2: LayerNorm<T>,
    ) -> Self {
        let drop_path = DropPath::new(config.p_layerdrop);
        Block { config, attn, mlp, norm1, norm2, drop_path }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn attention(&self) -> &SelfAttention<T> {
        &self.attn
    }

    pub fn mlp(&self) -> &FeedForward<T> {
        &self.mlp
    }

    pub fn norm1(&self) -> &LayerNorm<T> {
        &self.norm1
    }

    pub fn norm2(&self) -> &LayerNorm<T> {
        &self.norm2
    }

    /// Runs the block on exactly one `[model_dim, T, B]` input.
    pub fn forward(&self, inputs: &[Tensor<T>], mode: &mut Mode<'_>) -> Result<Vec<Tensor<T>>> {
        match inputs {
            [x] => Ok(vec![self.forward_one(x, mode)?]),
            _ => Err(BlockError::Arity(inputs.len())),
        }
    }

    pub fn forward_one(&self, x: &Tensor<T>, mode: &mut Mode<'_>) -> Result<Tensor<T>> {
        if x.rank() != 3 || x.shape[0] != self.config.model_dim {
            return Err(TensorError::DimensionMismatch(format!(
                "block expects [{}, T, B], got {:?}",
                self.config.model_dim, x.shape
            ))
            .into());
        }
        let attn = self.attn.forward(&self.norm1.forward(x)?, mode)?;
        let output = x.add(&self.drop_path.forward(attn, mode)?)?;
        let mlp = self.mlp.forward(&self.norm2.forward(&output)?, mode)?;
        Ok(output.add(&self.drop_path.forward(mlp, mode)?)?)
    }

    /// Attention weights of the first sublayer for input `x`, `[H*B, T, T]`.
    pub fn attention_weights(&self, x: &Tensor<T>) -> Result<Tensor<T>> {
        self.attn.attention_weights(&self.norm1.forward(x)?)
    }

    /// Parameters in fixed order: w1, w2, wq, wk, wv, wf, norm1, norm2,
    /// each weight followed by its bias.
    pub fn parameters(&self) -> Vec<&Parameter<T>> {
        let mut params = self.mlp.params();
        params.extend(self.attn.params());
        params.extend(self.norm1.params());
        params.extend(self.norm2.params());
        params
    }

    pub fn named_parameters(&self) -> Vec<(&str, &Tensor<T>)> {
        self.parameters().into_iter().map(|p| (p.name.as_str(), p.tensor())).collect()
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.num_elements()).sum()
    }

    /// Converts every parameter to element type `U`.
    pub fn cast<U: Float>(&self) -> Result<Block<U>> {
        Ok(Block {
            config: self.config.clone(),
            attn: self.attn.cast()?,
            mlp: self.mlp.cast()?,
            norm1: self.norm1.cast()?,
            norm2: self.norm2.cast()?,
            drop_path: self.drop_path,
        })
    }
}

impl<T> fmt::Display for Block<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VisionTransformer (nHeads: {}), (pDropout: {}), (pLayerdrop: {}), ",
            self.config.n_heads, self.config.p_dropout, self.config.p_layerdrop
        )
    }
}
