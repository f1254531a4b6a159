use num_traits::Float;
use tensor_core::Tensor;

use crate::activation::gelu;
use crate::config::ModelConfig;
use crate::error::{BlockError, Result};
use crate::mode::Mode;
use crate::nn::{dropout, Linear};
use crate::params::Parameter;
use crate::random::RandomSource;

/// Position-wise feed-forward: `w1 -> GELU -> dropout -> w2 -> dropout`.
#[derive(Debug, Clone)]
pub struct FeedForward<T> {
    pub w1: Linear<T>,
    pub w2: Linear<T>,
    p_dropout: f32,
}

impl<T: Float> FeedForward<T> {
    pub fn init(config: &ModelConfig, rng: &mut dyn RandomSource) -> Result<Self> {
        FeedForward::from_parts(
            Linear::init("w1", config.model_dim, config.mlp_dim, rng)?,
            Linear::init("w2", config.mlp_dim, config.model_dim, rng)?,
            config,
        )
    }

    pub fn from_parts(w1: Linear<T>, w2: Linear<T>, config: &ModelConfig) -> Result<Self> {
        let (d, m) = (config.model_dim, config.mlp_dim);
        if w1.weight().shape() != [m, d] || w2.weight().shape() != [d, m] {
            return Err(BlockError::InvalidWeightShape(format!(
                "mlp expects w1 [{m}, {d}] and w2 [{d}, {m}], got {:?} and {:?}",
                w1.weight().shape(),
                w2.weight().shape()
            )));
        }
        Ok(FeedForward { w1, w2, p_dropout: config.p_dropout })
    }

    pub fn forward(&self, x: &Tensor<T>, mode: &mut Mode<'_>) -> Result<Tensor<T>> {
        let hidden = gelu(&self.w1.forward(x)?);
        let hidden = dropout(hidden, self.p_dropout, mode);
        let out = self.w2.forward(&hidden)?;
        Ok(dropout(out, self.p_dropout, mode))
    }

    pub fn params(&self) -> Vec<&Parameter<T>> {
        self.w1.params().into_iter().chain(self.w2.params()).collect()
    }

    pub fn cast<U: Float>(&self) -> Result<FeedForward<U>> {
        Ok(FeedForward {
            w1: self.w1.cast()?,
            w2: self.w2.cast()?,
            p_dropout: self.p_dropout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::gelu_scalar;
    use crate::random::{seeded, ScriptedSource};
    use approx::assert_abs_diff_eq;

    #[test]
    fn forward_applies_gelu_between_projections() {
        let config = ModelConfig::new(2, 1, 2, 2, 0.0, 0.0);
        let eye = Tensor::new(vec![1.0f32, 0.0, 0.0, 1.0], vec![2, 2]).unwrap();
        let shift = Tensor::new(vec![0.5, -0.5], vec![2]).unwrap();
        let w1 = Linear::new("w1", eye.clone(), shift, true).unwrap();
        let w2 = Linear::new("w2", eye, Tensor::zeros(vec![2]), true).unwrap();
        let mlp = FeedForward::from_parts(w1, w2, &config).unwrap();

        let x = Tensor::new(vec![1.0, -2.0], vec![2, 1, 1]).unwrap();
        let y = mlp.forward(&x, &mut Mode::Eval).unwrap();
        assert_abs_diff_eq!(y.data[0], gelu_scalar(1.5f32), epsilon = 1e-6);
        assert_abs_diff_eq!(y.data[1], gelu_scalar(-2.5f32), epsilon = 1e-6);
    }

    #[test]
    fn forward_keeps_shape() {
        let config = ModelConfig::new(8, 2, 32, 4, 0.1, 0.0);
        let mlp = FeedForward::<f32>::init(&config, &mut seeded(21)).unwrap();
        let x = Tensor::from_fn(vec![8, 3, 2], |i| i as f32 * 0.01);
        assert_eq!(mlp.forward(&x, &mut Mode::Eval).unwrap().shape, vec![8, 3, 2]);
        let mut rng = seeded(22);
        assert_eq!(mlp.forward(&x, &mut Mode::Train(&mut rng)).unwrap().shape, vec![8, 3, 2]);
    }

    #[test]
    fn dropout_zeroes_output_while_training() {
        // p = 0.5 with every draw below p drops both hidden and output units.
        let config = ModelConfig::new(4, 2, 8, 2, 0.5, 0.0);
        let mlp = FeedForward::<f32>::init(&config, &mut seeded(23)).unwrap();
        let x = Tensor::ones(vec![4, 2, 1]);
        let mut src = ScriptedSource::new(vec![0.1]);
        let y = mlp.forward(&x, &mut Mode::Train(&mut src)).unwrap();
        assert!(y.data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn from_parts_rejects_swapped_weights() {
        let config = ModelConfig::new(4, 2, 8, 2, 0.0, 0.0);
        let mut rng = seeded(24);
        let w1 = Linear::<f32>::init("w1", 8, 4, &mut rng).unwrap();
        let w2 = Linear::init("w2", 4, 8, &mut rng).unwrap();
        assert!(FeedForward::from_parts(w1, w2, &config).is_err());
    }
}
