use num_traits::Float;
use tensor_core::{float_const, Tensor, TensorError};

use crate::config::ModelConfig;
use crate::error::{BlockError, Result};
use crate::mode::Mode;
use crate::nn::{dropout, Linear};
use crate::params::Parameter;
use crate::random::RandomSource;

/// Moves attention heads in and out of the batch axis.
///
/// Projections are `[H*D, T, B]`; the merged layout is `[B*H, T, D]` with
/// slice `b*H + h` holding head `h` of sample `b`, so every head of every
/// sample becomes one matrix of a batched matmul.
pub trait HeadLayout<T> {
    fn split_heads(&self, n_heads: usize, head_dim: usize) -> Result<Tensor<T>>;
    fn merge_heads(&self, n_heads: usize) -> Result<Tensor<T>>;
}

impl<T: Float> HeadLayout<T> for Tensor<T> {
    fn split_heads(&self, n_heads: usize, head_dim: usize) -> Result<Tensor<T>> {
        if self.rank() != 3 || self.shape[0] != n_heads * head_dim {
            return Err(TensorError::InvalidShape(format!(
                "split_heads expects [{}, T, B], got {:?}",
                n_heads * head_dim,
                self.shape
            ))
            .into());
        }
        let (t, b) = (self.shape[1], self.shape[2]);
        let out = self
            .reshape(vec![n_heads, head_dim, t, b])?
            .permute(&[3, 0, 2, 1])?
            .into_shape(vec![b * n_heads, t, head_dim])?;
        Ok(out)
    }

    fn merge_heads(&self, n_heads: usize) -> Result<Tensor<T>> {
        if self.rank() != 3 || n_heads == 0 || self.shape[0] % n_heads != 0 {
            return Err(TensorError::InvalidShape(format!(
                "merge_heads expects [B*{}, T, D], got {:?}",
                n_heads, self.shape
            ))
            .into());
        }
        let (t, d) = (self.shape[1], self.shape[2]);
        let b = self.shape[0] / n_heads;
        let out = self
            .reshape(vec![b, n_heads, t, d])?
            .permute(&[1, 3, 2, 0])?
            .into_shape(vec![n_heads * d, t, b])?;
        Ok(out)
    }
}

/// Multi-head scaled dot-product self-attention with separate Q/K/V
/// projections and an output projection.
#[derive(Debug, Clone)]
pub struct SelfAttention<T> {
    pub wq: Linear<T>,
    pub wk: Linear<T>,
    pub wv: Linear<T>,
    pub wf: Linear<T>,
    n_heads: usize,
    head_dim: usize,
    p_dropout: f32,
}

impl<T: Float> SelfAttention<T> {
    pub fn init(config: &ModelConfig, rng: &mut dyn RandomSource) -> Result<Self> {
        let (d, inner) = (config.model_dim, config.inner_dim());
        SelfAttention::from_parts(
            Linear::init("wq", d, inner, rng)?,
            Linear::init("wk", d, inner, rng)?,
            Linear::init("wv", d, inner, rng)?,
            Linear::init("wf", inner, d, rng)?,
            config,
        )
    }

    pub fn from_parts(
        wq: Linear<T>,
        wk: Linear<T>,
        wv: Linear<T>,
        wf: Linear<T>,
        config: &ModelConfig,
    ) -> Result<Self> {
        let inner = config.inner_dim();
        for proj in [&wq, &wk, &wv] {
            if proj.weight().shape() != [inner, config.model_dim] {
                return Err(BlockError::InvalidWeightShape(format!(
                    "{} shape mismatch: expected [{}, {}], got {:?}",
                    proj.weight().name,
                    inner,
                    config.model_dim,
                    proj.weight().shape()
                )));
            }
        }
        if wf.weight().shape() != [config.model_dim, inner] {
            return Err(BlockError::InvalidWeightShape(format!(
                "{} shape mismatch: expected [{}, {}], got {:?}",
                wf.weight().name,
                config.model_dim,
                inner,
                wf.weight().shape()
            )));
        }
        Ok(SelfAttention {
            wq,
            wk,
            wv,
            wf,
            n_heads: config.n_heads,
            head_dim: config.head_dim,
            p_dropout: config.p_dropout,
        })
    }

    /// Query-key products scaled by `1/sqrt(head_dim)`, before softmax.
    /// Shape `[B*H, T, T]`, key positions on the last axis.
    pub fn scores(&self, x: &Tensor<T>) -> Result<Tensor<T>> {
        let mut q = self.wq.forward(x)?.split_heads(self.n_heads, self.head_dim)?;
        let k = self.wk.forward(x)?.split_heads(self.n_heads, self.head_dim)?;
        q.scalar_mul(T::one() / float_const::<T>(self.head_dim as f64).sqrt())?;
        Ok(q.batched_matmul_nt(&k)?)
    }

    /// Softmax-normalized attention weights, `[B*H, T, T]`.
    pub fn attention_weights(&self, x: &Tensor<T>) -> Result<Tensor<T>> {
        let mut attn = self.scores(x)?;
        attn.softmax(2)?;
        Ok(attn)
    }

    /// `[C, T, B] -> [C, T, B]`. Dropout applies to the projected output
    /// only, never to the attention weights.
    pub fn forward(&self, x: &Tensor<T>, mode: &mut Mode<'_>) -> Result<Tensor<T>> {
        let attn = self.attention_weights(x)?;
        let v = self.wv.forward(x)?.split_heads(self.n_heads, self.head_dim)?;
        let heads = attn.batched_matmul(&v)?;
        let merged = heads.merge_heads(self.n_heads)?;
        let projected = self.wf.forward(&merged)?;
        Ok(dropout(projected, self.p_dropout, mode))
    }

    /// wq, wk, wv, wf; weight before bias.
    pub fn params(&self) -> Vec<&Parameter<T>> {
        [&self.wq, &self.wk, &self.wv, &self.wf]
            .into_iter()
            .flat_map(|l| l.params())
            .collect()
    }

    pub fn cast<U: Float>(&self) -> Result<SelfAttention<U>> {
        Ok(SelfAttention {
            wq: self.wq.cast()?,
            wk: self.wk.cast()?,
            wv: self.wv.cast()?,
            wf: self.wf.cast()?,
            n_heads: self.n_heads,
            head_dim: self.head_dim,
            p_dropout: self.p_dropout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::seeded;
    use approx::assert_abs_diff_eq;

    fn small_config() -> ModelConfig {
        ModelConfig::new(8, 2, 16, 3, 0.0, 0.0)
    }

    fn input(c: usize, t: usize, b: usize) -> Tensor<f32> {
        Tensor::from_fn(vec![c, t, b], |i| ((i * 7 % 13) as f32 - 6.0) * 0.25)
    }

    #[test]
    fn split_then_merge_is_identity() {
        let x = Tensor::<f32>::from_fn(vec![6, 4, 2], |i| i as f32);
        let heads = x.split_heads(3, 2).unwrap();
        assert_eq!(heads.shape, vec![6, 4, 2]);
        // sample 1, head 2, token 3, dim 1 comes from channel 2*2+1
        assert_eq!(heads.get(&[1 * 3 + 2, 3, 1]).unwrap(), x.get(&[5, 3, 1]).unwrap());
        assert_eq!(heads.merge_heads(3).unwrap(), x);
    }

    #[test]
    fn split_heads_rejects_wrong_width() {
        let x = Tensor::<f32>::zeros(vec![5, 2, 1]);
        assert!(x.split_heads(2, 2).is_err());
    }

    #[test]
    fn forward_keeps_shape() {
        let config = small_config();
        let attn = SelfAttention::<f32>::init(&config, &mut seeded(11)).unwrap();
        let x = input(8, 5, 2);
        let y = attn.forward(&x, &mut Mode::Eval).unwrap();
        assert_eq!(y.shape, vec![8, 5, 2]);
    }

    #[test]
    fn attention_rows_sum_to_one() {
        let config = small_config();
        let attn = SelfAttention::<f32>::init(&config, &mut seeded(12)).unwrap();
        let w = attn.attention_weights(&input(8, 4, 3)).unwrap();
        assert_eq!(w.shape, vec![3 * 3, 4, 4]);
        for row in w.data.chunks_exact(4) {
            assert_abs_diff_eq!(row.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
            assert!(row.iter().all(|&p| p >= 0.0));
        }
    }

    #[test]
    fn scaling_query_scales_scores() {
        let config = ModelConfig::new(4, 4, 8, 1, 0.0, 0.0);
        let attn = SelfAttention::<f32>::init(&config, &mut seeded(13)).unwrap();
        let x = input(4, 3, 1);
        let base = attn.scores(&x).unwrap();

        let k = 3.0;
        let mut scaled = attn.clone();
        let mut weight = attn.wq.weight().tensor().clone();
        let mut bias = attn.wq.bias().tensor().clone();
        weight.scalar_mul(k).unwrap();
        bias.scalar_mul(k).unwrap();
        scaled.wq.set_weight(weight).unwrap();
        scaled.wq.set_bias(bias).unwrap();
        let scores = scaled.scores(&x).unwrap();
        for (s, b) in scores.data.iter().zip(base.data.iter()) {
            assert_abs_diff_eq!(*s, k * *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn scores_are_scaled_by_inverse_sqrt_head_dim() {
        // Identity projections, zero bias: scores are x_t . x_s / sqrt(4).
        let config = ModelConfig::new(4, 4, 8, 1, 0.0, 0.0);
        let eye = Tensor::<f32>::from_fn(vec![4, 4], |i| if i % 5 == 0 { 1.0 } else { 0.0 });
        let lin = |name: &str| Linear::new(name, eye.clone(), Tensor::zeros(vec![4]), true).unwrap();
        let attn = SelfAttention::from_parts(lin("wq"), lin("wk"), lin("wv"), lin("wf"), &config).unwrap();
        // two tokens: (1, 0, 0, 0) and (1, 1, 1, 1)
        let x = Tensor::new(vec![1.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0], vec![4, 2, 1]).unwrap();
        let s = attn.scores(&x).unwrap();
        assert_eq!(s.data, vec![0.5, 0.5, 0.5, 2.0]);
    }

    #[test]
    fn from_parts_rejects_mismatched_projection() {
        let config = small_config();
        let mut rng = seeded(14);
        let wq = Linear::<f32>::init("wq", 8, 4, &mut rng).unwrap();
        let wk = Linear::init("wk", 8, 6, &mut rng).unwrap();
        let wv = Linear::init("wv", 8, 6, &mut rng).unwrap();
        let wf = Linear::init("wf", 6, 8, &mut rng).unwrap();
        assert!(SelfAttention::from_parts(wq, wk, wv, wf, &config).is_err());
    }

    #[test]
    fn heads_do_not_mix_across_batch() {
        let config = small_config();
        let attn = SelfAttention::<f32>::init(&config, &mut seeded(15)).unwrap();
        let x = input(8, 3, 2);
        let both = attn.forward(&x, &mut Mode::Eval).unwrap();
        // Sample 1 alone must give the same result as in the batch.
        let x1 = Tensor::from_fn(vec![8, 3, 1], |i| x.data[i * 2 + 1]);
        let alone = attn.forward(&x1, &mut Mode::Eval).unwrap();
        for i in 0..alone.data.len() {
            assert_abs_diff_eq!(alone.data[i], both.data[i * 2 + 1], epsilon = 1e-6);
        }
    }
}
