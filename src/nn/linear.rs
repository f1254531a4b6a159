use num_traits::Float;
use tensor_core::Tensor;

use crate::error::{BlockError, Result};
use crate::params::Parameter;
use crate::random::{trunc_normal, RandomSource};

/// Standard deviation of the truncated-normal weight init.
pub const INIT_STD: f32 = 0.02;

/// Affine projection over the leading (channel) axis.
#[derive(Debug, Clone)]
pub struct Linear<T> {
    weight: Parameter<T>,
    bias: Parameter<T>,
}

impl<T: Float> Linear<T> {
    /// `weight` is `[out, in]`, `bias` is `[out]`.
    pub fn new(name: &str, weight: Tensor<T>, bias: Tensor<T>, requires_grad: bool) -> Result<Self> {
        if weight.rank() != 2 || weight.shape[1] == 0 {
            return Err(BlockError::InvalidWeightShape(format!(
                "{}.weight must be 2D [out, in], got {:?}",
                name, weight.shape
            )));
        }
        if bias.shape != [weight.shape[0]] {
            return Err(BlockError::InvalidWeightShape(format!(
                "{}.bias shape mismatch: expected [{}], got {:?}",
                name, weight.shape[0], bias.shape
            )));
        }
        let (weight_name, bias_name) = (format!("{}.weight", name), format!("{}.bias", name));
        let (weight, bias) = if requires_grad {
            (Parameter::new(weight_name, weight), Parameter::new(bias_name, bias))
        } else {
            (Parameter::frozen(weight_name, weight), Parameter::frozen(bias_name, bias))
        };
        Ok(Linear { weight, bias })
    }

    /// Truncated-normal weight, zero bias.
    pub fn init(name: &str, in_dim: usize, out_dim: usize, rng: &mut dyn RandomSource) -> Result<Self> {
        let weight = trunc_normal(vec![out_dim, in_dim], INIT_STD, rng);
        Linear::new(name, weight, Tensor::zeros(vec![out_dim]), true)
    }

    pub fn weight(&self) -> &Parameter<T> {
        &self.weight
    }

    pub fn bias(&self) -> &Parameter<T> {
        &self.bias
    }

    pub fn in_dim(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_dim(&self) -> usize {
        self.weight.shape()[0]
    }

    /// `[in, ...] -> [out, ...]`.
    pub fn forward(&self, x: &Tensor<T>) -> Result<Tensor<T>> {
        let in_dim = self.in_dim();
        if x.shape.first() != Some(&in_dim) {
            return Err(BlockError::InvalidWeightShape(format!(
                "{}: input leading dim {:?} != in_dim {}",
                self.weight.name,
                x.shape.first(),
                in_dim
            )));
        }
        let cols = x.num_elements() / in_dim;
        let x_2d = x.reshape(vec![in_dim, cols])?;
        let mut out = self.weight.tensor().matmul(&x_2d)?;
        for (row, &b) in out.data.chunks_exact_mut(cols.max(1)).zip(self.bias.tensor().data.iter()) {
            for v in row.iter_mut() {
                *v = *v + b;
            }
        }
        let mut out_shape = x.shape.clone();
        out_shape[0] = self.out_dim();
        Ok(out.into_shape(out_shape)?)
    }

    pub fn set_weight(&mut self, weight: Tensor<T>) -> Result<()> {
        self.weight.replace(weight)
    }

    pub fn set_bias(&mut self, bias: Tensor<T>) -> Result<()> {
        self.bias.replace(bias)
    }

    pub fn params(&self) -> [&Parameter<T>; 2] {
        [&self.weight, &self.bias]
    }

    pub fn cast<U: Float>(&self) -> Result<Linear<U>> {
        Ok(Linear { weight: self.weight.cast()?, bias: self.bias.cast()? })
    }
}
