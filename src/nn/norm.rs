use num_traits::Float;
use tensor_core::{float_const, Tensor};

use crate::error::{BlockError, Result};
use crate::params::Parameter;

pub const LAYER_NORM_EPS: f64 = 1e-6;

/// Affine layer normalization over the channel axis (axis 0).
#[derive(Debug, Clone)]
pub struct LayerNorm<T> {
    axis: usize,
    eps: T,
    scale: Parameter<T>,
    shift: Parameter<T>,
}

impl<T: Float> LayerNorm<T> {
    /// Scale initialized to ones, shift to zeros.
    pub fn new(name: &str, dim: usize) -> Self {
        LayerNorm {
            axis: 0,
            eps: float_const(LAYER_NORM_EPS),
            scale: Parameter::new(format!("{}.weight", name), Tensor::ones(vec![dim])),
            shift: Parameter::new(format!("{}.bias", name), Tensor::zeros(vec![dim])),
        }
    }

    pub fn dim(&self) -> usize {
        self.scale.num_elements()
    }

    pub fn forward(&self, x: &Tensor<T>) -> Result<Tensor<T>> {
        let mut out = x.clone();
        out.layernorm(self.axis, self.scale.tensor(), self.shift.tensor(), self.eps)?;
        Ok(out)
    }

    /// Index 0 is the scale, index 1 the shift.
    pub fn params(&self) -> [&Parameter<T>; 2] {
        [&self.scale, &self.shift]
    }

    pub fn set_param(&mut self, index: usize, tensor: Tensor<T>, requires_grad: bool) -> Result<()> {
        let param = match index {
            0 => &mut self.scale,
            1 => &mut self.shift,
            _ => {
                return Err(BlockError::Config(format!(
                    "LayerNorm has 2 parameters, index {} requested",
                    index
                )))
            }
        };
        param.replace(tensor)?;
        param.requires_grad = requires_grad;
        Ok(())
    }

    pub fn cast<U: Float>(&self) -> Result<LayerNorm<U>> {
        Ok(LayerNorm {
            axis: self.axis,
            eps: float_const(LAYER_NORM_EPS),
            scale: self.scale.cast()?,
            shift: self.shift.cast()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn normalizes_each_token_over_channels() {
        let norm = LayerNorm::<f32>::new("norm1", 4);
        // C=4, T=1, B=2: token 0 = (1,2,3,4), token 1 = (-1,-1,1,1)
        let x = Tensor::new(vec![1.0, -1.0, 2.0, -1.0, 3.0, 1.0, 4.0, 1.0], vec![4, 1, 2]).unwrap();
        let y = norm.forward(&x).unwrap();
        assert_eq!(y.shape, x.shape);
        for b in 0..2 {
            let col: Vec<f32> = (0..4).map(|c| y.data[c * 2 + b]).collect();
            let mean: f32 = col.iter().sum::<f32>() / 4.0;
            let var: f32 = col.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
            assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-5);
            assert_abs_diff_eq!(var, 1.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn set_param_by_position() {
        let mut norm = LayerNorm::<f32>::new("norm2", 2);
        norm.set_param(0, Tensor::new(vec![2.0, 2.0], vec![2]).unwrap(), false).unwrap();
        norm.set_param(1, Tensor::new(vec![1.0, 1.0], vec![2]).unwrap(), false).unwrap();
        let y = norm.forward(&Tensor::new(vec![-1.0, 1.0], vec![2, 1, 1]).unwrap()).unwrap();
        assert_abs_diff_eq!(y.data[0], -1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(y.data[1], 3.0, epsilon = 1e-4);
        assert!(norm.params().iter().all(|p| !p.requires_grad));
        assert!(norm.set_param(2, Tensor::ones(vec![2]), false).is_err());
        assert!(norm.set_param(0, Tensor::ones(vec![3]), false).is_err());
    }
}
