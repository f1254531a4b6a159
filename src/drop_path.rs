use log::{debug, warn};
use num_traits::Float;
use tensor_core::{float_const, Tensor, TensorError};

use crate::error::Result;
use crate::mode::Mode;

/// Stochastic depth over the batch axis of a `[C, T, B]` branch output.
///
/// While training, each sample keeps its branch with probability
/// `1 - p_layerdrop`. Kept samples are divided by the fraction of the batch
/// that was kept, so the batch mean of the mask is one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DropPath {
    pub p_layerdrop: f32,
}

impl DropPath {
    pub fn new(p_layerdrop: f32) -> Self {
        DropPath { p_layerdrop }
    }

    pub fn forward<T: Float>(&self, x: Tensor<T>, mode: &mut Mode<'_>) -> Result<Tensor<T>> {
        let rng = match mode {
            Mode::Train(rng) => rng,
            Mode::Eval => return Ok(x),
        };
        if x.rank() != 3 {
            return Err(TensorError::InvalidShape(format!(
                "drop path expects [C, T, B], got {:?}",
                x.shape
            ))
            .into());
        }
        let batch = x.shape[2];
        if batch == 0 {
            return Ok(x);
        }

        let keep: Vec<bool> = (0..batch).map(|_| rng.next_uniform() >= self.p_layerdrop).collect();
        let kept = keep.iter().filter(|&&k| k).count();
        debug!("drop path mask {:?} (p_layerdrop {})", keep, self.p_layerdrop);
        if kept == 0 {
            warn!(
                "drop path dropped all {} samples (p_layerdrop {}); branch output is zero",
                batch, self.p_layerdrop
            );
            return Ok(Tensor::zeros(x.shape));
        }

        let scale: T = float_const(batch as f64 / kept as f64);
        let mask = Tensor::from_fn(vec![1, 1, batch], |b| if keep[b] { scale } else { T::zero() });
        Ok(x.mul_broadcast(&mask)?)
    }
}
