use num_traits::Float;
use tensor_core::{float_const, Tensor};

use crate::mode::Mode;

/// Inverted dropout: while training, each element is zeroed with probability
/// `p` and survivors are scaled by `1 / (1 - p)`. Identity in eval mode.
pub fn dropout<T: Float>(mut x: Tensor<T>, p: f32, mode: &mut Mode<'_>) -> Tensor<T> {
    let p = mode.effective_p(p);
    let rng = match mode {
        Mode::Train(rng) if p > 0.0 => rng,
        _ => return x,
    };
    if p >= 1.0 {
        x.data.iter_mut().for_each(|v| *v = T::zero());
        return x;
    }
    let scale: T = float_const(1.0 / (1.0 - f64::from(p)));
    for v in x.data.iter_mut() {
        *v = if rng.next_uniform() >= p { *v * scale } else { T::zero() };
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::{seeded, ScriptedSource};

    #[test]
    fn eval_mode_is_identity() {
        let x = Tensor::<f32>::from_fn(vec![4, 2, 2], |i| i as f32);
        let y = dropout(x.clone(), 0.5, &mut Mode::Eval);
        assert_eq!(x, y);
    }

    #[test]
    fn zero_probability_is_identity_while_training() {
        let x = Tensor::<f32>::ones(vec![3, 3, 1]);
        let mut rng = seeded(3);
        assert_eq!(dropout(x.clone(), 0.0, &mut Mode::Train(&mut rng)), x);
    }

    #[test]
    fn training_scales_survivors() {
        let x = Tensor::<f32>::ones(vec![4, 1, 1]);
        let mut src = ScriptedSource::new(vec![0.9, 0.1, 0.5, 0.2]);
        let y = dropout(x, 0.25, &mut Mode::Train(&mut src));
        let s = 1.0 / 0.75;
        assert_eq!(y.data, vec![s, 0.0, s, 0.0]);
    }

    #[test]
    fn probability_one_zeroes_everything() {
        let x = Tensor::<f32>::ones(vec![2, 2, 2]);
        let mut rng = seeded(5);
        let y = dropout(x, 1.0, &mut Mode::Train(&mut rng));
        assert!(y.data.iter().all(|&v| v == 0.0));
    }
}
