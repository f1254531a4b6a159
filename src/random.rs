//! Random sources used for parameter init, dropout and drop-path masks.

use num_traits::Float;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use tensor_core::{float_const, Tensor};

/// Absolute bounds for truncated-normal initialization.
pub const TRUNC_NORMAL_BOUNDS: (f32, f32) = (-2.0, 2.0);

const MAX_REDRAWS: usize = 64;

pub trait RandomSource {
    /// Uniform draw in `[0, 1)`.
    fn next_uniform(&mut self) -> f32;
    /// Standard normal draw.
    fn next_normal(&mut self) -> f32;
}

impl RandomSource for StdRng {
    fn next_uniform(&mut self) -> f32 {
        self.gen::<f32>()
    }

    fn next_normal(&mut self) -> f32 {
        self.sample(StandardNormal)
    }
}

pub fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Replays a fixed list of values, wrapping around when exhausted. Both
/// uniform and normal draws read from the same list.
#[derive(Debug, Clone)]
pub struct ScriptedSource {
    values: Vec<f32>,
    cursor: usize,
}

impl ScriptedSource {
    pub fn new(values: Vec<f32>) -> Self {
        ScriptedSource { values, cursor: 0 }
    }

    fn next(&mut self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        let v = self.values[self.cursor % self.values.len()];
        self.cursor += 1;
        v
    }
}

impl RandomSource for ScriptedSource {
    fn next_uniform(&mut self) -> f32 {
        self.next()
    }

    fn next_normal(&mut self) -> f32 {
        self.next()
    }
}

/// Normal(0, std) samples, redrawn while outside [`TRUNC_NORMAL_BOUNDS`].
pub fn trunc_normal<T: Float>(shape: Vec<usize>, std: f32, rng: &mut dyn RandomSource) -> Tensor<T> {
    let (lo, hi) = TRUNC_NORMAL_BOUNDS;
    Tensor::from_fn(shape, |_| {
        let mut v = rng.next_normal() * std;
        let mut redraws = 0;
        while !(lo..=hi).contains(&v) && redraws < MAX_REDRAWS {
            v = rng.next_normal() * std;
            redraws += 1;
        }
        float_const(f64::from(v.clamp(lo, hi)))
    })
}
