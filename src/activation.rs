use num_traits::Float;
use tensor_core::{float_const, Tensor};

const GELU_CUBIC: f64 = 0.044715;

/// Tanh approximation of GELU (Hendrycks & Gimpel):
/// `0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 * x^3)))`.
pub fn gelu_scalar<T: Float>(x: T) -> T {
    let sqrt_2_over_pi: T = float_const((2.0 / std::f64::consts::PI).sqrt());
    let cubic: T = float_const(GELU_CUBIC);
    let half: T = float_const(0.5);
    half * x * (T::one() + (sqrt_2_over_pi * (x + cubic * x * x * x)).tanh())
}

/// Element-wise GELU; output has the input's shape and element type.
pub fn gelu<T: Float>(x: &Tensor<T>) -> Tensor<T> {
    x.map(gelu_scalar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;
    use tensor_core::{bf16, f16};

    fn reference(x: f32) -> f32 {
        0.5 * x * (1.0 + libm::tanhf((2.0 / std::f32::consts::PI).sqrt() * (x + 0.044715 * x.powi(3))))
    }

    #[test]
    fn gelu_reference_points() {
        assert_eq!(gelu_scalar(0.0f32), 0.0);
        assert_abs_diff_eq!(gelu_scalar(1.0f32), 0.841192, epsilon = 1e-5);
        assert_abs_diff_eq!(gelu_scalar(-1.0f32), -0.158808, epsilon = 1e-5);
        for x in [-3.0f32, -0.5, 0.25, 2.0, 3.0] {
            assert_abs_diff_eq!(gelu_scalar(x), reference(x), epsilon = 1e-5);
        }
    }

    #[test]
    fn gelu_tracks_exact_erf_form() {
        for i in -40..=40 {
            let x = i as f32 * 0.1;
            let exact = 0.5 * x * (1.0 + libm::erff(x / std::f32::consts::SQRT_2));
            assert_abs_diff_eq!(gelu_scalar(x), exact, epsilon = 1e-3);
        }
    }

    #[test]
    fn gelu_preserves_shape_and_element_type() {
        let x = Tensor::new(vec![-1.0f32, 0.0, 1.0, 2.0], vec![2, 2, 1]).unwrap();
        let half_x: Tensor<f16> = x.cast().unwrap();
        let y: Tensor<f16> = gelu(&half_x);
        assert_eq!(y.shape, vec![2, 2, 1]);
        assert!((y.data[2].to_f32() - 0.8412).abs() < 1e-2);

        let y_bf: Tensor<bf16> = gelu(&x.cast().unwrap());
        assert!((y_bf.data[3].to_f32() - reference(2.0)).abs() < 2e-2);

        let y64 = gelu(&x.cast::<f64>().unwrap());
        assert!((y64.data[2] - 0.8411919906082768).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn gelu_is_non_decreasing_for_positive_inputs(a in 0.0f32..20.0, d in 0.0f32..5.0) {
            // One ulp of slack for f32 rounding inside tanh.
            prop_assert!(gelu_scalar(a + d) >= gelu_scalar(a) - 1e-6 * (1.0 + a));
        }

        #[test]
        fn gelu_approaches_identity_for_large_inputs(x in 6.0f32..100.0) {
            prop_assert!((gelu_scalar(x) - x).abs() <= 1e-4 * x);
        }
    }
}
