//! Activation Functions
//!
//! Forward and backward passes for the two non-linearities in the model.
//!
//! ## ReLU
//!
//! ```text
//! relu(x)  = max(0, x)
//! relu'(x) = 1 if x > 0 else 0
//! ```
//!
//! The derivative at exactly zero is taken as 0.
//!
//! ## Softmax
//!
//! Applied along the last axis, with an optional temperature `T`:
//!
//! ```text
//! softmax(x / T)_i = exp((x_i - max) / T) / Σ_j exp((x_j - max) / T)
//! ```
//!
//! Given the forward output `s` and an upstream gradient `g`, the Jacobian
//! product per row is
//!
//! ```text
//! grad_x = s ⊙ (g - Σ_j g_j s_j)
//! ```

use crate::error::{LmError, Result};
use crate::tensor::Tensor;
use rayon::prelude::*;

/// ReLU activation (forward pass)
pub fn relu_forward(x: &Tensor) -> Tensor {
    x.map(|v| v.max(0.0))
}

/// ReLU derivative (backward pass)
///
/// `x` is the original input to the activation.
pub fn relu_backward(grad_out: &Tensor, x: &Tensor) -> Tensor {
    let data = x
        .data
        .par_iter()
        .zip(&grad_out.data)
        .map(|(&x_val, &g)| if x_val > 0.0 { g } else { 0.0 })
        .collect();
    Tensor::new(data, x.shape.clone())
}

/// Softmax along the last axis after dividing by `temperature`
///
/// Returns a configuration error when `temperature <= 0`.
pub fn softmax(x: &Tensor, temperature: f32) -> Result<Tensor> {
    if !(temperature > 0.0) {
        return Err(LmError::Configuration(format!(
            "softmax temperature must be positive, got {}",
            temperature
        )));
    }
    if temperature == 1.0 {
        return Ok(x.softmax());
    }
    Ok(x.mul_scalar(1.0 / temperature).softmax())
}

/// Softmax backward along the last axis
///
/// `probs` is the forward output.
pub fn softmax_backward(grad_out: &Tensor, probs: &Tensor) -> Tensor {
    let cols = probs.last_dim();
    let mut data = vec![0.0; probs.len()];
    if cols == 0 {
        return Tensor::new(data, probs.shape.clone());
    }

    data.par_chunks_mut(cols)
        .zip(probs.data.par_chunks(cols))
        .zip(grad_out.data.par_chunks(cols))
        .for_each(|((out, s), g)| {
            let dot: f32 = s.iter().zip(g).map(|(a, b)| a * b).sum();
            for ((o, &s_i), &g_i) in out.iter_mut().zip(s).zip(g) {
                *o = s_i * (g_i - dot);
            }
        });

    Tensor::new(data, probs.shape.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_relu_backward_masks_non_positive() {
        let x = Tensor::new(vec![-1.0, 0.0, 2.0], vec![3]);
        let g = Tensor::new(vec![5.0, 5.0, 5.0], vec![3]);
        assert_eq!(relu_forward(&x).data, vec![0.0, 0.0, 2.0]);
        assert_eq!(relu_backward(&g, &x).data, vec![0.0, 0.0, 5.0]);
    }

    #[test]
    fn test_softmax_stable_for_large_inputs() {
        let x = Tensor::new(vec![1000.0, 1000.0], vec![1, 2]);
        let s = softmax(&x, 1.0).unwrap();
        assert_abs_diff_eq!(s.data[0], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(s.data[1], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_low_temperature_sharpens() {
        let x = Tensor::new(vec![1.0, 2.0], vec![2]);
        let warm = softmax(&x, 1.0).unwrap();
        let cold = softmax(&x, 0.1).unwrap();
        assert!(cold.data[1] > warm.data[1]);
    }

    #[test]
    fn test_non_positive_temperature_rejected() {
        let x = Tensor::new(vec![1.0, 2.0], vec![2]);
        assert!(matches!(softmax(&x, 0.0), Err(LmError::Configuration(_))));
        assert!(matches!(softmax(&x, -1.0), Err(LmError::Configuration(_))));
    }

    #[test]
    fn test_softmax_backward_matches_finite_difference() {
        let x = Tensor::new(vec![0.3, -1.2, 0.8, 0.1], vec![1, 4]);
        let weights = [0.5, -1.0, 2.0, 0.25];
        let loss = |t: &Tensor| -> f32 {
            softmax(t, 1.0)
                .unwrap()
                .data
                .iter()
                .zip(weights.iter())
                .map(|(a, b)| a * b)
                .sum()
        };

        let probs = softmax(&x, 1.0).unwrap();
        let g = Tensor::new(weights.to_vec(), vec![1, 4]);
        let analytic = softmax_backward(&g, &probs);

        let h = 1e-3;
        for i in 0..4 {
            let mut plus = x.clone();
            plus.data[i] += h;
            let mut minus = x.clone();
            minus.data[i] -= h;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
            assert_abs_diff_eq!(analytic.data[i], numeric, epsilon = 1e-3);
        }
    }
}
