//! Layer Normalization
//!
//! Normalizes each row over the feature dimension, then applies a learnable
//! scale (gamma) and shift (beta).
//!
//! ## Forward Pass
//!
//! ```text
//! mean   = Σ x / N
//! var    = Σ (x - mean)² / N
//! x_norm = (x - mean) / √(var + ε)
//! y      = γ ⊙ x_norm + β
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! grad_γ      = Σ_rows grad_y ⊙ x_norm
//! grad_β      = Σ_rows grad_y
//! grad_x_norm = grad_y ⊙ γ
//! grad_x      = (grad_x_norm - E[grad_x_norm] - x_norm ⊙ E[grad_x_norm ⊙ x_norm]) / √(var + ε)
//! ```
//!
//! The two expectation terms carry the dependency of every output on the
//! row's mean and variance.

use crate::parameter::Parameter;
use crate::tensor::Tensor;
use rayon::prelude::*;

/// Layer normalization over the last dimension
#[derive(Clone, Debug)]
pub struct LayerNorm {
    pub gamma: Parameter,
    pub beta: Parameter,
    pub eps: f32,
}

impl LayerNorm {
    /// gamma starts at 1 and beta at 0, so a fresh layer is a pure normalizer
    pub fn new(d_model: usize, eps: f32, prefix: &str) -> Self {
        Self {
            gamma: Parameter::ones(format!("{}.gamma", prefix), vec![d_model]),
            beta: Parameter::zeros(format!("{}.beta", prefix), vec![d_model]),
            eps,
        }
    }

    pub fn forward(&self, x: &Tensor) -> (Tensor, LayerNormCache) {
        let d = x.last_dim();
        let rows = x.num_rows();
        let gamma = &self.gamma.value.data;
        let beta = &self.beta.value.data;

        let mut y = vec![0.0; x.len()];
        let mut x_norm = vec![0.0; x.len()];
        let mut std = vec![0.0; rows];

        if d > 0 {
            y.par_chunks_mut(d)
                .zip(x_norm.par_chunks_mut(d))
                .zip(std.par_iter_mut())
                .zip(x.data.par_chunks(d))
                .for_each(|(((y_row, xn_row), std_val), x_row)| {
                    let mean = x_row.iter().sum::<f32>() / d as f32;
                    let var = x_row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / d as f32;
                    *std_val = (var + self.eps).sqrt();

                    for j in 0..d {
                        xn_row[j] = (x_row[j] - mean) / *std_val;
                        y_row[j] = gamma[j] * xn_row[j] + beta[j];
                    }
                });
        }

        let cache = LayerNormCache {
            x_norm: Tensor::new(x_norm, x.shape.clone()),
            std,
        };
        (Tensor::new(y, x.shape.clone()), cache)
    }

    /// Accumulates gamma/beta gradients and returns the input gradient
    pub fn backward(&mut self, grad_out: &Tensor, cache: &LayerNormCache) -> Tensor {
        let d = grad_out.last_dim();

        self.gamma
            .accumulate(&grad_out.mul(&cache.x_norm).sum_to_last_dim());
        self.beta.accumulate(&grad_out.sum_to_last_dim());

        let grad_x_norm = grad_out.mul(&self.gamma.value);
        let mut grad_x = vec![0.0; grad_out.len()];

        if d > 0 {
            grad_x
                .par_chunks_mut(d)
                .zip(grad_x_norm.data.par_chunks(d))
                .zip(cache.x_norm.data.par_chunks(d))
                .zip(cache.std.par_iter())
                .for_each(|(((out, gxn), xn), &std_val)| {
                    let mean_g = gxn.iter().sum::<f32>() / d as f32;
                    let mean_gx = gxn.iter().zip(xn).map(|(g, x)| g * x).sum::<f32>() / d as f32;
                    for j in 0..d {
                        out[j] = (gxn[j] - mean_g - xn[j] * mean_gx) / std_val;
                    }
                });
        }

        Tensor::new(grad_x, grad_out.shape.clone())
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.gamma, &self.beta]
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.gamma, &mut self.beta]
    }
}

/// Cache for layer norm backward pass
#[derive(Clone, Debug)]
pub struct LayerNormCache {
    pub x_norm: Tensor,
    /// `√(var + ε)` per row
    pub std: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_rows_are_normalized() {
        let ln = LayerNorm::new(4, 1e-6, "ln1");
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, -10.0, 0.0, 10.0, 20.0], vec![2, 4]);
        let (y, _) = ln.forward(&x);

        for r in 0..2 {
            let row = y.row(r);
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            let var: f32 = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
            assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-5);
            assert_abs_diff_eq!(var, 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_constant_row_is_finite() {
        let ln = LayerNorm::new(3, 1e-6, "ln");
        let (y, _) = ln.forward(&Tensor::full(vec![1, 3], 5.0));
        assert!(y.data.iter().all(|v| v.is_finite() && v.abs() < 1e-3));
    }

    #[test]
    fn test_parameter_names() {
        let ln = LayerNorm::new(3, 1e-6, "transformer_blocks.1.ln2");
        let names: Vec<_> = ln.parameters().iter().map(|p| p.name.clone()).collect();
        assert_eq!(
            names,
            vec!["transformer_blocks.1.ln2.gamma", "transformer_blocks.1.ln2.beta"]
        );
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut ln = LayerNorm::new(4, 1e-6, "ln");
        ln.gamma.value = Tensor::new(vec![1.0, 0.5, -1.0, 2.0], vec![4]);
        let x = Tensor::new(vec![0.3, -1.1, 0.9, 2.0, 1.0, 0.2, -0.4, 0.6], vec![2, 4]);
        let w = Tensor::new(vec![1.0, -2.0, 0.5, 0.3, -0.7, 1.5, 0.2, 1.0], vec![2, 4]);

        let loss = |ln: &LayerNorm, x: &Tensor| -> f32 {
            ln.forward(x).0.data.iter().zip(&w.data).map(|(a, b)| a * b).sum()
        };

        let (_, cache) = ln.forward(&x);
        let grad_x = ln.backward(&w, &cache);

        let h = 1e-2;
        for i in 0..x.len() {
            let mut plus = x.clone();
            plus.data[i] += h;
            let mut minus = x.clone();
            minus.data[i] -= h;
            let numeric = (loss(&ln, &plus) - loss(&ln, &minus)) / (2.0 * h);
            assert_abs_diff_eq!(grad_x.data[i], numeric, epsilon = 2e-2);
        }

        for i in 0..4 {
            let mut plus = ln.clone();
            plus.gamma.value.data[i] += h;
            let mut minus = ln.clone();
            minus.gamma.value.data[i] -= h;
            let numeric = (loss(&plus, &x) - loss(&minus, &x)) / (2.0 * h);
            assert_abs_diff_eq!(ln.gamma.grad.data[i], numeric, epsilon = 2e-2);
        }
    }
}
