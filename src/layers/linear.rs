//! Linear Layer (Fully Connected)
//!
//! An affine transformation `y = x @ W + b`, where the bias is optional.
//! Attention projections have no bias; the feed-forward layers do.
//!
//! ## Forward Pass
//!
//! ```text
//! Input:  x [.., in_features]
//! Weight: W [in_features, out_features]
//! Bias:   b [out_features]           (optional)
//! Output: y = x @ W + b [.., out_features]
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! grad_W = x^T @ grad_y        (leading dims of x folded into rows)
//! grad_b = sum(grad_y) over every axis but the last
//! grad_x = grad_y @ W^T
//! ```
//!
//! Parameter gradients are accumulated into [`Parameter::grad`]; the input
//! gradient is returned to the caller.

use crate::parameter::Parameter;
use crate::tensor::Tensor;
use rand::Rng;

/// Linear layer with an optional bias
#[derive(Clone, Debug)]
pub struct Linear {
    pub weight: Parameter,
    pub bias: Option<Parameter>,
}

impl Linear {
    /// Create a layer with `N(0,1)/sqrt(in_features)` weights
    ///
    /// `weight_name` and `bias_name` become the checkpoint keys. Passing
    /// `None` for the bias builds a bias-free projection.
    pub fn new<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        weight_name: impl Into<String>,
        bias_name: Option<String>,
        rng: &mut R,
    ) -> Self {
        Self {
            weight: Parameter::normal(
                weight_name,
                vec![in_features, out_features],
                in_features,
                rng,
            ),
            bias: bias_name.map(|name| Parameter::zeros(name, vec![out_features])),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.value.shape[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.value.shape[1]
    }

    /// Forward pass; caches the input for the backward pass
    pub fn forward(&self, x: &Tensor) -> (Tensor, LinearCache) {
        let mut y = x.matmul(&self.weight.value);
        if let Some(bias) = &self.bias {
            y = y.add(&bias.value);
        }
        (y, LinearCache { x: x.clone() })
    }

    /// Backward pass
    ///
    /// Accumulates `grad_W` (and `grad_b`) and returns `grad_x`.
    pub fn backward(&mut self, grad_out: &Tensor, cache: &LinearCache) -> Tensor {
        let in_features = self.in_features();
        let out_features = self.out_features();

        let x_2d = cache.x.reshape(&[cache.x.num_rows(), in_features]);
        let g_2d = grad_out.reshape(&[grad_out.num_rows(), out_features]);

        let grad_weight = x_2d.transpose(0, 1).matmul(&g_2d);
        self.weight.accumulate(&grad_weight);

        if let Some(bias) = &mut self.bias {
            bias.accumulate(&grad_out.sum_to_last_dim());
        }

        grad_out.matmul(&self.weight.value.transpose(0, 1))
    }

    /// Parameters in canonical order: weight, then bias
    pub fn parameters(&self) -> Vec<&Parameter> {
        let mut params = vec![&self.weight];
        params.extend(self.bias.as_ref());
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = vec![&mut self.weight];
        params.extend(self.bias.as_mut());
        params
    }
}

/// Cache for linear layer backward pass
#[derive(Clone, Debug)]
pub struct LinearCache {
    pub x: Tensor,
}
