//! Position-wise Feed-Forward Network
//!
//! ```text
//! x → Linear(W1, b1) → ReLU → Linear(W2, b2) → y
//! [.., d_model] → [.., d_ff] → [.., d_model]
//! ```

use super::activation::{relu_backward, relu_forward};
use super::linear::{Linear, LinearCache};
use crate::parameter::Parameter;
use crate::tensor::Tensor;
use rand::Rng;

/// Two linear layers with a ReLU between them
#[derive(Clone, Debug)]
pub struct FeedForward {
    pub fc1: Linear,
    pub fc2: Linear,
}

impl FeedForward {
    pub fn new<R: Rng + ?Sized>(d_model: usize, d_ff: usize, prefix: &str, rng: &mut R) -> Self {
        Self {
            fc1: Linear::new(
                d_model,
                d_ff,
                format!("{}.W1", prefix),
                Some(format!("{}.b1", prefix)),
                rng,
            ),
            fc2: Linear::new(
                d_ff,
                d_model,
                format!("{}.W2", prefix),
                Some(format!("{}.b2", prefix)),
                rng,
            ),
        }
    }

    pub fn forward(&self, x: &Tensor) -> (Tensor, FeedForwardCache) {
        let (h, fc1_cache) = self.fc1.forward(x);
        let h_activated = relu_forward(&h);
        let (y, fc2_cache) = self.fc2.forward(&h_activated);
        let cache = FeedForwardCache {
            fc1_cache,
            h,
            fc2_cache,
        };
        (y, cache)
    }

    pub fn backward(&mut self, grad_out: &Tensor, cache: &FeedForwardCache) -> Tensor {
        let grad_h_activated = self.fc2.backward(grad_out, &cache.fc2_cache);
        let grad_h = relu_backward(&grad_h_activated, &cache.h);
        self.fc1.backward(&grad_h, &cache.fc1_cache)
    }

    /// `W1, b1, W2, b2`
    pub fn parameters(&self) -> Vec<&Parameter> {
        let mut params = self.fc1.parameters();
        params.extend(self.fc2.parameters());
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = self.fc1.parameters_mut();
        params.extend(self.fc2.parameters_mut());
        params
    }
}

/// Cache for feed-forward backward pass
#[derive(Clone, Debug)]
pub struct FeedForwardCache {
    pub fc1_cache: LinearCache,
    /// Pre-activation, needed for the ReLU derivative
    pub h: Tensor,
    pub fc2_cache: LinearCache,
}
