//! Gradient Utilities
//!
//! Global gradient norm and norm-based clipping.
//!
//! ## Gradient Clipping
//!
//! Occasionally a batch produces a very large gradient, and a single update
//! of that size can wreck the weights. Clipping rescales every gradient by
//! the same factor so the global norm is bounded while the direction of the
//! update is kept:
//!
//! ```text
//! norm = √(Σ_params Σ g²)
//! if norm > max_norm:
//!     g *= max_norm / (norm + 1e-6)
//! ```
//!
//! Clipping runs after backward and before the optimizer step. The norm is
//! also a useful training metric: a norm that keeps growing usually means
//! the learning rate is too high.

use crate::parameter::Parameter;
use rayon::prelude::*;

/// L2 norm over every gradient in `params`
pub fn global_grad_norm(params: &[&mut Parameter]) -> f32 {
    params
        .iter()
        .map(|p| p.grad.sum_squares())
        .sum::<f32>()
        .sqrt()
}

/// Scale all gradients so their global norm is at most `max_norm`
///
/// Returns the norm measured before clipping.
pub fn clip_gradients(params: &mut [&mut Parameter], max_norm: f32) -> f32 {
    let norm = global_grad_norm(params);

    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for p in params.iter_mut() {
            p.grad.data.par_iter_mut().for_each(|g| *g *= scale);
        }
    }

    norm
}
