//! Cross-entropy loss over vocabulary logits
//!
//! ```text
//! loss = -(1 / (B·L)) Σ log softmax(logits)[target]
//! ```
//!
//! Log-probabilities are computed as `(x - max) - ln Σ exp(x - max)`, so the
//! loss stays finite for logits in the thousands.
//!
//! With label smoothing `s`, the target distribution puts `1 - s` on the
//! target id and `s / (V - 1)` on every other id. The gradient with respect
//! to the logits is `(softmax - target_dist) / (B·L)` in both cases.

use crate::error::{LmError, Result};
use crate::tensor::Tensor;
use rayon::prelude::*;

#[derive(Clone, Debug, Default)]
pub struct CrossEntropyLoss {
    pub label_smoothing: f32,
}

/// Values kept from the forward pass
#[derive(Clone, Debug)]
pub struct LossCache {
    pub probs: Tensor,
    pub targets: Vec<u32>,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    /// `smoothing` must lie in `[0, 1)`
    pub fn with_label_smoothing(smoothing: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&smoothing) {
            return Err(LmError::Configuration(format!(
                "label_smoothing must be in [0, 1), got {}",
                smoothing
            )));
        }
        Ok(Self {
            label_smoothing: smoothing,
        })
    }

    fn target_weights(&self, vocab_size: usize) -> (f32, f32) {
        if self.label_smoothing == 0.0 || vocab_size < 2 {
            (1.0, 0.0)
        } else {
            (
                1.0 - self.label_smoothing,
                self.label_smoothing / (vocab_size - 1) as f32,
            )
        }
    }

    /// Mean loss over every `(batch, position)`
    ///
    /// `logits` is `[B, L, V]` and `targets` is `[B, L]`.
    pub fn forward(&self, logits: &Tensor, targets: &[Vec<u32>]) -> Result<(f32, LossCache)> {
        let vocab_size = logits.last_dim();
        let flat: Vec<u32> = targets.iter().flatten().copied().collect();

        if logits.shape.len() != 3
            || logits.shape[0] != targets.len()
            || logits.num_rows() != flat.len()
        {
            return Err(LmError::Shape(format!(
                "logits {:?} do not match targets [{}, {}]",
                logits.shape,
                targets.len(),
                targets.first().map(|t| t.len()).unwrap_or(0)
            )));
        }
        if flat.is_empty() {
            return Err(LmError::Shape("cannot compute loss over zero positions".into()));
        }
        if let Some(&bad) = flat.iter().find(|&&t| t as usize >= vocab_size) {
            return Err(LmError::Bounds(format!(
                "target id {} outside vocabulary of size {}",
                bad, vocab_size
            )));
        }

        let (on, off) = self.target_weights(vocab_size);
        let total: f32 = logits
            .data
            .par_chunks(vocab_size)
            .zip(flat.par_iter())
            .map(|(row, &target)| {
                let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                let log_sum = row.iter().map(|&x| (x - max).exp()).sum::<f32>().ln();
                let log_prob = |x: f32| (x - max) - log_sum;

                let target_term = on * log_prob(row[target as usize]);
                if off == 0.0 {
                    return -target_term;
                }
                let others: f32 = row
                    .iter()
                    .enumerate()
                    .filter(|&(j, _)| j != target as usize)
                    .map(|(_, &x)| log_prob(x))
                    .sum();
                -(target_term + off * others)
            })
            .sum();

        let cache = LossCache {
            probs: logits.softmax(),
            targets: flat,
        };
        Ok((total / cache.targets.len() as f32, cache))
    }

    /// Gradient of the mean loss with respect to the logits
    pub fn backward(&self, cache: &LossCache) -> Tensor {
        let vocab_size = cache.probs.last_dim();
        let n = cache.targets.len() as f32;
        let (on, off) = self.target_weights(vocab_size);

        let mut grad = cache.probs.data.clone();
        grad.par_chunks_mut(vocab_size)
            .zip(cache.targets.par_iter())
            .for_each(|(row, &target)| {
                for (j, g) in row.iter_mut().enumerate() {
                    let t = if j == target as usize { on } else { off };
                    *g = (*g - t) / n;
                }
            });

        Tensor::new(grad, cache.probs.shape.clone())
    }
}
