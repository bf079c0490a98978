//! Learning-rate schedule: linear warmup then cosine decay
//!
//! ```text
//! s < W        lr = max_lr · s / W
//! W ≤ s < T    lr = min_lr + (max_lr - min_lr) · ½(1 + cos(π (s - W) / (T - W)))
//! s ≥ T        lr = min_lr
//! ```
//!
//! The result is clamped to at least `min_lr`.

use crate::optimizer::AdamW;
use std::f32::consts::PI;

#[derive(Clone, Debug)]
pub struct CosineWarmupScheduler {
    pub warmup_steps: usize,
    pub total_steps: usize,
    pub max_lr: f32,
    pub min_lr: f32,
}

impl CosineWarmupScheduler {
    pub fn new(warmup_steps: usize, total_steps: usize, max_lr: f32, min_lr: f32) -> Self {
        Self {
            warmup_steps,
            total_steps,
            max_lr,
            min_lr,
        }
    }

    /// Learning rate at `step`
    pub fn lr_at(&self, step: usize) -> f32 {
        let lr = if step < self.warmup_steps {
            self.max_lr * step as f32 / self.warmup_steps as f32
        } else if step < self.total_steps {
            let progress =
                (step - self.warmup_steps) as f32 / (self.total_steps - self.warmup_steps) as f32;
            self.min_lr + (self.max_lr - self.min_lr) * 0.5 * (1.0 + (PI * progress).cos())
        } else {
            self.min_lr
        };
        lr.max(self.min_lr)
    }

    /// Compute the rate for `step` and write it into the optimizer
    pub fn step(&self, step: usize, optimizer: &mut AdamW) -> f32 {
        let lr = self.lr_at(step);
        optimizer.set_learning_rate(lr);
        lr
    }
}
