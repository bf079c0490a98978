//! AdamW Optimizer
//!
//! Adam with decoupled weight decay (Loshchilov & Hutter, 2019).
//!
//! ## Algorithm
//!
//! For each parameter θ with gradient g, at step t:
//!
//! ```text
//! m = β₁ · m + (1 - β₁) · g          # first moment
//! v = β₂ · v + (1 - β₂) · g²         # second moment
//! m̂ = m / (1 - β₁^t)                 # bias correction
//! v̂ = v / (1 - β₂^t)
//! θ = θ - lr · m̂ / (√v̂ + ε)          # Adam step
//! θ = θ - lr · λ · θ                  # decoupled weight decay
//! ```
//!
//! Defaults: β₁ = 0.9, β₂ = 0.999, ε = 1e-8, λ = 0.01. Decay applies to every
//! parameter.
//!
//! ## State
//!
//! One `m` and one `v` tensor per parameter, in the model's canonical
//! parameter order, plus the step counter `t`. All three are saved in
//! checkpoints so training resumes with the same moment estimates.
//!
//! ## Example
//!
//! ```rust
//! use tisslm::{AdamW, ModelConfig, TransformerModel};
//!
//! let mut model = TransformerModel::new(&ModelConfig::tiny(300), 0).unwrap();
//! let mut optimizer = AdamW::new(&model.parameters(), 1e-3, 0.01);
//! // ... forward, loss, backward ...
//! optimizer.step(&mut model.parameters_mut()).unwrap();
//! model.zero_grad();
//! ```

use crate::error::{LmError, Result};
use crate::parameter::Parameter;
use crate::tensor::Tensor;
use rayon::prelude::*;

/// Tensors smaller than this are updated sequentially
const PARALLEL_THRESHOLD: usize = 1000;

/// AdamW optimizer state
#[derive(Clone, Debug)]
pub struct AdamW {
    pub learning_rate: f32,
    pub weight_decay: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    /// Steps taken so far
    pub t: u64,
    /// First moments, one per parameter
    pub m: Vec<Tensor>,
    /// Second moments, one per parameter
    pub v: Vec<Tensor>,
}

impl AdamW {
    /// Zero-initialized moments shaped like `params`
    pub fn new(params: &[&Parameter], learning_rate: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            weight_decay,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            t: 0,
            m: params.iter().map(|p| p.value.zeros_like()).collect(),
            v: params.iter().map(|p| p.value.zeros_like()).collect(),
        }
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self.epsilon = epsilon;
        self
    }

    pub fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }

    /// Apply one update to every parameter from its accumulated gradient
    ///
    /// `params` must be in the same order, and have the same shapes, as the
    /// parameters the optimizer was built from.
    pub fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()> {
        if params.len() != self.m.len() {
            return Err(LmError::Shape(format!(
                "optimizer tracks {} parameters, got {}",
                self.m.len(),
                params.len()
            )));
        }
        for (i, p) in params.iter().enumerate() {
            if p.value.shape != self.m[i].shape {
                return Err(LmError::Shape(format!(
                    "parameter {} has shape {:?}, optimizer state has {:?}",
                    p.name, p.value.shape, self.m[i].shape
                )));
            }
        }

        self.t += 1;
        let step = AdamStep {
            lr: self.learning_rate,
            weight_decay: self.weight_decay,
            beta1: self.beta1,
            beta2: self.beta2,
            epsilon: self.epsilon,
            bias_correction1: 1.0 - self.beta1.powi(self.t as i32),
            bias_correction2: 1.0 - self.beta2.powi(self.t as i32),
        };

        for ((p, m), v) in params.iter_mut().zip(&mut self.m).zip(&mut self.v) {
            step.apply(&mut p.value.data, &p.grad.data, &mut m.data, &mut v.data);
        }
        Ok(())
    }

    /// Zero every parameter's gradient
    pub fn zero_grad(&self, params: &mut [&mut Parameter]) {
        for p in params.iter_mut() {
            p.zero_grad();
        }
    }
}

/// Scalars shared by every element update in one step
struct AdamStep {
    lr: f32,
    weight_decay: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    bias_correction1: f32,
    bias_correction2: f32,
}

impl AdamStep {
    #[inline(always)]
    fn update(&self, theta: &mut f32, g: f32, m: &mut f32, v: &mut f32) {
        *m = self.beta1 * *m + (1.0 - self.beta1) * g;
        *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
        let m_hat = *m / self.bias_correction1;
        let v_hat = *v / self.bias_correction2;
        *theta -= self.lr * m_hat / (v_hat.sqrt() + self.epsilon);
        *theta -= self.lr * self.weight_decay * *theta;
    }

    fn apply(&self, theta: &mut [f32], grad: &[f32], m: &mut [f32], v: &mut [f32]) {
        if theta.len() > PARALLEL_THRESHOLD {
            theta
                .par_iter_mut()
                .zip(grad.par_iter())
                .zip(m.par_iter_mut().zip(v.par_iter_mut()))
                .for_each(|((t, &g), (m, v))| self.update(t, g, m, v));
        } else {
            for i in 0..theta.len() {
                self.update(&mut theta[i], grad[i], &mut m[i], &mut v[i]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        // With bias correction, the first step is lr * sign(g) before decay
        let mut p = Parameter::new("w", Tensor::new(vec![1.0, -1.0], vec![2]));
        p.grad = Tensor::new(vec![0.5, -2.0], vec![2]);

        let mut opt = AdamW::new(&[&p], 0.1, 0.0);
        opt.step(&mut [&mut p]).unwrap();

        assert_eq!(opt.t, 1);
        assert_abs_diff_eq!(p.value.data[0], 0.9, epsilon = 1e-5);
        assert_abs_diff_eq!(p.value.data[1], -0.9, epsilon = 1e-5);
    }

    #[test]
    fn test_decay_applies_after_adam_step() {
        let mut p = Parameter::new("w", Tensor::new(vec![2.0], vec![1]));
        p.grad = Tensor::new(vec![1.0], vec![1]);

        let mut opt = AdamW::new(&[&p], 0.1, 0.5);
        opt.step(&mut [&mut p]).unwrap();

        // (2.0 - 0.1) * (1 - 0.1 * 0.5)
        assert_abs_diff_eq!(p.value.data[0], 1.9 * 0.95, epsilon = 1e-5);
    }

    #[test]
    fn test_zero_gradient_only_decays() {
        let mut p = Parameter::new("w", Tensor::new(vec![1.0; 2000], vec![2000]));
        let mut opt = AdamW::new(&[&p], 0.01, 0.1);
        opt.step(&mut [&mut p]).unwrap();
        assert!(p.value.data.iter().all(|&x| (x - 0.999).abs() < 1e-6));
    }

    #[test]
    fn test_moments_track_gradients() {
        let mut p = Parameter::new("w", Tensor::zeros(vec![1]));
        p.grad = Tensor::new(vec![2.0], vec![1]);
        let mut opt = AdamW::new(&[&p], 0.001, 0.0);
        opt.step(&mut [&mut p]).unwrap();
        assert_abs_diff_eq!(opt.m[0].data[0], 0.2, epsilon = 1e-6);
        assert_abs_diff_eq!(opt.v[0].data[0], 0.004, epsilon = 1e-6);
    }

    #[test]
    fn test_rejects_mismatched_parameters() {
        let p = Parameter::zeros("w", vec![2]);
        let mut q = Parameter::zeros("w", vec![3]);
        let mut opt = AdamW::new(&[&p], 0.1, 0.0);
        assert!(matches!(opt.step(&mut [&mut q]), Err(LmError::Shape(_))));
        assert!(matches!(opt.step(&mut []), Err(LmError::Shape(_))));
        assert_eq!(opt.t, 0);
    }

    #[test]
    fn test_zero_grad() {
        let mut p = Parameter::zeros("w", vec![2]);
        p.grad = Tensor::new(vec![1.0, 1.0], vec![2]);
        let opt = AdamW::new(&[&p], 0.1, 0.0);
        opt.zero_grad(&mut [&mut p]);
        assert_eq!(p.grad.data, vec![0.0, 0.0]);
    }
}
