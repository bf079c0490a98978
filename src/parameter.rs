//! Trainable parameters
//!
//! Every learnable tensor in the model is a [`Parameter`]: a value, a gradient
//! buffer of the same shape, and a hierarchical name such as
//! `transformer_blocks.0.mha.Wq`. Layers accumulate into `grad` during the
//! backward pass; the optimizer reads `grad` and writes `value`.
//!
//! Names double as checkpoint keys, so they must stay stable.

use crate::tensor::Tensor;
use rand::Rng;
use rand_distr::StandardNormal;

/// A named tensor with an accumulated gradient
#[derive(Clone, Debug)]
pub struct Parameter {
    pub name: String,
    pub value: Tensor,
    pub grad: Tensor,
}

impl Parameter {
    /// Wrap an existing tensor with a zeroed gradient
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        let grad = value.zeros_like();
        Self {
            name: name.into(),
            value,
            grad,
        }
    }

    /// Weight drawn from `N(0, 1) / sqrt(fan_in)`
    pub fn normal<R: Rng + ?Sized>(
        name: impl Into<String>,
        shape: Vec<usize>,
        fan_in: usize,
        rng: &mut R,
    ) -> Self {
        let scale = 1.0 / (fan_in.max(1) as f32).sqrt();
        let size: usize = shape.iter().product();
        let data = (0..size)
            .map(|_| rng.sample::<f32, _>(StandardNormal) * scale)
            .collect();
        Self::new(name, Tensor::new(data, shape))
    }

    pub fn zeros(name: impl Into<String>, shape: Vec<usize>) -> Self {
        Self::new(name, Tensor::zeros(shape))
    }

    pub fn ones(name: impl Into<String>, shape: Vec<usize>) -> Self {
        Self::new(name, Tensor::full(shape, 1.0))
    }

    pub fn shape(&self) -> &[usize] {
        &self.value.shape
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Add `delta` into the gradient buffer
    pub fn accumulate(&mut self, delta: &Tensor) {
        self.grad.add_assign(delta);
    }

    pub fn zero_grad(&mut self) {
        self.grad.data.iter_mut().for_each(|g| *g = 0.0);
    }
}
