//! Tensor Primitives
//!
//! A minimal dense tensor used by every layer in the model. Values live in a
//! flat, row-major `Vec<f32>` alongside the shape and the derived strides.
//!
//! ## Supported Operations
//!
//! - **Matrix multiplication**: `[.., m, k] @ [k, n]` (leading dims are folded
//!   into rows) and batched `[b, h, m, k] @ [b, h, k, n]` for attention
//! - **Suffix broadcasting**: `add`/`mul` accept a right operand whose shape
//!   equals a trailing suffix of the left operand's shape. This covers bias
//!   vectors `[n]`, positional rows `[seq, dim]` and attention masks `[q, k]`
//! - **Last-axis softmax**: numerically stable, one row per rayon task
//! - **Layout ops**: reshape, transpose of any two axes, concatenation along
//!   an axis (used to grow the KV cache)
//!
//! Shape preconditions are asserted. The model validates caller-supplied shapes
//! before they reach these kernels, so a failed assertion here is a bug rather
//! than bad input.
//!
//! ## Example
//!
//! ```rust
//! use tisslm::Tensor;
//!
//! let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
//! let b = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! let c = a.matmul(&b);
//! assert_eq!(c.shape, vec![2, 2]);
//! assert_eq!(c.data, vec![4.0, 5.0, 10.0, 11.0]);
//! ```

use rayon::prelude::*;

/// A multi-dimensional array of `f32`
///
/// For shape `[2, 3]` the data is laid out as
/// `[r0c0, r0c1, r0c2, r1c0, r1c1, r1c2]` and the strides are `[3, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all elements
    pub data: Vec<f32>,
    /// Dimensions
    pub shape: Vec<usize>,
    /// Step size of each dimension in `data`
    pub strides: Vec<usize>,
}

impl Tensor {
    /// Create a tensor from flat data and a shape
    ///
    /// # Panics
    ///
    /// Panics if the product of `shape` differs from `data.len()`.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected
        );

        let strides = Self::compute_strides(&shape);
        Self {
            data,
            shape,
            strides,
        }
    }

    /// Tensor of zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![0.0; size], shape)
    }

    /// Tensor of zeros with the same shape as `self`
    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.shape.clone())
    }

    /// Tensor filled with a constant
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![value; size], shape)
    }

    fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the last dimension (1 for a scalar)
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Number of rows when the tensor is viewed as `[*, last_dim]`
    pub fn num_rows(&self) -> usize {
        let last = self.last_dim();
        if last == 0 {
            0
        } else {
            self.data.len() / last
        }
    }

    /// Borrow row `i` of the `[*, last_dim]` view
    pub fn row(&self, i: usize) -> &[f32] {
        let d = self.last_dim();
        &self.data[i * d..(i + 1) * d]
    }

    fn resolve_axis(&self, axis: isize) -> usize {
        let ndim = self.shape.len() as isize;
        let pos = if axis < 0 { ndim + axis } else { axis };
        assert!(
            pos >= 0 && pos < ndim,
            "Axis {} out of range for shape {:?}",
            axis,
            self.shape
        );
        pos as usize
    }

    // Innermost loop of the blocked matmul, written so LLVM auto-vectorizes it
    #[inline(always)]
    fn axpy(a_val: f32, b: &[f32], result: &mut [f32]) {
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a_val * b_val;
        }
    }

    /// Matrix multiplication
    ///
    /// - `[.., m, k] @ [k, n]` → `[.., m, n]`: leading dimensions of the left
    ///   operand are folded into rows, so `[batch, seq, d] @ [d, n]` works.
    /// - `[b, h, m, k] @ [b, h, k, n]` → `[b, h, m, n]`: batched per
    ///   `(batch, head)` pair in parallel.
    ///
    /// # Panics
    ///
    /// Panics on incompatible or unsupported shapes.
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        if other.shape.len() == 2 && self.shape.len() >= 2 {
            let k = self.last_dim();
            assert_eq!(
                k, other.shape[0],
                "Matrix dimensions incompatible: {:?} @ {:?}",
                self.shape, other.shape
            );
            let m = self.num_rows();
            let n = other.shape[1];
            let data = Self::matmul_2d(&self.data, &other.data, m, k, n);

            let mut shape = self.shape.clone();
            let last = shape.len() - 1;
            shape[last] = n;
            return Tensor::new(data, shape);
        }

        if self.shape.len() == 4 && other.shape.len() == 4 {
            let (batch, heads, m, k) = (self.shape[0], self.shape[1], self.shape[2], self.shape[3]);
            let n = other.shape[3];
            assert_eq!(
                (other.shape[0], other.shape[1], other.shape[2]),
                (batch, heads, k),
                "Batched matmul shapes incompatible: {:?} @ {:?}",
                self.shape,
                other.shape
            );

            let mut result = vec![0.0; batch * heads * m * n];
            if m * n > 0 {
                result
                    .par_chunks_mut(m * n)
                    .enumerate()
                    .for_each(|(bh, out)| {
                        let a = &self.data[bh * m * k..(bh + 1) * m * k];
                        let b = &other.data[bh * k * n..(bh + 1) * k * n];
                        for i in 0..m {
                            let out_row = &mut out[i * n..(i + 1) * n];
                            for l in 0..k {
                                Self::axpy(a[i * k + l], &b[l * n..(l + 1) * n], out_row);
                            }
                        }
                    });
            }
            return Tensor::new(result, vec![batch, heads, m, n]);
        }

        panic!(
            "Unsupported matmul shapes: {:?} @ {:?}",
            self.shape, other.shape
        );
    }

    /// Row-major `[m, k] @ [k, n]`
    ///
    /// Small products run sequentially. Larger ones use 8×8 cache blocks with
    /// output row blocks distributed across rayon workers.
    fn matmul_2d(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
        const BLOCK_SIZE: usize = 8;

        let mut result = vec![0.0; m * n];
        if m == 0 || n == 0 {
            return result;
        }

        if m * n * k < 1_000 {
            for i in 0..m {
                let out_row = &mut result[i * n..(i + 1) * n];
                for l in 0..k {
                    Self::axpy(a[i * k + l], &b[l * n..(l + 1) * n], out_row);
                }
            }
            return result;
        }

        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for j_start in (0..n).step_by(BLOCK_SIZE) {
                    let j_end = (j_start + BLOCK_SIZE).min(n);
                    for k_start in (0..k).step_by(BLOCK_SIZE) {
                        let k_end = (k_start + BLOCK_SIZE).min(k);
                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for k_idx in k_start..k_end {
                                Self::axpy(
                                    a[i * k + k_idx],
                                    &b[k_idx * n + j_start..k_idx * n + j_end],
                                    &mut result_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        result
    }

    /// Softmax over the last axis
    ///
    /// Each row is shifted by its maximum before exponentiation, so inputs
    /// like `±1000` stay finite. A row of all `-inf` (fully masked) produces
    /// zeros rather than NaN.
    pub fn softmax(&self) -> Tensor {
        let cols = self.last_dim();
        let mut result = self.data.clone();
        if cols == 0 {
            return Tensor::new(result, self.shape.clone());
        }

        result.par_chunks_mut(cols).for_each(|row| {
            let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            if max == f32::NEG_INFINITY {
                row.iter_mut().for_each(|v| *v = 0.0);
                return;
            }
            let mut sum = 0.0;
            for v in row.iter_mut() {
                *v = (*v - max).exp();
                sum += *v;
            }
            for v in row.iter_mut() {
                *v /= sum;
            }
        });

        Tensor::new(result, self.shape.clone())
    }

    fn is_suffix_of(&self, other: &Tensor) -> bool {
        other.shape.len() <= self.shape.len()
            && self.shape[self.shape.len() - other.shape.len()..] == other.shape[..]
    }

    fn zip_broadcast(&self, other: &Tensor, op: &str, f: impl Fn(f32, f32) -> f32 + Sync) -> Tensor {
        if self.shape == other.shape {
            let data = self
                .data
                .par_iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect();
            return Tensor::new(data, self.shape.clone());
        }

        if self.is_suffix_of(other) && !other.data.is_empty() {
            let period = other.data.len();
            let data = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &a)| f(a, other.data[i % period]))
                .collect();
            return Tensor::new(data, self.shape.clone());
        }

        panic!(
            "Unsupported broadcast for {}: {:?} and {:?}",
            op, self.shape, other.shape
        );
    }

    /// Element-wise addition with suffix broadcasting
    pub fn add(&self, other: &Tensor) -> Tensor {
        self.zip_broadcast(other, "add", |a, b| a + b)
    }

    /// Element-wise multiplication with suffix broadcasting
    pub fn mul(&self, other: &Tensor) -> Tensor {
        self.zip_broadcast(other, "mul", |a, b| a * b)
    }

    /// Element-wise subtraction (shapes must match)
    pub fn sub(&self, other: &Tensor) -> Tensor {
        assert_eq!(self.shape, other.shape, "Shapes must match for subtraction");
        self.zip_broadcast(other, "sub", |a, b| a - b)
    }

    /// In-place `self += other` (shapes must match)
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(
            self.shape, other.shape,
            "Shapes must match for accumulation"
        );
        self.data
            .par_iter_mut()
            .zip(&other.data)
            .for_each(|(a, &b)| *a += b);
    }

    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        self.map(|x| x * scalar)
    }

    pub fn add_scalar(&self, scalar: f32) -> Tensor {
        self.map(|x| x + scalar)
    }

    /// Apply `f` to every element
    pub fn map(&self, f: impl Fn(f32) -> f32 + Sync) -> Tensor {
        let data = self.data.par_iter().map(|&x| f(x)).collect();
        Tensor::new(data, self.shape.clone())
    }

    /// Sum over every axis except the last: `[.., n]` → `[n]`
    ///
    /// This is the reduction needed for bias, gamma and beta gradients.
    pub fn sum_to_last_dim(&self) -> Tensor {
        let n = self.last_dim();
        let mut out = vec![0.0; n];
        for row in self.data.chunks(n.max(1)) {
            for (o, &v) in out.iter_mut().zip(row) {
                *o += v;
            }
        }
        Tensor::new(out, vec![n])
    }

    /// Sum of squared elements
    pub fn sum_squares(&self) -> f32 {
        self.data.par_iter().map(|&v| v * v).sum()
    }

    /// L2 norm of the flattened tensor
    pub fn norm(&self) -> f32 {
        self.sum_squares().sqrt()
    }

    /// Reshape without moving data
    pub fn reshape(&self, new_shape: &[usize]) -> Tensor {
        let new_size: usize = new_shape.iter().product();
        assert_eq!(
            self.data.len(),
            new_size,
            "Cannot reshape {:?} into {:?}: element count mismatch",
            self.shape,
            new_shape
        );
        Tensor::new(self.data.clone(), new_shape.to_vec())
    }

    /// Swap two axes (negative indices count from the end)
    pub fn transpose(&self, dim1: isize, dim2: isize) -> Tensor {
        let d1 = self.resolve_axis(dim1);
        let d2 = self.resolve_axis(dim2);

        let mut new_shape = self.shape.clone();
        new_shape.swap(d1, d2);

        if self.shape.len() == 2 {
            let (rows, cols) = (self.shape[0], self.shape[1]);
            let mut result = vec![0.0; rows * cols];
            for i in 0..rows {
                for j in 0..cols {
                    result[j * rows + i] = self.data[i * cols + j];
                }
            }
            return Tensor::new(result, new_shape);
        }

        // Walk the output in order and gather from the permuted input strides
        let mut src_strides = self.strides.clone();
        src_strides.swap(d1, d2);
        let out_strides = Self::compute_strides(&new_shape);

        let result: Vec<f32> = (0..self.data.len())
            .into_par_iter()
            .map(|i| {
                let mut remaining = i;
                let mut src = 0;
                for (dim, &stride) in out_strides.iter().enumerate() {
                    let coord = remaining / stride;
                    remaining %= stride;
                    src += coord * src_strides[dim];
                }
                self.data[src]
            })
            .collect();

        Tensor::new(result, new_shape)
    }

    /// Concatenate along `axis`; all other dimensions must match
    pub fn concat(&self, other: &Tensor, axis: usize) -> Tensor {
        assert_eq!(
            self.shape.len(),
            other.shape.len(),
            "Cannot concatenate {:?} with {:?}",
            self.shape,
            other.shape
        );
        for (i, (a, b)) in self.shape.iter().zip(&other.shape).enumerate() {
            assert!(
                i == axis || a == b,
                "Cannot concatenate {:?} with {:?} along axis {}",
                self.shape,
                other.shape,
                axis
            );
        }

        let outer: usize = self.shape[..axis].iter().product();
        let a_block = self.shape[axis..].iter().product::<usize>();
        let b_block = other.shape[axis..].iter().product::<usize>();

        let mut data = Vec::with_capacity(self.data.len() + other.data.len());
        for o in 0..outer {
            data.extend_from_slice(&self.data[o * a_block..(o + 1) * a_block]);
            data.extend_from_slice(&other.data[o * b_block..(o + 1) * b_block]);
        }

        let mut shape = self.shape.clone();
        shape[axis] += other.shape[axis];
        Tensor::new(data, shape)
    }

    /// Maximum absolute element (0 for an empty tensor)
    pub fn max_abs(&self) -> f32 {
        self.data.iter().fold(0.0f32, |a, &b| a.max(b.abs()))
    }
}
