//! Sinusoidal positional encoding
//!
//! A fixed `[max_len, d_model]` table, precomputed once:
//!
//! ```text
//! PE[pos, 2i]   = sin(pos · 10000^(-2i / d_model))
//! PE[pos, 2i+1] = cos(pos · 10000^(-2i / d_model))
//! ```
//!
//! The table has no trainable parameters. `forward` adds rows
//! `[start_pos, start_pos + L)` so cached generation steps see the same
//! positions a full forward would.

use crate::error::{LmError, Result};
use crate::tensor::Tensor;

#[derive(Clone, Debug)]
pub struct PositionalEncoding {
    pub table: Tensor,
    pub max_len: usize,
    pub d_model: usize,
}

impl PositionalEncoding {
    pub fn new(d_model: usize, max_len: usize) -> Self {
        let mut data = vec![0.0; max_len * d_model];
        for pos in 0..max_len {
            for i in (0..d_model).step_by(2) {
                let angle = pos as f32 * 10000f32.powf(-(i as f32) / d_model as f32);
                data[pos * d_model + i] = angle.sin();
                if i + 1 < d_model {
                    data[pos * d_model + i + 1] = angle.cos();
                }
            }
        }
        Self {
            table: Tensor::new(data, vec![max_len, d_model]),
            max_len,
            d_model,
        }
    }

    /// Add positions `[start_pos, start_pos + L)` to `x: [B, L, D]`
    pub fn forward(&self, x: &Tensor, start_pos: usize) -> Result<Tensor> {
        let len = x.shape[1];
        if start_pos + len > self.max_len {
            return Err(LmError::Bounds(format!(
                "positions {}..{} exceed positional encoding max_len {}",
                start_pos,
                start_pos + len,
                self.max_len
            )));
        }

        let rows = Tensor::new(
            self.table.data[start_pos * self.d_model..(start_pos + len) * self.d_model].to_vec(),
            vec![len, self.d_model],
        );
        Ok(x.add(&rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_first_row_alternates_zero_and_one() {
        let pe = PositionalEncoding::new(4, 8);
        assert_eq!(pe.table.row(0), &[0.0, 1.0, 0.0, 1.0]);
        assert_abs_diff_eq!(pe.table.row(1)[0], 1f32.sin(), epsilon = 1e-6);
    }

    #[test]
    fn test_offset_selects_later_rows() {
        let pe = PositionalEncoding::new(4, 8);
        let x = Tensor::zeros(vec![1, 2, 4]);
        let y = pe.forward(&x, 3).unwrap();
        assert_eq!(&y.data[..4], pe.table.row(3));
        assert_eq!(&y.data[4..], pe.table.row(4));
    }

    #[test]
    fn test_same_offset_same_addend() {
        let pe = PositionalEncoding::new(6, 16);
        let x = Tensor::new((0..2 * 3 * 6).map(|v| v as f32 * 0.1).collect(), vec![2, 3, 6]);
        let a = pe.forward(&x, 5).unwrap().sub(&x);
        let b = pe.forward(&Tensor::zeros(vec![2, 3, 6]), 5).unwrap();
        for (u, v) in a.data.iter().zip(&b.data) {
            assert_abs_diff_eq!(u, v, epsilon = 1e-5);
        }
        // every batch row gets the same positions
        assert_eq!(&b.data[..18], &b.data[18..]);
        assert_eq!(pe.forward(&x, 5).unwrap(), pe.forward(&x, 5).unwrap());
    }

    #[test]
    fn test_exact_fit_allowed_overflow_rejected() {
        let pe = PositionalEncoding::new(4, 4);
        assert!(pe.forward(&Tensor::zeros(vec![1, 4, 4]), 0).is_ok());
        assert!(matches!(
            pe.forward(&Tensor::zeros(vec![1, 1, 4]), 4),
            Err(LmError::Bounds(_))
        ));
    }
}
