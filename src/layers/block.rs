//! Transformer Block
//!
//! Post-norm composition: each sub-layer is added to its input and the sum
//! is normalized.
//!
//! ```text
//! a = x + MHA(x)
//! h = LN1(a)
//! s = h + FFN(h)
//! y = LN2(s)
//! ```
//!
//! ## Backward Pass
//!
//! Residual connections split the gradient into two paths that are summed:
//!
//! ```text
//! grad_s = LN2.backward(grad_y)
//! grad_h = grad_s + FFN.backward(grad_s)
//! grad_a = LN1.backward(grad_h)
//! grad_x = grad_a + MHA.backward(grad_a)
//! ```

use super::attention::{AttentionCache, KvCache, MultiHeadAttention};
use super::feed_forward::{FeedForward, FeedForwardCache};
use super::layer_norm::{LayerNorm, LayerNormCache};
use crate::error::Result;
use crate::parameter::Parameter;
use crate::tensor::Tensor;
use rand::Rng;

#[derive(Clone, Debug)]
pub struct TransformerBlock {
    pub mha: MultiHeadAttention,
    pub ffn: FeedForward,
    pub ln1: LayerNorm,
    pub ln2: LayerNorm,
}

impl TransformerBlock {
    /// `prefix` is the block's name, e.g. `transformer_blocks.0`
    pub fn new<R: Rng + ?Sized>(
        d_model: usize,
        num_heads: usize,
        d_ff: usize,
        eps: f32,
        prefix: &str,
        rng: &mut R,
    ) -> Result<Self> {
        Ok(Self {
            mha: MultiHeadAttention::new(d_model, num_heads, &format!("{}.mha", prefix), rng)?,
            ffn: FeedForward::new(d_model, d_ff, &format!("{}.ffn", prefix), rng),
            ln1: LayerNorm::new(d_model, eps, &format!("{}.ln1", prefix)),
            ln2: LayerNorm::new(d_model, eps, &format!("{}.ln2", prefix)),
        })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        kv_cache: Option<&mut KvCache>,
    ) -> (Tensor, BlockCache) {
        let (attn_out, attn_cache) = self.mha.forward(x, mask, kv_cache);
        let (h, ln1_cache) = self.ln1.forward(&x.add(&attn_out));

        let (ffn_out, ffn_cache) = self.ffn.forward(&h);
        let (y, ln2_cache) = self.ln2.forward(&h.add(&ffn_out));

        let cache = BlockCache {
            attn_cache,
            ln1_cache,
            ffn_cache,
            ln2_cache,
        };
        (y, cache)
    }

    pub fn backward(&mut self, grad_out: &Tensor, cache: &BlockCache) -> Result<Tensor> {
        let grad_s = self.ln2.backward(grad_out, &cache.ln2_cache);

        let mut grad_h = self.ffn.backward(&grad_s, &cache.ffn_cache);
        grad_h.add_assign(&grad_s);

        let grad_a = self.ln1.backward(&grad_h, &cache.ln1_cache);

        let mut grad_x = self.mha.backward(&grad_a, &cache.attn_cache)?;
        grad_x.add_assign(&grad_a);
        Ok(grad_x)
    }

    /// `mha.{Wq,Wk,Wv,Wo}, ffn.{W1,b1,W2,b2}, ln1.{gamma,beta}, ln2.{gamma,beta}`
    pub fn parameters(&self) -> Vec<&Parameter> {
        let mut params = self.mha.parameters();
        params.extend(self.ffn.parameters());
        params.extend(self.ln1.parameters());
        params.extend(self.ln2.parameters());
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = self.mha.parameters_mut();
        params.extend(self.ffn.parameters_mut());
        params.extend(self.ln1.parameters_mut());
        params.extend(self.ln2.parameters_mut());
        params
    }
}

/// Cache for transformer block backward pass
#[derive(Clone, Debug)]
pub struct BlockCache {
    pub attn_cache: AttentionCache,
    pub ln1_cache: LayerNormCache,
    pub ffn_cache: FeedForwardCache,
    pub ln2_cache: LayerNormCache,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::attention::causal_mask;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn block() -> TransformerBlock {
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        TransformerBlock::new(4, 2, 8, 1e-6, "transformer_blocks.0", &mut rng).unwrap()
    }

    #[test]
    fn test_parameter_count_and_order() {
        let b = block();
        let names: Vec<_> = b.parameters().iter().map(|p| p.name.clone()).collect();
        assert_eq!(names.len(), 12);
        assert_eq!(names[0], "transformer_blocks.0.mha.Wq");
        assert_eq!(names[4], "transformer_blocks.0.ffn.W1");
        assert_eq!(names[11], "transformer_blocks.0.ln2.beta");
    }

    #[test]
    fn test_output_rows_are_normalized() {
        let b = block();
        let x = Tensor::new((0..12).map(|i| i as f32 * 0.1).collect(), vec![1, 3, 4]);
        let (y, _) = b.forward(&x, Some(&causal_mask(3)), None);
        for r in 0..3 {
            let mean: f32 = y.row(r).iter().sum::<f32>() / 4.0;
            assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut b = block();
        let x = Tensor::new(
            vec![0.5, -0.3, 0.8, 0.1, -0.6, 0.9, 0.2, -0.4, 0.7, 0.3, -0.8, 0.0],
            vec![1, 3, 4],
        );
        let mask = causal_mask(3);
        let w: Vec<f32> = (0..12).map(|i| ((i * 7 % 5) as f32 - 2.0) * 0.5).collect();

        let loss = |b: &TransformerBlock, x: &Tensor| -> f32 {
            let (y, _) = b.forward(x, Some(&mask), None);
            y.data.iter().zip(&w).map(|(a, c)| a * c).sum()
        };

        let (_, cache) = b.forward(&x, Some(&mask), None);
        let grad_x = b
            .backward(&Tensor::new(w.clone(), vec![1, 3, 4]), &cache)
            .unwrap();

        let h = 1e-2;
        for i in 0..x.len() {
            let mut plus = x.clone();
            plus.data[i] += h;
            let mut minus = x.clone();
            minus.data[i] -= h;
            let numeric = (loss(&b, &plus) - loss(&b, &minus)) / (2.0 * h);
            assert_abs_diff_eq!(grad_x.data[i], numeric, epsilon = 5e-2);
        }
    }
}
