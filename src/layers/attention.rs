//! Multi-Head Self-Attention
//!
//! Each position attends to a weighted mix of value vectors, with weights
//! coming from query/key similarity. Heads run the same computation on
//! independent `d_k = d_model / num_heads` slices.
//!
//! ## Scaled Dot-Product Attention
//!
//! ```text
//! Q, K, V      = x @ W_q, x @ W_k, x @ W_v         [B, L, D]
//! split heads  → [B, H, L, d_k]
//! scores       = Q @ K^T / √d_k + mask              [B, H, L_q, L_k]
//! weights      = softmax(scores)
//! context      = weights @ V                        [B, H, L_q, d_k]
//! output       = merge_heads(context) @ W_o         [B, L, D]
//! ```
//!
//! The mask is additive: `0` where attention is allowed, `-inf` above the
//! diagonal for causal masking. It broadcasts over batch and head axes.
//!
//! ## KV Cache
//!
//! During generation the keys and values of earlier positions never change,
//! so [`KvCache`] keeps them and each new call only projects the new tokens.
//! New `K`/`V` are concatenated onto the cache along the length axis, and the
//! queries attend over the full cached history. Single-token steps need no
//! mask: the only keys present are the past and the token itself.
//!
//! ## Backward Pass
//!
//! ```text
//! grad_V       = weights^T @ grad_context
//! grad_weights = grad_context @ V^T
//! grad_scores  = softmax_backward(grad_weights, weights)
//! grad_Q       = grad_scores @ K / √d_k
//! grad_K       = grad_scores^T @ Q / √d_k
//! ```
//!
//! Training always runs without a cache; backward over a cached forward is
//! rejected because the cached keys have no recorded projection inputs.

use super::activation::softmax_backward;
use super::linear::{Linear, LinearCache};
use crate::error::{LmError, Result};
use crate::parameter::Parameter;
use crate::tensor::Tensor;
use rand::Rng;

/// Per-layer key/value history, shaped `[B, H, L_past, d_k]`
#[derive(Clone, Debug, Default)]
pub struct KvCache {
    pub k: Option<Tensor>,
    pub v: Option<Tensor>,
}

impl KvCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of positions stored
    pub fn len(&self) -> usize {
        self.k.as_ref().map(|k| k.shape[2]).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.k = None;
        self.v = None;
    }

    /// Append new keys and values along the length axis, returning the full history
    fn extend(&mut self, k: Tensor, v: Tensor) -> (Tensor, Tensor) {
        let k_full = match self.k.take() {
            Some(past) => past.concat(&k, 2),
            None => k,
        };
        let v_full = match self.v.take() {
            Some(past) => past.concat(&v, 2),
            None => v,
        };
        self.k = Some(k_full.clone());
        self.v = Some(v_full.clone());
        (k_full, v_full)
    }
}

/// `softmax(Q Kᵀ / √d_k + mask) · V`
///
/// `q`, `k`, `v` are `[B, H, L, d_k]` (keys and values may be longer than the
/// queries). Returns the context and the attention weights.
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
) -> (Tensor, Tensor) {
    let d_k = q.last_dim();
    let mut scores = q
        .matmul(&k.transpose(-2, -1))
        .mul_scalar(1.0 / (d_k as f32).sqrt());
    if let Some(mask) = mask {
        scores = scores.add(mask);
    }
    let weights = scores.softmax();
    let context = weights.matmul(v);
    (context, weights)
}

/// Build an additive causal mask `[len, len]` with `-inf` above the diagonal
pub fn causal_mask(len: usize) -> Tensor {
    let mut mask = vec![0.0; len * len];
    for i in 0..len {
        for j in (i + 1)..len {
            mask[i * len + j] = f32::NEG_INFINITY;
        }
    }
    Tensor::new(mask, vec![len, len])
}

/// `[B, L, D]` → `[B, H, L, d_k]`
fn split_heads(x: &Tensor, num_heads: usize) -> Tensor {
    let (b, l, d) = (x.shape[0], x.shape[1], x.shape[2]);
    x.reshape(&[b, l, num_heads, d / num_heads]).transpose(1, 2)
}

/// `[B, H, L, d_k]` → `[B, L, D]`
fn merge_heads(x: &Tensor) -> Tensor {
    let (b, h, l, d_k) = (x.shape[0], x.shape[1], x.shape[2], x.shape[3]);
    x.transpose(1, 2).reshape(&[b, l, h * d_k])
}

/// Multi-head attention with bias-free projections
#[derive(Clone, Debug)]
pub struct MultiHeadAttention {
    pub wq: Linear,
    pub wk: Linear,
    pub wv: Linear,
    pub wo: Linear,
    pub num_heads: usize,
}

impl MultiHeadAttention {
    /// Fails with a configuration error unless `d_model % num_heads == 0`
    pub fn new<R: Rng + ?Sized>(
        d_model: usize,
        num_heads: usize,
        prefix: &str,
        rng: &mut R,
    ) -> Result<Self> {
        if num_heads == 0 || d_model % num_heads != 0 {
            return Err(LmError::Configuration(format!(
                "d_model ({}) must be divisible by num_heads ({})",
                d_model, num_heads
            )));
        }

        let proj = |name: &str, rng: &mut R| {
            Linear::new(d_model, d_model, format!("{}.{}", prefix, name), None, rng)
        };
        Ok(Self {
            wq: proj("Wq", rng),
            wk: proj("Wk", rng),
            wv: proj("Wv", rng),
            wo: proj("Wo", rng),
            num_heads,
        })
    }

    /// Forward pass over `x: [B, L, D]`
    ///
    /// When `kv_cache` is given, the new keys and values are appended to it
    /// and attention runs over the whole history.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        kv_cache: Option<&mut KvCache>,
    ) -> (Tensor, AttentionCache) {
        let (q_proj, q_cache) = self.wq.forward(x);
        let (k_proj, k_cache) = self.wk.forward(x);
        let (v_proj, v_cache) = self.wv.forward(x);

        let q = split_heads(&q_proj, self.num_heads);
        let k_new = split_heads(&k_proj, self.num_heads);
        let v_new = split_heads(&v_proj, self.num_heads);

        let used_kv_cache = kv_cache.is_some();
        let (k, v) = match kv_cache {
            Some(cache) => cache.extend(k_new, v_new),
            None => (k_new, v_new),
        };

        let (context, weights) = scaled_dot_product_attention(&q, &k, &v, mask);
        let merged = merge_heads(&context);
        let (out, o_cache) = self.wo.forward(&merged);

        let cache = AttentionCache {
            q,
            k,
            v,
            weights,
            q_cache,
            k_cache,
            v_cache,
            o_cache,
            used_kv_cache,
        };
        (out, cache)
    }

    /// Backward pass; accumulates into all four projections
    pub fn backward(&mut self, grad_out: &Tensor, cache: &AttentionCache) -> Result<Tensor> {
        if cache.used_kv_cache {
            return Err(LmError::Configuration(
                "backward is not supported through a KV-cached forward pass".into(),
            ));
        }

        let d_k = cache.q.last_dim();
        let scale = 1.0 / (d_k as f32).sqrt();

        let grad_merged = self.wo.backward(grad_out, &cache.o_cache);
        let grad_context = split_heads(&grad_merged, self.num_heads);

        let grad_v = cache.weights.transpose(-2, -1).matmul(&grad_context);
        let grad_weights = grad_context.matmul(&cache.v.transpose(-2, -1));
        let grad_scores = softmax_backward(&grad_weights, &cache.weights);

        let grad_q = grad_scores.matmul(&cache.k).mul_scalar(scale);
        let grad_k = grad_scores
            .transpose(-2, -1)
            .matmul(&cache.q)
            .mul_scalar(scale);

        let mut grad_x = self.wq.backward(&merge_heads(&grad_q), &cache.q_cache);
        grad_x.add_assign(&self.wk.backward(&merge_heads(&grad_k), &cache.k_cache));
        grad_x.add_assign(&self.wv.backward(&merge_heads(&grad_v), &cache.v_cache));
        Ok(grad_x)
    }

    /// `Wq, Wk, Wv, Wo`
    pub fn parameters(&self) -> Vec<&Parameter> {
        vec![
            &self.wq.weight,
            &self.wk.weight,
            &self.wv.weight,
            &self.wo.weight,
        ]
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![
            &mut self.wq.weight,
            &mut self.wk.weight,
            &mut self.wv.weight,
            &mut self.wo.weight,
        ]
    }
}

/// Cache for attention backward pass
#[derive(Clone, Debug)]
pub struct AttentionCache {
    /// Queries `[B, H, L_q, d_k]`
    pub q: Tensor,
    /// Keys over the full attended history
    pub k: Tensor,
    pub v: Tensor,
    pub weights: Tensor,
    pub q_cache: LinearCache,
    pub k_cache: LinearCache,
    pub v_cache: LinearCache,
    pub o_cache: LinearCache,
    pub used_kv_cache: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn mha(d_model: usize, heads: usize) -> MultiHeadAttention {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        MultiHeadAttention::new(d_model, heads, "mha", &mut rng).unwrap()
    }

    fn input(b: usize, l: usize, d: usize) -> Tensor {
        Tensor::new(
            (0..b * l * d).map(|i| ((i * 37 % 17) as f32 - 8.0) / 8.0).collect(),
            vec![b, l, d],
        )
    }

    #[test]
    fn test_rejects_indivisible_heads() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let err = MultiHeadAttention::new(10, 3, "mha", &mut rng).unwrap_err();
        assert!(matches!(err, LmError::Configuration(_)));
    }

    #[test]
    fn test_identity_attention_weights_sum_to_one() {
        let q = Tensor::new(vec![1.0, 0.0, 0.0, 1.0], vec![1, 1, 2, 2]);
        let (context, weights) = scaled_dot_product_attention(&q, &q, &q, None);
        assert_eq!(context.shape, vec![1, 1, 2, 2]);
        for r in 0..2 {
            let sum: f32 = weights.row(r).iter().sum();
            assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_causal_mask_blocks_future() {
        let q = Tensor::new(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6], vec![1, 1, 3, 2]);
        let mask = causal_mask(3);
        let (_, weights) = scaled_dot_product_attention(&q, &q, &q, Some(&mask));
        assert_abs_diff_eq!(weights.data[0], 1.0, epsilon = 1e-6);
        assert_eq!(weights.data[1], 0.0);
        assert_eq!(weights.data[2], 0.0);
        assert_eq!(weights.data[5], 0.0);
    }

    #[test]
    fn test_split_merge_round_trip() {
        let x = input(2, 3, 8);
        assert_eq!(merge_heads(&split_heads(&x, 4)), x);
    }

    #[test]
    fn test_kv_cache_matches_full_forward() {
        let attn = mha(8, 2);
        let x = input(1, 4, 8);
        let (full, _) = attn.forward(&x, Some(&causal_mask(4)), None);

        let mut cache = KvCache::new();
        let prefix = Tensor::new(x.data[..3 * 8].to_vec(), vec![1, 3, 8]);
        attn.forward(&prefix, Some(&causal_mask(3)), Some(&mut cache));
        assert_eq!(cache.len(), 3);

        let last = Tensor::new(x.data[3 * 8..].to_vec(), vec![1, 1, 8]);
        let (step, _) = attn.forward(&last, None, Some(&mut cache));
        assert_eq!(cache.len(), 4);

        for j in 0..8 {
            assert_abs_diff_eq!(step.data[j], full.data[3 * 8 + j], epsilon = 1e-5);
        }
    }

    #[test]
    fn test_backward_through_cache_is_rejected() {
        let mut attn = mha(4, 2);
        let mut cache = KvCache::new();
        let (y, fwd) = attn.forward(&input(1, 2, 4), None, Some(&mut cache));
        let err = attn.backward(&y, &fwd).unwrap_err();
        assert!(matches!(err, LmError::Configuration(_)));
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut attn = mha(4, 2);
        let x = input(1, 3, 4);
        let mask = causal_mask(3);
        let w: Vec<f32> = (0..12).map(|i| (i as f32 * 0.37).sin()).collect();

        let loss = |attn: &MultiHeadAttention, x: &Tensor| -> f32 {
            let (y, _) = attn.forward(x, Some(&mask), None);
            y.data.iter().zip(&w).map(|(a, b)| a * b).sum()
        };

        let (_, cache) = attn.forward(&x, Some(&mask), None);
        let grad_x = attn
            .backward(&Tensor::new(w.clone(), vec![1, 3, 4]), &cache)
            .unwrap();

        let h = 1e-2;
        for i in 0..x.len() {
            let mut plus = x.clone();
            plus.data[i] += h;
            let mut minus = x.clone();
            minus.data[i] -= h;
            let numeric = (loss(&attn, &plus) - loss(&attn, &minus)) / (2.0 * h);
            assert_abs_diff_eq!(grad_x.data[i], numeric, epsilon = 1e-2);
        }

        for i in 0..attn.wk.weight.len() {
            let mut plus = attn.clone();
            plus.wk.weight.value.data[i] += h;
            let mut minus = attn.clone();
            minus.wk.weight.value.data[i] -= h;
            let numeric = (loss(&plus, &x) - loss(&minus, &x)) / (2.0 * h);
            assert_abs_diff_eq!(attn.wk.weight.grad.data[i], numeric, epsilon = 1e-2);
        }
    }
}
