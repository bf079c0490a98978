//! Decoder-Only Transformer
//!
//! The full language model: token embeddings, sinusoidal positions, a stack
//! of post-norm transformer blocks and an output projection to vocabulary
//! logits.
//!
//! ## Architecture
//!
//! ```text
//! Token IDs [B, L]
//!     ↓
//! Embedding lookup E[ids]                [B, L, d_model]
//!     ↓
//! + sinusoidal positions at start_pos
//!     ↓
//! TransformerBlock × n_layers
//!     ↓
//! x @ P                                   [B, L, vocab_size]
//! ```
//!
//! ## Causal Mask and the KV Cache
//!
//! A full forward (no cache, or an empty one) builds an additive causal mask
//! so position `i` only sees positions `≤ i`. Once the cache holds earlier
//! positions, new tokens are appended and attend over the whole history
//! without a mask. `start_pos` must equal the number of positions already in
//! the cache so positional encodings line up.
//!
//! ## Backward Pass
//!
//! `backward` takes the gradient of the loss with respect to the logits,
//! runs it through the output projection and every block in reverse, and
//! scatter-adds the result into the embedding rows that were looked up.
//! Gradients accumulate until [`TransformerModel::zero_grad`].
//!
//! ## Parameter Order
//!
//! `parameters()` walks the model in a fixed order that also defines the
//! positional `param_i` keys of legacy checkpoints:
//!
//! ```text
//! embeddings, output_proj,
//! transformer_blocks.{i}.mha.{Wq,Wk,Wv,Wo},
//! transformer_blocks.{i}.ffn.{W1,b1,W2,b2},
//! transformer_blocks.{i}.ln1.{gamma,beta},
//! transformer_blocks.{i}.ln2.{gamma,beta}
//! ```
//!
//! ## Example
//!
//! ```rust
//! use tisslm::{ModelConfig, TransformerModel};
//!
//! let config = ModelConfig::tiny(300);
//! let model = TransformerModel::new(&config, 42).unwrap();
//! let (logits, _) = model.forward(&[vec![1, 2, 3]], None, 0).unwrap();
//! assert_eq!(logits.shape, vec![1, 3, 300]);
//! ```

use crate::error::{LmError, Result};
use crate::layers::attention::{causal_mask, KvCache};
use crate::layers::block::{BlockCache, TransformerBlock};
use crate::layers::linear::{Linear, LinearCache};
use crate::layers::positional::PositionalEncoding;
use crate::parameter::Parameter;
use crate::tensor::Tensor;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Model hyperparameters
///
/// `d_model` must be divisible by `num_heads`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub d_model: usize,
    pub n_layers: usize,
    pub num_heads: usize,
    pub d_ff: usize,
    pub vocab_size: usize,
    pub layer_norm_eps: f32,
    pub positional_encoding_max_len: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            d_model: 128,
            n_layers: 4,
            num_heads: 8,
            d_ff: 512,
            vocab_size: 8000,
            layer_norm_eps: 1e-6,
            positional_encoding_max_len: 100,
        }
    }
}

impl ModelConfig {
    /// Very small model for tests and quick experiments
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            d_model: 32,
            n_layers: 2,
            num_heads: 4,
            d_ff: 64,
            vocab_size,
            layer_norm_eps: 1e-6,
            positional_encoding_max_len: 64,
        }
    }

    pub fn small(vocab_size: usize) -> Self {
        Self {
            d_model: 128,
            n_layers: 4,
            num_heads: 8,
            d_ff: 512,
            vocab_size,
            layer_norm_eps: 1e-6,
            positional_encoding_max_len: 256,
        }
    }

    /// Load a JSON config; unspecified fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("d_model", self.d_model),
            ("num_heads", self.num_heads),
            ("d_ff", self.d_ff),
            ("vocab_size", self.vocab_size),
            ("positional_encoding_max_len", self.positional_encoding_max_len),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(LmError::Configuration(format!("{} must be positive", name)));
            }
        }
        if self.d_model % self.num_heads != 0 {
            return Err(LmError::Configuration(format!(
                "d_model ({}) must be divisible by num_heads ({})",
                self.d_model, self.num_heads
            )));
        }
        if !(self.layer_norm_eps > 0.0) {
            return Err(LmError::Configuration(format!(
                "layer_norm_eps must be positive, got {}",
                self.layer_norm_eps
            )));
        }
        Ok(())
    }
}

/// Decoder-only transformer language model
#[derive(Clone, Debug)]
pub struct TransformerModel {
    pub config: ModelConfig,
    /// Token embedding table `E` `[vocab_size, d_model]`
    pub embeddings: Parameter,
    pub positional: PositionalEncoding,
    pub blocks: Vec<TransformerBlock>,
    /// Output projection `P` `[d_model, vocab_size]`
    pub output_proj: Linear,
}

impl TransformerModel {
    /// Build a randomly initialized model
    ///
    /// Weights are drawn from `N(0, 1) / sqrt(fan_in)` with a ChaCha8 stream
    /// seeded by `seed`, so identical seeds give identical models.
    pub fn new(config: &ModelConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let embeddings = Parameter::normal(
            "embeddings",
            vec![config.vocab_size, config.d_model],
            config.d_model,
            &mut rng,
        );
        let output_proj = Linear::new(
            config.d_model,
            config.vocab_size,
            "output_proj",
            None,
            &mut rng,
        );

        let blocks = (0..config.n_layers)
            .map(|i| {
                TransformerBlock::new(
                    config.d_model,
                    config.num_heads,
                    config.d_ff,
                    config.layer_norm_eps,
                    &format!("transformer_blocks.{}", i),
                    &mut rng,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config: config.clone(),
            embeddings,
            positional: PositionalEncoding::new(
                config.d_model,
                config.positional_encoding_max_len,
            ),
            blocks,
            output_proj,
        })
    }

    /// Fresh, empty KV cache with one slot per layer
    pub fn new_kv_cache(&self) -> Vec<KvCache> {
        vec![KvCache::new(); self.blocks.len()]
    }

    /// Forward pass
    ///
    /// `token_ids` is a batch of equal-length rows `[B, L]`. Returns logits
    /// `[B, L, vocab_size]` and the cache needed for [`Self::backward`].
    ///
    /// # Errors
    ///
    /// - `Shape` for an empty batch, ragged rows, a cache list whose length
    ///   differs from `n_layers`, layer caches of unequal length, or a
    ///   `start_pos` that is not the number of cached positions
    /// - `Bounds` for a token id outside the vocabulary or positions past
    ///   `positional_encoding_max_len`
    pub fn forward(
        &self,
        token_ids: &[Vec<u32>],
        mut kv_cache: Option<&mut [KvCache]>,
        start_pos: usize,
    ) -> Result<(Tensor, ModelCache)> {
        let batch = token_ids.len();
        let seq_len = token_ids.first().map(|row| row.len()).unwrap_or(0);
        if batch == 0 || seq_len == 0 {
            return Err(LmError::Shape("token_ids must be a non-empty [B, L] batch".into()));
        }
        if token_ids.iter().any(|row| row.len() != seq_len) {
            return Err(LmError::Shape("token_ids rows must all have the same length".into()));
        }
        if let Some(caches) = kv_cache.as_deref() {
            if caches.len() != self.blocks.len() {
                return Err(LmError::Shape(format!(
                    "expected {} KV cache slots, got {}",
                    self.blocks.len(),
                    caches.len()
                )));
            }
            let cached = caches.first().map_or(0, KvCache::len);
            if caches.iter().any(|c| c.len() != cached) {
                return Err(LmError::Shape(
                    "KV cache layers hold different numbers of positions".into(),
                ));
            }
            if start_pos != cached {
                return Err(LmError::Shape(format!(
                    "start_pos {} does not match {} cached positions",
                    start_pos, cached
                )));
            }
        }

        let d_model = self.config.d_model;
        let vocab_size = self.config.vocab_size;
        let flat: Vec<u32> = token_ids.iter().flatten().copied().collect();

        let mut embedded = Vec::with_capacity(flat.len() * d_model);
        for &id in &flat {
            let id = id as usize;
            if id >= vocab_size {
                return Err(LmError::Bounds(format!(
                    "token id {} outside vocabulary of size {}",
                    id, vocab_size
                )));
            }
            embedded.extend_from_slice(&self.embeddings.value.data[id * d_model..(id + 1) * d_model]);
        }
        let x = Tensor::new(embedded, vec![batch, seq_len, d_model]);
        let mut x = self.positional.forward(&x, start_pos)?;

        let cache_is_empty = kv_cache
            .as_deref()
            .map_or(true, |caches| caches.iter().all(KvCache::is_empty));
        let mask = cache_is_empty.then(|| causal_mask(seq_len));

        let mut block_caches = Vec::with_capacity(self.blocks.len());
        for (i, block) in self.blocks.iter().enumerate() {
            let layer_cache = kv_cache.as_deref_mut().map(|caches| &mut caches[i]);
            let (next, cache) = block.forward(&x, mask.as_ref(), layer_cache);
            block_caches.push(cache);
            x = next;
        }

        let (logits, output_cache) = self.output_proj.forward(&x);

        let cache = ModelCache {
            batch,
            seq_len,
            token_ids: flat,
            block_caches,
            output_cache,
        };
        Ok((logits, cache))
    }

    /// Backward pass from `grad_logits` `[B, L, vocab_size]`
    ///
    /// Accumulates into every parameter's gradient. Fails with a
    /// configuration error if the forward pass used a KV cache, and with a
    /// shape error if `grad_logits` does not match the forward's logits.
    /// Either way no gradient is touched.
    pub fn backward(&mut self, grad_logits: &Tensor, cache: &ModelCache) -> Result<()> {
        if cache
            .block_caches
            .iter()
            .any(|block| block.attn_cache.used_kv_cache)
        {
            return Err(LmError::Configuration(
                "backward is not supported through a KV-cached forward pass".into(),
            ));
        }
        let expected = [cache.batch, cache.seq_len, self.config.vocab_size];
        if grad_logits.shape != expected || cache.block_caches.len() != self.blocks.len() {
            return Err(LmError::Shape(format!(
                "grad_logits shape {:?} does not match logits {:?}",
                grad_logits.shape, expected
            )));
        }

        let mut grad = self.output_proj.backward(grad_logits, &cache.output_cache);

        for (block, block_cache) in self.blocks.iter_mut().zip(&cache.block_caches).rev() {
            grad = block.backward(&grad, block_cache)?;
        }

        // Positional encoding is additive and fixed, so grad passes straight to E
        let d_model = self.config.d_model;
        let embed_grad = &mut self.embeddings.grad.data;
        for (pos, &id) in cache.token_ids.iter().enumerate() {
            let id = id as usize;
            let src = &grad.data[pos * d_model..(pos + 1) * d_model];
            for (g, &s) in embed_grad[id * d_model..(id + 1) * d_model].iter_mut().zip(src) {
                *g += s;
            }
        }
        Ok(())
    }

    /// All parameters in canonical order
    pub fn parameters(&self) -> Vec<&Parameter> {
        let mut params = vec![&self.embeddings, &self.output_proj.weight];
        for block in &self.blocks {
            params.extend(block.parameters());
        }
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = vec![&mut self.embeddings, &mut self.output_proj.weight];
        for block in &mut self.blocks {
            params.extend(block.parameters_mut());
        }
        params
    }

    pub fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }

    /// Total number of trainable scalars
    pub fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }

    /// Load weights from a checkpoint archive
    ///
    /// A missing file is not an error: the model keeps its random
    /// initialization and a warning is logged.
    pub fn load_weights(&mut self, path: impl AsRef<Path>) -> Result<()> {
        crate::checkpoint::load_weights(self, path.as_ref())
    }

    /// Save weights only (no optimizer state)
    pub fn save_weights(&self, path: impl AsRef<Path>) -> Result<()> {
        crate::checkpoint::save_weights(self, path.as_ref())
    }
}

/// Everything the backward pass needs from a forward pass
#[derive(Clone, Debug)]
pub struct ModelCache {
    pub batch: usize,
    pub seq_len: usize,
    /// Token ids flattened row-major from `[B, L]`
    pub token_ids: Vec<u32>,
    pub block_caches: Vec<BlockCache>,
    pub output_cache: LinearCache,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn tiny_model() -> TransformerModel {
        let config = ModelConfig {
            d_model: 8,
            n_layers: 2,
            num_heads: 2,
            d_ff: 16,
            vocab_size: 10,
            layer_norm_eps: 1e-6,
            positional_encoding_max_len: 16,
        };
        TransformerModel::new(&config, 7).unwrap()
    }

    #[test]
    fn test_config_rejects_indivisible_heads() {
        let config = ModelConfig {
            d_model: 10,
            num_heads: 3,
            ..ModelConfig::default()
        };
        assert!(matches!(config.validate(), Err(LmError::Configuration(_))));
        assert!(TransformerModel::new(&config, 0).is_err());
    }

    #[test]
    fn test_config_from_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, r#"{"d_model": 64, "num_heads": 4}"#).unwrap();
        let config = ModelConfig::from_file(&path).unwrap();
        assert_eq!(config.d_model, 64);
        assert_eq!(config.vocab_size, 8000);
    }

    #[test]
    fn test_same_seed_same_model() {
        let a = tiny_model();
        let b = tiny_model();
        assert_eq!(a.embeddings.value, b.embeddings.value);
        assert_eq!(a.blocks[1].ffn.fc2.weight.value, b.blocks[1].ffn.fc2.weight.value);
    }

    #[test]
    fn test_parameter_order() {
        let model = tiny_model();
        let names: Vec<_> = model.parameters().iter().map(|p| p.name.clone()).collect();
        assert_eq!(names.len(), 2 + 2 * 12);
        assert_eq!(names[0], "embeddings");
        assert_eq!(names[1], "output_proj");
        assert_eq!(names[2], "transformer_blocks.0.mha.Wq");
        assert_eq!(names[14], "transformer_blocks.1.mha.Wq");
        assert_eq!(names[25], "transformer_blocks.1.ln2.beta");
    }

    #[test]
    fn test_forward_shape_and_errors() {
        let model = tiny_model();
        let (logits, _) = model.forward(&[vec![1, 2, 3], vec![4, 5, 6]], None, 0).unwrap();
        assert_eq!(logits.shape, vec![2, 3, 10]);

        assert!(matches!(model.forward(&[vec![10]], None, 0), Err(LmError::Bounds(_))));
        assert!(matches!(model.forward(&[vec![1; 4]], None, 13), Err(LmError::Bounds(_))));
        assert!(matches!(model.forward(&[vec![1, 2], vec![3]], None, 0), Err(LmError::Shape(_))));
        assert!(matches!(model.forward(&[], None, 0), Err(LmError::Shape(_))));
    }

    #[test]
    fn test_causal_prefix_logits_unchanged_by_suffix() {
        let model = tiny_model();
        let (short, _) = model.forward(&[vec![3, 1, 4]], None, 0).unwrap();
        let (long, _) = model.forward(&[vec![3, 1, 4, 1, 5]], None, 0).unwrap();
        for i in 0..short.len() {
            assert_abs_diff_eq!(short.data[i], long.data[i], epsilon = 1e-5);
        }
    }

    #[test]
    fn test_cached_steps_match_full_forward() {
        let model = tiny_model();
        let ids = vec![2u32, 7, 1, 8, 2];
        let (full, _) = model.forward(&[ids.clone()], None, 0).unwrap();

        let mut cache = model.new_kv_cache();
        model.forward(&[ids[..3].to_vec()], Some(&mut cache[..]), 0).unwrap();
        for (offset, &id) in ids[3..].iter().enumerate() {
            let pos = 3 + offset;
            let (step, _) = model.forward(&[vec![id]], Some(&mut cache[..]), pos).unwrap();
            for j in 0..10 {
                assert_abs_diff_eq!(step.data[j], full.data[pos * 10 + j], epsilon = 1e-4);
            }
        }
        assert!(cache.iter().all(|c| c.len() == 5));
    }

    #[test]
    fn test_embedding_gradient_scatters_to_used_rows() {
        let mut model = tiny_model();
        let (logits, cache) = model.forward(&[vec![3, 3, 5]], None, 0).unwrap();
        model.backward(&Tensor::full(logits.shape.clone(), 0.1), &cache).unwrap();

        let d = model.config.d_model;
        let row_norm = |id: usize| -> f32 {
            model.embeddings.grad.data[id * d..(id + 1) * d]
                .iter()
                .map(|g| g.abs())
                .sum()
        };
        assert_eq!(row_norm(0), 0.0);
        assert_eq!(row_norm(9), 0.0);
        assert!(row_norm(3) > 0.0);
        assert!(row_norm(5) > 0.0);

        model.zero_grad();
        assert!(model.parameters().iter().all(|p| p.grad.max_abs() == 0.0));
    }

    #[test]
    fn test_backward_after_cached_forward_fails() {
        let mut model = tiny_model();
        let mut kv = model.new_kv_cache();
        let (logits, cache) = model.forward(&[vec![1, 2]], Some(&mut kv[..]), 0).unwrap();
        let err = model.backward(&logits, &cache).unwrap_err();
        assert!(matches!(err, LmError::Configuration(_)));
        assert!(model.parameters().iter().all(|p| p.grad.max_abs() == 0.0));
    }

    #[test]
    fn test_backward_rejects_mismatched_grad_shape() {
        let mut model = tiny_model();
        let (_, cache) = model.forward(&[vec![1, 2, 3]], None, 0).unwrap();
        for shape in [vec![1, 2, 10], vec![1, 3, 9], vec![3, 10]] {
            let err = model.backward(&Tensor::zeros(shape), &cache).unwrap_err();
            assert!(matches!(err, LmError::Shape(_)));
        }
        assert!(model.parameters().iter().all(|p| p.grad.max_abs() == 0.0));
        assert!(model.backward(&Tensor::zeros(vec![1, 3, 10]), &cache).is_ok());
    }

    #[test]
    fn test_start_pos_must_match_cache_length() {
        let model = tiny_model();
        let mut kv = model.new_kv_cache();
        assert!(matches!(
            model.forward(&[vec![1, 2]], Some(&mut kv[..]), 1),
            Err(LmError::Shape(_))
        ));
        assert!(kv.iter().all(KvCache::is_empty));

        model.forward(&[vec![1, 2, 3]], Some(&mut kv[..]), 0).unwrap();
        for wrong in [0, 2, 9] {
            assert!(matches!(
                model.forward(&[vec![4]], Some(&mut kv[..]), wrong),
                Err(LmError::Shape(_))
            ));
        }
        assert!(kv.iter().all(|c| c.len() == 3));

        kv[1].clear();
        assert!(matches!(
            model.forward(&[vec![4]], Some(&mut kv[..]), 3),
            Err(LmError::Shape(_))
        ));
    }

    #[test]
    fn test_num_parameters() {
        let model = tiny_model();
        let per_block = 4 * 64 + (8 * 16 + 16 + 16 * 8 + 8) + 4 * 8;
        assert_eq!(model.num_parameters(), 2 * 10 * 8 + 2 * per_block);
    }
}
