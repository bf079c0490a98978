//! Neural Network Layers
//!
//! Every layer used by the transformer, each with an explicit forward and
//! backward pass.
//!
//! ## Layers
//!
//! - **activation**: ReLU and softmax (forward and backward)
//! - **linear**: Fully connected layer with optional bias
//! - **layer_norm**: Layer normalization
//! - **attention**: Multi-head self-attention and the KV cache
//! - **feed_forward**: Two-layer ReLU network
//! - **positional**: Sinusoidal positional encoding
//! - **block**: Post-norm transformer block
//!
//! ## Design Pattern
//!
//! Each trainable layer follows the same shape:
//!
//! ```rust,ignore
//! impl Layer {
//!     pub fn forward(&self, x: &Tensor) -> (Tensor, Cache) { }
//!     pub fn backward(&mut self, grad: &Tensor, cache: &Cache) -> Tensor { }
//!     pub fn parameters(&self) -> Vec<&Parameter> { }
//!     pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> { }
//! }
//! ```
//!
//! Forward borrows the layer immutably and hands back a cache of whatever the
//! backward pass needs. Backward accumulates parameter gradients in place and
//! returns the gradient with respect to the input.

pub mod activation;
pub mod attention;
pub mod block;
pub mod feed_forward;
pub mod layer_norm;
pub mod linear;
pub mod positional;

pub use activation::{relu_backward, relu_forward, softmax, softmax_backward};
pub use attention::{
    causal_mask, scaled_dot_product_attention, AttentionCache, KvCache, MultiHeadAttention,
};
pub use block::{BlockCache, TransformerBlock};
pub use feed_forward::{FeedForward, FeedForwardCache};
pub use layer_norm::{LayerNorm, LayerNormCache};
pub use linear::{Linear, LinearCache};
pub use positional::PositionalEncoding;
