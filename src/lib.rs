//! TissLM: A Small Language Model Stack
//!
//! A decoder-only transformer language model built from scratch in Rust,
//! with every forward and backward pass written out by hand. Around the
//! model sit a byte-level BPE tokenizer, a KV-cached generator, a training
//! loop and a small retrieval layer for prompt augmentation.
//!
//! # Modules
//!
//! - [`tokenizer`] - Byte Pair Encoding (BPE) tokenization
//! - [`tensor`] - Row-major tensors, matmul, softmax, broadcasting
//! - [`parameter`] - Named value/gradient pairs
//! - [`layers`] - Linear, LayerNorm, attention, feed-forward, positions, blocks
//! - [`model`] - The transformer and its configuration
//! - [`loss`] - Cross-entropy with optional label smoothing
//! - [`optimizer`], [`scheduler`], [`gradients`] - AdamW, cosine warmup, clipping
//! - [`data`] - Batched next-token datasets and corpus loading
//! - [`checkpoint`] - Weight and training-state archives
//! - [`train`], [`training_logger`] - Training loop and CSV metrics
//! - [`generate`] - Sampling strategies and autoregressive generation
//! - [`retrieval`] - Embeddings, BM25/cosine scoring, knowledge base
//!
//! # Example
//!
//! ```rust
//! use tisslm::{BpeTokenizer, Generator, ModelConfig, SamplingMethod, TransformerModel};
//!
//! let tokenizer = BpeTokenizer::train("to be or not to be, that is the question", 270).unwrap();
//! let ids = tokenizer.encode("to be");
//! assert_eq!(tokenizer.decode(&ids), "to be");
//!
//! let model = TransformerModel::new(&ModelConfig::tiny(tokenizer.vocab_size()), 7).unwrap();
//! let new_ids = Generator::new(&model)
//!     .generate(&ids, 4, SamplingMethod::Greedy, None, true)
//!     .unwrap();
//! assert_eq!(new_ids.len(), 4);
//! ```
//!
//! Logging goes through the [`log`] facade; install any logger to see it.

pub mod checkpoint;
pub mod data;
pub mod error;
pub mod generate;
pub mod gradients;
pub mod layers;
pub mod loss;
pub mod model;
pub mod optimizer;
pub mod parameter;
pub mod retrieval;
pub mod scheduler;
pub mod tensor;
pub mod tokenizer;
pub mod train;
pub mod training_logger;

// Re-export main types for convenience
pub use checkpoint::{load_checkpoint, save_checkpoint, TrainingProgress};
pub use data::{load_corpus, Batch, Dataset};
pub use error::{LmError, Result};
pub use generate::{GenerationConfig, Generator, SamplingMethod};
pub use gradients::{clip_gradients, global_grad_norm};
pub use layers::KvCache;
pub use loss::CrossEntropyLoss;
pub use model::{ModelConfig, TransformerModel};
pub use optimizer::AdamW;
pub use parameter::Parameter;
pub use scheduler::CosineWarmupScheduler;
pub use tensor::Tensor;
pub use tokenizer::{BpeTokenizer, TokenizerStats};
pub use train::{Trainer, TrainingConfig, TrainingSummary};
pub use training_logger::{StepMetrics, TrainingLogger};
