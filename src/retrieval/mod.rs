//! Retrieval
//!
//! Retrieval-augmented prompting on top of the model's own embedding table.
//!
//! ## Modules
//!
//! - **embedder**: Mean token embedding of a text
//! - **strategy**: Cosine, BM25 and hybrid scoring
//! - **chunking**: Fixed-size and sentence splitting of long documents
//! - **keywords**: TF-IDF keyword extraction
//! - **knowledge_base**: Document store with feedback and prompt augmentation
//!
//! ## Example
//!
//! ```rust
//! use tisslm::retrieval::{Embedder, KnowledgeBase, KnowledgeBaseConfig, RetrievalMethod};
//! use tisslm::{BpeTokenizer, ModelConfig, TransformerModel};
//!
//! let tokenizer = BpeTokenizer::new();
//! let model = TransformerModel::new(&ModelConfig::tiny(tokenizer.vocab_size()), 1).unwrap();
//!
//! let mut kb = KnowledgeBase::new(Embedder::new(&tokenizer, &model), KnowledgeBaseConfig::default()).unwrap();
//! kb.add_document("The Rhine flows through Basel.", None).unwrap();
//! let prompt = kb.augment_prompt("Where does the Rhine flow?", Some(1), RetrievalMethod::Bm25).unwrap();
//! assert!(prompt.starts_with("context: The Rhine"));
//! ```

pub mod chunking;
pub mod embedder;
pub mod keywords;
pub mod knowledge_base;
pub mod strategy;

pub use chunking::{ChunkingStrategy, FixedSizeChunking, SentenceChunking};
pub use embedder::Embedder;
pub use keywords::{KeywordExtractor, TfIdfKeywordExtractor};
pub use knowledge_base::{
    Document, DocumentMetadata, Feedback, KnowledgeBase, KnowledgeBaseConfig, KnowledgeStats,
};
pub use strategy::{
    cosine_similarity, Bm25, CosineSimilarity, HybridStrategy, Query, RetrievalMethod,
    RetrievalStrategy,
};
