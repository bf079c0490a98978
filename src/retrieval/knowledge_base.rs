//! Knowledge Base
//!
//! An in-memory document store that augments prompts with retrieved
//! context.
//!
//! ## Storage
//!
//! Documents and their embeddings live in parallel vectors: document `i` is
//! `documents[i]` and its mean-token embedding is `embeddings[i]`. Embeddings
//! are computed once, at insertion, against the model's embedding table.
//!
//! ## Retrieval
//!
//! ```text
//! query → embed → score every document (cosine | BM25 | hybrid) → top-k texts
//! ```
//!
//! Each returned document's `access_count` is incremented. An empty store
//! returns no documents.
//!
//! ## Feedback
//!
//! A feedback score `s ∈ [1, 5]` for a set of retrieved texts moves each
//! matching document's relevance towards `s / 5`:
//!
//! ```text
//! relevance ← (1 - α) · relevance + α · s / 5       α = feedback_alpha
//! ```
//!
//! Interactions can also be written back as new documents, marked
//! `self_correction` when the user supplied a correction and
//! `self_generated` otherwise.

use super::chunking::ChunkingStrategy;
use super::embedder::Embedder;
use super::strategy::{
    top_k_indices, Bm25, CosineSimilarity, HybridStrategy, Query, RetrievalMethod,
    RetrievalStrategy,
};
use crate::error::{LmError, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch
fn now_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub source: String,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
    pub access_count: u64,
    pub relevance_score: f32,
    /// Caller-defined fields
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl DocumentMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            timestamp: now_timestamp(),
            access_count: 0,
            relevance_score: 1.0,
            extra: BTreeMap::new(),
        }
    }
}

impl Default for DocumentMetadata {
    fn default() -> Self {
        Self::new("user_input")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub text: String,
    pub metadata: DocumentMetadata,
}

/// One recorded feedback event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub query: String,
    pub retrieved: Vec<String>,
    pub score: u8,
    pub text: Option<String>,
    pub timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeStats {
    pub total_docs: usize,
    pub avg_relevance_score: f32,
    pub total_accesses: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeBaseConfig {
    /// Documents used by [`KnowledgeBase::augment_prompt`] when no `k` is given
    pub retrieval_k: usize,
    pub feedback_alpha: f32,
    /// Initial relevance of documents written back from generated responses
    pub self_gen_confidence: f32,
    /// Must contain `{context}` and `{prompt}`
    pub context_template: String,
    pub hybrid_cosine_weight: f32,
    pub hybrid_bm25_weight: f32,
}

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            retrieval_k: 3,
            feedback_alpha: 0.1,
            self_gen_confidence: 0.7,
            context_template: "context: {context} question: {prompt}".into(),
            hybrid_cosine_weight: 0.5,
            hybrid_bm25_weight: 0.5,
        }
    }
}

impl KnowledgeBaseConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.feedback_alpha) {
            return Err(LmError::Configuration(format!(
                "feedback_alpha must be in [0, 1], got {}",
                self.feedback_alpha
            )));
        }
        if !(0.0..=1.0).contains(&self.self_gen_confidence) {
            return Err(LmError::Configuration(format!(
                "self_gen_confidence must be in [0, 1], got {}",
                self.self_gen_confidence
            )));
        }
        if !self.context_template.contains("{context}") || !self.context_template.contains("{prompt}") {
            return Err(LmError::Configuration(
                "context_template must contain {context} and {prompt}".into(),
            ));
        }
        if self.hybrid_cosine_weight < 0.0 || self.hybrid_bm25_weight < 0.0 {
            return Err(LmError::Configuration("hybrid weights must be non-negative".into()));
        }
        Ok(())
    }

    /// Hybrid retrieval with the configured weights
    pub fn hybrid_method(&self) -> RetrievalMethod {
        RetrievalMethod::Hybrid {
            cosine_weight: self.hybrid_cosine_weight,
            bm25_weight: self.hybrid_bm25_weight,
        }
    }
}

pub struct KnowledgeBase<'a> {
    embedder: Embedder<'a>,
    config: KnowledgeBaseConfig,
    documents: Vec<Document>,
    embeddings: Vec<Vec<f32>>,
    feedback: Vec<Feedback>,
}

impl<'a> KnowledgeBase<'a> {
    pub fn new(embedder: Embedder<'a>, config: KnowledgeBaseConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            embedder,
            config,
            documents: Vec::new(),
            embeddings: Vec::new(),
            feedback: Vec::new(),
        })
    }

    pub fn config(&self) -> &KnowledgeBaseConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn feedback_log(&self) -> &[Feedback] {
        &self.feedback
    }

    /// Embed and store `text`; returns its index
    pub fn add_document(&mut self, text: &str, metadata: Option<DocumentMetadata>) -> Result<usize> {
        let embedding = self.embedder.embed(text)?;
        self.documents.push(Document {
            text: text.to_string(),
            metadata: metadata.unwrap_or_default(),
        });
        self.embeddings.push(embedding);
        info!("Added document {} to knowledge base", self.documents.len() - 1);
        Ok(self.documents.len() - 1)
    }

    /// Split `text` and store every chunk; returns the number added
    pub fn add_chunked_document(
        &mut self,
        text: &str,
        chunker: &dyn ChunkingStrategy,
        metadata: Option<DocumentMetadata>,
    ) -> Result<usize> {
        let chunks = chunker.chunk(text);
        for chunk in &chunks {
            self.add_document(chunk, metadata.clone())?;
        }
        Ok(chunks.len())
    }

    /// One score per stored document
    pub fn scores(&self, query: &str, method: RetrievalMethod) -> Result<Vec<f32>> {
        let embedding = self.embedder.embed(query)?;
        let query = Query {
            text: query,
            embedding: &embedding,
        };
        let texts: Vec<&str> = self.documents.iter().map(|d| d.text.as_str()).collect();

        let scores = match method {
            RetrievalMethod::Cosine => CosineSimilarity.score(&query, &self.embeddings)?,
            RetrievalMethod::Bm25 => Bm25::new(&texts).score(&query, &self.embeddings)?,
            RetrievalMethod::Hybrid {
                cosine_weight,
                bm25_weight,
            } => HybridStrategy::new(Bm25::new(&texts), cosine_weight, bm25_weight)
                .score(&query, &self.embeddings)?,
        };
        debug!(
            "Scored {} documents with {:?}; best {:.4}",
            scores.len(),
            method,
            scores.iter().copied().fold(f32::NEG_INFINITY, f32::max)
        );
        Ok(scores)
    }

    /// Up to `k` document texts, best first
    pub fn retrieve(&mut self, query: &str, k: usize, method: RetrievalMethod) -> Result<Vec<String>> {
        if self.documents.is_empty() {
            warn!("Knowledge base is empty; nothing to retrieve");
            return Ok(Vec::new());
        }
        let scores = self.scores(query, method)?;
        let top = top_k_indices(&scores, k);
        Ok(top
            .into_iter()
            .map(|i| {
                let doc = &mut self.documents[i];
                doc.metadata.access_count += 1;
                doc.text.clone()
            })
            .collect())
    }

    /// Render `context_template` with the retrieved texts and `query`
    ///
    /// Returns `query` unchanged when nothing is retrieved.
    pub fn augment_prompt(
        &mut self,
        query: &str,
        k: Option<usize>,
        method: RetrievalMethod,
    ) -> Result<String> {
        let k = k.unwrap_or(self.config.retrieval_k);
        let context = self.retrieve(query, k, method)?;
        if context.is_empty() {
            return Ok(query.to_string());
        }
        Ok(self
            .config
            .context_template
            .replace("{context}", &context.join(" "))
            .replace("{prompt}", query))
    }

    /// Record feedback and update the relevance of every matching document
    pub fn add_feedback(
        &mut self,
        query: &str,
        retrieved: &[String],
        score: u8,
        text: Option<&str>,
    ) -> Result<()> {
        if !(1..=5).contains(&score) {
            return Err(LmError::Configuration(format!(
                "feedback score must be between 1 and 5, got {}",
                score
            )));
        }
        let alpha = self.config.feedback_alpha;
        let target = score as f32 / 5.0;
        for doc in self
            .documents
            .iter_mut()
            .filter(|d| retrieved.iter().any(|r| *r == d.text))
        {
            let old = doc.metadata.relevance_score;
            doc.metadata.relevance_score = (1.0 - alpha) * old + alpha * target;
        }

        self.feedback.push(Feedback {
            query: query.to_string(),
            retrieved: retrieved.to_vec(),
            score,
            text: text.map(str::to_string),
            timestamp: now_timestamp(),
        });
        info!("Recorded feedback score {} for {} documents", score, retrieved.len());
        Ok(())
    }

    /// Store an interaction as a new document; returns its index
    pub fn self_update_from_interaction(
        &mut self,
        query: &str,
        response: &str,
        correction: Option<&str>,
    ) -> Result<usize> {
        let (text, metadata) = match correction {
            Some(correction) => (
                format!("Query: {}\nCorrect Answer: {}", query, correction),
                DocumentMetadata::new("self_correction"),
            ),
            None => (
                format!("Query: {}\nResponse: {}", query, response),
                DocumentMetadata {
                    relevance_score: self.config.self_gen_confidence,
                    ..DocumentMetadata::new("self_generated")
                },
            ),
        };
        self.add_document(&text, Some(metadata))
    }

    pub fn stats(&self) -> KnowledgeStats {
        let total_docs = self.documents.len();
        let avg_relevance_score = if total_docs == 0 {
            0.0
        } else {
            self.documents
                .iter()
                .map(|d| d.metadata.relevance_score)
                .sum::<f32>()
                / total_docs as f32
        };
        KnowledgeStats {
            total_docs,
            avg_relevance_score,
            total_accesses: self.documents.iter().map(|d| d.metadata.access_count).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::chunking::SentenceChunking;
    use crate::tensor::Tensor;
    use crate::tokenizer::BpeTokenizer;
    use approx::assert_abs_diff_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn table() -> Tensor {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let data = (0..256 * 8).map(|_| rng.gen_range(-1.0..1.0)).collect();
        Tensor::new(data, vec![256, 8])
    }

    #[test]
    fn test_empty_store_returns_nothing() {
        let tokenizer = BpeTokenizer::new();
        let table = table();
        let mut kb =
            KnowledgeBase::new(Embedder::from_table(&tokenizer, &table).unwrap(), Default::default())
                .unwrap();
        assert!(kb.retrieve("anything", 3, RetrievalMethod::Cosine).unwrap().is_empty());
        assert_eq!(kb.augment_prompt("hi", None, RetrievalMethod::Bm25).unwrap(), "hi");
    }

    #[test]
    fn test_identical_document_ranks_first() {
        let tokenizer = BpeTokenizer::new();
        let table = table();
        let mut kb =
            KnowledgeBase::new(Embedder::from_table(&tokenizer, &table).unwrap(), Default::default())
                .unwrap();
        kb.add_document("zebras graze quietly", None).unwrap();
        kb.add_document("quantum flux capacitor", None).unwrap();
        kb.add_document("hello world", None).unwrap();

        let top = kb.retrieve("quantum flux capacitor", 2, RetrievalMethod::Cosine).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0], "quantum flux capacitor");
        assert_eq!(kb.retrieve("hello", 10, RetrievalMethod::Bm25).unwrap().len(), 3);
        assert_eq!(kb.stats().total_accesses, 5);
    }

    #[test]
    fn test_augment_prompt_uses_template() {
        let tokenizer = BpeTokenizer::new();
        let table = table();
        let mut kb =
            KnowledgeBase::new(Embedder::from_table(&tokenizer, &table).unwrap(), Default::default())
                .unwrap();
        kb.add_document("Paris is the capital of France.", None).unwrap();
        let prompt = kb
            .augment_prompt("capital of France", Some(1), kb.config().hybrid_method())
            .unwrap();
        assert_eq!(
            prompt,
            "context: Paris is the capital of France. question: capital of France"
        );
    }

    #[test]
    fn test_feedback_moves_relevance() {
        let tokenizer = BpeTokenizer::new();
        let table = table();
        let mut kb =
            KnowledgeBase::new(Embedder::from_table(&tokenizer, &table).unwrap(), Default::default())
                .unwrap();
        kb.add_document("alpha", None).unwrap();
        kb.add_document("beta", None).unwrap();

        kb.add_feedback("q", &["alpha".to_string()], 1, Some("bad")).unwrap();
        // 0.9 · 1.0 + 0.1 · 0.2
        assert_abs_diff_eq!(kb.documents()[0].metadata.relevance_score, 0.92, epsilon = 1e-6);
        assert_eq!(kb.documents()[1].metadata.relevance_score, 1.0);
        assert_eq!(kb.feedback_log().len(), 1);
        assert!(kb.add_feedback("q", &[], 6, None).is_err());
        assert_abs_diff_eq!(kb.stats().avg_relevance_score, 0.96, epsilon = 1e-6);
    }

    #[test]
    fn test_self_update_and_chunked_ingest() {
        let tokenizer = BpeTokenizer::new();
        let table = table();
        let mut kb =
            KnowledgeBase::new(Embedder::from_table(&tokenizer, &table).unwrap(), Default::default())
                .unwrap();

        let i = kb.self_update_from_interaction("2+2?", "5", Some("4")).unwrap();
        assert_eq!(kb.documents()[i].text, "Query: 2+2?\nCorrect Answer: 4");
        assert_eq!(kb.documents()[i].metadata.source, "self_correction");

        let j = kb.self_update_from_interaction("sky?", "blue", None).unwrap();
        assert_eq!(kb.documents()[j].text, "Query: sky?\nResponse: blue");
        assert_eq!(kb.documents()[j].metadata.source, "self_generated");
        assert_abs_diff_eq!(kb.documents()[j].metadata.relevance_score, 0.7);

        let added = kb
            .add_chunked_document("One. Two! Three?", &SentenceChunking, None)
            .unwrap();
        assert_eq!(added, 3);
        assert_eq!(kb.documents()[4].text, "Three?");
        assert_eq!(kb.stats().total_docs, 5);
    }

    #[test]
    fn test_config_validation() {
        let bad = KnowledgeBaseConfig {
            context_template: "no placeholders".into(),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let parsed: KnowledgeBaseConfig = serde_json::from_str(r#"{"retrieval_k": 5}"#).unwrap();
        assert_eq!(parsed.retrieval_k, 5);
        assert_eq!(parsed.feedback_alpha, 0.1);
    }
}
