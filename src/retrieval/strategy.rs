//! Retrieval Scoring
//!
//! A [`RetrievalStrategy`] turns a query and a document store into one score
//! per document. Higher is more relevant.
//!
//! ## Cosine
//!
//! ```text
//! score(q, d) = q·d / (‖q‖ ‖d‖)
//! ```
//!
//! Zero when either vector has zero norm.
//!
//! ## BM25
//!
//! ```text
//! idf(t)      = ln((N - n(t) + 0.5) / (n(t) + 0.5) + 1)
//! score(q, d) = Σ_{t ∈ q} idf(t) · tf(t,d)(k1 + 1) / (tf(t,d) + k1(1 - b + b·|d| / avgdl))
//! ```
//!
//! with `k1 = 1.5`, `b = 0.75`. Words are lowercased, split on whitespace and
//! stripped of surrounding punctuation. The index is built once from the
//! corpus and kept inside the strategy.
//!
//! ## Hybrid
//!
//! Cosine and BM25 scores are min-max normalized independently and combined
//! as `wc · cosine + wb · bm25`. A score vector with no spread normalizes to
//! zeros.

use crate::error::{LmError, Result};
use std::collections::HashMap;

/// What a strategy scores documents against
#[derive(Clone, Copy, Debug)]
pub struct Query<'a> {
    pub text: &'a str,
    pub embedding: &'a [f32],
}

pub trait RetrievalStrategy {
    /// One score per entry in `doc_embeddings`
    fn score(&self, query: &Query<'_>, doc_embeddings: &[Vec<f32>]) -> Result<Vec<f32>>;
}

/// Which strategy a knowledge base builds for a retrieval
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RetrievalMethod {
    Cosine,
    Bm25,
    Hybrid { cosine_weight: f32, bm25_weight: f32 },
}

impl Default for RetrievalMethod {
    fn default() -> Self {
        RetrievalMethod::Cosine
    }
}

/// Cosine similarity of two vectors; zero if either has zero norm
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CosineSimilarity;

impl RetrievalStrategy for CosineSimilarity {
    fn score(&self, query: &Query<'_>, doc_embeddings: &[Vec<f32>]) -> Result<Vec<f32>> {
        for doc in doc_embeddings {
            if doc.len() != query.embedding.len() {
                return Err(LmError::Shape(format!(
                    "embedding dimensions don't match: {} vs {}",
                    query.embedding.len(),
                    doc.len()
                )));
            }
        }
        Ok(doc_embeddings
            .iter()
            .map(|doc| cosine_similarity(query.embedding, doc))
            .collect())
    }
}

/// Lowercased words with surrounding punctuation removed
pub fn word_tokens(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

/// BM25 index over a fixed corpus
#[derive(Clone, Debug)]
pub struct Bm25 {
    pub k1: f32,
    pub b: f32,
    doc_len: Vec<usize>,
    avgdl: f32,
    term_freq: Vec<HashMap<String, usize>>,
    doc_freq: HashMap<String, usize>,
}

impl Bm25 {
    pub fn new<S: AsRef<str>>(corpus: &[S]) -> Self {
        Self::with_params(corpus, 1.5, 0.75)
    }

    pub fn with_params<S: AsRef<str>>(corpus: &[S], k1: f32, b: f32) -> Self {
        let mut doc_len = Vec::with_capacity(corpus.len());
        let mut term_freq = Vec::with_capacity(corpus.len());
        let mut doc_freq: HashMap<String, usize> = HashMap::new();

        for doc in corpus {
            let terms = word_tokens(doc.as_ref());
            doc_len.push(terms.len());
            let mut freqs: HashMap<String, usize> = HashMap::new();
            for term in terms {
                *freqs.entry(term).or_insert(0) += 1;
            }
            for term in freqs.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            term_freq.push(freqs);
        }

        let avgdl = if doc_len.is_empty() {
            0.0
        } else {
            doc_len.iter().sum::<usize>() as f32 / doc_len.len() as f32
        };
        Self {
            k1,
            b,
            doc_len,
            avgdl,
            term_freq,
            doc_freq,
        }
    }

    pub fn num_docs(&self) -> usize {
        self.doc_len.len()
    }

    fn idf(&self, term: &str) -> f32 {
        let n = self.doc_freq.get(term).copied().unwrap_or(0) as f32;
        let total = self.num_docs() as f32;
        ((total - n + 0.5) / (n + 0.5) + 1.0).ln()
    }

    /// Score every indexed document against `query`
    pub fn scores(&self, query: &str) -> Vec<f32> {
        let terms = word_tokens(query);
        // all-empty corpus: length normalization is moot
        let avgdl = if self.avgdl > 0.0 { self.avgdl } else { 1.0 };

        self.term_freq
            .iter()
            .zip(&self.doc_len)
            .map(|(freqs, &len)| {
                terms
                    .iter()
                    .filter_map(|term| freqs.get(term).map(|&tf| (term, tf as f32)))
                    .map(|(term, tf)| {
                        let numerator = tf * (self.k1 + 1.0);
                        let denominator =
                            tf + self.k1 * (1.0 - self.b + self.b * len as f32 / avgdl);
                        self.idf(term) * numerator / denominator
                    })
                    .sum()
            })
            .collect()
    }
}

impl RetrievalStrategy for Bm25 {
    fn score(&self, query: &Query<'_>, doc_embeddings: &[Vec<f32>]) -> Result<Vec<f32>> {
        if doc_embeddings.len() != self.num_docs() {
            return Err(LmError::Shape(format!(
                "BM25 index holds {} documents, asked to score {}",
                self.num_docs(),
                doc_embeddings.len()
            )));
        }
        Ok(self.scores(query.text))
    }
}

/// Rescale to `[0, 1]`; all-equal input gives zeros
pub fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    if !(range > 0.0) {
        return vec![0.0; scores.len()];
    }
    scores.iter().map(|&s| (s - min) / range).collect()
}

#[derive(Clone, Debug)]
pub struct HybridStrategy {
    pub bm25: Bm25,
    pub cosine_weight: f32,
    pub bm25_weight: f32,
}

impl HybridStrategy {
    pub fn new(bm25: Bm25, cosine_weight: f32, bm25_weight: f32) -> Self {
        Self {
            bm25,
            cosine_weight,
            bm25_weight,
        }
    }
}

impl RetrievalStrategy for HybridStrategy {
    fn score(&self, query: &Query<'_>, doc_embeddings: &[Vec<f32>]) -> Result<Vec<f32>> {
        if query.text.trim().is_empty() {
            return Err(LmError::Configuration(
                "hybrid retrieval requires query text".into(),
            ));
        }
        let cosine = min_max_normalize(&CosineSimilarity.score(query, doc_embeddings)?);
        let bm25 = min_max_normalize(&self.bm25.score(query, doc_embeddings)?);
        Ok(cosine
            .iter()
            .zip(&bm25)
            .map(|(&c, &k)| self.cosine_weight * c + self.bm25_weight * k)
            .collect())
    }
}

/// Indices of the `k` highest scores, best first; ties keep insertion order
pub fn top_k_indices(scores: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    order.truncate(k);
    order
}
