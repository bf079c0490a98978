//! TF-IDF keyword extraction
//!
//! ```text
//! idf(w)        = ln(N / (df(w) + 1))
//! tfidf(w, doc) = count(w, doc) · idf(w)
//! ```
//!
//! `N` is the size of the background corpus. Words are lowercased and split
//! on whitespace; anything that is not purely alphabetic, and every stop
//! word, is ignored. A word absent from the corpus scores zero.

use std::collections::{HashMap, HashSet};

pub trait KeywordExtractor {
    fn extract_keywords(&self, text: &str, top_n: usize) -> Vec<String>;
}

#[derive(Clone, Debug, Default)]
pub struct TfIdfKeywordExtractor {
    idf: HashMap<String, f32>,
    stop_words: HashSet<String>,
}

impl TfIdfKeywordExtractor {
    pub fn new<S, W>(corpus: &[S], stop_words: W) -> Self
    where
        S: AsRef<str>,
        W: IntoIterator,
        W::Item: Into<String>,
    {
        let mut extractor = Self {
            idf: HashMap::new(),
            stop_words: stop_words
                .into_iter()
                .map(|w| w.into().to_lowercase())
                .collect(),
        };

        let mut df: HashMap<String, usize> = HashMap::new();
        for doc in corpus {
            let unique: HashSet<String> = extractor.tokenize(doc.as_ref()).into_iter().collect();
            for word in unique {
                *df.entry(word).or_insert(0) += 1;
            }
        }
        let n = corpus.len() as f32;
        extractor.idf = df
            .into_iter()
            .map(|(word, count)| (word, (n / (count as f32 + 1.0)).ln()))
            .collect();
        extractor
    }

    fn tokenize(&self, text: &str) -> Vec<String> {
        text.split_whitespace()
            .map(str::to_lowercase)
            .filter(|w| w.chars().all(char::is_alphabetic) && !self.stop_words.contains(w))
            .collect()
    }

    pub fn idf(&self, word: &str) -> Option<f32> {
        self.idf.get(word).copied()
    }
}

impl KeywordExtractor for TfIdfKeywordExtractor {
    /// Highest-scoring words first; ties keep first-occurrence order
    fn extract_keywords(&self, text: &str, top_n: usize) -> Vec<String> {
        let tokens = self.tokenize(text);
        let mut order: Vec<String> = Vec::new();
        let mut tf: HashMap<&str, usize> = HashMap::new();
        for token in &tokens {
            let count = tf.entry(token.as_str()).or_insert(0);
            if *count == 0 {
                order.push(token.clone());
            }
            *count += 1;
        }

        let score = |word: &str| tf[word] as f32 * self.idf(word).unwrap_or(0.0);
        let mut ranked: Vec<(usize, f32)> =
            order.iter().enumerate().map(|(i, w)| (i, score(w))).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        ranked
            .into_iter()
            .take(top_n)
            .map(|(i, _)| order[i].clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn corpus() -> Vec<&'static str> {
        vec![
            "the cat sat on the mat",
            "the dog chased the cat",
            "rockets fly to orbit",
            "the weather is mild",
        ]
    }

    #[test]
    fn test_idf_values() {
        let extractor = TfIdfKeywordExtractor::new(&corpus(), Vec::<String>::new());
        // "rockets" appears in 1 of 4 documents
        assert_abs_diff_eq!(extractor.idf("rockets").unwrap(), (4.0f32 / 2.0).ln());
        // "the" appears in 3 of 4
        assert_abs_diff_eq!(extractor.idf("the").unwrap(), 0.0);
        assert!(extractor.idf("unseen").is_none());
    }

    #[test]
    fn test_rare_words_rank_first_and_stop_words_skipped() {
        let extractor = TfIdfKeywordExtractor::new(&corpus(), ["on", "to", "is"]);
        let keywords = extractor.extract_keywords("The rockets and the cat rockets!", 2);
        // "rockets!" is not alphabetic, so rockets counts once
        assert_eq!(keywords, vec!["rockets", "cat"]);
        assert!(extractor.extract_keywords("", 3).is_empty());
        assert!(extractor.extract_keywords("to is on", 3).is_empty());
    }
}
