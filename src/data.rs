//! Training Data
//!
//! [`Dataset`] turns a flat token stream into consecutive, non-overlapping
//! `(input, target)` batches for next-token prediction:
//!
//! ```text
//! Tokens: [1, 2, 3, 4, 5, 6, 7, 8, 9]
//! batch_size: 2, seq_len: 2
//!
//! Batch 0:
//!   x = [[1, 2], [3, 4]]   y = [[2, 3], [4, 5]]
//! Batch 1:
//!   x = [[5, 6], [7, 8]]   y = [[6, 7], [8, 9]]
//! ```
//!
//! The target is the input shifted by one position. The number of batches is
//! `(num_tokens - 1) / (batch_size · seq_len)`, so every target token exists;
//! a tail too short for a full batch is dropped.
//!
//! [`load_corpus`] reads training text from a single file or from every
//! `.txt` file in a directory.

use crate::error::{LmError, Result};
use crate::tokenizer::BpeTokenizer;
use log::info;
use std::fs;
use std::path::Path;

/// `(inputs, targets)`, each `[batch_size][seq_len]`
pub type Batch = (Vec<Vec<u32>>, Vec<Vec<u32>>);

#[derive(Clone, Debug)]
pub struct Dataset {
    tokens: Vec<u32>,
    batch_size: usize,
    seq_len: usize,
}

impl Dataset {
    /// Fails with a configuration error if the tokens cannot fill one batch
    pub fn new(tokens: Vec<u32>, batch_size: usize, seq_len: usize) -> Result<Self> {
        if batch_size == 0 || seq_len == 0 {
            return Err(LmError::Configuration(
                "batch_size and seq_len must be positive".into(),
            ));
        }
        let dataset = Self {
            tokens,
            batch_size,
            seq_len,
        };
        if dataset.num_batches() < 1 {
            return Err(LmError::Configuration(format!(
                "{} tokens cannot fill a single batch of {} x {} (need at least {})",
                dataset.tokens.len(),
                batch_size,
                seq_len,
                batch_size * seq_len + 1
            )));
        }
        Ok(dataset)
    }

    /// Tokenize `text` and build a dataset from it
    pub fn from_text(
        text: &str,
        tokenizer: &BpeTokenizer,
        batch_size: usize,
        seq_len: usize,
    ) -> Result<Self> {
        let tokens = tokenizer.encode(text);
        info!("Loaded {} tokens from text", tokens.len());
        Self::new(tokens, batch_size, seq_len)
    }

    pub fn num_batches(&self) -> usize {
        self.tokens.len().saturating_sub(1) / (self.batch_size * self.seq_len)
    }

    pub fn num_tokens(&self) -> usize {
        self.tokens.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Batch `index`, or `None` past the end
    pub fn batch(&self, index: usize) -> Option<Batch> {
        if index >= self.num_batches() {
            return None;
        }
        let span = self.batch_size * self.seq_len;
        let start = index * span;
        let x = &self.tokens[start..start + span];
        let y = &self.tokens[start + 1..start + span + 1];

        let rows = |slice: &[u32]| -> Vec<Vec<u32>> {
            slice.chunks(self.seq_len).map(|c| c.to_vec()).collect()
        };
        Some((rows(x), rows(y)))
    }

    /// Batches in order
    pub fn iter(&self) -> impl Iterator<Item = Batch> + '_ {
        (0..self.num_batches()).filter_map(move |i| self.batch(i))
    }

    /// Split into `(train, validation)` with roughly `val_fraction` of the
    /// tokens held out from the end
    pub fn split(&self, val_fraction: f32) -> Result<(Dataset, Dataset)> {
        if !(0.0..1.0).contains(&val_fraction) {
            return Err(LmError::Configuration(format!(
                "val_fraction must be in [0, 1), got {}",
                val_fraction
            )));
        }
        let cut = ((self.tokens.len() as f32) * (1.0 - val_fraction)) as usize;
        let train = Dataset::new(self.tokens[..cut].to_vec(), self.batch_size, self.seq_len)?;
        let val = Dataset::new(self.tokens[cut..].to_vec(), self.batch_size, self.seq_len)?;
        Ok((train, val))
    }
}

/// Read training text from a `.txt` file or a directory of them
///
/// Directory entries are read in name order. Each file contributes its
/// contents followed by a newline. Invalid UTF-8 is replaced rather than
/// rejected.
pub fn load_corpus(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let files = if path.is_dir() {
        let mut files: Vec<_> = fs::read_dir(path)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().map_or(false, |ext| ext == "txt"))
            .collect();
        files.sort();
        files
    } else if path.is_file() {
        vec![path.to_path_buf()]
    } else {
        return Err(LmError::Configuration(format!(
            "corpus path {} is neither a file nor a directory",
            path.display()
        )));
    };

    let mut corpus = String::new();
    for file in &files {
        let bytes = fs::read(file)?;
        corpus.push_str(&String::from_utf8_lossy(&bytes));
        corpus.push('\n');
    }
    info!(
        "Loaded corpus from {} file(s) under {} ({} bytes)",
        files.len(),
        path.display(),
        corpus.len()
    );
    Ok(corpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batches_are_shifted_by_one() {
        let ds = Dataset::new((1..=9).collect(), 2, 2).unwrap();
        assert_eq!(ds.num_batches(), 2);

        let (x, y) = ds.batch(0).unwrap();
        assert_eq!(x, vec![vec![1, 2], vec![3, 4]]);
        assert_eq!(y, vec![vec![2, 3], vec![4, 5]]);

        let (x, y) = ds.batch(1).unwrap();
        assert_eq!(x, vec![vec![5, 6], vec![7, 8]]);
        assert_eq!(y, vec![vec![6, 7], vec![8, 9]]);

        assert!(ds.batch(2).is_none());
        assert_eq!(ds.iter().count(), 2);
    }

    #[test]
    fn test_short_stream_rejected() {
        // 4 tokens give (4 - 1) / 4 = 0 batches
        let err = Dataset::new(vec![1, 2, 3, 4], 1, 4).unwrap_err();
        assert!(matches!(err, LmError::Configuration(_)));
        assert!(Dataset::new(vec![1, 2, 3, 4, 5], 1, 4).is_ok());
        assert!(Dataset::new(vec![1, 2, 3], 0, 1).is_err());
    }

    #[test]
    fn test_split_keeps_shapes() {
        let ds = Dataset::new((0..100).collect(), 2, 4).unwrap();
        let (train, val) = ds.split(0.2).unwrap();
        assert_eq!(train.num_tokens() + val.num_tokens(), 100);
        assert_eq!(val.seq_len(), 4);
    }

    #[test]
    fn test_load_corpus_directory_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), "second").unwrap();
        fs::write(dir.path().join("a.txt"), "first").unwrap();
        fs::write(dir.path().join("notes.md"), "ignored").unwrap();

        let corpus = load_corpus(dir.path()).unwrap();
        assert_eq!(corpus, "first\nsecond\n");
    }

    #[test]
    fn test_load_corpus_lossy_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.txt");
        fs::write(&path, [b'o', b'k', 0xff]).unwrap();
        assert_eq!(load_corpus(&path).unwrap(), "ok\u{fffd}\n");
        assert!(load_corpus(dir.path().join("missing")).is_err());
    }
}
