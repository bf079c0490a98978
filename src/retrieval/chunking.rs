//! Document chunking
//!
//! Long documents are split before indexing so each stored entry covers one
//! idea. Both strategies keep the order of the source text.

use crate::error::{LmError, Result};

pub trait ChunkingStrategy {
    fn chunk(&self, text: &str) -> Vec<String>;
}

/// Windows of `chunk_size` words, each starting `chunk_size - overlap` words
/// after the previous one
#[derive(Clone, Copy, Debug)]
pub struct FixedSizeChunking {
    chunk_size: usize,
    overlap: usize,
}

impl FixedSizeChunking {
    /// `overlap` must be smaller than `chunk_size`
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        if overlap >= chunk_size {
            return Err(LmError::Configuration(format!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                overlap, chunk_size
            )));
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }
}

impl ChunkingStrategy for FixedSizeChunking {
    fn chunk(&self, text: &str) -> Vec<String> {
        let words: Vec<&str> = text.split_whitespace().collect();
        let stride = self.chunk_size - self.overlap;
        let mut chunks = Vec::new();
        let mut start = 0;
        while start < words.len() {
            let end = (start + self.chunk_size).min(words.len());
            chunks.push(words[start..end].join(" "));
            if end == words.len() {
                break;
            }
            start += stride;
        }
        chunks
    }
}

/// One chunk per sentence
///
/// A sentence ends at `.`, `?` or `!` followed by whitespace, or at a line
/// break. Chunks are trimmed and empty ones dropped.
#[derive(Clone, Copy, Debug, Default)]
pub struct SentenceChunking;

impl ChunkingStrategy for SentenceChunking {
    fn chunk(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            let boundary = match c {
                '\n' | '\r' => true,
                '.' | '?' | '!' => {
                    current.push(c);
                    chars.peek().map_or(true, |next| next.is_whitespace())
                }
                _ => {
                    current.push(c);
                    false
                }
            };
            if boundary {
                let sentence = current.trim();
                if !sentence.is_empty() {
                    chunks.push(sentence.to_string());
                }
                current.clear();
            }
        }
        let tail = current.trim();
        if !tail.is_empty() {
            chunks.push(tail.to_string());
        }
        chunks
    }
}
