//! Text embeddings from the model's token embedding table
//!
//! A text is tokenized and its embedding is the mean of the rows `E[id]`.
//! Empty input embeds to the zero vector. The embedder borrows the table, so
//! it always sees the model's current weights and cannot outlive it.

use crate::error::{LmError, Result};
use crate::model::TransformerModel;
use crate::tensor::Tensor;
use crate::tokenizer::BpeTokenizer;
use log::warn;

pub struct Embedder<'a> {
    tokenizer: &'a BpeTokenizer,
    table: &'a Tensor,
}

impl<'a> Embedder<'a> {
    /// Embed with the model's embedding table
    pub fn new(tokenizer: &'a BpeTokenizer, model: &'a TransformerModel) -> Self {
        Self {
            tokenizer,
            table: &model.embeddings.value,
        }
    }

    /// Embed with any `[vocab_size, dim]` table
    pub fn from_table(tokenizer: &'a BpeTokenizer, table: &'a Tensor) -> Result<Self> {
        if table.shape.len() != 2 {
            return Err(LmError::Shape(format!(
                "embedding table must be 2-D, got shape {:?}",
                table.shape
            )));
        }
        Ok(Self { tokenizer, table })
    }

    pub fn dim(&self) -> usize {
        self.table.shape[1]
    }

    /// Mean token embedding of `text`
    ///
    /// Fails with a bounds error if the tokenizer produces an id the table
    /// has no row for.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let dim = self.dim();
        let rows = self.table.shape[0];
        let ids = self.tokenizer.encode(text);
        if ids.is_empty() {
            warn!("Input text for embedding is empty or tokenized to empty");
            return Ok(vec![0.0; dim]);
        }

        let mut sum = vec![0.0f32; dim];
        for &id in &ids {
            let id = id as usize;
            if id >= rows {
                return Err(LmError::Bounds(format!(
                    "token id {} has no row in an embedding table of {} rows",
                    id, rows
                )));
            }
            for (s, &e) in sum.iter_mut().zip(&self.table.data[id * dim..(id + 1) * dim]) {
                *s += e;
            }
        }
        let scale = 1.0 / ids.len() as f32;
        Ok(sum.into_iter().map(|s| s * scale).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn byte_table(dim: usize) -> Tensor {
        // row i = [i, i, ...]
        let data = (0..256).flat_map(|i| vec![i as f32; dim]).collect();
        Tensor::new(data, vec![256, dim])
    }

    #[test]
    fn test_mean_of_rows() {
        let tokenizer = BpeTokenizer::new();
        let table = byte_table(3);
        let embedder = Embedder::from_table(&tokenizer, &table).unwrap();
        // 'a' = 97, 'c' = 99
        let e = embedder.embed("ac").unwrap();
        assert_eq!(e.len(), 3);
        assert_abs_diff_eq!(e[0], 98.0);
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let tokenizer = BpeTokenizer::new();
        let table = byte_table(4);
        let embedder = Embedder::from_table(&tokenizer, &table).unwrap();
        assert_eq!(embedder.embed("").unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn test_id_outside_table() {
        let tokenizer = BpeTokenizer::new();
        let table = Tensor::zeros(vec![10, 2]);
        let embedder = Embedder::from_table(&tokenizer, &table).unwrap();
        assert!(matches!(embedder.embed("z"), Err(LmError::Bounds(_))));
        assert!(Embedder::from_table(&tokenizer, &Tensor::zeros(vec![4])).is_err());
    }
}
