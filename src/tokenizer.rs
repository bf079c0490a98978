//! Byte Pair Encoding (BPE) Tokenizer
//!
//! A byte-level BPE tokenizer trained from scratch on a text corpus.
//!
//! ## How BPE Works
//!
//! 1. **Start with bytes**: ids 0-255 are the 256 single-byte tokens
//! 2. **Count adjacent pairs**: find the most frequent adjacent id pair
//! 3. **Merge it**: the pair becomes a new id `n = |vocab|`, and every
//!    non-overlapping occurrence in the corpus is replaced by `n`
//! 4. **Repeat** until the target vocabulary size is reached or no pair
//!    occurs more than once
//!
//! Ties between equally frequent pairs go to the pair that occurs first in
//! the current sequence, which makes training fully deterministic.
//!
//! ## Example
//!
//! Training on `"ababab"` with a target of 258:
//!
//! ```text
//! ids:     [97, 98, 97, 98, 97, 98]
//! merge 1: (97, 98) → 256     ids: [256, 256, 256]
//! merge 2: (256, 256) → 257   ids: [257, 256]
//! ```
//!
//! ## Encoding
//!
//! Text is converted to its UTF-8 bytes, then the applicable pair with the
//! smallest merged id (the earliest-learned merge) is applied repeatedly
//! until no learned pair remains. Because merges only ever join adjacent
//! ids, `decode(encode(s)) == s` for every string.
//!
//! ## Persistence
//!
//! `save(prefix)` writes two files:
//!
//! - `{prefix}_vocab.json`: `{"<id>": "<hex bytes>", ...}`
//! - `{prefix}_merges.txt`: one `a b new` line per merge, in learned order
//!
//! `load` also accepts vocabularies that store each entry as a list of byte
//! values instead of a hex string.
//!
//! ## Implementation Notes
//!
//! - **Parallel pair counting**: the corpus is split into chunks and counted
//!   on all cores with rayon, then the per-chunk counts are reduced
//! - **Double buffering**: each merge pass writes into a reused buffer and
//!   swaps it in, avoiding an allocation per merge

use crate::error::{LmError, Result};
use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

const NUM_BYTE_TOKENS: usize = 256;

/// Pair counts from training: `(count, first position)`
type PairStats = HashMap<(u32, u32), (usize, usize)>;

/// A byte-level BPE tokenizer
///
/// `vocab[id]` holds the bytes a token decodes to. Ids are dense: the first
/// 256 are single bytes and every later id was created by a merge.
#[derive(Clone, Debug)]
pub struct BpeTokenizer {
    vocab: Vec<Vec<u8>>,
    /// Merge rules in learned order
    merges: Vec<((u32, u32), u32)>,
    /// Pair → merged id, for encoding
    merge_lookup: HashMap<(u32, u32), u32>,
}

impl Default for BpeTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl BpeTokenizer {
    /// Tokenizer with only the 256 byte tokens and no merges
    pub fn new() -> Self {
        Self {
            vocab: (0..NUM_BYTE_TOKENS).map(|b| vec![b as u8]).collect(),
            merges: Vec::new(),
            merge_lookup: HashMap::new(),
        }
    }

    /// Learn merges from `text` until the vocabulary reaches `vocab_size`
    ///
    /// Fails with a configuration error when `vocab_size < 256`. Training
    /// stops early once no adjacent pair occurs at least twice.
    ///
    /// ```rust
    /// use tisslm::BpeTokenizer;
    ///
    /// let tokenizer = BpeTokenizer::train("ababab", 258).unwrap();
    /// assert_eq!(tokenizer.merges()[0], ((97, 98), 256));
    /// assert_eq!(tokenizer.encode("aba"), vec![256, 97]);
    /// ```
    pub fn train(text: &str, vocab_size: usize) -> Result<Self> {
        if vocab_size < NUM_BYTE_TOKENS {
            return Err(LmError::Configuration(format!(
                "vocab_size must be at least {}, got {}",
                NUM_BYTE_TOKENS, vocab_size
            )));
        }

        let mut tokenizer = Self::new();
        let num_merges = vocab_size - NUM_BYTE_TOKENS;
        info!(
            "Training BPE tokenizer: {} bytes, target vocab size {}",
            text.len(),
            vocab_size
        );

        let mut ids: Vec<u32> = text.bytes().map(u32::from).collect();
        let mut buffer = Vec::with_capacity(ids.len());

        for merge_idx in 0..num_merges {
            let stats = count_pairs(&ids);

            // Most frequent pair; ties go to the earliest first occurrence
            let best = stats
                .into_iter()
                .max_by(|(_, (ca, pa)), (_, (cb, pb))| ca.cmp(cb).then(pb.cmp(pa)));
            let (pair, count) = match best {
                Some((pair, (count, _))) if count >= 2 => (pair, count),
                _ => {
                    debug!("No repeated pairs left after {} merges", merge_idx);
                    break;
                }
            };

            let new_id = tokenizer.vocab.len() as u32;
            let mut bytes = tokenizer.vocab[pair.0 as usize].clone();
            bytes.extend_from_slice(&tokenizer.vocab[pair.1 as usize]);
            tokenizer.vocab.push(bytes);
            tokenizer.merges.push((pair, new_id));
            tokenizer.merge_lookup.insert(pair, new_id);

            merge_pair(&ids, pair, new_id, &mut buffer);
            std::mem::swap(&mut ids, &mut buffer);

            debug!(
                "Merge {}/{}: {:?} (count: {}) -> {}",
                merge_idx + 1,
                num_merges,
                pair,
                count,
                new_id
            );
        }

        info!(
            "BPE training complete: vocab size {}, {} merges",
            tokenizer.vocab.len(),
            tokenizer.merges.len()
        );
        Ok(tokenizer)
    }

    /// Encode text to token ids
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let mut ids: Vec<u32> = text.bytes().map(u32::from).collect();
        let mut buffer = Vec::with_capacity(ids.len());

        loop {
            // Applicable pair with the smallest merged id
            let next = ids
                .windows(2)
                .filter_map(|w| {
                    self.merge_lookup
                        .get(&(w[0], w[1]))
                        .map(|&new_id| ((w[0], w[1]), new_id))
                })
                .min_by_key(|&(_, new_id)| new_id);

            match next {
                Some((pair, new_id)) => {
                    merge_pair(&ids, pair, new_id, &mut buffer);
                    std::mem::swap(&mut ids, &mut buffer);
                }
                None => break,
            }
        }
        ids
    }

    /// Decode ids to text
    ///
    /// Invalid UTF-8 becomes U+FFFD. Ids outside the vocabulary are skipped.
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut bytes = Vec::new();
        for &id in ids {
            match self.vocab.get(id as usize) {
                Some(token) => bytes.extend_from_slice(token),
                None => debug!("Skipping unknown token id {} during decode", id),
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Decode and drop a single leading space
    pub fn detokenize(&self, ids: &[u32]) -> String {
        let text = self.decode(ids);
        match text.strip_prefix(' ') {
            Some(rest) => rest.to_string(),
            None => text,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Merge rules `((a, b), new)` in learned order
    pub fn merges(&self) -> &[((u32, u32), u32)] {
        &self.merges
    }

    /// Bytes for a single id
    pub fn token_bytes(&self, id: u32) -> Option<&[u8]> {
        self.vocab.get(id as usize).map(|b| b.as_slice())
    }

    /// Id used for unknown tokens: first id of `"<unk>"`, or 0
    pub fn unk_token_id(&self) -> u32 {
        self.encode("<unk>").first().copied().unwrap_or(0)
    }

    /// Id used for padding: first id of `"<pad>"`, or 1
    pub fn pad_token_id(&self) -> u32 {
        self.encode("<pad>").first().copied().unwrap_or(1)
    }

    pub fn stats(&self) -> TokenizerStats {
        TokenizerStats {
            vocab_size: self.vocab.len(),
            num_merges: self.merges.len(),
            base_tokens: NUM_BYTE_TOKENS,
        }
    }

    /// Write `{prefix}_vocab.json` and `{prefix}_merges.txt`
    pub fn save(&self, prefix: impl AsRef<Path>) -> Result<()> {
        let (vocab_path, merges_path) = artifact_paths(prefix.as_ref());

        let vocab: BTreeMap<u32, String> = self
            .vocab
            .iter()
            .enumerate()
            .map(|(id, bytes)| (id as u32, to_hex(bytes)))
            .collect();
        fs::write(&vocab_path, serde_json::to_string(&vocab)?)?;

        let merges: String = self
            .merges
            .iter()
            .map(|((a, b), n)| format!("{} {} {}\n", a, b, n))
            .collect();
        fs::write(&merges_path, merges)?;

        info!(
            "Saved tokenizer ({} tokens) to {} and {}",
            self.vocab.len(),
            vocab_path.display(),
            merges_path.display()
        );
        Ok(())
    }

    /// Load a tokenizer written by [`Self::save`]
    pub fn load(prefix: impl AsRef<Path>) -> Result<Self> {
        let (vocab_path, merges_path) = artifact_paths(prefix.as_ref());

        let raw: HashMap<String, StoredToken> =
            serde_json::from_str(&fs::read_to_string(&vocab_path)?)?;
        let mut entries = Vec::with_capacity(raw.len());
        for (key, token) in raw {
            let id: usize = key
                .parse()
                .map_err(|_| LmError::Decode(format!("invalid vocabulary id {:?}", key)))?;
            entries.push((id, token.into_bytes()?));
        }
        entries.sort_by_key(|(id, _)| *id);
        if entries.iter().enumerate().any(|(i, (id, _))| i != *id) {
            return Err(LmError::Decode(
                "vocabulary ids must be contiguous from 0".into(),
            ));
        }
        let vocab: Vec<Vec<u8>> = entries.into_iter().map(|(_, bytes)| bytes).collect();
        if vocab.len() < NUM_BYTE_TOKENS {
            return Err(LmError::Decode(format!(
                "vocabulary has {} entries, expected at least {}",
                vocab.len(),
                NUM_BYTE_TOKENS
            )));
        }

        let mut merges = Vec::new();
        for (line_no, line) in fs::read_to_string(&merges_path)?.lines().enumerate() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.is_empty() {
                continue;
            }
            let parsed: Vec<u32> = parts
                .iter()
                .map(|p| p.parse::<u32>())
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| {
                    LmError::Decode(format!("merges line {}: {}", line_no + 1, e))
                })?;
            if parsed.len() != 3 {
                return Err(LmError::Decode(format!(
                    "merges line {}: expected 3 ids, got {}",
                    line_no + 1,
                    parsed.len()
                )));
            }
            let (a, b, n) = (parsed[0], parsed[1], parsed[2]);
            if a >= n || b >= n || n as usize >= vocab.len() {
                return Err(LmError::Decode(format!(
                    "merges line {}: rule {} {} -> {} references an unknown or later id",
                    line_no + 1,
                    a,
                    b,
                    n
                )));
            }
            merges.push(((a, b), n));
        }

        let merge_lookup = merges.iter().copied().collect();
        info!(
            "Loaded tokenizer from {} ({} tokens, {} merges)",
            vocab_path.display(),
            vocab.len(),
            merges.len()
        );
        Ok(Self {
            vocab,
            merges,
            merge_lookup,
        })
    }
}

/// Statistics about a tokenizer's vocabulary
#[derive(Debug, Clone, PartialEq)]
pub struct TokenizerStats {
    /// Total vocabulary size (base tokens + learned merges)
    pub vocab_size: usize,
    /// Number of merge rules learned
    pub num_merges: usize,
    /// Number of base tokens (always 256 for byte-level BPE)
    pub base_tokens: usize,
}

/// A vocabulary entry as stored on disk
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum StoredToken {
    Hex(String),
    Bytes(Vec<u8>),
}

impl StoredToken {
    fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            StoredToken::Bytes(bytes) => Ok(bytes),
            StoredToken::Hex(hex) => from_hex(&hex),
        }
    }
}

fn artifact_paths(prefix: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let base = prefix.to_string_lossy();
    (
        format!("{}_vocab.json", base).into(),
        format!("{}_merges.txt", base).into(),
    )
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn from_hex(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return Err(LmError::Decode(format!("invalid hex token {:?}", hex)));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| LmError::Decode(format!("invalid hex token {:?}", hex)))
        })
        .collect()
}

/// Count adjacent pairs, recording each pair's first position
fn count_pairs(ids: &[u32]) -> PairStats {
    if ids.len() < 2 {
        return PairStats::new();
    }
    let chunk_size = 50_000.max(ids.len() / rayon::current_num_threads().max(1));

    ids.par_chunks(chunk_size)
        .enumerate()
        .fold(PairStats::new, |mut local, (chunk_idx, chunk)| {
            let start = chunk_idx * chunk_size;
            for (j, w) in chunk.windows(2).enumerate() {
                let entry = local.entry((w[0], w[1])).or_insert((0, start + j));
                entry.0 += 1;
            }
            // Pair spanning into the next chunk
            let end = start + chunk.len();
            if let (Some(&last), Some(&next)) = (chunk.last(), ids.get(end)) {
                let entry = local.entry((last, next)).or_insert((0, end - 1));
                entry.0 += 1;
            }
            local
        })
        .reduce(PairStats::new, |mut a, b| {
            for (pair, (count, pos)) in b {
                let entry = a.entry(pair).or_insert((0, pos));
                entry.0 += count;
                entry.1 = entry.1.min(pos);
            }
            a
        })
}

/// Replace non-overlapping occurrences of `pair`, scanning left to right
fn merge_pair(ids: &[u32], pair: (u32, u32), new_id: u32, out: &mut Vec<u32>) {
    out.clear();
    let mut i = 0;
    while i < ids.len() {
        if i + 1 < ids.len() && ids[i] == pair.0 && ids[i + 1] == pair.1 {
            out.push(new_id);
            i += 2;
        } else {
            out.push(ids[i]);
            i += 1;
        }
    }
}
