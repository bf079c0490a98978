//! Autoregressive Generation
//!
//! [`Generator`] extends a prompt one token at a time. Each step takes the
//! logits at the last position, optionally penalizes tokens already seen,
//! and picks the next id with a [`SamplingMethod`].
//!
//! ## KV Cache
//!
//! The cached path forwards the prompt once, which fills a per-layer
//! [`KvCache`], then forwards only the newest token at
//! `start_pos = prompt_len + i`. Each step costs one position instead of the
//! whole sequence.
//!
//! The uncached path re-forwards `prompt ⧺ generated` from position 0 every
//! step. It is kept as a reference: both paths pick the same tokens for
//! greedy decoding and for any seeded sampler.
//!
//! ## Sampling
//!
//! | Method | Rule |
//! |---|---|
//! | greedy | `argmax ℓ` |
//! | random | draw from `softmax(ℓ / T)` |
//! | top-k | keep the `k` most likely ids, renormalize, draw |
//! | nucleus | keep the shortest prefix of ids (by probability) whose mass reaches `p`, renormalize, draw |
//! | beam | keep the `width` continuations with the highest summed log-probability |
//!
//! Draws use a `ChaCha8Rng` built per call from the caller's seed, or from
//! entropy when no seed is given.
//!
//! ## Beam Search
//!
//! Every step expands each live beam by its `width` most likely next ids,
//! scores each candidate as `score + log softmax(ℓ)[id]`, and keeps the best
//! `width` candidates overall. Ties keep expansion order, so a width of one
//! follows greedy decoding exactly. Beams re-forward their whole context
//! each step and ignore `use_cache`.
//!
//! ## End of Sequence
//!
//! With an `eos_id` set, generation stops as soon as that id is chosen. The
//! end id itself is not returned. A beam that emits it stops growing and
//! competes with its final score.

use crate::error::{LmError, Result};
use crate::layers::activation::softmax;
use crate::layers::attention::KvCache;
use crate::model::TransformerModel;
use crate::tensor::Tensor;
use crate::tokenizer::BpeTokenizer;
use log::debug;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// How the next token is chosen from a logits vector
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SamplingMethod {
    Greedy,
    Random { temperature: f32 },
    TopK { temperature: f32, k: usize },
    Nucleus { temperature: f32, top_p: f32 },
    Beam { width: usize },
}

const DEFAULT_BEAM_WIDTH: usize = 3;

impl SamplingMethod {
    /// Build a method from its name
    ///
    /// Accepted names are `greedy`, `random` (alias `sampling`), `top_k`,
    /// `nucleus` (alias `top_p`) and `beam` (width 3). Fails with a configuration error for an
    /// unknown name or a missing parameter the method needs.
    pub fn from_name(
        name: &str,
        temperature: f32,
        top_k: Option<usize>,
        top_p: Option<f32>,
    ) -> Result<Self> {
        let method = match name {
            "greedy" => SamplingMethod::Greedy,
            "random" | "sampling" => SamplingMethod::Random { temperature },
            "top_k" => SamplingMethod::TopK {
                temperature,
                k: top_k.ok_or_else(|| {
                    LmError::Configuration("top_k must be specified for top_k sampling".into())
                })?,
            },
            "nucleus" | "top_p" => SamplingMethod::Nucleus {
                temperature,
                top_p: top_p.ok_or_else(|| {
                    LmError::Configuration("top_p must be specified for nucleus sampling".into())
                })?,
            },
            "beam" => SamplingMethod::Beam {
                width: DEFAULT_BEAM_WIDTH,
            },
            other => {
                return Err(LmError::Configuration(format!(
                    "unknown sampling method: {}",
                    other
                )))
            }
        };
        method.validate()?;
        Ok(method)
    }

    pub fn validate(&self) -> Result<()> {
        let temperature = match *self {
            SamplingMethod::Greedy => return Ok(()),
            SamplingMethod::Beam { width } => {
                if width == 0 {
                    return Err(LmError::Configuration("beam width must be at least 1".into()));
                }
                return Ok(());
            }
            SamplingMethod::Random { temperature } => temperature,
            SamplingMethod::TopK { temperature, k } => {
                if k == 0 {
                    return Err(LmError::Configuration("top_k must be at least 1".into()));
                }
                temperature
            }
            SamplingMethod::Nucleus { temperature, top_p } => {
                if !(top_p > 0.0 && top_p <= 1.0) {
                    return Err(LmError::Configuration(format!(
                        "top_p must be in (0, 1], got {}",
                        top_p
                    )));
                }
                temperature
            }
        };
        if !(temperature > 0.0) {
            return Err(LmError::Configuration(format!(
                "temperature must be positive, got {}",
                temperature
            )));
        }
        Ok(())
    }

    /// Pick a token id from one logits vector
    ///
    /// A single step of beam search has no lookahead, so `Beam` picks the
    /// argmax here. [`Generator`] runs the full search.
    pub fn sample<R: Rng + ?Sized>(&self, logits: &[f32], rng: &mut R) -> Result<u32> {
        if logits.is_empty() {
            return Err(LmError::Shape("cannot sample from empty logits".into()));
        }
        self.validate()?;

        let temperature = match *self {
            SamplingMethod::Greedy | SamplingMethod::Beam { .. } => {
                return Ok(argmax(logits) as u32)
            }
            SamplingMethod::Random { temperature }
            | SamplingMethod::TopK { temperature, .. }
            | SamplingMethod::Nucleus { temperature, .. } => temperature,
        };
        let mut probs = softmax(&Tensor::new(logits.to_vec(), vec![logits.len()]), temperature)?.data;

        match *self {
            SamplingMethod::TopK { k, .. } => keep_top_k(&mut probs, k),
            SamplingMethod::Nucleus { top_p, .. } => keep_nucleus(&mut probs, top_p),
            _ => {}
        }

        let coin: f32 = rng.gen();
        Ok(sample_mult(&probs, coin) as u32)
    }
}

/// Index of the largest value; ties go to the lowest index
fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Ids ordered by descending probability, ties by ascending id
fn ranked(probs: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]).then(a.cmp(&b)));
    order
}

fn keep_top_k(probs: &mut [f32], k: usize) {
    for &i in ranked(probs).iter().skip(k) {
        probs[i] = 0.0;
    }
}

fn keep_nucleus(probs: &mut [f32], top_p: f32) {
    let mut cumulative = 0.0;
    let mut reached = false;
    for i in ranked(probs) {
        if reached {
            probs[i] = 0.0;
        } else {
            cumulative += probs[i];
            reached = cumulative >= top_p;
        }
    }
}

fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = logits.iter().map(|&l| (l - max).exp()).sum::<f32>().ln();
    logits.iter().map(|&l| l - max - log_sum).collect()
}

/// Draw from an unnormalized distribution with a uniform `coin` in `[0, 1)`
fn sample_mult(probs: &[f32], coin: f32) -> usize {
    let total: f32 = probs.iter().sum();
    let target = coin * total;
    let mut cdf = 0.0;
    let mut last_nonzero = 0;
    for (i, &p) in probs.iter().enumerate() {
        if p > 0.0 {
            cdf += p;
            last_nonzero = i;
            if target < cdf {
                return i;
            }
        }
    }
    last_nonzero
}

/// Divide positive logits by `penalty` and multiply the rest, for every id
/// in `seen`
pub fn apply_repetition_penalty(logits: &mut [f32], seen: &HashSet<u32>, penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    for &id in seen {
        if let Some(l) = logits.get_mut(id as usize) {
            *l = if *l > 0.0 { *l / penalty } else { *l * penalty };
        }
    }
}

/// Generation settings as they appear in a JSON config
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// `greedy`, `random`, `sampling`, `top_k`, `nucleus` or `beam`
    pub method: String,
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub beam_width: usize,
    pub repetition_penalty: f32,
    /// Stop as soon as this id is generated
    pub eos_id: Option<u32>,
    pub seed: Option<u64>,
    pub use_cache: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            method: "greedy".into(),
            temperature: 1.0,
            top_k: 10,
            top_p: 0.9,
            beam_width: DEFAULT_BEAM_WIDTH,
            repetition_penalty: 1.0,
            eos_id: None,
            seed: None,
            use_cache: true,
        }
    }
}

impl GenerationConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.sampling_method()?;
        if !(self.repetition_penalty > 0.0) {
            return Err(LmError::Configuration(format!(
                "repetition_penalty must be positive, got {}",
                self.repetition_penalty
            )));
        }
        Ok(())
    }

    pub fn sampling_method(&self) -> Result<SamplingMethod> {
        if self.method == "beam" {
            let method = SamplingMethod::Beam {
                width: self.beam_width,
            };
            method.validate()?;
            return Ok(method);
        }
        SamplingMethod::from_name(
            &self.method,
            self.temperature,
            Some(self.top_k),
            Some(self.top_p),
        )
    }
}

/// Token generator over a borrowed model
pub struct Generator<'a> {
    model: &'a TransformerModel,
    repetition_penalty: f32,
    eos_id: Option<u32>,
}

#[derive(Clone, Debug)]
struct Beam {
    tokens: Vec<u32>,
    score: f32,
    finished: bool,
}

impl<'a> Generator<'a> {
    pub fn new(model: &'a TransformerModel) -> Self {
        Self {
            model,
            repetition_penalty: 1.0,
            eos_id: None,
        }
    }

    /// Stop generating when `eos_id` is chosen
    pub fn with_eos_id(mut self, eos_id: u32) -> Self {
        self.eos_id = Some(eos_id);
        self
    }

    /// `penalty` must be positive; 1.0 disables it
    pub fn with_repetition_penalty(mut self, penalty: f32) -> Result<Self> {
        if !(penalty > 0.0) {
            return Err(LmError::Configuration(format!(
                "repetition_penalty must be positive, got {}",
                penalty
            )));
        }
        self.repetition_penalty = penalty;
        Ok(self)
    }

    /// Generate `n_new_tokens` ids after `prompt`
    ///
    /// Returns only the new ids, fewer than `n_new_tokens` if the end id
    /// came up first. Positions past the model's
    /// `positional_encoding_max_len` fail with a bounds error.
    pub fn generate(
        &self,
        prompt: &[u32],
        n_new_tokens: usize,
        method: SamplingMethod,
        seed: Option<u64>,
        use_cache: bool,
    ) -> Result<Vec<u32>> {
        if prompt.is_empty() {
            return Err(LmError::Shape("prompt must contain at least one token".into()));
        }
        method.validate()?;
        if n_new_tokens == 0 {
            return Ok(Vec::new());
        }

        if let SamplingMethod::Beam { width } = method {
            return self.beam_search(prompt, n_new_tokens, width);
        }
        let mut rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        if use_cache {
            self.generate_cached(prompt, n_new_tokens, method, &mut rng)
        } else {
            self.generate_uncached(prompt, n_new_tokens, method, &mut rng)
        }
    }

    /// Generate with every option taken from `config`
    pub fn generate_with_config(
        &self,
        prompt: &[u32],
        n_new_tokens: usize,
        config: &GenerationConfig,
    ) -> Result<Vec<u32>> {
        config.validate()?;
        let mut generator =
            Generator::new(self.model).with_repetition_penalty(config.repetition_penalty)?;
        generator.eos_id = config.eos_id.or(self.eos_id);
        generator.generate(
            prompt,
            n_new_tokens,
            config.sampling_method()?,
            config.seed,
            config.use_cache,
        )
    }

    /// Encode `prompt`, generate, and detokenize the new ids
    pub fn generate_text(
        &self,
        tokenizer: &BpeTokenizer,
        prompt: &str,
        n_new_tokens: usize,
        method: SamplingMethod,
        seed: Option<u64>,
    ) -> Result<String> {
        let ids = tokenizer.encode(prompt);
        let generated = self.generate(&ids, n_new_tokens, method, seed, true)?;
        Ok(tokenizer.detokenize(&generated))
    }

    fn pick(
        &self,
        logits: &Tensor,
        seen: &HashSet<u32>,
        method: SamplingMethod,
        rng: &mut ChaCha8Rng,
    ) -> Result<u32> {
        let vocab = logits.last_dim();
        let start = logits.len() - vocab;
        let mut last = logits.data[start..].to_vec();
        apply_repetition_penalty(&mut last, seen, self.repetition_penalty);
        method.sample(&last, rng)
    }

    fn generate_cached(
        &self,
        prompt: &[u32],
        n_new_tokens: usize,
        method: SamplingMethod,
        rng: &mut ChaCha8Rng,
    ) -> Result<Vec<u32>> {
        let mut caches = self.model.new_kv_cache();
        let mut seen: HashSet<u32> = prompt.iter().copied().collect();
        let mut generated = Vec::with_capacity(n_new_tokens);

        let (mut logits, _) = self.model.forward(&[prompt.to_vec()], Some(&mut caches[..]), 0)?;
        for i in 0..n_new_tokens {
            let next = self.pick(&logits, &seen, method, rng)?;
            if self.eos_id == Some(next) {
                debug!("end of sequence after {} tokens", i);
                break;
            }
            generated.push(next);
            seen.insert(next);

            if i + 1 < n_new_tokens {
                let start_pos = prompt.len() + i;
                logits = self.model.forward(&[vec![next]], Some(&mut caches[..]), start_pos)?.0;
                debug!("step {} (pos {}): token {}", i, start_pos, next);
            }
        }
        Ok(generated)
    }

    fn generate_uncached(
        &self,
        prompt: &[u32],
        n_new_tokens: usize,
        method: SamplingMethod,
        rng: &mut ChaCha8Rng,
    ) -> Result<Vec<u32>> {
        let mut tokens = prompt.to_vec();
        let mut seen: HashSet<u32> = prompt.iter().copied().collect();
        let mut generated = Vec::with_capacity(n_new_tokens);

        for i in 0..n_new_tokens {
            let (logits, _) = self.model.forward(&[tokens.clone()], None, 0)?;
            let next = self.pick(&logits, &seen, method, rng)?;
            if self.eos_id == Some(next) {
                debug!("end of sequence after {} tokens", i);
                break;
            }
            debug!("step {} (uncached, len {}): token {}", i, tokens.len(), next);
            tokens.push(next);
            generated.push(next);
            seen.insert(next);
        }
        Ok(generated)
    }

    fn beam_search(&self, prompt: &[u32], n_new_tokens: usize, width: usize) -> Result<Vec<u32>> {
        let mut beams = vec![Beam {
            tokens: Vec::new(),
            score: 0.0,
            finished: false,
        }];

        for step in 0..n_new_tokens {
            if beams.iter().all(|b| b.finished) {
                break;
            }
            let mut candidates = Vec::with_capacity(beams.len() * width);
            for beam in &beams {
                if beam.finished {
                    candidates.push(beam.clone());
                    continue;
                }
                let context: Vec<u32> = prompt.iter().chain(&beam.tokens).copied().collect();
                let seen: HashSet<u32> = context.iter().copied().collect();
                let (logits, _) = self.model.forward(&[context], None, 0)?;

                let vocab = logits.last_dim();
                let mut last = logits.data[logits.len() - vocab..].to_vec();
                apply_repetition_penalty(&mut last, &seen, self.repetition_penalty);
                let log_probs = log_softmax(&last);

                for id in ranked(&last).into_iter().take(width) {
                    let mut tokens = beam.tokens.clone();
                    tokens.push(id as u32);
                    candidates.push(Beam {
                        tokens,
                        score: beam.score + log_probs[id],
                        finished: self.eos_id == Some(id as u32),
                    });
                }
            }

            candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
            candidates.truncate(width);
            beams = candidates;
            if let Some(best) = beams.first() {
                debug!("beam step {}: best score {:.4}", step, best.score);
            }
        }

        let mut best = beams.into_iter().next().map(|b| (b.tokens, b.finished));
        if let Some((tokens, true)) = best.as_mut() {
            tokens.pop();
        }
        Ok(best.map(|(tokens, _)| tokens).unwrap_or_default())
    }
}
