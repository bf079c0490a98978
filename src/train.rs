//! Training Loop
//!
//! [`Trainer`] owns a model, its AdamW optimizer and a loss function, and
//! runs the standard next-token training loop over a [`Dataset`].
//!
//! ## One Step
//!
//! ```text
//! forward(x)            → logits [B, L, V]
//! loss.forward(y)       → scalar loss
//! loss.backward         → ∂L/∂logits
//! model.backward        → gradients accumulated into every Parameter
//! clip_gradients        → global norm bounded by max_grad_norm
//! optimizer.step        → AdamW update with decoupled weight decay
//! scheduler.step        → learning rate for the next step
//! zero_grad             → gradients cleared
//! ```
//!
//! ## Checkpoints and Resume
//!
//! With a `checkpoint_dir`, the trainer saves every `save_interval` steps,
//! once more at the end of training, and when stopped early. After each save
//! old checkpoints are rotated according to `keep_checkpoints`.
//!
//! `resume_from` restores weights, optimizer moments and the global step.
//! The step counts completed updates, so training picks up in the right
//! epoch at the first batch not yet seen.
//!
//! ## Cancellation
//!
//! [`Trainer::train`] takes a stop flag. It is checked between steps, never
//! in the middle of one. When it is set the trainer saves a checkpoint and
//! returns with `stopped_early` set.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::atomic::AtomicBool;
//! use tisslm::{BpeTokenizer, Dataset, ModelConfig, Trainer, TrainingConfig, TransformerModel};
//!
//! let text = std::fs::read_to_string("corpus.txt").unwrap();
//! let tokenizer = BpeTokenizer::train(&text, 512).unwrap();
//!
//! let config = TrainingConfig { batch_size: 4, seq_len: 32, ..TrainingConfig::default() };
//! let dataset = Dataset::from_text(&text, &tokenizer, config.batch_size, config.seq_len).unwrap();
//!
//! let model = TransformerModel::new(&ModelConfig::tiny(tokenizer.vocab_size()), config.seed).unwrap();
//! let mut trainer = Trainer::new(model, config).unwrap();
//! let summary = trainer.train(&dataset, &AtomicBool::new(false)).unwrap();
//! println!("final loss {:?}", summary.final_loss);
//! ```

use crate::checkpoint::{self, TrainingProgress};
use crate::data::Dataset;
use crate::error::{LmError, Result};
use crate::gradients::clip_gradients;
use crate::loss::CrossEntropyLoss;
use crate::model::{ModelConfig, TransformerModel};
use crate::optimizer::AdamW;
use crate::scheduler::CosineWarmupScheduler;
use crate::training_logger::{StepMetrics, TrainingLogger};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Training hyperparameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Peak learning rate reached after warmup
    pub learning_rate: f32,
    /// Floor of the cosine decay
    pub min_learning_rate: f32,
    pub batch_size: usize,
    pub seq_len: usize,
    pub num_epochs: usize,
    pub weight_decay: f32,
    pub warmup_steps: usize,
    /// 0 derives `num_epochs × batches per epoch`
    pub total_steps: usize,
    pub max_grad_norm: f32,
    /// Save every N steps; 0 saves only at the end
    pub save_interval: usize,
    /// Log metrics every N steps
    pub log_interval: usize,
    /// No checkpoints are written when unset
    pub checkpoint_dir: Option<PathBuf>,
    /// Newest checkpoints to keep; negative keeps all
    pub keep_checkpoints: i64,
    pub resume_from: Option<PathBuf>,
    /// Per-step CSV metrics; a file that can't be written is logged and
    /// skipped
    pub metrics_path: Option<PathBuf>,
    pub seed: u64,
    pub label_smoothing: f32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            min_learning_rate: 0.0,
            batch_size: 1,
            seq_len: 100,
            num_epochs: 5,
            weight_decay: 0.01,
            warmup_steps: 50,
            total_steps: 0,
            max_grad_norm: 1.0,
            save_interval: 0,
            log_interval: 10,
            checkpoint_dir: None,
            keep_checkpoints: -1,
            resume_from: None,
            metrics_path: None,
            seed: 42,
            label_smoothing: 0.0,
        }
    }
}

impl TrainingConfig {
    /// Load a JSON config; unspecified fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.seq_len == 0 || self.num_epochs == 0 {
            return Err(LmError::Configuration(
                "batch_size, seq_len and num_epochs must be positive".into(),
            ));
        }
        if !(self.learning_rate > 0.0) {
            return Err(LmError::Configuration(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.min_learning_rate < 0.0 || self.min_learning_rate > self.learning_rate {
            return Err(LmError::Configuration(format!(
                "min_learning_rate must be in [0, {}], got {}",
                self.learning_rate, self.min_learning_rate
            )));
        }
        if self.weight_decay < 0.0 {
            return Err(LmError::Configuration("weight_decay must be non-negative".into()));
        }
        if !(self.max_grad_norm > 0.0) {
            return Err(LmError::Configuration(format!(
                "max_grad_norm must be positive, got {}",
                self.max_grad_norm
            )));
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            return Err(LmError::Configuration(format!(
                "label_smoothing must be in [0, 1), got {}",
                self.label_smoothing
            )));
        }
        if self.keep_checkpoints == 0 {
            return Err(LmError::Configuration(
                "keep_checkpoints must be positive, or negative to keep all".into(),
            ));
        }
        Ok(())
    }
}

/// Outcome of [`Trainer::train`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrainingSummary {
    /// Global step reached, including resumed steps
    pub steps: usize,
    /// Steps run by this call
    pub steps_this_run: usize,
    pub final_loss: Option<f32>,
    pub stopped_early: bool,
    pub last_checkpoint: Option<PathBuf>,
}

pub struct Trainer {
    pub model: TransformerModel,
    pub optimizer: AdamW,
    pub config: TrainingConfig,
    loss_fn: CrossEntropyLoss,
    global_step: usize,
}

impl Trainer {
    pub fn new(model: TransformerModel, config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        let optimizer = AdamW::new(
            &model.parameters(),
            config.learning_rate,
            config.weight_decay,
        );
        let loss_fn = CrossEntropyLoss::with_label_smoothing(config.label_smoothing)?;
        Ok(Self {
            model,
            optimizer,
            config,
            loss_fn,
            global_step: 0,
        })
    }

    /// Build a fresh model from `model_config`, seeded with `config.seed`
    pub fn from_configs(model_config: &ModelConfig, config: TrainingConfig) -> Result<Self> {
        let model = TransformerModel::new(model_config, config.seed)?;
        Self::new(model, config)
    }

    /// Completed optimizer steps
    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Restore model, optimizer and step counter from a checkpoint
    pub fn resume(&mut self, path: &Path) -> Result<TrainingProgress> {
        let progress = checkpoint::load_checkpoint(&mut self.model, &mut self.optimizer, path)?;
        self.global_step = progress.step;
        Ok(progress)
    }

    /// One optimizer update on a single batch
    ///
    /// Uses the optimizer's current learning rate; the caller owns the
    /// schedule.
    pub fn train_step(&mut self, inputs: &[Vec<u32>], targets: &[Vec<u32>]) -> Result<(f32, f32)> {
        let (logits, cache) = self.model.forward(inputs, None, 0)?;
        let (loss, loss_cache) = self.loss_fn.forward(&logits, targets)?;
        let grad_logits = self.loss_fn.backward(&loss_cache);
        self.model.backward(&grad_logits, &cache)?;

        let mut params = self.model.parameters_mut();
        let grad_norm = clip_gradients(&mut params, self.config.max_grad_norm);
        self.optimizer.step(&mut params)?;
        self.optimizer.zero_grad(&mut params);

        Ok((loss, grad_norm))
    }

    /// Mean loss over every batch, without touching gradients
    pub fn evaluate(&self, dataset: &Dataset) -> Result<f32> {
        let mut total = 0.0;
        let mut count = 0;
        for (x, y) in dataset.iter() {
            let (logits, _) = self.model.forward(&x, None, 0)?;
            let (loss, _) = self.loss_fn.forward(&logits, &y)?;
            total += loss;
            count += 1;
        }
        Ok(total / count.max(1) as f32)
    }

    fn save(&self, epoch: usize) -> Result<Option<PathBuf>> {
        let dir = match &self.config.checkpoint_dir {
            Some(dir) => dir,
            None => return Ok(None),
        };
        let progress = TrainingProgress {
            epoch,
            step: self.global_step,
        };
        let path = checkpoint::save_checkpoint(&self.model, &self.optimizer, progress, dir)?;
        checkpoint::rotate_checkpoints(dir, self.config.keep_checkpoints)?;
        Ok(Some(path))
    }

    /// Train for `num_epochs` over `dataset`
    ///
    /// The dataset's batch shape must match the config.
    pub fn train(&mut self, dataset: &Dataset, stop: &AtomicBool) -> Result<TrainingSummary> {
        if dataset.batch_size() != self.config.batch_size || dataset.seq_len() != self.config.seq_len {
            return Err(LmError::Configuration(format!(
                "dataset batches are {}x{}, config expects {}x{}",
                dataset.batch_size(),
                dataset.seq_len(),
                self.config.batch_size,
                self.config.seq_len
            )));
        }

        if let Some(path) = self.config.resume_from.clone() {
            if path.exists() {
                self.resume(&path)?;
            } else {
                warn!(
                    "Checkpoint {} not found; starting from scratch",
                    path.display()
                );
            }
        }

        let batches_per_epoch = dataset.num_batches();
        let total_steps = if self.config.total_steps > 0 {
            self.config.total_steps
        } else {
            self.config.num_epochs * batches_per_epoch
        };
        let scheduler = CosineWarmupScheduler::new(
            self.config.warmup_steps,
            total_steps,
            self.config.learning_rate,
            self.config.min_learning_rate,
        );
        let mut metrics_log = match &self.config.metrics_path {
            Some(path) => match TrainingLogger::new(path) {
                Ok(logger) => Some(logger),
                Err(e) => {
                    warn!(
                        "Could not open metrics log {}: {}. Training without it.",
                        path.display(),
                        e
                    );
                    None
                }
            },
            None => None,
        };

        let start_step = self.global_step;
        let start_epoch = start_step / batches_per_epoch;
        info!(
            "Training {} parameters: {} batches of {}x{} per epoch, {} total steps",
            self.model.num_parameters(),
            batches_per_epoch,
            self.config.batch_size,
            self.config.seq_len,
            total_steps
        );
        if start_step > 0 {
            info!("Resuming at epoch {}, step {}", start_epoch + 1, start_step);
        }

        let mut summary = TrainingSummary::default();
        let mut lr = scheduler.step(self.global_step, &mut self.optimizer);

        'epochs: for epoch in start_epoch..self.config.num_epochs {
            info!("--- Epoch {}/{} ---", epoch + 1, self.config.num_epochs);
            let skip = if epoch == start_epoch {
                start_step % batches_per_epoch
            } else {
                0
            };

            for (x, y) in dataset.iter().skip(skip) {
                if stop.load(Ordering::Relaxed) {
                    info!("Stop requested at step {}", self.global_step);
                    summary.stopped_early = true;
                    summary.last_checkpoint = self.save(epoch)?;
                    break 'epochs;
                }

                let (loss, grad_norm) = self.train_step(&x, &y)?;
                self.global_step += 1;
                summary.steps_this_run += 1;
                summary.final_loss = Some(loss);

                let metrics = StepMetrics {
                    step: self.global_step,
                    epoch,
                    learning_rate: lr,
                    loss,
                    grad_norm,
                };
                if let Some(logger) = metrics_log.as_mut() {
                    if let Err(e) = logger.log(&metrics) {
                        warn!("Metrics log write failed at step {}: {}", self.global_step, e);
                    }
                }
                if self.config.log_interval > 0 && self.global_step % self.config.log_interval == 0 {
                    info!(
                        "Step {}, Loss: {:.4}, Perplexity: {:.2}, LR: {:.6}, Grad Norm: {:.4}",
                        self.global_step,
                        loss,
                        metrics.perplexity(),
                        lr,
                        grad_norm
                    );
                }

                lr = scheduler.step(self.global_step, &mut self.optimizer);

                if self.config.save_interval > 0 && self.global_step % self.config.save_interval == 0 {
                    match self.save(epoch) {
                        Ok(path) => summary.last_checkpoint = path,
                        Err(e) => warn!("Periodic checkpoint at step {} failed: {}", self.global_step, e),
                    }
                }
            }
        }

        if !summary.stopped_early {
            info!("Training complete after {} steps", self.global_step);
            let last_epoch = self.config.num_epochs.saturating_sub(1);
            if let Some(path) = self.save(last_epoch)? {
                summary.last_checkpoint = Some(path);
            }
        }
        summary.steps = self.global_step;
        Ok(summary)
    }
}
