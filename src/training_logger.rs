//! Training Metrics Logger
//!
//! [`TrainingLogger`] writes one CSV row per optimizer step so a run can be
//! plotted or compared after the fact. Every row is flushed immediately, so
//! a crash loses at most the step in flight.
//!
//! ## CSV Format
//!
//! - `step`: Global optimizer step (1-based, counts resumed steps)
//! - `epoch`: Epoch the step belongs to (0-based)
//! - `elapsed_seconds`: Time since the logger was created
//! - `learning_rate`: Rate used for this step
//! - `loss`: Training loss (cross-entropy)
//! - `perplexity`: exp(loss)
//! - `grad_norm`: Global gradient norm before clipping
//!
//! ## Perplexity
//!
//! Perplexity measures how "surprised" the model is by the data:
//! ```text
//! perplexity = exp(loss)
//! ```
//!
//! A model guessing uniformly over a vocabulary of V tokens has perplexity
//! V. A perfect model has perplexity 1.

use crate::error::Result;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

/// Metrics for a single optimizer step
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepMetrics {
    pub step: usize,
    pub epoch: usize,
    pub learning_rate: f32,
    pub loss: f32,
    pub grad_norm: f32,
}

impl StepMetrics {
    pub fn perplexity(&self) -> f32 {
        self.loss.exp()
    }
}

/// CSV logger for per-step training metrics
pub struct TrainingLogger {
    log_file: File,
    start_time: Instant,
}

impl TrainingLogger {
    /// Create the CSV file and write the header
    pub fn new(log_path: impl AsRef<Path>) -> Result<Self> {
        let mut log_file = File::create(log_path)?;
        writeln!(
            log_file,
            "step,epoch,elapsed_seconds,learning_rate,loss,perplexity,grad_norm"
        )?;
        log_file.flush()?;

        Ok(Self {
            log_file,
            start_time: Instant::now(),
        })
    }

    /// Append one row
    pub fn log(&mut self, metrics: &StepMetrics) -> Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f32();
        writeln!(
            self.log_file,
            "{},{},{:.2},{:.6e},{:.6},{:.4},{:.6}",
            metrics.step,
            metrics.epoch,
            elapsed,
            metrics.learning_rate,
            metrics.loss,
            metrics.perplexity(),
            metrics.grad_norm
        )?;
        self.log_file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_and_rows_are_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        let mut logger = TrainingLogger::new(&path).unwrap();
        logger
            .log(&StepMetrics {
                step: 1,
                epoch: 0,
                learning_rate: 1e-3,
                loss: 0.0,
                grad_norm: 2.5,
            })
            .unwrap();

        // Logger still open: contents must already be on disk
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines[0],
            "step,epoch,elapsed_seconds,learning_rate,loss,perplexity,grad_norm"
        );
        let fields: Vec<&str> = lines[1].split(',').collect();
        assert_eq!(fields.len(), 7);
        assert_eq!(fields[0], "1");
        assert_eq!(fields[1], "0");
        assert_eq!(fields[5], "1.0000");
        assert_eq!(fields[6], "2.500000");
    }
}
