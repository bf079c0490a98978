//! Checkpoint Archives
//!
//! Model weights, optimizer moments and training progress are stored in a
//! single binary archive of named arrays.
//!
//! ## File Format
//!
//! ```text
//! b"TISSLM_CKPT"            magic
//! u8                        format version (1)
//! u32                       number of entries
//! per entry:
//!   u32 + bytes             name (UTF-8)
//!   u32 + u32 × ndim        shape
//!   u32 + f32 × len         data
//! ```
//!
//! All integers and floats are little-endian. Scalars are stored as
//! zero-dimensional arrays with one element. Step counters would lose
//! precision past 2^24 as a single `f32`, so each is stored as a `[4]` array
//! of 16-bit limbs, most significant first. Every limb is exact in `f32`.
//!
//! ## Keys
//!
//! | Key | Contents |
//! |---|---|
//! | `embeddings`, `transformer_blocks.0.mha.Wq`, ... | parameter values by name |
//! | `optimizer_m_{i}`, `optimizer_v_{i}` | AdamW moments, in parameter order |
//! | `num_params` | scalar |
//! | `optimizer_t`, `epoch`, `step` | 16-bit limb counters |
//!
//! Older archives name parameters positionally as `param_0 .. param_{K-1}`
//! and store counters as plain scalars. [`load_checkpoint`] and
//! [`load_weights`] accept both layouts.
//!
//! ## Robustness
//!
//! Loading never aborts on a single bad entry: a parameter missing from the
//! archive keeps its current value and a parameter with the wrong shape is
//! skipped, each with a warning. Saving writes to a temporary file and
//! renames it into place, so an interrupted save never leaves a truncated
//! checkpoint behind.

use crate::error::{LmError, Result};
use crate::model::TransformerModel;
use crate::optimizer::AdamW;
use crate::tensor::Tensor;
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 11] = b"TISSLM_CKPT";
const VERSION: u8 = 1;

/// Named arrays, the in-memory form of a checkpoint file
pub type Archive = BTreeMap<String, Tensor>;

/// Training progress restored from a checkpoint
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrainingProgress {
    pub epoch: usize,
    pub step: usize,
}

/// File name used for the checkpoint taken at `step`
pub fn checkpoint_file_name(step: usize) -> String {
    format!("checkpoint_step_{}.ckpt", step)
}

fn scalar(value: f32) -> Tensor {
    Tensor::new(vec![value], vec![])
}

fn read_scalar(archive: &Archive, key: &str) -> Option<f32> {
    archive.get(key).and_then(|t| t.data.first().copied())
}

fn counter(value: u64) -> Tensor {
    let limbs = (0..4)
        .rev()
        .map(|i| ((value >> (16 * i)) & 0xFFFF) as f32)
        .collect();
    Tensor::new(limbs, vec![4])
}

/// Limb counters, or a plain scalar from older archives
fn read_counter(archive: &Archive, key: &str) -> Option<u64> {
    let tensor = archive.get(key)?;
    match tensor.data.as_slice() {
        [value] => Some(*value as u64),
        limbs if tensor.shape == [4] => Some(
            limbs
                .iter()
                .fold(0u64, |acc, &limb| (acc << 16) | (limb as u64 & 0xFFFF)),
        ),
        _ => None,
    }
}

/// Write an archive atomically
pub fn write_archive(path: &Path, archive: &Archive) -> Result<()> {
    let tmp_path = PathBuf::from(format!("{}.tmp", path.display()));
    {
        let mut file = BufWriter::new(File::create(&tmp_path)?);
        file.write_all(MAGIC)?;
        file.write_all(&[VERSION])?;
        file.write_all(&(archive.len() as u32).to_le_bytes())?;

        for (name, tensor) in archive {
            let name_bytes = name.as_bytes();
            file.write_all(&(name_bytes.len() as u32).to_le_bytes())?;
            file.write_all(name_bytes)?;

            file.write_all(&(tensor.shape.len() as u32).to_le_bytes())?;
            for &dim in &tensor.shape {
                file.write_all(&(dim as u32).to_le_bytes())?;
            }
            file.write_all(&(tensor.data.len() as u32).to_le_bytes())?;
            for &val in &tensor.data {
                file.write_all(&val.to_le_bytes())?;
            }
        }
        file.flush()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Little-endian reader that reports truncation as a decode error
struct ArchiveReader<R: Read> {
    inner: R,
}

impl<R: Read> ArchiveReader<R> {
    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.inner.read_exact(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                LmError::Decode("checkpoint archive is truncated".into())
            } else {
                LmError::Io(e)
            }
        })?;
        Ok(buf)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_tensor(&mut self) -> Result<Tensor> {
        let ndim = self.read_u32()? as usize;
        let mut shape = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            shape.push(self.read_u32()? as usize);
        }
        let len = self.read_u32()? as usize;
        let expected: usize = shape.iter().product();
        if len != expected {
            return Err(LmError::Decode(format!(
                "array of shape {:?} declares {} values",
                shape, len
            )));
        }
        let bytes = self.read_bytes(len * 4)?;
        let data = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Tensor::new(data, shape))
    }
}

/// Read an archive written by [`write_archive`]
pub fn read_archive(path: &Path) -> Result<Archive> {
    let mut reader = ArchiveReader {
        inner: BufReader::new(File::open(path)?),
    };

    let magic = reader.read_bytes(MAGIC.len())?;
    if magic != MAGIC {
        return Err(LmError::Decode(format!(
            "{} is not a checkpoint archive",
            path.display()
        )));
    }
    let version = reader.read_bytes(1)?[0];
    if version != VERSION {
        return Err(LmError::Decode(format!(
            "unsupported checkpoint version {}",
            version
        )));
    }

    let count = reader.read_u32()? as usize;
    let mut archive = Archive::new();
    for _ in 0..count {
        let name_len = reader.read_u32()? as usize;
        let name = String::from_utf8(reader.read_bytes(name_len)?)
            .map_err(|_| LmError::Decode("entry name is not valid UTF-8".into()))?;
        let tensor = reader.read_tensor()?;
        archive.insert(name, tensor);
    }
    Ok(archive)
}

fn weights_archive(model: &TransformerModel) -> Archive {
    let params = model.parameters();
    let mut archive: Archive = params
        .iter()
        .map(|p| (p.name.clone(), p.value.clone()))
        .collect();
    archive.insert("num_params".into(), scalar(params.len() as f32));
    archive
}

/// Save model weights only
pub fn save_weights(model: &TransformerModel, path: &Path) -> Result<()> {
    write_archive(path, &weights_archive(model))?;
    info!("Saved model weights to {}", path.display());
    Ok(())
}

/// Save model, optimizer and progress to `dir/checkpoint_step_{step}.ckpt`
///
/// Returns the path written.
pub fn save_checkpoint(
    model: &TransformerModel,
    optimizer: &AdamW,
    progress: TrainingProgress,
    dir: &Path,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(checkpoint_file_name(progress.step));

    let mut archive = weights_archive(model);
    for (i, (m, v)) in optimizer.m.iter().zip(&optimizer.v).enumerate() {
        archive.insert(format!("optimizer_m_{}", i), m.clone());
        archive.insert(format!("optimizer_v_{}", i), v.clone());
    }
    archive.insert("optimizer_t".into(), counter(optimizer.t));
    archive.insert("epoch".into(), counter(progress.epoch as u64));
    archive.insert("step".into(), counter(progress.step as u64));

    write_archive(&path, &archive)?;
    info!("Saved checkpoint to {}", path.display());
    Ok(path)
}

/// Copy parameter values out of an archive
///
/// Positional `param_i` keys take precedence when present; `num_params`
/// bounds how many of them are read.
fn restore_parameters(model: &mut TransformerModel, archive: &Archive) -> usize {
    let is_legacy = archive.keys().any(|k| k.starts_with("param_"));
    let mut params = model.parameters_mut();
    let mut loaded = 0;

    if is_legacy {
        info!("Detected positional checkpoint layout; loading by parameter order");
        let declared = read_scalar(archive, "num_params").map(|n| n as usize);
        let available = archive.keys().filter(|k| k.starts_with("param_")).count();
        let count = declared.unwrap_or(available);
        if count != params.len() {
            warn!(
                "Parameter count mismatch: checkpoint has {}, model requires {}",
                count,
                params.len()
            );
        }

        for (i, param) in params.iter_mut().enumerate().take(count) {
            let key = format!("param_{}", i);
            match archive.get(&key) {
                Some(value) if value.shape == param.value.shape => {
                    param.value = value.clone();
                    loaded += 1;
                }
                Some(value) => warn!(
                    "Shape mismatch for {} (from {}): expected {:?}, got {:?}. Skipping.",
                    param.name, key, param.value.shape, value.shape
                ),
                None => warn!("{} missing from checkpoint; keeping current value", key),
            }
        }
    } else {
        for param in params.iter_mut() {
            match archive.get(&param.name) {
                Some(value) if value.shape == param.value.shape => {
                    param.value = value.clone();
                    loaded += 1;
                }
                Some(value) => warn!(
                    "Shape mismatch for {}: expected {:?}, got {:?}. Skipping.",
                    param.name, param.value.shape, value.shape
                ),
                None => warn!(
                    "Parameter {} not found in checkpoint; keeping random initialization",
                    param.name
                ),
            }
        }
    }

    if loaded == 0 {
        error!("No parameters could be restored from the checkpoint");
    } else {
        info!("Restored {}/{} parameters", loaded, params.len());
    }
    loaded
}

/// Load model weights
///
/// A missing file is logged and leaves the model untouched.
pub fn load_weights(model: &mut TransformerModel, path: &Path) -> Result<()> {
    if !path.exists() {
        warn!(
            "Model weights file not found at {}; using random initialization",
            path.display()
        );
        return Ok(());
    }
    let archive = read_archive(path)?;
    restore_parameters(model, &archive);
    Ok(())
}

/// Restore model, optimizer and progress from a checkpoint file
pub fn load_checkpoint(
    model: &mut TransformerModel,
    optimizer: &mut AdamW,
    path: &Path,
) -> Result<TrainingProgress> {
    let archive = read_archive(path)?;
    restore_parameters(model, &archive);

    let num_params = read_scalar(&archive, "num_params")
        .map(|n| n as usize)
        .unwrap_or(optimizer.m.len());
    for i in 0..num_params.min(optimizer.m.len()) {
        for (prefix, state) in [("optimizer_m", &mut optimizer.m), ("optimizer_v", &mut optimizer.v)] {
            let key = format!("{}_{}", prefix, i);
            match archive.get(&key) {
                Some(value) if value.shape == state[i].shape => state[i] = value.clone(),
                Some(value) => warn!(
                    "Shape mismatch for {}: expected {:?}, got {:?}. Skipping.",
                    key, state[i].shape, value.shape
                ),
                None => warn!("{} missing from checkpoint; keeping zeros", key),
            }
        }
    }
    if let Some(t) = read_counter(&archive, "optimizer_t") {
        optimizer.t = t;
    }

    let progress = TrainingProgress {
        epoch: read_counter(&archive, "epoch").unwrap_or(0) as usize,
        step: read_counter(&archive, "step").unwrap_or(0) as usize,
    };
    info!(
        "Loaded checkpoint from {}. Resuming from epoch {}, step {}.",
        path.display(),
        progress.epoch,
        progress.step
    );
    Ok(progress)
}

/// Checkpoint files in `dir`, oldest step first
pub fn list_checkpoints(dir: &Path) -> Result<Vec<(usize, PathBuf)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let step = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("checkpoint_step_"))
            .and_then(|n| n.strip_suffix(".ckpt"))
            .and_then(|n| n.parse::<usize>().ok());
        if let Some(step) = step {
            found.push((step, path));
        }
    }
    found.sort();
    Ok(found)
}

/// Most recent checkpoint in `dir`, if any
pub fn latest_checkpoint(dir: &Path) -> Result<Option<PathBuf>> {
    Ok(list_checkpoints(dir)?.pop().map(|(_, path)| path))
}

/// Delete all but the newest `keep` checkpoints; a negative `keep` keeps all
///
/// Returns the removed paths.
pub fn rotate_checkpoints(dir: &Path, keep: i64) -> Result<Vec<PathBuf>> {
    if keep < 0 {
        return Ok(Vec::new());
    }
    let found = list_checkpoints(dir)?;
    let excess = found.len().saturating_sub(keep as usize);
    let mut removed = Vec::with_capacity(excess);
    for (_, path) in found.into_iter().take(excess) {
        fs::remove_file(&path)?;
        info!("Removed old checkpoint {}", path.display());
        removed.push(path);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelConfig;

    fn model(seed: u64) -> TransformerModel {
        let config = ModelConfig {
            d_model: 8,
            n_layers: 1,
            num_heads: 2,
            d_ff: 8,
            vocab_size: 12,
            layer_norm_eps: 1e-6,
            positional_encoding_max_len: 8,
        };
        TransformerModel::new(&config, seed).unwrap()
    }

    #[test]
    fn test_archive_round_trip_preserves_scalars() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.ckpt");
        let mut archive = Archive::new();
        archive.insert("w".into(), Tensor::new(vec![1.5, -2.0, 0.25, 8.0], vec![2, 2]));
        archive.insert("step".into(), scalar(42.0));
        write_archive(&path, &archive).unwrap();

        let loaded = read_archive(&path).unwrap();
        assert_eq!(loaded, archive);
        assert_eq!(read_scalar(&loaded, "step"), Some(42.0));
        assert!(!dir.path().join("a.ckpt.tmp").exists());
    }

    #[test]
    fn test_rejects_foreign_and_truncated_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.ckpt");
        fs::write(&path, b"NOT_A_CHECKPOINT").unwrap();
        assert!(matches!(read_archive(&path), Err(LmError::Decode(_))));

        let mut archive = Archive::new();
        archive.insert("w".into(), Tensor::zeros(vec![4]));
        write_archive(&path, &archive).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        assert!(matches!(read_archive(&path), Err(LmError::Decode(_))));
    }

    #[test]
    fn test_weights_round_trip_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.ckpt");
        let source = model(1);
        source.save_weights(&path).unwrap();

        let mut target = model(2);
        target.load_weights(&path).unwrap();
        for (a, b) in source.parameters().iter().zip(target.parameters()) {
            assert_eq!(a.value, b.value, "{} differs", a.name);
        }
    }

    #[test]
    fn test_missing_weights_file_keeps_init() {
        let mut m = model(3);
        let before = m.embeddings.value.clone();
        m.load_weights("/nonexistent/weights.ckpt").unwrap();
        assert_eq!(m.embeddings.value, before);
    }

    #[test]
    fn test_positional_layout_and_shape_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.ckpt");
        let source = model(4);
        let params = source.parameters();

        let mut archive = Archive::new();
        for (i, p) in params.iter().enumerate() {
            archive.insert(format!("param_{}", i), p.value.clone());
        }
        // wrong shape for output_proj
        archive.insert("param_1".into(), Tensor::zeros(vec![3, 3]));
        archive.insert("num_params".into(), scalar(params.len() as f32));
        write_archive(&path, &archive).unwrap();

        let mut target = model(5);
        let original_proj = target.output_proj.weight.value.clone();
        target.load_weights(&path).unwrap();

        assert_eq!(target.embeddings.value, source.embeddings.value);
        assert_eq!(target.output_proj.weight.value, original_proj);
        assert_eq!(
            target.blocks[0].mha.wq.weight.value,
            source.blocks[0].mha.wq.weight.value
        );
    }

    #[test]
    fn test_checkpoint_restores_optimizer_and_progress() {
        let dir = tempfile::tempdir().unwrap();
        let source = model(6);
        let mut opt = AdamW::new(&source.parameters(), 1e-3, 0.01);
        opt.t = 17;
        opt.m[0].data[0] = 0.5;
        opt.v[3].data[1] = 0.25;

        let progress = TrainingProgress { epoch: 2, step: 17 };
        let path = save_checkpoint(&source, &opt, progress, dir.path()).unwrap();
        assert!(path.ends_with("checkpoint_step_17.ckpt"));

        let mut target = model(7);
        let mut restored = AdamW::new(&target.parameters(), 1e-3, 0.01);
        let got = load_checkpoint(&mut target, &mut restored, &path).unwrap();

        assert_eq!(got, progress);
        assert_eq!(restored.t, 17);
        assert_eq!(restored.m[0].data[0], 0.5);
        assert_eq!(restored.v[3].data[1], 0.25);
        assert_eq!(target.embeddings.value, source.embeddings.value);
    }

    #[test]
    fn test_counters_stay_exact_past_f32_precision() {
        let step = (1u64 << 40) + 3;
        assert_eq!((step as f32) as u64, 1u64 << 40);
        let mut archive = Archive::new();
        archive.insert("step".into(), counter(step));
        archive.insert("old".into(), scalar(1234.0));
        archive.insert("bad".into(), Tensor::zeros(vec![3]));
        assert_eq!(read_counter(&archive, "step"), Some(step));
        assert_eq!(read_counter(&archive, "old"), Some(1234));
        assert_eq!(read_counter(&archive, "bad"), None);

        let dir = tempfile::tempdir().unwrap();
        let source = model(9);
        let mut opt = AdamW::new(&source.parameters(), 1e-3, 0.0);
        opt.t = (1u64 << 33) + 1;
        let progress = TrainingProgress {
            epoch: 70_000,
            step: 16_777_217,
        };
        let path = save_checkpoint(&source, &opt, progress, dir.path()).unwrap();

        let mut target = model(9);
        let mut restored = AdamW::new(&target.parameters(), 1e-3, 0.0);
        assert_eq!(load_checkpoint(&mut target, &mut restored, &path).unwrap(), progress);
        assert_eq!(restored.t, (1u64 << 33) + 1);
    }

    #[test]
    fn test_load_checkpoint_missing_file_is_an_error() {
        let mut m = model(8);
        let mut opt = AdamW::new(&m.parameters(), 1e-3, 0.0);
        let err = load_checkpoint(&mut m, &mut opt, Path::new("/nonexistent/x.ckpt"));
        assert!(matches!(err, Err(LmError::Io(_))));
    }

    #[test]
    fn test_rotation_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let m = model(9);
        let opt = AdamW::new(&m.parameters(), 1e-3, 0.0);
        for step in [5, 10, 15, 20] {
            save_checkpoint(&m, &opt, TrainingProgress { epoch: 0, step }, dir.path()).unwrap();
        }

        assert!(rotate_checkpoints(dir.path(), -1).unwrap().is_empty());
        let removed = rotate_checkpoints(dir.path(), 2).unwrap();
        assert_eq!(removed.len(), 2);

        let left: Vec<usize> = list_checkpoints(dir.path())
            .unwrap()
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        assert_eq!(left, vec![15, 20]);
        assert_eq!(
            latest_checkpoint(dir.path()).unwrap(),
            Some(dir.path().join("checkpoint_step_20.ckpt"))
        );
    }
}
