// src/checkpoint.rs

//! Checkpoint save/load for GPT models
//!
//! A checkpoint directory holds `meta.json` (step, loss, model config) and
//! `weights.bin`, one record per parameter in enumeration order:
//!
//! ```text
//! [u32 name_len][name bytes][u32 rank][u32 dim; rank][u32 len][f32; len]
//! ```
//!
//! All integers and floats are little-endian.

use anyhow::{bail, Context, Result};
use log::{info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::config::GptConfig;
use crate::gpt::GptModel;
use crate::layers::Module;

pub const META_FILE: &str = "meta.json";
pub const WEIGHTS_FILE: &str = "weights.bin";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub step: usize,
    pub loss: f32,
    pub config: GptConfig,
}

/// One named tensor as stored in a weights file.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightRecord {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Outcome of restoring weights into a model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub restored: Vec<String>,
    /// Present in the file but unknown to the model, or size-mismatched.
    pub skipped: Vec<String>,
    /// Model parameters with no record in the file.
    pub missing: Vec<String>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty() && self.missing.is_empty()
    }
}

/// Save model weights and metadata to a checkpoint directory
pub fn save_checkpoint(
    model: &GptModel,
    meta: &CheckpointMetadata,
    checkpoint_dir: impl AsRef<Path>,
) -> Result<()> {
    let dir = checkpoint_dir.as_ref();
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create checkpoint directory: {:?}", dir))?;

    let meta_path = dir.join(META_FILE);
    let meta_file = File::create(&meta_path)
        .with_context(|| format!("Failed to create metadata file: {:?}", meta_path))?;
    serde_json::to_writer_pretty(BufWriter::new(meta_file), meta)
        .context("Failed to serialize checkpoint metadata")?;

    save_weights(model, dir.join(WEIGHTS_FILE))?;

    info!("Checkpoint saved to {:?} (step {})", dir, meta.step);
    Ok(())
}

pub fn load_metadata(checkpoint_dir: impl AsRef<Path>) -> Result<CheckpointMetadata> {
    let meta_path = checkpoint_dir.as_ref().join(META_FILE);
    let meta_file = File::open(&meta_path)
        .with_context(|| format!("Failed to open metadata file: {:?}", meta_path))?;
    serde_json::from_reader(BufReader::new(meta_file))
        .with_context(|| format!("Failed to deserialize metadata: {:?}", meta_path))
}

/// Rebuilds a model from the stored config and restores its weights.
/// `rng` only seeds the initial values of parameters the file lacks.
pub fn load_checkpoint<R: Rng + ?Sized>(
    checkpoint_dir: impl AsRef<Path>,
    rng: &mut R,
) -> Result<(GptModel, CheckpointMetadata, LoadReport)> {
    let dir = checkpoint_dir.as_ref();
    let meta = load_metadata(dir)?;
    let mut model =
        GptModel::new(&meta.config, rng).context("Checkpoint holds an invalid model config")?;
    let report = load_weights(&mut model, dir.join(WEIGHTS_FILE))?;

    info!(
        "Checkpoint loaded from {:?} (step {}, loss {:.4})",
        dir, meta.step, meta.loss
    );
    Ok((model, meta, report))
}

// ─────────────────────────────────────────────────────────────────────────────
// Weights file
// ─────────────────────────────────────────────────────────────────────────────

fn write_u32<W: Write>(w: &mut W, v: usize) -> std::io::Result<()> {
    let v = u32::try_from(v).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "value exceeds u32")
    })?;
    w.write_all(&v.to_le_bytes())
}

fn write_record<W: Write>(w: &mut W, name: &str, shape: &[usize], data: &[f32]) -> Result<()> {
    let name_bytes = name.as_bytes();
    write_u32(w, name_bytes.len())?;
    w.write_all(name_bytes)?;
    write_u32(w, shape.len())?;
    for &d in shape {
        write_u32(w, d)?;
    }
    write_u32(w, data.len())?;
    for &x in data {
        w.write_all(&x.to_le_bytes())?;
    }
    Ok(())
}

/// Save only model weights (all parameters, enumeration order)
pub fn save_weights(model: &GptModel, weights_path: impl AsRef<Path>) -> Result<()> {
    let path = weights_path.as_ref();
    let file = File::create(path)
        .with_context(|| format!("Failed to create weights file: {:?}", path))?;
    let mut w = BufWriter::new(file);

    for p in model.parameters() {
        write_record(&mut w, &p.name, p.shape(), p.value.data())
            .with_context(|| format!("Failed to write {}", p.name))?;
    }
    w.flush()
        .with_context(|| format!("Failed to write weights file: {:?}", path))?;
    info!("Weights saved to {:?}", path);
    Ok(())
}

/// Write arbitrary records in the weights file layout
pub fn write_weight_records(
    weights_path: impl AsRef<Path>,
    records: &[WeightRecord],
) -> Result<()> {
    let path = weights_path.as_ref();
    let file = File::create(path)
        .with_context(|| format!("Failed to create weights file: {:?}", path))?;
    let mut w = BufWriter::new(file);
    for rec in records {
        write_record(&mut w, &rec.name, &rec.shape, &rec.data)
            .with_context(|| format!("Failed to write {}", rec.name))?;
    }
    w.flush()
        .with_context(|| format!("Failed to write weights file: {:?}", path))?;
    Ok(())
}

/// Reader that knows how many bytes the file still holds, so a corrupt
/// length field fails before anything is allocated for it.
struct BoundedReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> BoundedReader<R> {
    fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    fn bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        if n as u64 > self.remaining {
            bail!("needs {} bytes but only {} remain", n, self.remaining);
        }
        let mut buf = vec![0u8; n];
        self.inner.read_exact(&mut buf)?;
        self.remaining -= n as u64;
        Ok(buf)
    }

    fn u32(&mut self) -> Result<usize> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
    }
}

pub fn read_weight_records(weights_path: impl AsRef<Path>) -> Result<Vec<WeightRecord>> {
    let path = weights_path.as_ref();
    let file =
        File::open(path).with_context(|| format!("Failed to open weights file: {:?}", path))?;
    let remaining = file
        .metadata()
        .with_context(|| format!("Failed to stat weights file: {:?}", path))?
        .len();
    let mut r = BoundedReader {
        inner: BufReader::new(file),
        remaining,
    };
    let mut records = Vec::new();

    while !r.is_empty() {
        let idx = records.len();
        let name_len = r
            .u32()
            .with_context(|| format!("Truncated record {} in {:?}", idx, path))?;
        let name = r
            .bytes(name_len)
            .with_context(|| format!("Truncated name in record {}", idx))?;
        let name = String::from_utf8(name)
            .with_context(|| format!("Record {} has a non UTF-8 name", idx))?;

        let rank = r.u32().with_context(|| format!("Truncated shape for {}", name))?;
        let dims = r
            .bytes(rank.saturating_mul(4))
            .with_context(|| format!("Truncated shape for {}", name))?;
        let shape: Vec<usize> = dims
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
            .collect();
        let numel = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .with_context(|| format!("Shape {:?} of {} overflows", shape, name))?;

        let len = r.u32().with_context(|| format!("Truncated length for {}", name))?;
        if len != numel {
            bail!(
                "Record {} declares {} values but its shape {:?} holds {}",
                name,
                len,
                shape,
                numel
            );
        }
        let bytes = r
            .bytes(len.saturating_mul(4))
            .with_context(|| format!("Truncated data for {}", name))?;
        let data = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        records.push(WeightRecord { name, shape, data });
    }
    Ok(records)
}

/// Load weights into an existing model, by name
///
/// Unknown records and records whose shape differs from the parameter are
/// skipped with a warning.
pub fn load_weights(model: &mut GptModel, weights_path: impl AsRef<Path>) -> Result<LoadReport> {
    let path = weights_path.as_ref();
    let records = read_weight_records(path)?;
    let mut report = LoadReport::default();

    for rec in &records {
        let expected = model
            .parameters()
            .iter()
            .find(|p| p.name == rec.name)
            .map(|p| p.shape().to_vec());
        if let Some(expected) = expected {
            if expected != rec.shape {
                warn!(
                    "Skipping {}: stored shape {:?} but the model expects {:?}",
                    rec.name, rec.shape, expected
                );
                report.skipped.push(rec.name.clone());
                continue;
            }
        }
        match model.restore_parameter(&rec.name, &rec.data) {
            Ok(()) => report.restored.push(rec.name.clone()),
            Err(e) => {
                warn!("Skipping {}: {}", rec.name, e);
                report.skipped.push(rec.name.clone());
            }
        }
    }

    report.missing = model
        .parameters()
        .iter()
        .filter(|p| !records.iter().any(|r| r.name == p.name))
        .map(|p| p.name.clone())
        .collect();
    for name in &report.missing {
        warn!("No stored weights for {}", name);
    }

    info!(
        "Weights loaded from {:?}: {} restored, {} skipped, {} missing",
        path,
        report.restored.len(),
        report.skipped.len(),
        report.missing.len()
    );
    Ok(report)
}
