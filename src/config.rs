//! Model and training configuration.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TensorError};

/// Architecture hyper-parameters. Stored in checkpoint metadata, so a model
/// can be rebuilt from disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GptConfig {
    pub vocab_size: usize,
    /// Maximum context length.
    pub block_size: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
    pub dropout: f32,
}

impl Default for GptConfig {
    /// GPT-2 small.
    fn default() -> Self {
        Self {
            vocab_size: 50257,
            block_size: 1024,
            n_layer: 12,
            n_head: 12,
            n_embd: 768,
            dropout: 0.1,
        }
    }
}

impl GptConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(TensorError::InvalidConfig(msg));
        if self.vocab_size == 0 || self.block_size == 0 {
            return invalid(format!(
                "vocab_size ({}) and block_size ({}) must be positive",
                self.vocab_size, self.block_size
            ));
        }
        if self.n_layer == 0 || self.n_head == 0 || self.n_embd == 0 {
            return invalid(format!(
                "n_layer ({}), n_head ({}) and n_embd ({}) must be positive",
                self.n_layer, self.n_head, self.n_embd
            ));
        }
        if self.n_embd % self.n_head != 0 {
            return invalid(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return invalid(format!("dropout must be in [0, 1), got {}", self.dropout));
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }
}

/// Knobs for the training driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub steps: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub min_learning_rate: f32,
    pub warmup_steps: usize,
    pub weight_decay: f32,
    /// Global gradient-norm ceiling; `0` disables clipping.
    pub max_grad_norm: f32,
    /// Save every N steps when `out_dir` is set; `0` saves only at the end.
    pub checkpoint_interval: usize,
    pub seed: u64,
    pub out_dir: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            steps: 1000,
            batch_size: 8,
            learning_rate: 3e-4,
            min_learning_rate: 3e-5,
            warmup_steps: 100,
            weight_decay: 0.01,
            max_grad_norm: 1.0,
            checkpoint_interval: 0,
            seed: 42,
            out_dir: None,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TensorError::InvalidConfig(
                "batch_size must be positive".into(),
            ));
        }
        if !(self.learning_rate > 0.0) || self.min_learning_rate < 0.0 {
            return Err(TensorError::InvalidConfig(format!(
                "learning rates must satisfy lr > 0 and min_lr >= 0, got {} / {}",
                self.learning_rate, self.min_learning_rate
            )));
        }
        if self.max_grad_norm < 0.0 {
            return Err(TensorError::InvalidConfig(format!(
                "max_grad_norm must be >= 0, got {}",
                self.max_grad_norm
            )));
        }
        Ok(())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open train config: {:?}", path))?;
        let cfg: TrainConfig = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse train config: {:?}", path))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
