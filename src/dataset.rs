//! Random next-token windows over a token stream.

use log::trace;
use rand::Rng;

use crate::error::{Result, TensorError};
use crate::tensor::TokenIds;

#[derive(Debug, Clone)]
pub struct TextDataset {
    tokens: Vec<usize>,
    block_size: usize,
}

impl TextDataset {
    /// Needs at least `block_size + 1` tokens so one shifted window fits.
    pub fn new(tokens: Vec<usize>, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(TensorError::InvalidConfig(
                "block_size must be positive".into(),
            ));
        }
        if tokens.len() <= block_size {
            return Err(TensorError::DataTooShort {
                tokens: tokens.len(),
                block_size,
            });
        }
        Ok(Self { tokens, block_size })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn tokens(&self) -> &[usize] {
        &self.tokens
    }

    /// `batch` windows at uniform offsets in `[0, len - block_size - 1]`.
    /// Returns inputs `[batch, block_size]` and the flat targets, which are
    /// the inputs shifted left by one token.
    pub fn get_batch<R: Rng + ?Sized>(&self, batch: usize, rng: &mut R) -> (TokenIds, Vec<usize>) {
        let t = self.block_size;
        let max_offset = self.tokens.len() - t - 1;
        let mut x = Vec::with_capacity(batch * t);
        let mut y = Vec::with_capacity(batch * t);
        for _ in 0..batch {
            let offset = rng.random_range(0..=max_offset);
            trace!("batch window at offset {}", offset);
            x.extend_from_slice(&self.tokens[offset..offset + t]);
            y.extend_from_slice(&self.tokens[offset + 1..offset + t + 1]);
        }
        let x = TokenIds::new(x, batch, t).unwrap_or_else(|e| panic!("get_batch: {e}"));
        (x, y)
    }
}
