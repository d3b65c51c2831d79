//! Autoregressive generation over a [`GptModel`].
//!
//! There is no KV cache: every step re-runs the forward pass over the last
//! `block_size` ids and samples from the final position's logits.

use log::{debug, info};
use rand::Rng;

use crate::gpt::GptModel;
use crate::sampling::{self, SamplingPolicy};
use crate::tensor::{Tensor, TokenIds};

pub struct Engine {
    model: GptModel,
}

impl Engine {
    /// Puts the model in eval mode.
    pub fn new(mut model: GptModel) -> Self {
        model.eval();
        info!(
            "Engine: new with {} layers, block_size={}",
            model.num_layers(),
            model.config().block_size
        );
        Self { model }
    }

    pub fn model(&self) -> &GptModel {
        &self.model
    }

    pub fn into_model(self) -> GptModel {
        self.model
    }

    pub fn block_size(&self) -> usize {
        self.model.config().block_size
    }

    /// Last `block_size` ids of `ids`.
    pub fn crop_context<'a>(&self, ids: &'a [usize]) -> &'a [usize] {
        &ids[ids.len().saturating_sub(self.block_size())..]
    }

    /// Full forward over a batch that already fits the context window.
    pub fn prefill<R: Rng + ?Sized>(&mut self, ids: &TokenIds, rng: &mut R) -> Tensor {
        info!("Engine: prefill forward [B={},T={}]", ids.batch(), ids.time());
        let logits = self.model.forward(ids, rng);
        debug!("Engine: prefill logits shape {:?}", logits.shape());
        logits
    }

    /// `[B, V]` logits for the next position of each row.
    pub fn next_logits<R: Rng + ?Sized>(&mut self, ids: &TokenIds, rng: &mut R) -> Tensor {
        let logits = self.model.forward(ids, rng);
        sampling::extract_last_logits(&logits)
    }

    pub fn decode_next_with_policy<R: Rng + ?Sized>(
        &mut self,
        ids: &[usize],
        policy: SamplingPolicy,
        rng: &mut R,
    ) -> usize {
        assert!(!ids.is_empty(), "prompt must be non-empty");
        let ctx = TokenIds::from_sequence(self.crop_context(ids));
        let last = self.next_logits(&ctx, rng);
        sampling::sample_with_policy(&last, policy, rng)[0]
    }

    /// Prompt followed by `max_new_tokens` sampled ids.
    pub fn generate<R: Rng + ?Sized>(
        &mut self,
        prompt: &[usize],
        max_new_tokens: usize,
        policy: SamplingPolicy,
        rng: &mut R,
    ) -> Vec<usize> {
        let mut ids = prompt.to_vec();
        ids.extend(self.stream(prompt, max_new_tokens, policy, rng));
        ids
    }

    /// Multi-sample generation (batch = num_samples), one forward per step.
    pub fn generate_multi<R: Rng + ?Sized>(
        &mut self,
        prompt: &[usize],
        num_samples: usize,
        max_new_tokens: usize,
        policy: SamplingPolicy,
        rng: &mut R,
    ) -> Vec<Vec<usize>> {
        assert!(num_samples > 0, "num_samples must be > 0");
        assert!(!prompt.is_empty(), "prompt must be non-empty");

        let mut rows: Vec<Vec<usize>> = vec![prompt.to_vec(); num_samples];
        for _ in 0..max_new_tokens {
            let t = rows[0].len().min(self.block_size());
            let flat: Vec<usize> = rows
                .iter()
                .flat_map(|r| r[r.len() - t..].iter().copied())
                .collect();
            let ctx = TokenIds::new(flat, num_samples, t)
                .unwrap_or_else(|e| panic!("generate_multi: {e}"));
            let last = self.next_logits(&ctx, rng);
            let next = sampling::sample_with_policy(&last, policy, rng);
            for (row, id) in rows.iter_mut().zip(next) {
                row.push(id);
            }
        }
        rows
    }

    pub fn stream<'a, R: Rng + ?Sized>(
        &'a mut self,
        prompt: &[usize],
        max_new_tokens: usize,
        policy: SamplingPolicy,
        rng: &'a mut R,
    ) -> Streamer<'a, R> {
        assert!(!prompt.is_empty(), "prompt must be non-empty");
        info!(
            "Engine: streaming start [T0={}] max_new_tokens={} policy={:?}",
            prompt.len(),
            max_new_tokens,
            policy
        );
        Streamer {
            engine: self,
            rng,
            ids: prompt.to_vec(),
            policy,
            steps_left: max_new_tokens,
        }
    }
}

/// Streaming iterator that yields one token id each step.
pub struct Streamer<'a, R: Rng + ?Sized> {
    engine: &'a mut Engine,
    rng: &'a mut R,
    ids: Vec<usize>,
    policy: SamplingPolicy,
    steps_left: usize,
}

impl<R: Rng + ?Sized> Streamer<'_, R> {
    /// Prompt plus everything emitted so far.
    pub fn ids(&self) -> &[usize] {
        &self.ids
    }
}

impl<R: Rng + ?Sized> Iterator for Streamer<'_, R> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        if self.steps_left == 0 {
            return None;
        }
        let next = self
            .engine
            .decode_next_with_policy(&self.ids, self.policy, self.rng);
        self.ids.push(next);
        self.steps_left -= 1;
        debug!(
            "Streamer: emitted {}, steps_left={}",
            next, self.steps_left
        );
        Some(next)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.steps_left, Some(self.steps_left))
    }
}

impl<R: Rng + ?Sized> ExactSizeIterator for Streamer<'_, R> {}
