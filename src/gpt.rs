//! The GPT model: embeddings, a stack of pre-norm blocks, a final LayerNorm
//! and the vocabulary projection.

use log::{debug, info};
use rand::Rng;

use crate::backend::MatmulBackend;
use crate::causalattention::Block;
use crate::config::GptConfig;
use crate::error::{Result, TensorError};
use crate::layers::{Dropout, Embedding, Layer, LayerNorm, Linear, Module, Parameter};
use crate::ops;
use crate::tensor::{Tensor, TokenIds};

#[derive(Debug)]
pub struct GptModel {
    config: GptConfig,
    pub wte: Embedding,
    pub wpe: Embedding,
    drop: Dropout,
    pub blocks: Vec<Block>,
    pub ln_f: LayerNorm,
    pub lm_head: Linear,
    training: bool,
}

impl GptModel {
    pub fn new<R: Rng + ?Sized>(config: &GptConfig, rng: &mut R) -> Result<Self> {
        Self::with_backend(config, MatmulBackend::default(), rng)
    }

    pub fn with_backend<R: Rng + ?Sized>(
        config: &GptConfig,
        backend: MatmulBackend,
        rng: &mut R,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            "Building GPT: vocab={} block={} layers={} heads={} embd={} dropout={} backend={}",
            config.vocab_size,
            config.block_size,
            config.n_layer,
            config.n_head,
            config.n_embd,
            config.dropout,
            backend.name()
        );

        let wte = Embedding::new("wte", config.vocab_size, config.n_embd, rng);
        let wpe = Embedding::new("wpe", config.block_size, config.n_embd, rng);
        let blocks = (0..config.n_layer)
            .map(|i| Block::new(config, i, backend, rng))
            .collect();
        let ln_f = LayerNorm::new("ln_f", config.n_embd);
        let lm_head = Linear::new("lm_head", config.n_embd, config.vocab_size, backend, rng);

        let model = Self {
            config: config.clone(),
            wte,
            wpe,
            drop: Dropout::new(config.dropout),
            blocks,
            ln_f,
            lm_head,
            training: true,
        };
        info!("GPT ready: {} parameters", model.num_parameters());
        Ok(model)
    }

    pub fn config(&self) -> &GptConfig {
        &self.config
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Dropout is active only in training mode.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        self.drop.set_training(training);
        for block in &mut self.blocks {
            block.set_training(training);
        }
    }

    pub fn train(&mut self) {
        self.set_training(true);
    }

    pub fn eval(&mut self) {
        self.set_training(false);
    }

    /// `[B, T]` ids → `[B, T, vocab_size]` logits.
    pub fn forward<R: Rng + ?Sized>(&mut self, idx: &TokenIds, rng: &mut R) -> Tensor {
        let (b, t) = (idx.batch(), idx.time());
        assert!(
            t <= self.config.block_size,
            "sequence length {t} exceeds block_size {}",
            self.config.block_size
        );
        debug!("GPT forward: [B={b}, T={t}]");

        let positions: Vec<usize> = (0..b).flat_map(|_| 0..t).collect();
        let tok = self.wte.forward(idx.as_slice(), b, t);
        let pos = self.wpe.forward(&positions, b, t);

        let mut x = self.drop.forward(&ops::add(&tok, &pos), rng);
        for block in &mut self.blocks {
            x = block.forward(&x, rng);
        }
        let x = self.ln_f.forward(&x);
        self.lm_head.forward(&x)
    }

    /// Propagates `dL/dlogits` through the whole stack, accumulating into
    /// every parameter gradient.
    pub fn backward(&mut self, grad_logits: &Tensor) {
        let g = self.lm_head.backward(grad_logits);
        let mut g = self.ln_f.backward(&g);
        for block in self.blocks.iter_mut().rev() {
            g = block.backward(&g);
        }
        let g = self.drop.backward(&g);
        // tok + pos is an add node: both tables see the same gradient.
        self.wte.backward(&g);
        self.wpe.backward(&g);
    }

    /// Copies `data` into the parameter called `name`.
    pub fn restore_parameter(&mut self, name: &str, data: &[f32]) -> Result<()> {
        let param = self
            .parameters_mut()
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| TensorError::UnknownParameter(name.to_string()))?;
        if param.size() != data.len() {
            return Err(TensorError::ShapeMismatch {
                expected: param.shape().to_vec(),
                expected_size: param.size(),
                got: vec![data.len()],
                got_size: data.len(),
            });
        }
        param.value.data_mut().copy_from_slice(data);
        Ok(())
    }

    /// Greedy decoding, cropping the context to `block_size`. Runs in eval
    /// mode and restores the previous mode afterwards.
    pub fn generate<R: Rng + ?Sized>(
        &mut self,
        prompt: &[usize],
        max_new_tokens: usize,
        rng: &mut R,
    ) -> Vec<usize> {
        assert!(!prompt.is_empty(), "generate needs a non-empty prompt");
        let was_training = self.training;
        self.eval();

        let mut ids = prompt.to_vec();
        for _ in 0..max_new_tokens {
            let start = ids.len().saturating_sub(self.config.block_size);
            let ctx = TokenIds::from_sequence(&ids[start..]);
            let logits = self.forward(&ctx, rng);
            let v = self.config.vocab_size;
            let last = &logits.data()[logits.size() - v..];
            ids.push(ops::argmax_row(last));
        }

        self.set_training(was_training);
        ids
    }
}

impl Module for GptModel {
    /// `wte, wpe, blocks.0 .. blocks.N-1, ln_f, lm_head`.
    fn parameters(&self) -> Vec<&Parameter> {
        let mut p = self.wte.parameters();
        p.extend(self.wpe.parameters());
        for block in &self.blocks {
            p.extend(block.parameters());
        }
        p.extend(self.ln_f.parameters());
        p.extend(self.lm_head.parameters());
        p
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut p = self.wte.parameters_mut();
        p.extend(self.wpe.parameters_mut());
        for block in &mut self.blocks {
            p.extend(block.parameters_mut());
        }
        p.extend(self.ln_f.parameters_mut());
        p.extend(self.lm_head.parameters_mut());
        p
    }
}
