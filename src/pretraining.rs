//! Training loop: schedule, zero-grad, forward, loss, backward, clip, step.

use anyhow::Result;
use log::{debug, info};
use rand::Rng;

use crate::checkpoint::{save_checkpoint, CheckpointMetadata};
use crate::config::TrainConfig;
use crate::dataset::TextDataset;
use crate::gpt::GptModel;
use crate::layers::Module;
use crate::loss::CrossEntropyLoss;
use crate::optim::{self, AdamW, AdamWConfig, CosineScheduleWithWarmup};
use crate::tensor::TokenIds;

/// What one optimisation step did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepStats {
    pub step: usize,
    pub loss: f32,
    pub lr: f32,
    /// Global gradient norm before clipping.
    pub grad_norm: f32,
}

pub struct Trainer {
    model: GptModel,
    optimizer: AdamW,
    schedule: CosineScheduleWithWarmup,
    loss_fn: CrossEntropyLoss,
    config: TrainConfig,
    step: usize,
}

impl Trainer {
    pub fn new(model: GptModel, config: TrainConfig) -> Result<Self> {
        config.validate()?;
        let optimizer = AdamW::new(
            &model.parameters(),
            AdamWConfig::default()
                .with_lr(config.learning_rate)
                .with_weight_decay(config.weight_decay),
        );
        let schedule = CosineScheduleWithWarmup::new(
            config.warmup_steps,
            config.steps,
            config.learning_rate,
            config.min_learning_rate,
        );
        info!(
            "Trainer: steps={} batch={} lr={} -> {} warmup={} clip={}",
            config.steps,
            config.batch_size,
            config.learning_rate,
            config.min_learning_rate,
            config.warmup_steps,
            config.max_grad_norm
        );
        Ok(Self {
            model,
            optimizer,
            schedule,
            loss_fn: CrossEntropyLoss::new(),
            config,
            step: 0,
        })
    }

    pub fn model(&self) -> &GptModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut GptModel {
        &mut self.model
    }

    pub fn into_model(self) -> GptModel {
        self.model
    }

    pub fn optimizer(&self) -> &AdamW {
        &self.optimizer
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn train_step<R: Rng + ?Sized>(
        &mut self,
        x: &TokenIds,
        y: &[usize],
        rng: &mut R,
    ) -> StepStats {
        let lr = self.schedule.lr(self.step);
        self.optimizer.set_lr(lr);
        self.model.train();
        self.model.zero_grad();

        let logits = self.model.forward(x, rng);
        let loss = self.loss_fn.forward(&logits, y);
        let grad = self.loss_fn.backward();
        self.model.backward(&grad);

        let mut params = self.model.parameters_mut();
        let grad_norm = optim::clip_grad_norm(&mut params, self.config.max_grad_norm);
        self.optimizer.step(&mut params);

        let stats = StepStats {
            step: self.step,
            loss,
            lr,
            grad_norm,
        };
        debug!("{:?}", stats);
        self.step += 1;
        stats
    }

    /// Runs `config.steps` steps on random batches, logging every 10 and
    /// checkpointing to `config.out_dir` when set.
    pub fn fit<R: Rng + ?Sized>(
        &mut self,
        dataset: &TextDataset,
        rng: &mut R,
    ) -> Result<Vec<StepStats>> {
        let mut history = Vec::with_capacity(self.config.steps);
        let started = std::time::Instant::now();

        for _ in 0..self.config.steps {
            let (x, y) = dataset.get_batch(self.config.batch_size, rng);
            let stats = self.train_step(&x, &y, rng);
            if stats.step % 10 == 0 || stats.step + 1 == self.config.steps {
                info!(
                    "step {:>5} | loss {:.4} | lr {:.2e} | grad_norm {:.3} | {:.1}s",
                    stats.step,
                    stats.loss,
                    stats.lr,
                    stats.grad_norm,
                    started.elapsed().as_secs_f32()
                );
            }
            history.push(stats);

            let interval = self.config.checkpoint_interval;
            if interval > 0 && self.step % interval == 0 && self.step < self.config.steps {
                self.save(stats.loss)?;
            }
        }

        if let Some(last) = history.last() {
            self.save(last.loss)?;
        }
        Ok(history)
    }

    fn save(&self, loss: f32) -> Result<()> {
        let Some(dir) = &self.config.out_dir else {
            return Ok(());
        };
        let meta = CheckpointMetadata {
            step: self.step,
            loss,
            config: self.model.config().clone(),
        };
        save_checkpoint(&self.model, &meta, dir)
    }
}
