//! AdamW with decoupled weight decay, global gradient clipping and the
//! warmup + cosine learning-rate schedule.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::layers::Parameter;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamWConfig {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

impl AdamWConfig {
    pub fn with_lr(mut self, lr: f32) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

/// Moment buffers are flat and offset-indexed in the parameter order seen at
/// construction. Every `step` must receive parameters in that same order.
#[derive(Debug, Clone)]
pub struct AdamW {
    config: AdamWConfig,
    layout: Vec<(String, usize)>,
    step: u64,
    m: Vec<f32>,
    v: Vec<f32>,
}

impl AdamW {
    pub fn new(params: &[&Parameter], config: AdamWConfig) -> Self {
        let layout: Vec<(String, usize)> =
            params.iter().map(|p| (p.name.clone(), p.size())).collect();
        let total: usize = layout.iter().map(|(_, n)| n).sum();
        debug!(
            "AdamW: {} tensors, {} elements, {:?}",
            layout.len(),
            total,
            config
        );
        Self {
            config,
            layout,
            step: 0,
            m: vec![0.0; total],
            v: vec![0.0; total],
        }
    }

    pub fn lr(&self) -> f32 {
        self.config.lr
    }

    pub fn set_lr(&mut self, lr: f32) {
        self.config.lr = lr;
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Total number of scalar elements tracked.
    pub fn state_len(&self) -> usize {
        self.m.len()
    }

    pub fn step(&mut self, params: &mut [&mut Parameter]) {
        assert_eq!(
            params.len(),
            self.layout.len(),
            "AdamW was built for {} parameters, got {}",
            self.layout.len(),
            params.len()
        );
        self.step += 1;
        let AdamWConfig {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;
        let t = self.step as i32;
        let bc1 = 1.0 - beta1.powi(t);
        let bc2 = 1.0 - beta2.powi(t);
        let step_size = lr / bc1;
        let bc2_sqrt = bc2.sqrt();

        let mut offset = 0;
        for (p, (name, size)) in params.iter_mut().zip(&self.layout) {
            assert!(
                p.name == *name && p.size() == *size,
                "AdamW parameter order changed: expected {name} ({size}), got {} ({})",
                p.name,
                p.size()
            );
            let m = &mut self.m[offset..offset + size];
            let v = &mut self.v[offset..offset + size];
            let Parameter { value, grad, .. } = &mut **p;
            for (((w, &g), m), v) in value
                .data_mut()
                .iter_mut()
                .zip(grad.data())
                .zip(m.iter_mut())
                .zip(v.iter_mut())
            {
                *w -= lr * weight_decay * *w;
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let denom = v.sqrt() / bc2_sqrt + eps;
                *w -= step_size * (*m / denom);
            }
            offset += size;
        }
    }
}

pub fn zero_grad(params: &mut [&mut Parameter]) {
    for p in params.iter_mut() {
        p.zero_grad();
    }
}

/// Global L2 norm over every gradient element.
pub fn grad_norm(params: &[&Parameter]) -> f32 {
    params
        .iter()
        .flat_map(|p| p.grad.data())
        .map(|g| g * g)
        .sum::<f32>()
        .sqrt()
}

/// Scales all gradients by `max_norm / (norm + 1e-6)` when their global norm
/// exceeds `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm(params: &mut [&mut Parameter], max_norm: f32) -> f32 {
    let total = params
        .iter()
        .flat_map(|p| p.grad.data())
        .map(|g| g * g)
        .sum::<f32>()
        .sqrt();
    if !total.is_finite() {
        warn!("gradient norm is not finite: {total}");
    }
    if max_norm > 0.0 && total > max_norm {
        let coef = max_norm / (total + 1e-6);
        for p in params.iter_mut() {
            p.grad.data_mut().iter_mut().for_each(|g| *g *= coef);
        }
    }
    total
}

// ─────────────────────────────────────────────────────────────────────────────
// Learning-rate schedule
// ─────────────────────────────────────────────────────────────────────────────

/// Linear warmup from 0 to `lr_max`, cosine decay to `lr_min` at
/// `max_steps`, then constant `lr_min`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CosineScheduleWithWarmup {
    pub warmup_steps: usize,
    pub max_steps: usize,
    pub lr_max: f32,
    pub lr_min: f32,
}

impl CosineScheduleWithWarmup {
    pub fn new(warmup_steps: usize, max_steps: usize, lr_max: f32, lr_min: f32) -> Self {
        Self {
            warmup_steps,
            max_steps,
            lr_max,
            lr_min,
        }
    }

    pub fn lr(&self, step: usize) -> f32 {
        if step < self.warmup_steps {
            return self.lr_max * step as f32 / self.warmup_steps as f32;
        }
        if step > self.max_steps || self.max_steps <= self.warmup_steps {
            return self.lr_min;
        }
        let progress =
            (step - self.warmup_steps) as f32 / (self.max_steps - self.warmup_steps) as f32;
        let decay = 0.5 * (1.0 + (std::f32::consts::PI * progress).cos());
        self.lr_min + (self.lr_max - self.lr_min) * decay
    }
}
