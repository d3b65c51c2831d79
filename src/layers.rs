//! Trainable building blocks with hand-derived backward passes.
//!
//! Each layer caches what its backward needs during `forward`; the next
//! `backward` consumes that cache. Calls are strictly `forward; backward` per
//! layer instance, and calling `backward` first panics. Parameter gradients
//! accumulate, so callers zero them between optimisation steps.

use log::trace;
use rand::Rng;

use crate::backend::MatmulBackend;
use crate::ops;
use crate::tensor::Tensor;

pub const LAYER_NORM_EPS: f32 = 1e-5;

// ─────────────────────────────────────────────────────────────────────────────
// Parameter
// ─────────────────────────────────────────────────────────────────────────────

/// A trainable tensor, its gradient accumulator, and the name checkpoints
/// address it by.
#[derive(Clone, Debug)]
pub struct Parameter {
    pub name: String,
    pub value: Tensor,
    pub grad: Tensor,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        let grad = Tensor::zeros(value.shape());
        Parameter {
            name: name.into(),
            value,
            grad,
        }
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    pub fn size(&self) -> usize {
        self.value.size()
    }
}

/// Anything that owns parameters. Both accessors must list parameters in the
/// same, stable order.
pub trait Module {
    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.size()).sum()
    }
}

/// A deterministic tensor-to-tensor layer.
pub trait Layer: Module {
    fn forward(&mut self, x: &Tensor) -> Tensor;

    /// Takes the gradient w.r.t. the last forward output, accumulates
    /// parameter gradients and returns the gradient w.r.t. the input.
    fn backward(&mut self, grad_out: &Tensor) -> Tensor;
}

fn reshape_or_panic(t: Tensor, shape: &[usize], what: &str) -> Tensor {
    t.reshape(shape).unwrap_or_else(|e| panic!("{what}: {e}"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Linear
// ─────────────────────────────────────────────────────────────────────────────

/// `y = x Wᵀ + b` with `W` stored `[out, in]`. Leading axes of `x` are
/// flattened into rows.
#[derive(Debug)]
pub struct Linear {
    pub weight: Parameter,
    pub bias: Parameter,
    in_features: usize,
    out_features: usize,
    backend: MatmulBackend,
    input: Option<Tensor>,
    input_shape: Vec<usize>,
}

impl Linear {
    /// Weights uniform in `[-0.5/in, 0.5/in)`, bias zero.
    pub fn new<R: Rng + ?Sized>(
        name: &str,
        in_features: usize,
        out_features: usize,
        backend: MatmulBackend,
        rng: &mut R,
    ) -> Self {
        let mut w = Tensor::rand(&[out_features, in_features], rng);
        let scale = 1.0 / in_features as f32;
        w.data_mut().iter_mut().for_each(|x| *x = (*x - 0.5) * scale);

        Linear {
            weight: Parameter::new(format!("{name}.weight"), w),
            bias: Parameter::new(format!("{name}.bias"), Tensor::zeros(&[out_features])),
            in_features,
            out_features,
            backend,
            input: None,
            input_shape: Vec::new(),
        }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

impl Module for Linear {
    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }
}

impl Layer for Linear {
    fn forward(&mut self, x: &Tensor) -> Tensor {
        assert_eq!(
            x.last_dim(),
            self.in_features,
            "linear {}: input {:?} does not match weight {:?}",
            self.weight.name,
            x.shape(),
            self.weight.shape()
        );
        let rows = x.rows();
        let x2 = reshape_or_panic(x.clone(), &[rows, self.in_features], "linear forward");
        let wt = ops::transpose(&self.weight.value);
        let mut out = ops::matmul_with(self.backend, &x2, &wt);

        let bias = self.bias.value.data();
        out.data_mut()
            .chunks_mut(self.out_features)
            .for_each(|row| row.iter_mut().zip(bias).for_each(|(y, &b)| *y += b));

        let mut out_shape = x.shape().to_vec();
        if let Some(last) = out_shape.last_mut() {
            *last = self.out_features;
        }
        trace!(
            "linear {}: {:?} -> {:?}",
            self.weight.name,
            x.shape(),
            out_shape
        );

        self.input_shape = x.shape().to_vec();
        self.input = Some(x2);
        reshape_or_panic(out, &out_shape, "linear forward")
    }

    fn backward(&mut self, grad_out: &Tensor) -> Tensor {
        let input = self
            .input
            .as_ref()
            .unwrap_or_else(|| panic!("linear {}: backward before forward", self.weight.name));
        let rows = input.shape()[0];
        assert_eq!(
            grad_out.size(),
            rows * self.out_features,
            "linear {}: gradient {:?} does not match output rows {}x{}",
            self.weight.name,
            grad_out.shape(),
            rows,
            self.out_features
        );
        let g2 = reshape_or_panic(grad_out.clone(), &[rows, self.out_features], "linear backward");

        // dW[r, c] += sum_rows g[row, r] * x[row, c]
        let dw = ops::matmul_with(self.backend, &ops::transpose(&g2), input);
        ops::add_inplace(&mut self.weight.grad, &dw);

        let db = self.bias.grad.data_mut();
        for row in g2.data().chunks(self.out_features) {
            db.iter_mut().zip(row).for_each(|(d, &g)| *d += g);
        }

        let dx = ops::matmul_with(self.backend, &g2, &self.weight.value);
        reshape_or_panic(dx, &self.input_shape, "linear backward")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LayerNorm
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct LayerNorm {
    pub gamma: Parameter,
    pub beta: Parameter,
    dim: usize,
    eps: f32,
    input: Option<Tensor>,
    mean: Vec<f32>,
    rstd: Vec<f32>,
}

impl LayerNorm {
    pub fn new(name: &str, dim: usize) -> Self {
        LayerNorm {
            gamma: Parameter::new(format!("{name}.gamma"), Tensor::full(1.0, &[dim])),
            beta: Parameter::new(format!("{name}.beta"), Tensor::zeros(&[dim])),
            dim,
            eps: LAYER_NORM_EPS,
            input: None,
            mean: Vec::new(),
            rstd: Vec::new(),
        }
    }

    /// Per-row mean and inverse std from the last forward call.
    pub fn cached_stats(&self) -> (&[f32], &[f32]) {
        (&self.mean, &self.rstd)
    }
}

impl Module for LayerNorm {
    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.gamma, &self.beta]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.gamma, &mut self.beta]
    }
}

impl Layer for LayerNorm {
    fn forward(&mut self, x: &Tensor) -> Tensor {
        assert_eq!(
            x.last_dim(),
            self.dim,
            "layernorm {}: input {:?} does not end in {}",
            self.gamma.name,
            x.shape(),
            self.dim
        );
        let d = self.dim;
        let rows = x.rows();
        let gamma = self.gamma.value.data();
        let beta = self.beta.value.data();

        let mut out = Tensor::zeros(x.shape());
        self.mean = Vec::with_capacity(rows);
        self.rstd = Vec::with_capacity(rows);

        for (row, out_row) in x.data().chunks(d).zip(out.data_mut().chunks_mut(d)) {
            let mean = row.iter().sum::<f32>() / d as f32;
            let var = row.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / d as f32;
            let rstd = 1.0 / (var + self.eps).sqrt();
            for i in 0..d {
                let norm = (row[i] - mean) * rstd;
                out_row[i] = norm * gamma[i] + beta[i];
            }
            self.mean.push(mean);
            self.rstd.push(rstd);
        }

        self.input = Some(x.clone());
        out
    }

    fn backward(&mut self, grad_out: &Tensor) -> Tensor {
        let input = self
            .input
            .as_ref()
            .unwrap_or_else(|| panic!("layernorm {}: backward before forward", self.gamma.name));
        assert_eq!(
            grad_out.shape(),
            input.shape(),
            "layernorm {}: gradient shape mismatch",
            self.gamma.name
        );
        let d = self.dim;
        let n = d as f32;
        let gamma = self.gamma.value.data();
        let dgamma = self.gamma.grad.data_mut();
        let dbeta = self.beta.grad.data_mut();

        let mut dx = Tensor::zeros(input.shape());
        let mut xhat = vec![0.0f32; d];
        let mut dxhat = vec![0.0f32; d];

        for (r, ((x_row, dy_row), dx_row)) in input
            .data()
            .chunks(d)
            .zip(grad_out.data().chunks(d))
            .zip(dx.data_mut().chunks_mut(d))
            .enumerate()
        {
            let mean = self.mean[r];
            let rstd = self.rstd[r];

            let mut sum_dxhat = 0.0f32;
            let mut sum_dxhat_xhat = 0.0f32;
            for i in 0..d {
                xhat[i] = (x_row[i] - mean) * rstd;
                dxhat[i] = dy_row[i] * gamma[i];
                dgamma[i] += dy_row[i] * xhat[i];
                dbeta[i] += dy_row[i];
                sum_dxhat += dxhat[i];
                sum_dxhat_xhat += dxhat[i] * xhat[i];
            }
            for i in 0..d {
                dx_row[i] = (rstd / n) * (n * dxhat[i] - sum_dxhat - xhat[i] * sum_dxhat_xhat);
            }
        }
        dx
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Embedding
// ─────────────────────────────────────────────────────────────────────────────

/// `[num_embeddings, dim]` lookup table indexed by integer ids.
#[derive(Debug)]
pub struct Embedding {
    pub weight: Parameter,
    num_embeddings: usize,
    dim: usize,
    indices: Option<Vec<usize>>,
}

impl Embedding {
    /// Table entries uniform in `[0, 1)`.
    pub fn new<R: Rng + ?Sized>(name: &str, num_embeddings: usize, dim: usize, rng: &mut R) -> Self {
        Embedding {
            weight: Parameter::new(
                format!("{name}.weight"),
                Tensor::rand(&[num_embeddings, dim], rng),
            ),
            num_embeddings,
            dim,
            indices: None,
        }
    }

    pub fn num_embeddings(&self) -> usize {
        self.num_embeddings
    }

    /// Gathers one row per index into `[batch, time, dim]`.
    pub fn forward(&mut self, indices: &[usize], batch: usize, time: usize) -> Tensor {
        assert_eq!(
            indices.len(),
            batch * time,
            "embedding {}: {} indices for [{batch}, {time}]",
            self.weight.name,
            indices.len()
        );
        let d = self.dim;
        let table = self.weight.value.data();
        let mut out = Tensor::zeros(&[batch, time, d]);
        for (&idx, out_row) in indices.iter().zip(out.data_mut().chunks_mut(d)) {
            assert!(
                idx < self.num_embeddings,
                "embedding {}: index {idx} out of range for {} rows",
                self.weight.name,
                self.num_embeddings
            );
            out_row.copy_from_slice(&table[idx * d..(idx + 1) * d]);
        }
        self.indices = Some(indices.to_vec());
        out
    }

    /// Scatter-adds `grad_out` into the rows touched by the last forward.
    /// Repeated indices accumulate.
    pub fn backward(&mut self, grad_out: &Tensor) {
        let indices = self
            .indices
            .as_ref()
            .unwrap_or_else(|| panic!("embedding {}: backward before forward", self.weight.name));
        assert_eq!(
            grad_out.size(),
            indices.len() * self.dim,
            "embedding {}: gradient {:?} does not match {} lookups",
            self.weight.name,
            grad_out.shape(),
            indices.len()
        );
        let d = self.dim;
        let grad = self.weight.grad.data_mut();
        for (&idx, g_row) in indices.iter().zip(grad_out.data().chunks(d)) {
            grad[idx * d..(idx + 1) * d]
                .iter_mut()
                .zip(g_row)
                .for_each(|(g, &v)| *g += v);
        }
    }
}

impl Module for Embedding {
    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight]
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dropout
// ─────────────────────────────────────────────────────────────────────────────

/// Inverted dropout. Identity when `p == 0` or when not training.
#[derive(Debug)]
pub struct Dropout {
    p: f32,
    training: bool,
    mask: Option<Tensor>,
}

impl Dropout {
    pub fn new(p: f32) -> Self {
        assert!(
            (0.0..1.0).contains(&p),
            "dropout probability must be in [0, 1), got {p}"
        );
        Dropout {
            p,
            training: true,
            mask: None,
        }
    }

    pub fn p(&self) -> f32 {
        self.p
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn forward<R: Rng + ?Sized>(&mut self, x: &Tensor, rng: &mut R) -> Tensor {
        if !self.training || self.p == 0.0 {
            self.mask = None;
            return x.clone();
        }
        let (out, mask) = ops::dropout(x, self.p, rng);
        self.mask = Some(mask);
        out
    }

    pub fn backward(&mut self, grad_out: &Tensor) -> Tensor {
        match &self.mask {
            Some(mask) => ops::mul(grad_out, mask),
            None => grad_out.clone(),
        }
    }
}
