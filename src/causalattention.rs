//! Causal self-attention, the GELU MLP and the pre-norm transformer block.
//!
//! Shape bookkeeping follows one convention throughout:
//! - `x`, `y`: `[B, T, C]`
//! - `q`, `k`, `v`: `[B, H, T, D]` with `C = H * D`
//! - scores / probabilities: `[B, H, T, T]`

use log::{debug, trace};
use rand::Rng;

use crate::backend::MatmulBackend;
use crate::config::GptConfig;
use crate::layers::{Dropout, Layer, LayerNorm, Linear, Module, Parameter};
use crate::ops;
use crate::tensor::Tensor;

/// Score written over every future position before the softmax.
pub const CAUSAL_MASK_FILL: f32 = -1e9;

// ─────────────────────────────────────────────────────────────────────────────
// Attention
// ─────────────────────────────────────────────────────────────────────────────

/// Forward intermediates kept for the backward pass.
#[derive(Debug)]
struct AttentionCache {
    q: Tensor,
    k: Tensor,
    v: Tensor,
    att: Tensor,
    b: usize,
    t: usize,
}

#[derive(Debug)]
pub struct CausalSelfAttention {
    layer_idx: usize,
    n_head: usize,
    n_embd: usize,
    head_dim: usize,
    backend: MatmulBackend,
    pub c_attn: Linear,
    pub c_proj: Linear,
    cache: Option<AttentionCache>,
}

impl CausalSelfAttention {
    pub fn new<R: Rng + ?Sized>(
        config: &GptConfig,
        layer_idx: usize,
        backend: MatmulBackend,
        rng: &mut R,
    ) -> Self {
        let n_head = config.n_head;
        let n_embd = config.n_embd;
        assert_eq!(n_embd % n_head, 0, "n_embd must be divisible by n_head");
        let head_dim = n_embd / n_head;

        debug!(
            "Layer {}: Attn n_head={}, head_dim={}",
            layer_idx, n_head, head_dim
        );

        let prefix = format!("blocks.{layer_idx}.attn");
        Self {
            layer_idx,
            n_head,
            n_embd,
            head_dim,
            backend,
            c_attn: Linear::new(&format!("{prefix}.c_attn"), n_embd, 3 * n_embd, backend, rng),
            c_proj: Linear::new(&format!("{prefix}.c_proj"), n_embd, n_embd, backend, rng),
            cache: None,
        }
    }

    /// Softmax probabilities `[B, H, T, T]` from the last forward call.
    pub fn attention_probs(&self) -> Option<&Tensor> {
        self.cache.as_ref().map(|c| &c.att)
    }

    fn scale(&self) -> f32 {
        1.0 / (self.head_dim as f32).sqrt()
    }

    /// `[B, T, 3C]` → three `[B, H, T, D]` tensors.
    fn split_heads(&self, qkv: &Tensor, b: usize, t: usize) -> (Tensor, Tensor, Tensor) {
        let (h, d, c) = (self.n_head, self.head_dim, self.n_embd);
        let mut q = Tensor::zeros(&[b, h, t, d]);
        let mut k = Tensor::zeros(&[b, h, t, d]);
        let mut v = Tensor::zeros(&[b, h, t, d]);
        let src = qkv.data();
        {
            let (qd, kd, vd) = (q.data_mut(), k.data_mut(), v.data_mut());
            for bi in 0..b {
                for ti in 0..t {
                    let row = (bi * t + ti) * 3 * c;
                    for hi in 0..h {
                        let dst = ((bi * h + hi) * t + ti) * d;
                        let off = row + hi * d;
                        qd[dst..dst + d].copy_from_slice(&src[off..off + d]);
                        kd[dst..dst + d].copy_from_slice(&src[off + c..off + c + d]);
                        vd[dst..dst + d].copy_from_slice(&src[off + 2 * c..off + 2 * c + d]);
                    }
                }
            }
        }
        (q, k, v)
    }

    /// `[B, H, T, D]` → `[B, T, C]`.
    fn merge_heads(&self, y: &Tensor, b: usize, t: usize) -> Tensor {
        let (h, d, c) = (self.n_head, self.head_dim, self.n_embd);
        let mut out = Tensor::zeros(&[b, t, c]);
        let src = y.data();
        let dst = out.data_mut();
        for bi in 0..b {
            for ti in 0..t {
                for hi in 0..h {
                    let from = ((bi * h + hi) * t + ti) * d;
                    let to = (bi * t + ti) * c + hi * d;
                    dst[to..to + d].copy_from_slice(&src[from..from + d]);
                }
            }
        }
        out
    }

    /// Inverse of [`Self::merge_heads`].
    fn unmerge_heads(&self, x: &Tensor, b: usize, t: usize) -> Tensor {
        let (h, d, c) = (self.n_head, self.head_dim, self.n_embd);
        let mut out = Tensor::zeros(&[b, h, t, d]);
        let src = x.data();
        let dst = out.data_mut();
        for bi in 0..b {
            for ti in 0..t {
                for hi in 0..h {
                    let from = (bi * t + ti) * c + hi * d;
                    let to = ((bi * h + hi) * t + ti) * d;
                    dst[to..to + d].copy_from_slice(&src[from..from + d]);
                }
            }
        }
        out
    }

    /// Inverse of [`Self::split_heads`].
    fn join_qkv(&self, dq: &Tensor, dk: &Tensor, dv: &Tensor, b: usize, t: usize) -> Tensor {
        let (h, d, c) = (self.n_head, self.head_dim, self.n_embd);
        let mut out = Tensor::zeros(&[b, t, 3 * c]);
        let dst = out.data_mut();
        let (qd, kd, vd) = (dq.data(), dk.data(), dv.data());
        for bi in 0..b {
            for ti in 0..t {
                let row = (bi * t + ti) * 3 * c;
                for hi in 0..h {
                    let src = ((bi * h + hi) * t + ti) * d;
                    let off = row + hi * d;
                    dst[off..off + d].copy_from_slice(&qd[src..src + d]);
                    dst[off + c..off + c + d].copy_from_slice(&kd[src..src + d]);
                    dst[off + 2 * c..off + 2 * c + d].copy_from_slice(&vd[src..src + d]);
                }
            }
        }
        out
    }
}

impl Module for CausalSelfAttention {
    fn parameters(&self) -> Vec<&Parameter> {
        let mut p = self.c_attn.parameters();
        p.extend(self.c_proj.parameters());
        p
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut p = self.c_attn.parameters_mut();
        p.extend(self.c_proj.parameters_mut());
        p
    }
}

impl Layer for CausalSelfAttention {
    fn forward(&mut self, x: &Tensor) -> Tensor {
        assert_eq!(
            x.rank(),
            3,
            "attention expects [B, T, C], got {:?}",
            x.shape()
        );
        let (b, t, c) = (x.shape()[0], x.shape()[1], x.shape()[2]);
        assert_eq!(c, self.n_embd, "attention: channel dim {c} != n_embd {}", self.n_embd);
        trace!(
            "Layer {} attn forward: input [B={}, T={}, C={}]",
            self.layer_idx,
            b,
            t,
            c
        );

        let qkv = self.c_attn.forward(x);
        let (q, k, v) = self.split_heads(&qkv, b, t);

        let mut att = ops::matmul_with(self.backend, &q, &ops::transpose(&k));
        let scale = self.scale();
        att.data_mut().iter_mut().for_each(|s| *s *= scale);

        // Key position j > query position i is masked.
        for row in 0..b * self.n_head {
            for i in 0..t {
                let base = (row * t + i) * t;
                for s in &mut att.data_mut()[base + i + 1..base + t] {
                    *s = CAUSAL_MASK_FILL;
                }
            }
        }
        let att = ops::softmax(&att);

        let y = ops::matmul_with(self.backend, &att, &v);
        let y = self.merge_heads(&y, b, t);

        self.cache = Some(AttentionCache { q, k, v, att, b, t });
        self.c_proj.forward(&y)
    }

    fn backward(&mut self, grad_out: &Tensor) -> Tensor {
        let dy_flat = self.c_proj.backward(grad_out);
        let cache = self
            .cache
            .as_ref()
            .unwrap_or_else(|| panic!("attention layer {}: backward before forward", self.layer_idx));
        let (b, t) = (cache.b, cache.t);

        let dy = self.unmerge_heads(&dy_flat, b, t);

        // dV = Pᵀ dY, dP = dY Vᵀ
        let dv = ops::matmul_with(self.backend, &ops::transpose(&cache.att), &dy);
        let dp = ops::matmul_with(self.backend, &dy, &ops::transpose(&cache.v));

        // dS[i,j] = P[i,j] (dP[i,j] - sum_k P[i,k] dP[i,k]), then the score scale
        let scale = self.scale();
        let mut ds = Tensor::zeros(dp.shape());
        if t > 0 {
            for ((p_row, dp_row), ds_row) in cache
                .att
                .data()
                .chunks(t)
                .zip(dp.data().chunks(t))
                .zip(ds.data_mut().chunks_mut(t))
            {
                let dot: f32 = p_row.iter().zip(dp_row).map(|(p, g)| p * g).sum();
                for j in 0..t {
                    ds_row[j] = p_row[j] * (dp_row[j] - dot) * scale;
                }
            }
        }

        // dQ = dS K, dK = dSᵀ Q
        let dq = ops::matmul_with(self.backend, &ds, &cache.k);
        let dk = ops::matmul_with(self.backend, &ops::transpose(&ds), &cache.q);

        let dqkv = self.join_qkv(&dq, &dk, &dv, b, t);
        self.c_attn.backward(&dqkv)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MLP
// ─────────────────────────────────────────────────────────────────────────────

/// `Linear(C, 4C) → GELU → Linear(4C, C) → Dropout`.
#[derive(Debug)]
pub struct Mlp {
    pub c_fc: Linear,
    pub c_proj: Linear,
    dropout: Dropout,
    gelu_input: Option<Tensor>,
}

impl Mlp {
    pub fn new<R: Rng + ?Sized>(
        config: &GptConfig,
        layer_idx: usize,
        backend: MatmulBackend,
        rng: &mut R,
    ) -> Self {
        let c = config.n_embd;
        let prefix = format!("blocks.{layer_idx}.mlp");
        Self {
            c_fc: Linear::new(&format!("{prefix}.c_fc"), c, 4 * c, backend, rng),
            c_proj: Linear::new(&format!("{prefix}.c_proj"), 4 * c, c, backend, rng),
            dropout: Dropout::new(config.dropout),
            gelu_input: None,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.dropout.set_training(training);
    }

    pub fn forward<R: Rng + ?Sized>(&mut self, x: &Tensor, rng: &mut R) -> Tensor {
        let h = self.c_fc.forward(x);
        let (a, cache) = ops::gelu_with_cache(&h);
        self.gelu_input = Some(cache);
        let out = self.c_proj.forward(&a);
        self.dropout.forward(&out, rng)
    }

    pub fn backward(&mut self, grad_out: &Tensor) -> Tensor {
        let g = self.dropout.backward(grad_out);
        let g = self.c_proj.backward(&g);
        let gelu_input = self
            .gelu_input
            .as_ref()
            .unwrap_or_else(|| panic!("{}: backward before forward", self.c_fc.weight.name));
        let g = ops::gelu_backward(gelu_input, &g);
        self.c_fc.backward(&g)
    }
}

impl Module for Mlp {
    fn parameters(&self) -> Vec<&Parameter> {
        let mut p = self.c_fc.parameters();
        p.extend(self.c_proj.parameters());
        p
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut p = self.c_fc.parameters_mut();
        p.extend(self.c_proj.parameters_mut());
        p
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transformer block
// ─────────────────────────────────────────────────────────────────────────────

/// Pre-norm residual block:
/// `x = x + drop1(attn(ln1(x)))`, then `x = x + drop2(mlp(ln2(x)))`.
#[derive(Debug)]
pub struct Block {
    layer_idx: usize,
    pub ln1: LayerNorm,
    pub attn: CausalSelfAttention,
    pub ln2: LayerNorm,
    pub mlp: Mlp,
    drop1: Dropout,
    drop2: Dropout,
}

impl Block {
    pub fn new<R: Rng + ?Sized>(
        config: &GptConfig,
        layer_idx: usize,
        backend: MatmulBackend,
        rng: &mut R,
    ) -> Self {
        let prefix = format!("blocks.{layer_idx}");
        Self {
            layer_idx,
            ln1: LayerNorm::new(&format!("{prefix}.ln1"), config.n_embd),
            attn: CausalSelfAttention::new(config, layer_idx, backend, rng),
            ln2: LayerNorm::new(&format!("{prefix}.ln2"), config.n_embd),
            mlp: Mlp::new(config, layer_idx, backend, rng),
            drop1: Dropout::new(config.dropout),
            drop2: Dropout::new(config.dropout),
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.mlp.set_training(training);
        self.drop1.set_training(training);
        self.drop2.set_training(training);
    }

    pub fn forward<R: Rng + ?Sized>(&mut self, x: &Tensor, rng: &mut R) -> Tensor {
        trace!("Block {} forward: {:?}", self.layer_idx, x.shape());

        let a = self.ln1.forward(x);
        let a = self.attn.forward(&a);
        let a = self.drop1.forward(&a, rng);
        let x = ops::add(x, &a);

        let m = self.ln2.forward(&x);
        let m = self.mlp.forward(&m, rng);
        let m = self.drop2.forward(&m, rng);
        ops::add(&x, &m)
    }

    /// Each residual join adds the branch gradient to the pass-through one.
    pub fn backward(&mut self, grad_out: &Tensor) -> Tensor {
        let g = self.drop2.backward(grad_out);
        let g = self.mlp.backward(&g);
        let g = self.ln2.backward(&g);
        let mut dx_mid = grad_out.clone();
        ops::add_inplace(&mut dx_mid, &g);

        let g = self.drop1.backward(&dx_mid);
        let g = self.attn.backward(&g);
        let g = self.ln1.backward(&g);
        ops::add_inplace(&mut dx_mid, &g);
        dx_mid
    }
}

impl Module for Block {
    fn parameters(&self) -> Vec<&Parameter> {
        let mut p = self.ln1.parameters();
        p.extend(self.attn.parameters());
        p.extend(self.ln2.parameters());
        p.extend(self.mlp.parameters());
        p
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut p = self.ln1.parameters_mut();
        p.extend(self.attn.parameters_mut());
        p.extend(self.ln2.parameters_mut());
        p.extend(self.mlp.parameters_mut());
        p
    }
}
