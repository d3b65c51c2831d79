// src/sampling.rs

//! Sampling strategies for text generation
//!
//! Filters work on a single row of logits and return a new row; filtered
//! entries become `-inf` so the following softmax gives them zero mass.

use log::{debug, trace};
use rand::Rng;

use crate::error::{Result, TensorError};
use crate::ops;
use crate::tensor::Tensor;

/// Inverse-CDF draw: the first index whose running sum exceeds a uniform
/// `r` in `[0, 1)`. Rounding can leave the total just under `r`; the last
/// index with non-zero mass is returned then.
pub fn sample_multinomial<R: Rng + ?Sized>(probs: &[f32], rng: &mut R) -> usize {
    assert!(!probs.is_empty(), "cannot sample from an empty distribution");
    let r: f32 = rng.random();
    let mut cum = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cum += p;
        if r < cum {
            return i;
        }
    }
    // Numerical fallback
    probs
        .iter()
        .rposition(|&p| p > 0.0)
        .unwrap_or(probs.len() - 1)
}

/// Indices sorted by value, largest first; ties keep ascending index order.
fn sorted_desc(values: &[f32]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by(|&a, &b| {
        values[b]
            .partial_cmp(&values[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    idx
}

// ═════════════════════════════════════════════════════════════════════════════
// Temperature scaling
// ═════════════════════════════════════════════════════════════════════════════

pub fn apply_temperature(logits: &[f32], temperature: f32) -> Vec<f32> {
    if temperature == 1.0 {
        return logits.to_vec();
    }
    assert!(
        temperature > 0.0,
        "Temperature must be positive, got {}",
        temperature
    );
    trace!("Applying temperature scaling: {}", temperature);
    logits.iter().map(|&x| x / temperature).collect()
}

// ═════════════════════════════════════════════════════════════════════════════
// Top-k filtering
// ═════════════════════════════════════════════════════════════════════════════

/// Keeps exactly the `k` largest logits. `k == 0` or `k >= len` is a no-op.
pub fn top_k_filter(logits: &[f32], k: usize) -> Vec<f32> {
    if k == 0 || k >= logits.len() {
        return logits.to_vec();
    }
    let mut out = vec![f32::NEG_INFINITY; logits.len()];
    for &i in sorted_desc(logits).iter().take(k) {
        out[i] = logits[i];
    }
    out
}

// ═════════════════════════════════════════════════════════════════════════════
// Top-p (nucleus) filtering
// ═════════════════════════════════════════════════════════════════════════════

/// Keeps the smallest set of most probable entries whose cumulative
/// probability reaches `p`. `p >= 1` is a no-op.
pub fn top_p_filter(logits: &[f32], p: f32) -> Vec<f32> {
    if p >= 1.0 {
        return logits.to_vec();
    }
    let mut probs = logits.to_vec();
    ops::softmax_row(&mut probs);
    let order = sorted_desc(&probs);

    let mut cutoff = order.len();
    let mut cum = 0.0f32;
    for (rank, &i) in order.iter().enumerate() {
        cum += probs[i];
        if cum >= p {
            cutoff = rank + 1;
            break;
        }
    }
    trace!("top-p {}: keeping {} of {}", p, cutoff, logits.len());

    let mut out = vec![f32::NEG_INFINITY; logits.len()];
    for &i in &order[..cutoff] {
        out[i] = logits[i];
    }
    out
}

// ═════════════════════════════════════════════════════════════════════════════
// Sampling functions
// ═════════════════════════════════════════════════════════════════════════════

pub fn sample_greedy(logits: &[f32]) -> usize {
    ops::argmax_row(logits)
}

/// Filtered distribution for one row: temperature, then top-k, then top-p,
/// then softmax.
pub fn filtered_probs(logits: &[f32], temperature: f32, top_k: usize, top_p: f32) -> Vec<f32> {
    let mut row = apply_temperature(logits, temperature);
    if top_k > 0 {
        row = top_k_filter(&row, top_k);
    }
    if top_p < 1.0 {
        row = top_p_filter(&row, top_p);
    }
    ops::softmax_row(&mut row);
    row
}

pub fn sample_from_logits<R: Rng + ?Sized>(
    logits: &[f32],
    temperature: f32,
    top_k: usize,
    top_p: f32,
    rng: &mut R,
) -> usize {
    let probs = filtered_probs(logits, temperature, top_k, top_p);
    sample_multinomial(&probs, rng)
}

/// One token per row of `[B, V]` logits.
pub fn sample_with_policy<R: Rng + ?Sized>(
    logits_last: &Tensor,
    policy: SamplingPolicy,
    rng: &mut R,
) -> Vec<usize> {
    let v = logits_last.last_dim();
    let out: Vec<usize> = logits_last
        .data()
        .chunks(v)
        .map(|row| match policy {
            SamplingPolicy::Greedy => sample_greedy(row),
            SamplingPolicy::Stochastic {
                temperature,
                top_k,
                top_p,
            } => sample_from_logits(row, temperature, top_k, top_p, rng),
        })
        .collect();
    debug!("Sampled {:?} with {:?}", out, policy);
    out
}

// ═════════════════════════════════════════════════════════════════════════════
// Utility functions
// ═════════════════════════════════════════════════════════════════════════════

/// Extract last timestep logits from [B, T, V] -> [B, V]
pub fn extract_last_logits(logits: &Tensor) -> Tensor {
    assert_eq!(logits.rank(), 3, "expected [B, T, V], got {:?}", logits.shape());
    let (b, t, v) = (logits.shape()[0], logits.shape()[1], logits.shape()[2]);
    assert!(t > 0, "cannot take the last step of an empty sequence");
    let mut data = Vec::with_capacity(b * v);
    for bi in 0..b {
        let start = (bi * t + t - 1) * v;
        data.extend_from_slice(&logits.data()[start..start + v]);
    }
    Tensor::from_vec(data, &[b, v]).unwrap_or_else(|e| panic!("extract_last_logits: {e}"))
}

// ═════════════════════════════════════════════════════════════════════════════
// Sampling policy enum
// ═════════════════════════════════════════════════════════════════════════════

/// Sampling policy to inject into the engine
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SamplingPolicy {
    Greedy,
    /// `top_k == 0` and `top_p >= 1` disable the respective filter.
    Stochastic {
        temperature: f32,
        top_k: usize,
        top_p: f32,
    },
}

impl SamplingPolicy {
    /// Policy from user-facing settings. Temperature 0 means greedy; a
    /// negative or non-finite temperature and a `top_p` outside `(0, 1]` are
    /// rejected.
    pub fn from_settings(temperature: f32, top_k: usize, top_p: f32) -> Result<Self> {
        if !temperature.is_finite() || temperature < 0.0 {
            return Err(TensorError::InvalidConfig(format!(
                "temperature must be a finite value >= 0, got {}",
                temperature
            )));
        }
        if !(top_p > 0.0 && top_p <= 1.0) {
            return Err(TensorError::InvalidConfig(format!(
                "top_p must be in (0, 1], got {}",
                top_p
            )));
        }
        if temperature == 0.0 {
            return Ok(SamplingPolicy::Greedy);
        }
        Ok(SamplingPolicy::Stochastic {
            temperature,
            top_k,
            top_p,
        })
    }

    /// Plain multinomial draw from the raw softmax.
    pub fn unfiltered() -> Self {
        SamplingPolicy::Stochastic {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
        }
    }

    pub fn temperature(t: f32) -> Self {
        SamplingPolicy::Stochastic {
            temperature: t,
            top_k: 0,
            top_p: 1.0,
        }
    }

    pub fn top_k(k: usize) -> Self {
        SamplingPolicy::Stochastic {
            temperature: 1.0,
            top_k: k,
            top_p: 1.0,
        }
    }

    pub fn top_p(p: f32) -> Self {
        SamplingPolicy::Stochastic {
            temperature: 1.0,
            top_k: 0,
            top_p: p,
        }
    }
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self::unfiltered()
    }
}
