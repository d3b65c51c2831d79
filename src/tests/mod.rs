// ═════════════════════════════════════════════════════════════════════════════
// Test suite
// ═════════════════════════════════════════════════════════════════════════════

mod test_engine;
mod test_layers;
mod test_tensor;
mod test_tokenizer;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::GptConfig;
use crate::tensor::Tensor;

pub(crate) fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// 1 layer, 2 heads, 8 channels, no dropout.
pub(crate) fn tiny_config() -> GptConfig {
    GptConfig {
        vocab_size: 11,
        block_size: 8,
        n_layer: 1,
        n_head: 2,
        n_embd: 8,
        dropout: 0.0,
    }
}

pub(crate) fn assert_all_finite(name: &str, xs: &[f32]) {
    for (i, &x) in xs.iter().enumerate() {
        assert!(x.is_finite(), "{name}: non-finite at idx={i}: {x}");
    }
}

/// Mean cross-entropy computed in f64, for finite-difference checks.
pub(crate) fn cross_entropy_f64(logits: &Tensor, targets: &[usize]) -> f64 {
    let v = logits.last_dim();
    let mut total = 0.0f64;
    for (row, &t) in logits.data().chunks(v).zip(targets) {
        let max = row.iter().fold(f64::NEG_INFINITY, |m, &x| m.max(x as f64));
        let lse = row.iter().map(|&x| (x as f64 - max).exp()).sum::<f64>().ln() + max;
        total += lse - row[t] as f64;
    }
    total / targets.len() as f64
}

/// Central difference of `f` w.r.t. `values[i]`, divided by the step that was
/// actually representable in f32.
pub(crate) fn central_difference(
    values: &mut [f32],
    i: usize,
    eps: f32,
    mut f: impl FnMut(&[f32]) -> f64,
) -> f64 {
    let orig = values[i];
    let plus = orig + eps;
    let minus = orig - eps;
    values[i] = plus;
    let f_plus = f(values);
    values[i] = minus;
    let f_minus = f(values);
    values[i] = orig;
    (f_plus - f_minus) / (plus as f64 - minus as f64)
}

/// Largest accepted gap between an analytic gradient and a central difference
/// taken with a 1e-3 step on a mean-scaled objective.
pub(crate) const GRAD_TOL: f64 = 1e-4;

/// Analytic vs numeric gradient, absolute tolerance.
pub(crate) fn assert_grad_close(what: &str, analytic: f32, numeric: f64) {
    let diff = (analytic as f64 - numeric).abs();
    assert!(
        diff <= GRAD_TOL,
        "{what}: analytic {analytic} vs numeric {numeric} (diff {diff})"
    );
}

/// `sum(y * proj)` in f64; with `proj` as the upstream gradient this is the
/// scalar whose derivative backward computes.
pub(crate) fn project(y: &Tensor, proj: &Tensor) -> f64 {
    y.data()
        .iter()
        .zip(proj.data())
        .map(|(&a, &b)| a as f64 * b as f64)
        .sum()
}
