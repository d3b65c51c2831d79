//! Elementwise, matrix and reduction operators over [`Tensor`].
//!
//! Binary operators require identical shapes; nothing broadcasts. A shape
//! mismatch here is a programming error and panics.

use rand::Rng;

use crate::backend::MatmulBackend;
use crate::tensor::Tensor;

/// `sqrt(2 / pi)`
const GELU_SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_COEFF: f32 = 0.044_715;

// ─────────────────────────────────────────────────────────────────────────────
// Elementwise
// ─────────────────────────────────────────────────────────────────────────────

fn zip_with(a: &Tensor, b: &Tensor, op: &str, f: impl Fn(f32, f32) -> f32) -> Tensor {
    assert_eq!(
        a.shape(),
        b.shape(),
        "{op}: operand shapes differ ({:?} vs {:?})",
        a.shape(),
        b.shape()
    );
    let mut out = a.clone();
    out.data_mut()
        .iter_mut()
        .zip(b.data())
        .for_each(|(x, &y)| *x = f(*x, y));
    out
}

fn map(a: &Tensor, f: impl Fn(f32) -> f32) -> Tensor {
    let mut out = a.clone();
    out.data_mut().iter_mut().for_each(|x| *x = f(*x));
    out
}

pub fn add(a: &Tensor, b: &Tensor) -> Tensor {
    zip_with(a, b, "add", |x, y| x + y)
}

pub fn sub(a: &Tensor, b: &Tensor) -> Tensor {
    zip_with(a, b, "sub", |x, y| x - y)
}

pub fn mul(a: &Tensor, b: &Tensor) -> Tensor {
    zip_with(a, b, "mul", |x, y| x * y)
}

pub fn div(a: &Tensor, b: &Tensor) -> Tensor {
    zip_with(a, b, "div", |x, y| x / y)
}

/// `dst += src`, used at residual joins and gradient fan-in.
pub fn add_inplace(dst: &mut Tensor, src: &Tensor) {
    assert_eq!(
        dst.shape(),
        src.shape(),
        "add_inplace: operand shapes differ ({:?} vs {:?})",
        dst.shape(),
        src.shape()
    );
    dst.data_mut()
        .iter_mut()
        .zip(src.data())
        .for_each(|(x, &y)| *x += y);
}

pub fn scale(a: &Tensor, s: f32) -> Tensor {
    map(a, |x| x * s)
}

pub fn exp(a: &Tensor) -> Tensor {
    map(a, f32::exp)
}

pub fn log(a: &Tensor) -> Tensor {
    map(a, f32::ln)
}

pub fn clip(a: &Tensor, min: f32, max: f32) -> Tensor {
    map(a, |x| x.clamp(min, max))
}

// ─────────────────────────────────────────────────────────────────────────────
// Matmul / transpose
// ─────────────────────────────────────────────────────────────────────────────

/// Batched `[..., M, K] × [..., K, N] → [..., M, N]` with the naive kernel.
pub fn matmul(a: &Tensor, b: &Tensor) -> Tensor {
    matmul_with(MatmulBackend::Naive, a, b)
}

pub fn matmul_with(backend: MatmulBackend, a: &Tensor, b: &Tensor) -> Tensor {
    assert!(
        a.rank() >= 2 && a.rank() == b.rank(),
        "matmul: operands must have equal rank >= 2, got {:?} and {:?}",
        a.shape(),
        b.shape()
    );
    let r = a.rank();
    assert_eq!(
        &a.shape()[..r - 2],
        &b.shape()[..r - 2],
        "matmul: batch dimensions differ ({:?} vs {:?})",
        a.shape(),
        b.shape()
    );
    let (m, k) = (a.shape()[r - 2], a.shape()[r - 1]);
    let (k2, n) = (b.shape()[r - 2], b.shape()[r - 1]);
    assert_eq!(
        k, k2,
        "matmul: inner dimensions differ ({:?} x {:?})",
        a.shape(),
        b.shape()
    );

    let batch: usize = a.shape()[..r - 2].iter().product();
    let mut out_shape = a.shape()[..r - 2].to_vec();
    out_shape.extend_from_slice(&[m, n]);
    let mut out = Tensor::zeros(&out_shape);
    backend.matmul(a.data(), b.data(), out.data_mut(), batch, m, k, n);
    out
}

/// Swaps the last two axes into a freshly allocated, contiguous buffer.
pub fn transpose(a: &Tensor) -> Tensor {
    assert!(
        a.rank() >= 2,
        "transpose: need rank >= 2, got {:?}",
        a.shape()
    );
    let r = a.rank();
    let (rows, cols) = (a.shape()[r - 2], a.shape()[r - 1]);
    let batch: usize = a.shape()[..r - 2].iter().product();

    let mut out_shape = a.shape().to_vec();
    out_shape.swap(r - 2, r - 1);
    let mut out = Tensor::zeros(&out_shape);

    let src = a.data();
    let dst = out.data_mut();
    for bi in 0..batch {
        let off = bi * rows * cols;
        for i in 0..rows {
            for j in 0..cols {
                dst[off + j * rows + i] = src[off + i * cols + j];
            }
        }
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Softmax
// ─────────────────────────────────────────────────────────────────────────────

/// In-place stable softmax of one row. A row whose exponentials all vanish
/// (every entry `-inf`) is left as zeros.
pub fn softmax_row(row: &mut [f32]) {
    let max = row.iter().fold(-f32::MAX, |m, &x| m.max(x));
    let mut sum = 0.0f32;
    for x in row.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }
    if sum > 0.0 {
        for x in row.iter_mut() {
            *x /= sum;
        }
    }
}

/// Softmax over the last axis.
pub fn softmax(a: &Tensor) -> Tensor {
    let mut out = a.clone();
    let d = out.last_dim();
    if d > 0 {
        out.data_mut().chunks_mut(d).for_each(softmax_row);
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// GELU (tanh approximation)
// ─────────────────────────────────────────────────────────────────────────────

#[inline]
fn gelu_scalar(x: f32) -> f32 {
    let z = GELU_SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
    0.5 * x * (1.0 + z.tanh())
}

#[inline]
fn gelu_grad_scalar(x: f32) -> f32 {
    let z = GELU_SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
    let t = z.tanh();
    let dz = GELU_SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_COEFF * x * x);
    0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * dz
}

pub fn gelu(a: &Tensor) -> Tensor {
    map(a, gelu_scalar)
}

/// GELU forward returning `(output, cache)`; the cache is the pre-activation
/// input, which is what [`gelu_backward`] needs.
pub fn gelu_with_cache(a: &Tensor) -> (Tensor, Tensor) {
    (gelu(a), a.clone())
}

pub fn gelu_backward(input: &Tensor, grad_out: &Tensor) -> Tensor {
    zip_with(input, grad_out, "gelu_backward", |x, g| g * gelu_grad_scalar(x))
}

// ─────────────────────────────────────────────────────────────────────────────
// Dropout
// ─────────────────────────────────────────────────────────────────────────────

/// Inverted dropout. Returns `(output, mask)` where every mask entry is either
/// `0` or `1/(1-p)`, so `output = input * mask` and the backward pass is the
/// same product.
pub fn dropout<R: Rng + ?Sized>(a: &Tensor, p: f32, rng: &mut R) -> (Tensor, Tensor) {
    assert!(
        (0.0..1.0).contains(&p),
        "dropout probability must be in [0, 1), got {p}"
    );
    if p == 0.0 {
        return (a.clone(), Tensor::full(1.0, a.shape()));
    }
    let keep_scale = 1.0 / (1.0 - p);
    let mut mask = Tensor::zeros(a.shape());
    for m in mask.data_mut() {
        if rng.random::<f32>() > p {
            *m = keep_scale;
        }
    }
    (mul(a, &mask), mask)
}

// ─────────────────────────────────────────────────────────────────────────────
// Reductions over the last axis
// ─────────────────────────────────────────────────────────────────────────────

fn reduce_last(a: &Tensor, f: impl Fn(&[f32]) -> f32) -> Tensor {
    assert!(a.rank() >= 1, "reduction needs rank >= 1");
    let d = a.last_dim();
    let out_shape = &a.shape()[..a.rank() - 1];
    let data: Vec<f32> = if d == 0 {
        vec![f(&[]); out_shape.iter().product()]
    } else {
        a.data().chunks(d).map(f).collect()
    };
    Tensor::from_vec(data, out_shape).unwrap_or_else(|e| panic!("reduce_last: {e}"))
}

pub fn sum_last(a: &Tensor) -> Tensor {
    reduce_last(a, |row| row.iter().sum())
}

pub fn max_last(a: &Tensor) -> Tensor {
    reduce_last(a, |row| row.iter().fold(f32::NEG_INFINITY, |m, &x| m.max(x)))
}

/// Index of the largest entry of each row; the first index wins on ties.
pub fn argmax_row(row: &[f32]) -> usize {
    let mut best = 0;
    for (i, &x) in row.iter().enumerate() {
        if x > row[best] {
            best = i;
        }
    }
    best
}

pub fn argmax_last(a: &Tensor) -> Vec<usize> {
    let d = a.last_dim();
    assert!(d > 0, "argmax over an empty axis");
    a.data().chunks(d).map(argmax_row).collect()
}
