//! Batched matrix-multiply kernels.
//!
//! Every layer that multiplies matrices is handed a [`MatmulBackend`] when it
//! is built. Both kernels compute each output cell with the same
//! `k = 0..K` summation order, so swapping one for the other never changes a
//! single bit of the result.

use log::info;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatmulBackend {
    /// Single-threaded triple loop.
    #[default]
    Naive,
    /// One rayon task per batch slice.
    Parallel,
}

impl MatmulBackend {
    pub fn name(&self) -> &'static str {
        match self {
            MatmulBackend::Naive => "naive",
            MatmulBackend::Parallel => "parallel",
        }
    }

    /// `out[b] = a[b] · rhs[b]` for `batch` independent `[m,k] × [k,n]` products.
    ///
    /// `out` is overwritten, not accumulated into.
    #[allow(clippy::too_many_arguments)]
    pub fn matmul(
        &self,
        a: &[f32],
        rhs: &[f32],
        out: &mut [f32],
        batch: usize,
        m: usize,
        k: usize,
        n: usize,
    ) {
        debug_assert_eq!(a.len(), batch * m * k);
        debug_assert_eq!(rhs.len(), batch * k * n);
        debug_assert_eq!(out.len(), batch * m * n);

        if m * n == 0 {
            return;
        }

        match self {
            MatmulBackend::Naive => {
                for (bi, out_b) in out.chunks_mut(m * n).enumerate() {
                    matmul_single(
                        &a[bi * m * k..(bi + 1) * m * k],
                        &rhs[bi * k * n..(bi + 1) * k * n],
                        out_b,
                        m,
                        k,
                        n,
                    );
                }
            }
            MatmulBackend::Parallel => {
                out.par_chunks_mut(m * n)
                    .enumerate()
                    .for_each(|(bi, out_b)| {
                        matmul_single(
                            &a[bi * m * k..(bi + 1) * m * k],
                            &rhs[bi * k * n..(bi + 1) * k * n],
                            out_b,
                            m,
                            k,
                            n,
                        );
                    });
            }
        }
    }
}

impl std::str::FromStr for MatmulBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "naive" => Ok(MatmulBackend::Naive),
            "parallel" | "rayon" => Ok(MatmulBackend::Parallel),
            other => Err(format!("unknown matmul backend '{other}' (naive|parallel)")),
        }
    }
}

#[inline]
fn matmul_single(a: &[f32], rhs: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    for i in 0..m {
        let a_row = &a[i * k..(i + 1) * k];
        for j in 0..n {
            let mut sum = 0.0f32;
            for (p, &av) in a_row.iter().enumerate() {
                sum += av * rhs[p * n + j];
            }
            out[i * n + j] = sum;
        }
    }
}

pub fn print_backend_info(backend: MatmulBackend) {
    match backend {
        MatmulBackend::Naive => info!("Matmul backend: naive (single thread)"),
        MatmulBackend::Parallel => info!(
            "Matmul backend: parallel (rayon, {} threads)",
            rayon::current_num_threads()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backends_are_bit_identical() {
        let batch = 3;
        let (m, k, n) = (4, 5, 6);
        let a: Vec<f32> = (0..batch * m * k).map(|i| (i as f32 * 0.37).sin()).collect();
        let b: Vec<f32> = (0..batch * k * n).map(|i| (i as f32 * 0.11).cos()).collect();

        let mut naive = vec![0.0; batch * m * n];
        let mut parallel = vec![1.0; batch * m * n];
        MatmulBackend::Naive.matmul(&a, &b, &mut naive, batch, m, k, n);
        MatmulBackend::Parallel.matmul(&a, &b, &mut parallel, batch, m, k, n);

        assert_eq!(naive, parallel);
    }

    #[test]
    fn test_parse_backend() {
        assert_eq!("naive".parse::<MatmulBackend>(), Ok(MatmulBackend::Naive));
        assert_eq!("Rayon".parse::<MatmulBackend>(), Ok(MatmulBackend::Parallel));
        assert!("cuda".parse::<MatmulBackend>().is_err());
    }
}
