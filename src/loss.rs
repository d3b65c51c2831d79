//! Softmax cross-entropy over the vocabulary axis.

use log::trace;

use crate::ops;
use crate::tensor::Tensor;

/// Probabilities are floored here before the log.
pub const PROB_FLOOR: f32 = 1e-10;

/// Mean negative log-likelihood of `targets` under `softmax(logits)`.
///
/// `logits` may be `[N, V]` or `[B, T, V]`; every leading axis counts as a
/// row. `forward` caches the probabilities that `backward` turns into
/// `(probs - onehot) / N`.
#[derive(Debug, Default)]
pub struct CrossEntropyLoss {
    probs: Option<Tensor>,
    targets: Vec<usize>,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forward(&mut self, logits: &Tensor, targets: &[usize]) -> f32 {
        let rows = logits.rows();
        let v = logits.last_dim();
        assert_eq!(
            targets.len(),
            rows,
            "cross entropy: {} targets for {} rows of {:?}",
            targets.len(),
            rows,
            logits.shape()
        );

        let probs = ops::softmax(logits);
        let mut total = 0.0f32;
        for (row, &target) in probs.data().chunks(v).zip(targets) {
            assert!(target < v, "cross entropy: target {target} >= vocab {v}");
            let p = row[target].max(PROB_FLOOR);
            total += -p.ln();
        }
        let loss = total / rows as f32;
        trace!("cross entropy: rows={rows} loss={loss}");

        self.probs = Some(probs);
        self.targets = targets.to_vec();
        loss
    }

    /// `dL/dlogits`, shaped like the logits passed to `forward`.
    pub fn backward(&self) -> Tensor {
        let mut grad = self
            .probs
            .clone()
            .unwrap_or_else(|| panic!("cross entropy: backward before forward"));
        let v = grad.last_dim();
        let scale = 1.0 / self.targets.len() as f32;
        for (row, &target) in grad.data_mut().chunks_mut(v).zip(&self.targets) {
            row[target] -= 1.0;
            row.iter_mut().for_each(|g| *g *= scale);
        }
        grad
    }
}

/// One-shot loss value without keeping a cache.
pub fn cross_entropy(logits: &Tensor, targets: &[usize]) -> f32 {
    CrossEntropyLoss::new().forward(logits, targets)
}
