//! Epoch-level classification metrics

use crate::nn::ops::argmax_rows;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Running loss and accuracy over the batches of one epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    loss_sum: f64,
    pub correct: usize,
    pub total: usize,
}

impl EpochMetrics {
    /// Add a batch with its mean loss
    pub fn update(&mut self, logits: &Array2<f32>, targets: &[usize], loss: f32) {
        self.correct += argmax_rows(logits)
            .iter()
            .zip(targets)
            .filter(|(p, t)| p == t)
            .count();
        self.loss_sum += f64::from(loss) * targets.len() as f64;
        self.total += targets.len();
    }

    /// Mean loss per sample
    pub fn loss(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.loss_sum / self.total as f64
        }
    }

    /// Top-1 accuracy in percent
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.correct as f64 / self.total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    #[test]
    fn test_accuracy_and_weighted_loss() {
        let mut m = EpochMetrics::default();
        m.update(&arr2(&[[0.9f32, 0.1], [0.2, 0.8]]), &[0, 0], 1.0);
        m.update(&arr2(&[[0.0f32, 1.0]]), &[1], 4.0);
        assert_eq!((m.correct, m.total), (2, 3));
        assert_abs_diff_eq!(m.accuracy(), 200.0 / 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(m.loss(), 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_empty_epoch() {
        assert_eq!(EpochMetrics::default().accuracy(), 0.0);
    }
}
