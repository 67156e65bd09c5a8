//! Classification losses

use crate::config::{param_f64, Params};
use crate::error::{Error, Result};
use crate::nn::ops::softmax;
use ndarray::Array2;

/// Loss over `[N, K]` logits and class targets
pub trait LossFn: Send {
    /// Mean loss over the batch and its gradient with respect to the logits
    fn forward(&self, logits: &Array2<f32>, targets: &[usize]) -> Result<(f32, Array2<f32>)>;

    fn name(&self) -> &str;
}

/// Softmax cross entropy with optional label smoothing
///
/// Targets become `(1 - eps) * one_hot + eps / K`; the gradient is
/// `(softmax - target) / N`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossEntropyLoss {
    label_smoothing: f32,
}

impl CrossEntropyLoss {
    pub fn new(label_smoothing: f32) -> Self {
        Self {
            label_smoothing: label_smoothing.clamp(0.0, 1.0),
        }
    }
}

impl LossFn for CrossEntropyLoss {
    fn forward(&self, logits: &Array2<f32>, targets: &[usize]) -> Result<(f32, Array2<f32>)> {
        let (n, k) = logits.dim();
        if targets.len() != n {
            return Err(Error::shape_mismatch("loss targets", &[n], &[targets.len()]));
        }
        if let Some(&bad) = targets.iter().find(|&&t| t >= k) {
            return Err(Error::Dataset(format!("target {bad} out of range for {k} logits")));
        }
        let probs = softmax(logits);
        let eps = self.label_smoothing;
        let off = eps / k as f32;
        let mut grad = probs.clone();
        let mut total = 0.0f32;
        for (i, &t) in targets.iter().enumerate() {
            for j in 0..k {
                let target = if j == t { 1.0 - eps + off } else { off };
                if target > 0.0 {
                    total -= target * probs[[i, j]].max(f32::MIN_POSITIVE).ln();
                }
                grad[[i, j]] -= target;
            }
        }
        let scale = 1.0 / n.max(1) as f32;
        grad.mapv_inplace(|g| g * scale);
        Ok((total * scale, grad))
    }

    fn name(&self) -> &str {
        "CrossEntropy"
    }
}

/// Criterion named by `CRITERION` with its `CRITERION_PARAMS`
pub fn build_criterion(name: &str, params: &Params) -> Result<Box<dyn LossFn>> {
    match name {
        "CrossEntropy" => {
            let smoothing = param_f64(params, "label_smoothing", 0.0)? as f32;
            Ok(Box::new(CrossEntropyLoss::new(smoothing)))
        }
        other => Err(Error::ConfigError(format!(
            "Unknown CRITERION: {other}. Valid criteria: CrossEntropy"
        ))),
    }
}
