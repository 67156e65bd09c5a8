//! Stochastic Gradient Descent optimizer

use super::Optimizer;
use crate::Tensor;
use std::collections::HashMap;

/// SGD with momentum, L2 weight decay and optional Nesterov momentum
///
/// ```text
/// g = grad + weight_decay * p
/// v = momentum * v + g            (v = g on the first step)
/// p -= lr * (nesterov ? g + momentum * v : v)
/// ```
#[derive(Debug, Clone)]
pub struct SGD {
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    nesterov: bool,
    velocities: HashMap<String, Tensor>,
}

impl SGD {
    pub fn new(lr: f32, momentum: f32) -> Self {
        Self {
            lr,
            momentum,
            weight_decay: 0.0,
            nesterov: false,
            velocities: HashMap::new(),
        }
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_nesterov(mut self, nesterov: bool) -> Self {
        self.nesterov = nesterov;
        self
    }

    /// Momentum buffer of a parameter
    pub fn velocity(&self, key: &str) -> Option<&Tensor> {
        self.velocities.get(key)
    }
}

impl Optimizer for SGD {
    fn step(&mut self, key: &str, param: &mut Tensor, grad: &Tensor) {
        let mut g = grad.clone();
        if self.weight_decay != 0.0 {
            g.scaled_add(self.weight_decay, &*param);
        }
        if self.momentum > 0.0 {
            let momentum = self.momentum;
            let v = self
                .velocities
                .entry(key.to_string())
                .and_modify(|v| {
                    v.mapv_inplace(|x| x * momentum);
                    *v += &g;
                })
                .or_insert_with(|| g.clone());
            if self.nesterov {
                g.scaled_add(self.momentum, &*v);
            } else {
                g.assign(&*v);
            }
        }
        param.scaled_add(-self.lr, &g);
    }

    fn reset(&mut self) {
        self.velocities.clear();
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    fn t(values: &[f32]) -> Tensor {
        arr1(values).into_dyn()
    }

    #[test]
    fn test_plain_sgd_step() {
        let mut opt = SGD::new(0.1, 0.0);
        let mut p = t(&[1.0, -2.0]);
        opt.step("w", &mut p, &t(&[1.0, 1.0]));
        assert_abs_diff_eq!(p[[0]], 0.9, epsilon = 1e-6);
        assert_abs_diff_eq!(p[[1]], -2.1, epsilon = 1e-6);
        assert!(opt.velocity("w").is_none());
    }

    #[test]
    fn test_momentum_accumulates_per_key() {
        let mut opt = SGD::new(1.0, 0.5);
        let mut p = t(&[0.0]);
        let g = t(&[1.0]);
        opt.step("w", &mut p, &g);
        opt.step("w", &mut p, &g);
        // v1 = 1, v2 = 0.5 + 1 = 1.5
        assert_abs_diff_eq!(p[[0]], -2.5, epsilon = 1e-6);
        assert_abs_diff_eq!(opt.velocity("w").unwrap()[[0]], 1.5, epsilon = 1e-6);

        let mut q = t(&[0.0]);
        opt.step("b", &mut q, &g);
        assert_abs_diff_eq!(q[[0]], -1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_nesterov_and_weight_decay() {
        let mut opt = SGD::new(0.1, 0.9).with_nesterov(true).with_weight_decay(0.5);
        let mut p = t(&[2.0]);
        opt.step("w", &mut p, &t(&[0.0]));
        // g = 1.0, v = 1.0, update = g + 0.9 * v = 1.9
        assert_abs_diff_eq!(p[[0]], 2.0 - 0.19, epsilon = 1e-6);
    }

    #[test]
    fn test_reset_clears_velocities() {
        let mut opt = SGD::new(0.1, 0.9);
        let mut p = t(&[0.0]);
        opt.step("w", &mut p, &t(&[1.0]));
        opt.reset();
        assert!(opt.velocity("w").is_none());
        opt.set_lr(0.01);
        assert_abs_diff_eq!(opt.lr(), 0.01);
    }
}
