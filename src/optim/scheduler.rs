//! Learning rate schedules
//!
//! Schedules are stepped once per epoch:
//! - `Constant` keeps the base rate
//! - `WarmupCosineLR` ramps linearly from `start_lr` to the base rate over
//!   `warmup_epochs`, then decays along a cosine to `end_lr`

use crate::config::{param_f64, param_usize, Params};
use crate::error::{Error, Result};
use std::f32::consts::PI;

/// Learning rate scheduler trait
pub trait LRScheduler: Send {
    /// Learning rate for the current epoch
    fn get_lr(&self) -> f32;

    /// Advance one epoch
    fn step(&mut self);

    /// Jump to an epoch (used when resuming)
    fn set_epoch(&mut self, epoch: usize);
}

/// Fixed learning rate
#[derive(Debug, Clone)]
pub struct ConstantLR {
    lr: f32,
}

impl ConstantLR {
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }
}

impl LRScheduler for ConstantLR {
    fn get_lr(&self) -> f32 {
        self.lr
    }

    fn step(&mut self) {}

    fn set_epoch(&mut self, _epoch: usize) {}
}

/// Linear warmup followed by cosine decay
#[derive(Debug, Clone)]
pub struct WarmupCosineLR {
    lr_max: f32,
    start_lr: f32,
    end_lr: f32,
    warmup_epochs: usize,
    total_epochs: usize,
    epoch: usize,
}

impl WarmupCosineLR {
    pub fn new(lr_max: f32, total_epochs: usize, warmup_epochs: usize) -> Self {
        Self {
            lr_max,
            start_lr: 0.0,
            end_lr: 0.0,
            warmup_epochs,
            total_epochs,
            epoch: 0,
        }
    }

    pub fn with_start_lr(mut self, start_lr: f32) -> Self {
        self.start_lr = start_lr;
        self
    }

    pub fn with_end_lr(mut self, end_lr: f32) -> Self {
        self.end_lr = end_lr;
        self
    }
}

impl LRScheduler for WarmupCosineLR {
    fn get_lr(&self) -> f32 {
        if self.epoch < self.warmup_epochs {
            let progress = self.epoch as f32 / self.warmup_epochs as f32;
            return self.start_lr + (self.lr_max - self.start_lr) * progress;
        }
        let decay_epochs = self.total_epochs.saturating_sub(self.warmup_epochs);
        let decay_epoch = self.epoch - self.warmup_epochs;
        if decay_epochs == 0 || decay_epoch >= decay_epochs {
            return self.end_lr;
        }
        let progress = decay_epoch as f32 / decay_epochs as f32;
        self.end_lr + (self.lr_max - self.end_lr) * 0.5 * (1.0 + (PI * progress).cos())
    }

    fn step(&mut self) {
        self.epoch += 1;
    }

    fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }
}

/// Schedule named by `LR_SCHEDULER` with its `LR_SCHEDULER_PARAMS`
pub fn build_scheduler(
    name: &str,
    params: &Params,
    lr: f32,
    epochs: usize,
) -> Result<Box<dyn LRScheduler>> {
    match name {
        "Constant" => Ok(Box::new(ConstantLR::new(lr))),
        "WarmupCosineLR" => {
            let warmup = param_usize(params, "warmup_epochs", 0)?;
            let start_lr = param_f64(params, "start_lr", 0.0)? as f32;
            let end_lr = param_f64(params, "end_lr", 0.0)? as f32;
            Ok(Box::new(
                WarmupCosineLR::new(lr, epochs, warmup)
                    .with_start_lr(start_lr)
                    .with_end_lr(end_lr),
            ))
        }
        other => Err(Error::ConfigError(format!(
            "Unknown LR_SCHEDULER: {other}. Valid schedulers: Constant, WarmupCosineLR"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_warmup_rises_linearly_from_start_lr() {
        let mut s = WarmupCosineLR::new(0.1, 10, 4).with_start_lr(0.02);
        assert_abs_diff_eq!(s.get_lr(), 0.02, epsilon = 1e-7);
        s.step();
        s.step();
        assert_abs_diff_eq!(s.get_lr(), 0.06, epsilon = 1e-7);
    }

    #[test]
    fn test_cosine_phase_peaks_then_decays_to_end() {
        let mut s = WarmupCosineLR::new(1.0, 6, 2).with_end_lr(0.1);
        s.set_epoch(2);
        assert_abs_diff_eq!(s.get_lr(), 1.0, epsilon = 1e-6);
        s.set_epoch(4);
        assert_abs_diff_eq!(s.get_lr(), 0.55, epsilon = 1e-6);
        s.set_epoch(6);
        assert_abs_diff_eq!(s.get_lr(), 0.1, epsilon = 1e-6);
    }

    #[test]
    fn test_cosine_decreases_monotonically() {
        let mut s = WarmupCosineLR::new(1.0, 20, 0);
        let mut prev = s.get_lr();
        for _ in 0..20 {
            s.step();
            let lr = s.get_lr();
            assert!(lr <= prev);
            prev = lr;
        }
    }

    #[test]
    fn test_build_scheduler_from_params() {
        let params: Params = serde_json::from_str(r#"{"warmup_epochs": 3, "start_lr": 0.001}"#).unwrap();
        let s = build_scheduler("WarmupCosineLR", &params, 0.1, 5).unwrap();
        assert_abs_diff_eq!(s.get_lr(), 0.001, epsilon = 1e-7);

        let mut c = build_scheduler("Constant", &Params::new(), 0.1, 5).unwrap();
        c.step();
        assert_abs_diff_eq!(c.get_lr(), 0.1);

        assert!(matches!(
            build_scheduler("OneCycle", &Params::new(), 0.1, 5),
            Err(Error::ConfigError(_))
        ));
    }
}
