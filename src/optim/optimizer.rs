//! Optimizer trait

use crate::Tensor;

/// Gradient-based parameter update
///
/// Parameters are identified by their dotted state-dict key so optimizer
/// state survives the module tree being rebuilt between steps.
pub trait Optimizer {
    /// Update `param` in place from `grad`
    fn step(&mut self, key: &str, param: &mut Tensor, grad: &Tensor);

    /// Drop per-parameter state such as momentum buffers
    fn reset(&mut self);

    fn lr(&self) -> f32;

    fn set_lr(&mut self, lr: f32);
}
