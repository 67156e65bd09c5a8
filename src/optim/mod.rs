//! Optimizers and learning rate schedules for the trainer

mod optimizer;
mod scheduler;
mod sgd;

pub use optimizer::Optimizer;
pub use scheduler::{build_scheduler, ConstantLR, LRScheduler, WarmupCosineLR};
pub use sgd::SGD;
