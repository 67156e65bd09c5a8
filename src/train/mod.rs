//! Training loop
//!
//! - Cross-entropy loss with label smoothing
//! - Epoch loss and accuracy
//! - [`Trainer`] with checkpointing, resume and a pre-test hook

mod batch;
mod loss;
mod metrics;
mod trainer;


pub use batch::Batch;
pub use loss::{build_criterion, CrossEntropyLoss, LossFn};
pub use metrics::EpochMetrics;
pub use trainer::{
    classifier_head, evaluate, Device, TestHook, Trainer, TrainerOptions, BEST_CHECKPOINT,
    LAST_CHECKPOINT,
};
