//! Module tree, float kernels and fusion
//!
//! - [`Module`]: layer + named parameters, buffers and children
//! - [`StateDict`]: named tensor snapshot with strict loading
//! - [`Forward`]: float-in/float-out execution shared with scripted models
//! - [`fuse_model`]: sibling-pattern fusion

mod forward;
mod fuse;
mod layer;
mod module;
pub mod ops;
mod state;

#[cfg(test)]
mod tests;

pub use forward::{Activation, Forward, ACTIVATION_DTYPE, ACTIVATION_POST_PROCESS, BN, WEIGHT_FAKE_QUANT};
pub use fuse::{fuse_model, FusedGroup, FusionPattern, FusionReport};
pub use layer::{BaseKind, BatchNormSpec, Conv2dSpec, ConvBnSpec, Layer, LinearSpec};
pub use module::{join, split_key, Module, MASK_SUFFIX, ORIG_SUFFIX};
pub use state::{StateDict, StateTensor};
