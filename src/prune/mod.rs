//! Pruning reparameterization and mask bookkeeping
//!
//! Checkpoints produced by a pruning run carry `<tensor>_orig` parameters
//! and `<tensor>_mask` buffers. This module rebuilds that structure on a
//! fresh model so such checkpoints load, bakes masks back into plain
//! tensors, and carries the masks across fusion, preparation and
//! conversion.

mod registry;
mod reparam;

#[cfg(test)]
mod tests;

pub use registry::{ParamRef, ParamRegistry};
pub use reparam::{
    dummy_pruning, get_masks, install_masks, reinstall_masks, remove_pruning_reparameterization,
    MaskMap,
};
