//! Float-to-integer conversion strategy shared with the trainer's test hook

use crate::error::{Error, Result};
use crate::nn::Module;
use crate::prune::{install_masks, remove_pruning_reparameterization, MaskMap, ParamRegistry};
use crate::quant::convert;
use std::sync::{Arc, OnceLock};

/// Converts a copy of a prepared model and re-attaches the pruning masks
///
/// Clones share the mask mapping, which is set once during initialization
/// and read-only afterwards.
#[derive(Clone, Debug, Default)]
pub struct QuantizeFn {
    masks: Arc<OnceLock<MaskMap>>,
}

impl QuantizeFn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the masks of a pruned checkpoint
    pub fn set_masks(&self, masks: MaskMap) -> Result<()> {
        self.masks
            .set(masks)
            .map_err(|_| Error::Unsupported("pruning masks are already set".into()))
    }

    pub fn masks(&self) -> Option<&MaskMap> {
        self.masks.get()
    }

    /// Integer model for `model`; `model` itself is not modified
    ///
    /// The copy has its reparameterization baked in before conversion, and
    /// the masks are registered on the result under their original keys.
    pub fn quantize(&self, model: &Module) -> Result<Module> {
        let mut copy = model.clone();
        copy.eval();
        let registry = ParamRegistry::from_model(&copy);
        remove_pruning_reparameterization(&mut copy, &registry)?;
        let mut quantized = convert(&copy)?;
        if let Some(masks) = self.masks.get() {
            install_masks(&mut quantized, masks)?;
        }
        Ok(quantized)
    }
}
