//! Pruning reparameterization
//!
//! A pruned tensor `weight` is stored as the parameter `weight_orig` and the
//! buffer `weight_mask`; the forward pass sees their product. Applying and
//! removing are both idempotent per tensor.

use super::registry::ParamRegistry;
use crate::error::{Error, Result};
use crate::nn::{split_key, FusionReport, Module, StateTensor, MASK_SUFFIX, ORIG_SUFFIX};
use crate::Tensor;
use std::collections::BTreeMap;

/// Dotted mask buffer key -> binary mask
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MaskMap {
    masks: BTreeMap<String, Tensor>,
}

impl MaskMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, mask: Tensor) {
        self.masks.insert(key.into(), mask);
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.masks.get(key)
    }

    pub fn len(&self) -> usize {
        self.masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.masks.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.masks.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Fraction of zero entries across all masks
    pub fn sparsity(&self) -> f32 {
        let total: usize = self.masks.values().map(|m| m.len()).sum();
        if total == 0 {
            return 0.0;
        }
        let zeros: usize = self
            .masks
            .values()
            .map(|m| m.iter().filter(|&&v| v == 0.0).count())
            .sum();
        zeros as f32 / total as f32
    }
}

/// Reparameterize every registered tensor with an all-ones mask
///
/// Tensors that are already reparameterized are left alone.
pub fn dummy_pruning(model: &mut Module, registry: &ParamRegistry) -> Result<()> {
    for entry in registry.iter() {
        let module = model.submodule_mut(&entry.module)?;
        let Some(tensor) = module.remove_param(&entry.attr) else {
            continue;
        };
        let mask = Tensor::ones(tensor.raw_dim());
        module.add_param(format!("{}{ORIG_SUFFIX}", entry.attr), tensor);
        module.add_buffer(format!("{}{MASK_SUFFIX}", entry.attr), mask);
    }
    Ok(())
}

/// Bake `orig * mask` back into plain tensors and drop the masks
///
/// Registered tensors without reparameterization are left alone.
pub fn remove_pruning_reparameterization(model: &mut Module, registry: &ParamRegistry) -> Result<()> {
    for entry in registry.iter() {
        let module = model.submodule_mut(&entry.module)?;
        let Some(orig) = module.remove_param(&format!("{}{ORIG_SUFFIX}", entry.attr)) else {
            continue;
        };
        let plain = match module.remove_buffer(&format!("{}{MASK_SUFFIX}", entry.attr)) {
            Some(StateTensor::Float(mask)) => orig * mask,
            _ => orig,
        };
        module.add_param(entry.attr.clone(), plain);
    }
    Ok(())
}

/// Collect every float buffer whose key carries the mask marker
pub fn get_masks(model: &Module) -> MaskMap {
    let mut masks = MaskMap::new();
    for (key, tensor) in model.named_buffers() {
        if let (true, Some(t)) = (key.contains("mask"), tensor.as_float()) {
            masks.insert(key, t.clone());
        }
    }
    masks
}

/// Register every mask as a buffer at its key
///
/// The owning module must exist; the buffer is created or replaced.
pub fn install_masks(model: &mut Module, masks: &MaskMap) -> Result<()> {
    for (key, mask) in masks.iter() {
        let (path, attr) = split_key(key);
        model.submodule_mut(path)?.add_buffer(attr, mask.clone());
    }
    Ok(())
}

/// Re-enter a rebuilt (fused and prepared) model into the pruned state
///
/// Applies dummy pruning over a fresh registry and then overwrites every
/// dummy mask whose pre-fusion key is known. Dummy masks without a source
/// mask stay all-ones.
pub fn reinstall_masks(
    model: &mut Module,
    masks: &MaskMap,
    report: &FusionReport,
) -> Result<ParamRegistry> {
    let registry = ParamRegistry::from_model(model);
    dummy_pruning(model, &registry)?;
    let targets: Vec<(String, Vec<usize>)> = model
        .named_buffers()
        .into_iter()
        .filter(|(key, _)| key.ends_with(MASK_SUFFIX))
        .map(|(key, t)| (key, t.shape().to_vec()))
        .collect();
    for (key, shape) in targets {
        let Some(mask) = masks.get(&report.original_key(&key)) else {
            continue;
        };
        if mask.shape() != shape.as_slice() {
            return Err(Error::shape_mismatch(key, &shape, mask.shape()));
        }
        model.set_tensor(&key, mask.clone().into())?;
    }
    Ok(registry)
}
