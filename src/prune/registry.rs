//! Registry of prunable tensors

use crate::nn::{join, BaseKind, Module, ORIG_SUFFIX};

/// Tensor attributes that can be pruned
const PRUNABLE_ATTRS: [&str; 2] = ["weight", "bias"];

/// One prunable tensor: module path plus attribute name
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamRef {
    pub module: String,
    pub attr: String,
    pub kind: BaseKind,
}

impl ParamRef {
    /// Full dotted key of the plain tensor
    pub fn key(&self) -> String {
        join(&self.module, &self.attr)
    }
}

/// Ordered prunable tensors of a model
///
/// Built from the live graph; it refers to modules by path, so it must be
/// rebuilt whenever fusion or preparation replaces module instances.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParamRegistry {
    entries: Vec<ParamRef>,
}

impl ParamRegistry {
    /// Weight and bias of every Conv2d, BatchNorm2d and Linear (fused
    /// variants included), whether or not currently reparameterized
    pub fn from_model(model: &Module) -> Self {
        let mut entries = Vec::new();
        for (path, module) in model.named_modules() {
            let Some(kind) = module.layer().base_kind() else {
                continue;
            };
            for attr in PRUNABLE_ATTRS {
                let present = module.param(attr).is_some()
                    || module.param(&format!("{attr}{ORIG_SUFFIX}")).is_some();
                if present {
                    entries.push(ParamRef {
                        module: path.clone(),
                        attr: attr.to_string(),
                        kind,
                    });
                }
            }
        }
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParamRef> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Full keys of the registered tensors
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(ParamRef::key).collect()
    }
}
