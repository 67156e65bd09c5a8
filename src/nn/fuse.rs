//! Layer fusion
//!
//! Adjacent siblings inside a container are fused when they form one of the
//! patterns Conv2d+BatchNorm2d+ReLU, Conv2d+BatchNorm2d, Conv2d+ReLU or
//! Linear+ReLU. The fused module takes the first slot and every absorbed
//! slot becomes an `Identity`.
//!
//! A container in training mode keeps the batch norm as a `bn` child of a
//! `ConvBn2d` so that QAT can keep updating its statistics. In eval mode the
//! batch norm is folded into the convolution weights.

use super::forward::BN;
use super::layer::{ConvBnSpec, Layer};
use super::module::{join, Module};
use crate::error::{Error, Result};
use crate::Tensor;
use ndarray::IxDyn;
use std::collections::BTreeMap;

/// Fusible sibling pattern
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FusionPattern {
    ConvBnReLU,
    ConvBn,
    ConvReLU,
    LinearReLU,
}

impl FusionPattern {
    fn len(self) -> usize {
        match self {
            FusionPattern::ConvBnReLU => 3,
            _ => 2,
        }
    }
}

/// One fused group
#[derive(Clone, Debug, PartialEq)]
pub struct FusedGroup {
    pub pattern: FusionPattern,
    /// Full paths of the fused slots, first slot holds the result
    pub members: Vec<String>,
}

/// What fusion changed in the tree
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FusionReport {
    pub groups: Vec<FusedGroup>,
    /// New module path -> path the module had before fusion
    moved: BTreeMap<String, String>,
}

impl FusionReport {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Slots replaced by `Identity`
    pub fn absorbed(&self) -> Vec<&str> {
        self.groups
            .iter()
            .flat_map(|g| g.members.iter().skip(1).map(String::as_str))
            .collect()
    }

    /// Module paths that moved, as (new, original)
    pub fn moved(&self) -> impl Iterator<Item = (&str, &str)> {
        self.moved.iter().map(|(n, o)| (n.as_str(), o.as_str()))
    }

    /// Key a tensor had before fusion
    ///
    /// `features.0.bn.weight_mask` maps back to `features.1.weight_mask` when
    /// the batch norm at `features.1` was moved under `features.0`.
    pub fn original_key(&self, key: &str) -> String {
        self.moved
            .iter()
            .filter(|(new, _)| key.starts_with(&format!("{new}.")))
            .max_by_key(|(new, _)| new.len())
            .map_or_else(
                || key.to_string(),
                |(new, orig)| format!("{orig}{}", &key[new.len()..]),
            )
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Conv,
    Bn,
    Relu,
    Linear,
    Other,
}

fn kind_of(layer: &Layer) -> Kind {
    match layer {
        Layer::Conv2d(_) => Kind::Conv,
        Layer::BatchNorm2d(_) => Kind::Bn,
        Layer::ReLU => Kind::Relu,
        Layer::Linear(_) => Kind::Linear,
        _ => Kind::Other,
    }
}

fn match_pattern(kinds: &[Kind]) -> Option<FusionPattern> {
    match kinds {
        [Kind::Conv, Kind::Bn, Kind::Relu, ..] => Some(FusionPattern::ConvBnReLU),
        [Kind::Conv, Kind::Bn, ..] => Some(FusionPattern::ConvBn),
        [Kind::Conv, Kind::Relu, ..] => Some(FusionPattern::ConvReLU),
        [Kind::Linear, Kind::Relu, ..] => Some(FusionPattern::LinearReLU),
        _ => None,
    }
}

/// Fuse every fusible sibling sequence in the tree
///
/// Fails with [`Error::Unsupported`] while any module carries a pruning
/// reparameterization.
pub fn fuse_model(model: &mut Module) -> Result<FusionReport> {
    let reparameterized = model.reparameterized_paths();
    if !reparameterized.is_empty() {
        return Err(Error::Unsupported(format!(
            "fusion of reparameterized modules: {}",
            reparameterized.join(", ")
        )));
    }
    let mut report = FusionReport::default();
    fuse_children(model, "", &mut report)?;
    Ok(report)
}

fn fuse_children(module: &mut Module, path: &str, report: &mut FusionReport) -> Result<()> {
    let training = module.is_training();
    let slots = module.children_slots_mut();
    let mut i = 0;
    while i < slots.len() {
        let end = (i + 3).min(slots.len());
        let kinds: Vec<Kind> = slots[i..end].iter().map(|(_, m)| kind_of(m.layer())).collect();
        match match_pattern(&kinds) {
            Some(pattern) => {
                fuse_group(slots, i, pattern, path, training, report)?;
                i += pattern.len();
            }
            None => {
                let (name, child) = &mut slots[i];
                let child_path = join(path, name);
                fuse_children(child, &child_path, report)?;
                i += 1;
            }
        }
    }
    Ok(())
}

fn fuse_group(
    slots: &mut [(String, Module)],
    start: usize,
    pattern: FusionPattern,
    path: &str,
    training: bool,
    report: &mut FusionReport,
) -> Result<()> {
    let members: Vec<String> = slots[start..start + pattern.len()]
        .iter()
        .map(|(name, _)| join(path, name))
        .collect();
    let mut absorbed: Vec<Module> = slots[start + 1..start + pattern.len()]
        .iter_mut()
        .map(|(_, m)| {
            let mut placeholder = Module::identity();
            placeholder.train(training);
            std::mem::replace(m, placeholder)
        })
        .collect();
    let head = &mut slots[start].1;

    match pattern {
        FusionPattern::ConvBnReLU | FusionPattern::ConvBn => {
            let relu = pattern == FusionPattern::ConvBnReLU;
            let bn = absorbed.remove(0);
            let Some(&conv) = head.layer().conv_spec() else {
                return Err(Error::Unsupported("fusion head is not a convolution".into()));
            };
            let Layer::BatchNorm2d(bn_spec) = *bn.layer() else {
                return Err(Error::Unsupported("fusion expected BatchNorm2d".into()));
            };
            if bn_spec.num_features != conv.out_channels {
                return Err(Error::shape_mismatch(
                    format!("{} num_features", members[1]),
                    &[conv.out_channels],
                    &[bn_spec.num_features],
                ));
            }
            if training {
                head.set_layer(Layer::ConvBn2d(ConvBnSpec {
                    conv,
                    relu,
                    freeze_bn: false,
                }));
                head.add_child(BN, bn);
                report
                    .moved
                    .insert(join(&members[0], BN), members[1].clone());
            } else {
                fold_bn(head, &bn, relu)?;
            }
        }
        FusionPattern::ConvReLU => {
            let Some(&conv) = head.layer().conv_spec() else {
                return Err(Error::Unsupported("fusion head is not a convolution".into()));
            };
            head.set_layer(Layer::ConvReLU2d(conv));
        }
        FusionPattern::LinearReLU => {
            let Some(&linear) = head.layer().linear_spec() else {
                return Err(Error::Unsupported("fusion head is not linear".into()));
            };
            head.set_layer(Layer::LinearReLU(linear));
        }
    }
    report.groups.push(FusedGroup { pattern, members });
    Ok(())
}

/// Replace the conv weights with batch-norm-folded ones
fn fold_bn(conv: &mut Module, bn: &Module, relu: bool) -> Result<()> {
    let Some(&spec) = conv.layer().conv_spec() else {
        return Err(Error::Unsupported("fold target is not a convolution".into()));
    };
    let Layer::BatchNorm2d(bn_spec) = *bn.layer() else {
        return Err(Error::Unsupported("fold source is not BatchNorm2d".into()));
    };
    let weight = conv
        .param("weight")
        .cloned()
        .ok_or_else(|| Error::ModuleNotFound("conv weight".into()))?;
    let bias = conv
        .param("bias")
        .cloned()
        .unwrap_or_else(|| Tensor::zeros(IxDyn(&[spec.out_channels])));
    let (w, b) = bn.fold_into(&weight, &bias, bn_spec.eps)?;
    conv.add_param("weight", w);
    conv.add_param("bias", b);
    let spec = super::layer::Conv2dSpec { bias: true, ..spec };
    conv.set_layer(if relu {
        Layer::ConvReLU2d(spec)
    } else {
        Layer::Conv2d(spec)
    });
    Ok(())
}
