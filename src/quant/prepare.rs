//! Observer insertion and QAT controls

use super::observer::{observer_module, set_flag};
use super::qconfig::QConfig;
use crate::error::Result;
use crate::nn::{Layer, Module, ACTIVATION_POST_PROCESS, WEIGHT_FAKE_QUANT};

/// Set `qconfig` on every module in the tree
pub fn attach_qconfig(model: &mut Module, qconfig: QConfig) -> Result<()> {
    model.apply(&mut |_, m| {
        m.set_qconfig(Some(qconfig));
        Ok(())
    })
}

/// Insert static observers on quantizable modules
pub fn prepare(model: &mut Module) -> Result<()> {
    prepare_tree(model, false);
    Ok(())
}

/// Insert fake-quantizers for QAT and switch the model to training mode
///
/// Weighted layers also receive a `weight_fake_quant` child sized to their
/// output channels.
pub fn prepare_qat(model: &mut Module) -> Result<()> {
    prepare_tree(model, true);
    model.train(true);
    Ok(())
}

fn attaches_observer(layer: &Layer) -> bool {
    matches!(
        layer,
        Layer::QuantStub
            | Layer::Conv2d(_)
            | Layer::ConvReLU2d(_)
            | Layer::ConvBn2d(_)
            | Layer::Linear(_)
            | Layer::LinearReLU(_)
            | Layer::BatchNorm2d(_)
    )
}

fn weight_channels(layer: &Layer) -> Option<usize> {
    layer
        .conv_spec()
        .map(|s| s.out_channels)
        .or_else(|| layer.linear_spec().map(|s| s.out_features))
}

fn prepare_tree(module: &mut Module, qat: bool) {
    let layer = module.layer().clone();
    if let (Some(qconfig), true) = (module.qconfig().copied(), attaches_observer(&layer)) {
        if module.child(ACTIVATION_POST_PROCESS).is_none() {
            module.add_child(
                ACTIVATION_POST_PROCESS,
                observer_module(qconfig.activation, 1, qat),
            );
        }
        if let (true, Some(channels)) = (qat, weight_channels(&layer)) {
            if module.child(WEIGHT_FAKE_QUANT).is_none() {
                module.add_child(WEIGHT_FAKE_QUANT, observer_module(qconfig.weight, channels, true));
            }
        }
    }
    // The bn child of a fused conv is covered by the conv's observer
    if matches!(layer, Layer::ConvBn2d(_)) || layer.is_observer() {
        return;
    }
    for (_, child) in module.children_slots_mut().iter_mut() {
        if !child.layer().is_observer() {
            prepare_tree(child, qat);
        }
    }
}

/// Freeze observer ranges of every fake-quantizer
pub fn disable_observer(model: &mut Module) -> Result<()> {
    model.apply(&mut |_, m| {
        if matches!(m.layer(), Layer::FakeQuantize(_)) {
            set_flag(m, "observer_enabled", false);
        }
        Ok(())
    })
}

pub fn enable_observer(model: &mut Module) -> Result<()> {
    model.apply(&mut |_, m| {
        if matches!(m.layer(), Layer::FakeQuantize(_)) {
            set_flag(m, "observer_enabled", true);
        }
        Ok(())
    })
}

/// Stop fused conv-bn modules from updating running statistics
pub fn freeze_bn_stats(model: &mut Module) -> Result<()> {
    model.apply(&mut |_, m| {
        if let Layer::ConvBn2d(spec) = m.layer() {
            let mut spec = *spec;
            spec.freeze_bn = true;
            m.set_layer(Layer::ConvBn2d(spec));
        }
        Ok(())
    })
}
