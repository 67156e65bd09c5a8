//! Conversion of a prepared float model to integer kernels
//!
//! ConvBn2d folds its batch norm first. Weights are quantized with the
//! qparams of their weight observer and outputs take the qparams of the
//! activation observer. Observers do not survive conversion.

use super::observer::{flag, module_qparams, observe, observer_module, to_qscheme};
use super::qtensor::QTensor;
use crate::error::{Error, Result};
use crate::nn::{
    join, Conv2dSpec, Layer, LinearSpec, Module, ACTIVATION_DTYPE, ACTIVATION_POST_PROCESS, BN,
    WEIGHT_FAKE_QUANT,
};
use crate::Tensor;
use ndarray::IxDyn;

/// Convert a prepared model, leaving the input untouched
///
/// Fails with [`Error::Unsupported`] if any module still carries a pruning
/// reparameterization or if a batch norm was left unfused.
pub fn convert(model: &Module) -> Result<Module> {
    let reparameterized = model.reparameterized_paths();
    if !reparameterized.is_empty() {
        return Err(Error::Unsupported(format!(
            "conversion of reparameterized modules: {}",
            reparameterized.join(", ")
        )));
    }
    let mut converted = convert_module(model, "")?;
    converted.eval();
    Ok(converted)
}

fn convert_module(module: &Module, path: &str) -> Result<Module> {
    let observer = module.child(ACTIVATION_POST_PROCESS);
    match (module.layer(), observer) {
        (Layer::QuantStub, Some(obs)) => {
            let (_, scales, zps) = module_qparams(obs)?;
            let mut out = Module::new(Layer::Quantize {
                dtype: ACTIVATION_DTYPE,
            });
            set_output_qparams(&mut out, &scales, &zps);
            Ok(out)
        }
        (Layer::DeQuantStub, _) => Ok(Module::new(Layer::DeQuantize)),
        (Layer::Conv2d(_) | Layer::ConvReLU2d(_) | Layer::ConvBn2d(_), Some(obs)) => {
            convert_conv(module, obs, path)
        }
        (Layer::Linear(spec) | Layer::LinearReLU(spec), Some(obs)) => {
            convert_linear(module, *spec, obs, path)
        }
        (Layer::BatchNorm2d(_), Some(_)) => Err(Error::Unsupported(format!(
            "standalone BatchNorm2d at '{path}' must be fused before conversion"
        ))),
        _ => {
            let mut out = Module::new(module.layer().clone());
            out.set_qconfig(module.qconfig().copied());
            for (name, tensor) in module.params() {
                out.add_param(name, tensor.clone());
            }
            for (name, tensor) in module.buffers() {
                out.add_buffer(name, tensor.clone());
            }
            for (name, child) in module.children() {
                if child.layer().is_observer() {
                    continue;
                }
                out.add_child(name, convert_module(child, &join(path, name))?);
            }
            Ok(out)
        }
    }
}

fn set_output_qparams(module: &mut Module, scales: &[f32], zero_points: &[i32]) {
    let scale = scales.first().copied().unwrap_or(1.0);
    let zero_point = zero_points.first().copied().unwrap_or(0);
    module.add_buffer("scale", Tensor::from_elem(IxDyn(&[1]), scale));
    module.add_buffer("zero_point", Tensor::from_elem(IxDyn(&[1]), zero_point as f32));
}

fn plain(module: &Module, name: &str, path: &str) -> Result<Tensor> {
    module
        .param(name)
        .cloned()
        .ok_or_else(|| Error::ModuleNotFound(join(path, name)))
}

/// Quantize `weight` with the module's weight observer
///
/// QAT modules reuse their `weight_fake_quant` state; static modules get a
/// fresh observer built from their qconfig.
fn quantize_weight(module: &Module, weight: &Tensor, path: &str) -> Result<QTensor> {
    let channels = weight.shape().first().copied().unwrap_or(1);
    let mut observer = match module.child(WEIGHT_FAKE_QUANT) {
        Some(fq) => fq.clone(),
        None => {
            let qconfig = module.qconfig().ok_or_else(|| {
                Error::Unsupported(format!("'{path}' has an observer but no qconfig"))
            })?;
            observer_module(qconfig.weight, channels, false)
        }
    };
    if flag(&observer, "observer_enabled") {
        observe(&mut observer, weight)?;
    }
    let (spec, scales, zps) = module_qparams(&observer)?;
    QTensor::quantize(weight, spec.dtype, to_qscheme(&spec, scales, zps))
}

fn convert_conv(module: &Module, obs: &Module, path: &str) -> Result<Module> {
    let Some(&spec) = module.layer().conv_spec() else {
        return Err(Error::Unsupported(format!("'{path}' is not a convolution")));
    };
    let weight = plain(module, "weight", path)?;
    let bias = module
        .param("bias")
        .cloned()
        .unwrap_or_else(|| Tensor::zeros(IxDyn(&[spec.out_channels])));
    let (weight, bias) = match module.layer() {
        Layer::ConvBn2d(_) => {
            let bn = module
                .child(BN)
                .ok_or_else(|| Error::ModuleNotFound(join(path, BN)))?;
            let Layer::BatchNorm2d(bn_spec) = *bn.layer() else {
                return Err(Error::Unsupported(format!("'{path}.bn' is not BatchNorm2d")));
            };
            bn.fold_into(&weight, &bias, bn_spec.eps)?
        }
        _ => (weight, bias),
    };

    let qweight = quantize_weight(module, &weight, path)?;
    let (_, scales, zps) = module_qparams(obs)?;
    let mut out = Module::new(Layer::QuantizedConv2d {
        conv: Conv2dSpec { bias: true, ..spec },
        relu: module.layer().has_relu(),
    });
    out.add_buffer("weight", qweight);
    out.add_buffer("bias", bias);
    set_output_qparams(&mut out, &scales, &zps);
    Ok(out)
}

fn convert_linear(module: &Module, spec: LinearSpec, obs: &Module, path: &str) -> Result<Module> {
    let weight = plain(module, "weight", path)?;
    let bias = module
        .param("bias")
        .cloned()
        .unwrap_or_else(|| Tensor::zeros(IxDyn(&[spec.out_features])));
    let qweight = quantize_weight(module, &weight, path)?;
    let (_, scales, zps) = module_qparams(obs)?;
    let mut out = Module::new(Layer::QuantizedLinear {
        linear: LinearSpec { bias: true, ..spec },
        relu: module.layer().has_relu(),
    });
    out.add_buffer("weight", qweight);
    out.add_buffer("bias", bias);
    set_output_qparams(&mut out, &scales, &zps);
    Ok(out)
}
