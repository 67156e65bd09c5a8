//! Fake quantization for quantization-aware training
//!
//! Forward: quantize then dequantize with the observer's current qparams.
//! Backward: straight-through estimator, gradients pass unchanged.

use super::observer::{flag, module_qparams, observe};
use super::qconfig::{ObserverScheme, ObserverSpec};
use crate::error::{Error, Result};
use crate::nn::Module;
use crate::Tensor;

/// Simulate quantization of `x`
///
/// `scales` and `zero_points` hold one entry for per-tensor schemes and one
/// per slice along the channel axis otherwise.
pub fn fake_quantize(
    x: &Tensor,
    spec: &ObserverSpec,
    scales: &[f32],
    zero_points: &[i32],
) -> Result<Tensor> {
    let (qmin, qmax) = spec.quant_range();
    let fq = |v: f32, scale: f32, zp: i32| {
        let q = ((v / scale).round() as i32 + zp).clamp(qmin, qmax);
        (q - zp) as f32 * scale
    };
    match spec.scheme {
        ObserverScheme::PerChannelSymmetric { axis } => {
            let channels = x.shape().get(axis).copied().unwrap_or(0);
            if scales.len() != channels || zero_points.len() != channels {
                return Err(Error::shape_mismatch(
                    "fake_quantize channels",
                    &[channels],
                    &[scales.len()],
                ));
            }
            let mut out = x.clone();
            for (idx, v) in out.indexed_iter_mut() {
                let c = idx[axis];
                *v = fq(*v, scales[c], zero_points[c]);
            }
            Ok(out)
        }
        _ => {
            let scale = scales.first().copied().unwrap_or(1.0);
            let zp = zero_points.first().copied().unwrap_or(0);
            Ok(x.mapv(|v| fq(v, scale, zp)))
        }
    }
}

/// Gradient of fake quantization under the straight-through estimator
pub fn ste_backward(grad_output: &Tensor) -> Tensor {
    grad_output.clone()
}

/// Forward of a `FakeQuantize` module
///
/// When observation is enabled the range is updated and the stored
/// `scale`/`zero_point` refreshed; when fake quantization is enabled the
/// stored qparams are applied, otherwise the input passes through.
pub fn fake_quant_forward(module: &mut Module, x: &Tensor) -> Result<Tensor> {
    if flag(module, "observer_enabled") {
        observe(module, x)?;
        let (_, scales, zps) = module_qparams(module)?;
        if let Some(t) = module.float_buffer_mut("scale") {
            t.iter_mut().zip(&scales).for_each(|(d, s)| *d = *s);
        }
        if let Some(t) = module.float_buffer_mut("zero_point") {
            t.iter_mut().zip(&zps).for_each(|(d, z)| *d = *z as f32);
        }
    }
    if !flag(module, "fake_quant_enabled") {
        return Ok(x.clone());
    }
    let (spec, scales, zps) = stored_qparams(module)?;
    fake_quantize(x, &spec, &scales, &zps)
}

/// Qparams held in the `scale`/`zero_point` buffers
pub fn stored_qparams(module: &Module) -> Result<(ObserverSpec, Vec<f32>, Vec<i32>)> {
    let spec = super::observer::spec_of(module)?;
    let scales: Vec<f32> = module
        .float_buffer("scale")
        .ok_or_else(|| Error::ModuleNotFound("fake quant buffer scale".into()))?
        .iter()
        .copied()
        .collect();
    let zps: Vec<i32> = module
        .float_buffer("zero_point")
        .ok_or_else(|| Error::ModuleNotFound("fake quant buffer zero_point".into()))?
        .iter()
        .map(|&z| z.round() as i32)
        .collect();
    Ok((spec, scales, zps))
}
