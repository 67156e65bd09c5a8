//! Range observers
//!
//! Observer state lives in module buffers so that it is part of the state
//! dict and survives checkpointing: `min_val`/`max_val` (shape `[1]` per
//! tensor, `[C]` per channel), plus `scale`, `zero_point`,
//! `observer_enabled` and `fake_quant_enabled` on fake-quantize modules.

use super::qconfig::{ObserverScheme, ObserverSpec};
use super::qtensor::QScheme;
use crate::error::{Error, Result};
use crate::nn::{Layer, Module};
use crate::Tensor;
use ndarray::{Axis, IxDyn};

/// Smallest scale handed out, matching f32 machine epsilon
const MIN_SCALE: f32 = f32::EPSILON;

/// Fresh observer module
///
/// `channels` sizes the per-channel state and is ignored for per-tensor
/// schemes.
pub fn observer_module(spec: ObserverSpec, channels: usize, fake_quant: bool) -> Module {
    let n = if spec.scheme.is_per_channel() {
        channels.max(1)
    } else {
        1
    };
    let layer = if fake_quant {
        Layer::FakeQuantize(spec)
    } else {
        Layer::Observer(spec)
    };
    let mut module = Module::new(layer);
    module.add_buffer("min_val", Tensor::from_elem(IxDyn(&[n]), f32::INFINITY));
    module.add_buffer("max_val", Tensor::from_elem(IxDyn(&[n]), f32::NEG_INFINITY));
    if fake_quant {
        module.add_buffer("scale", Tensor::ones(IxDyn(&[n])));
        module.add_buffer("zero_point", Tensor::zeros(IxDyn(&[n])));
        module.add_buffer("observer_enabled", Tensor::ones(IxDyn(&[1])));
        module.add_buffer("fake_quant_enabled", Tensor::ones(IxDyn(&[1])));
    }
    module
}

/// Observer settings of an observer module
pub fn spec_of(module: &Module) -> Result<ObserverSpec> {
    match module.layer() {
        Layer::Observer(spec) | Layer::FakeQuantize(spec) => Ok(*spec),
        other => Err(Error::Unsupported(format!(
            "{} is not an observer",
            other.name()
        ))),
    }
}

/// Read a `[1]` flag buffer; absent flags count as enabled
pub fn flag(module: &Module, name: &str) -> bool {
    module
        .float_buffer(name)
        .and_then(|t| t.iter().next().copied())
        .map_or(true, |v| v != 0.0)
}

pub fn set_flag(module: &mut Module, name: &str, on: bool) {
    if let Some(t) = module.float_buffer_mut(name) {
        t.fill(if on { 1.0 } else { 0.0 });
    }
}

/// Per-slice (or whole-tensor) min and max of a batch
fn batch_range(x: &Tensor, scheme: ObserverScheme, channels: usize) -> Result<(Vec<f32>, Vec<f32>)> {
    let fold = |view: ndarray::ArrayViewD<'_, f32>| {
        view.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
    };
    match scheme {
        ObserverScheme::PerChannelSymmetric { axis } => {
            let actual = x.shape().get(axis).copied().unwrap_or(0);
            if actual != channels {
                return Err(Error::shape_mismatch("observer channels", &[channels], &[actual]));
            }
            let (lo, hi): (Vec<f32>, Vec<f32>) =
                x.axis_iter(Axis(axis)).map(fold).unzip();
            Ok((lo, hi))
        }
        _ => {
            let (lo, hi) = fold(x.view());
            Ok((vec![lo], vec![hi]))
        }
    }
}

/// Update the running range of an observer module with a batch
///
/// With an averaging constant `c` the range moves as
/// `min += c * (batch_min - min)`; the first batch initializes it directly.
pub fn observe(module: &mut Module, x: &Tensor) -> Result<()> {
    if x.is_empty() {
        return Ok(());
    }
    let spec = spec_of(module)?;
    let channels = module.float_buffer("min_val").map_or(1, |t| t.len());
    let (batch_min, batch_max) = batch_range(x, spec.scheme, channels)?;

    for (name, batch) in [("min_val", batch_min), ("max_val", batch_max)] {
        let state = module
            .float_buffer_mut(name)
            .ok_or_else(|| Error::ModuleNotFound(format!("observer buffer {name}")))?;
        for (cur, b) in state.iter_mut().zip(batch) {
            *cur = if !cur.is_finite() {
                b
            } else {
                match spec.averaging_constant {
                    Some(c) => *cur + c * (b - *cur),
                    None if name == "min_val" => cur.min(b),
                    None => cur.max(b),
                }
            };
        }
    }
    Ok(())
}

/// Scales and zero points for an observed range
///
/// The range is widened to include zero. An unobserved range yields
/// scale 1 and zero point 0.
pub fn calculate_qparams(spec: &ObserverSpec, min: &[f32], max: &[f32]) -> (Vec<f32>, Vec<i32>) {
    let (qmin, qmax) = spec.quant_range();
    min.iter()
        .zip(max)
        .map(|(&lo, &hi)| {
            if !lo.is_finite() || !hi.is_finite() {
                return (1.0, 0);
            }
            let lo = lo.min(0.0);
            let hi = hi.max(0.0);
            match spec.scheme {
                ObserverScheme::PerTensorAffine => {
                    let levels = (qmax - qmin) as f32;
                    let span = hi - lo;
                    let scale = (span / levels).max(MIN_SCALE);
                    // lo / scale from the exact range ratio; half-way ranges round away from zero
                    let offset = if span / levels > MIN_SCALE {
                        f64::from(lo) * f64::from(levels) / f64::from(span)
                    } else {
                        f64::from(lo / scale)
                    };
                    let zp = (qmin - offset.round() as i32).clamp(qmin, qmax);
                    (scale, zp)
                }
                ObserverScheme::PerTensorSymmetric | ObserverScheme::PerChannelSymmetric { .. } => {
                    let max_abs = (-lo).max(hi);
                    let scale = (max_abs / ((qmax - qmin) as f32 / 2.0)).max(MIN_SCALE);
                    let zp = if qmin < 0 { 0 } else { (qmin + qmax + 1) / 2 };
                    (scale, zp)
                }
            }
        })
        .unzip()
}

/// Qparams from the current state of an observer module
pub fn module_qparams(module: &Module) -> Result<(ObserverSpec, Vec<f32>, Vec<i32>)> {
    let spec = spec_of(module)?;
    let min = module
        .float_buffer("min_val")
        .ok_or_else(|| Error::ModuleNotFound("observer buffer min_val".into()))?;
    let max = module
        .float_buffer("max_val")
        .ok_or_else(|| Error::ModuleNotFound("observer buffer max_val".into()))?;
    let min: Vec<f32> = min.iter().copied().collect();
    let max: Vec<f32> = max.iter().copied().collect();
    let (scales, zps) = calculate_qparams(&spec, &min, &max);
    Ok((spec, scales, zps))
}

/// Quantization scheme for computed qparams
pub fn to_qscheme(spec: &ObserverSpec, scales: Vec<f32>, zero_points: Vec<i32>) -> QScheme {
    match spec.scheme {
        ObserverScheme::PerChannelSymmetric { axis } => QScheme::PerChannelAffine {
            axis,
            scales,
            zero_points,
        },
        _ => QScheme::PerTensorAffine {
            scale: scales.first().copied().unwrap_or(1.0),
            zero_point: zero_points.first().copied().unwrap_or(0),
        },
    }
}

/// Forward of a plain observer: record the range, pass the input through
pub fn observer_forward(module: &mut Module, x: &Tensor) -> Result<Tensor> {
    if flag(module, "observer_enabled") {
        observe(module, x)?;
    }
    Ok(x.clone())
}
