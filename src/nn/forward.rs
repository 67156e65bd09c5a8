//! Forward pass over the module tree

use super::layer::{BatchNormSpec, Layer};
use super::module::{join, Module};
use super::ops;
use crate::error::{Error, Result};
use crate::profile::Profiler;
use crate::quant::fake_quantize::fake_quant_forward;
use crate::quant::kernels::{self, OutputQParams};
use crate::quant::observer::observer_forward;
use crate::quant::{QDtype, QScheme, QTensor};
use crate::Tensor;
use std::borrow::Cow;
use std::time::Instant;

/// Child holding the output observer of a prepared layer
pub const ACTIVATION_POST_PROCESS: &str = "activation_post_process";
/// Child holding the weight fake-quantizer of a QAT layer
pub const WEIGHT_FAKE_QUANT: &str = "weight_fake_quant";
/// Child holding the batch norm of a fused conv
pub const BN: &str = "bn";

/// Value flowing between modules
#[derive(Clone, Debug, PartialEq)]
pub enum Activation {
    Float(Tensor),
    Quantized(QTensor),
}

impl Activation {
    pub fn into_float(self, what: &str) -> Result<Tensor> {
        match self {
            Activation::Float(t) => Ok(t),
            Activation::Quantized(_) => Err(Error::Unsupported(format!(
                "{what} received a quantized tensor"
            ))),
        }
    }

    pub fn into_quantized(self, what: &str) -> Result<QTensor> {
        match self {
            Activation::Quantized(q) => Ok(q),
            Activation::Float(_) => Err(Error::Unsupported(format!(
                "{what} received a float tensor"
            ))),
        }
    }

    /// Float view, dequantizing if needed
    pub fn to_float(&self) -> Tensor {
        match self {
            Activation::Float(t) => t.clone(),
            Activation::Quantized(q) => q.dequantize(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Activation::Float(t) => t.shape(),
            Activation::Quantized(q) => q.shape(),
        }
    }
}

/// Anything that maps a float batch to float outputs
///
/// Implemented by live module trees and by scripted models so that the same
/// evaluation loop measures both.
pub trait Forward {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor>;

    /// Forward pass recording operator timings into `profiler`
    ///
    /// The default records the whole call as a single `forward` entry.
    fn forward_profiled(&mut self, input: &Tensor, profiler: &mut Profiler) -> Result<Tensor> {
        let start = Instant::now();
        let out = self.forward(input);
        profiler.record("forward", start.elapsed());
        out
    }
}

impl Forward for Module {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let out = self.forward_activation(Activation::Float(input.clone()))?;
        Ok(out.to_float())
    }

    /// Each leaf module is timed under its layer name
    fn forward_profiled(&mut self, input: &Tensor, profiler: &mut Profiler) -> Result<Tensor> {
        let mut tap = Tap {
            target: None,
            captured: None,
            profiler: Some(profiler),
        };
        let out = self.run("", Activation::Float(input.clone()), &mut tap)?;
        Ok(out.to_float())
    }
}

/// Records the input reaching one module path, and optionally leaf timings
struct Tap<'a> {
    target: Option<&'a str>,
    captured: Option<Activation>,
    profiler: Option<&'a mut Profiler>,
}

impl Module {
    /// Run the tree on an activation
    pub fn forward_activation(&mut self, input: Activation) -> Result<Activation> {
        let mut tap = Tap {
            target: None,
            captured: None,
            profiler: None,
        };
        self.run("", input, &mut tap)
    }

    /// Run the tree and also return the float input seen by `target`
    pub fn forward_capture(&mut self, input: &Tensor, target: &str) -> Result<(Tensor, Tensor)> {
        let mut tap = Tap {
            target: Some(target),
            captured: None,
            profiler: None,
        };
        let out = self.run("", Activation::Float(input.clone()), &mut tap)?;
        let captured = tap
            .captured
            .ok_or_else(|| Error::ModuleNotFound(target.to_string()))?;
        Ok((out.to_float(), captured.to_float()))
    }

    fn run(&mut self, path: &str, x: Activation, tap: &mut Tap<'_>) -> Result<Activation> {
        if tap.target == Some(path) {
            tap.captured = Some(x.clone());
        }
        let layer = self.layer().clone();
        let name = layer.name();
        let start = Instant::now();
        let out = match layer {
            Layer::Sequential => {
                let mut x = x;
                for (child_name, child) in self.children_slots_mut().iter_mut() {
                    x = child.run(&join(path, child_name), x, tap)?;
                }
                return Ok(x);
            }
            Layer::Conv2d(spec) | Layer::ConvReLU2d(spec) => {
                let x = x.into_float(name)?;
                let weight = self.observed_weight()?;
                let bias = self.effective_param("bias");
                let y = ops::conv2d(&x, &weight, bias.as_deref(), spec.stride, spec.padding)?;
                Activation::Float(if layer.has_relu() { ops::relu(&y) } else { y })
            }
            Layer::ConvBn2d(spec) => {
                let x = x.into_float(name)?;
                let y = self.conv_bn_forward(&x, spec.conv.stride, spec.conv.padding, spec.freeze_bn)?;
                Activation::Float(if spec.relu { ops::relu(&y) } else { y })
            }
            Layer::BatchNorm2d(spec) => {
                let x = x.into_float(name)?;
                Activation::Float(self.batch_norm_forward(&x, &spec)?)
            }
            Layer::Linear(_) | Layer::LinearReLU(_) => {
                let x = x.into_float(name)?;
                let weight = self.observed_weight()?;
                let bias = self.effective_param("bias");
                let y = ops::linear(&x, &weight, bias.as_deref())?;
                Activation::Float(if layer.has_relu() { ops::relu(&y) } else { y })
            }
            Layer::ReLU => match x {
                Activation::Float(t) => Activation::Float(ops::relu(&t)),
                Activation::Quantized(q) => Activation::Quantized(kernels::qrelu(&q)?),
            },
            Layer::MaxPool2d {
                kernel_size,
                stride,
            } => match x {
                Activation::Float(t) => Activation::Float(ops::max_pool2d(&t, kernel_size, stride)?),
                Activation::Quantized(q) => {
                    Activation::Quantized(kernels::qmax_pool2d(&q, kernel_size, stride)?)
                }
            },
            Layer::AdaptiveAvgPool2d => match x {
                Activation::Float(t) => Activation::Float(ops::global_avg_pool(&t)?),
                Activation::Quantized(q) => Activation::Quantized(kernels::qglobal_avg_pool(&q)?),
            },
            Layer::Flatten => match x {
                Activation::Float(t) => Activation::Float(ops::flatten(&t)?),
                Activation::Quantized(q) => Activation::Quantized(kernels::qflatten(&q)?),
            },
            Layer::Identity | Layer::DeQuantStub => x,
            Layer::QuantStub => Activation::Float(x.into_float(name)?),
            Layer::Observer(_) => Activation::Float(observer_forward(self, &x.into_float(name)?)?),
            Layer::FakeQuantize(_) => {
                Activation::Float(fake_quant_forward(self, &x.into_float(name)?)?)
            }
            Layer::Quantize { dtype } => {
                let x = x.into_float(name)?;
                let out = self.output_qparams()?;
                Activation::Quantized(QTensor::quantize(
                    &x,
                    dtype,
                    QScheme::PerTensorAffine {
                        scale: out.scale,
                        zero_point: out.zero_point,
                    },
                )?)
            }
            Layer::DeQuantize => Activation::Float(x.to_float()),
            Layer::QuantizedConv2d { conv, relu } => {
                let q = x.into_quantized(name)?;
                let (weight, bias) = self.quantized_weight_and_bias()?;
                Activation::Quantized(kernels::qconv2d(
                    &q,
                    weight,
                    bias,
                    conv.stride,
                    conv.padding,
                    relu,
                    self.output_qparams()?,
                )?)
            }
            Layer::QuantizedLinear { relu, .. } => {
                let q = x.into_quantized(name)?;
                let (weight, bias) = self.quantized_weight_and_bias()?;
                Activation::Quantized(kernels::qlinear(
                    &q,
                    weight,
                    bias,
                    relu,
                    self.output_qparams()?,
                )?)
            }
        };
        let out = self.post_process(out)?;
        if let Some(profiler) = tap.profiler.as_deref_mut() {
            profiler.record(name, start.elapsed());
        }
        Ok(out)
    }

    /// Run the output observer, if one is attached
    fn post_process(&mut self, out: Activation) -> Result<Activation> {
        match (self.child_mut(ACTIVATION_POST_PROCESS), out) {
            (Some(observer), Activation::Float(t)) => {
                let y = match observer.layer() {
                    Layer::FakeQuantize(_) => fake_quant_forward(observer, &t)?,
                    _ => observer_forward(observer, &t)?,
                };
                Ok(Activation::Float(y))
            }
            (_, out) => Ok(out),
        }
    }

    /// Effective weight passed through the weight fake-quantizer, if any
    fn observed_weight(&mut self) -> Result<Tensor> {
        let weight = self
            .effective_param("weight")
            .map(Cow::into_owned)
            .ok_or_else(|| Error::ModuleNotFound(format!("{} weight", self.layer().name())))?;
        match self.child_mut(WEIGHT_FAKE_QUANT) {
            Some(fq) => fake_quant_forward(fq, &weight),
            None => Ok(weight),
        }
    }

    fn batch_norm_forward(&mut self, x: &Tensor, spec: &BatchNormSpec) -> Result<Tensor> {
        let (mean, var) = if self.is_training() {
            let (mean, var, count) = ops::channel_stats(x)?;
            self.update_running_stats(&mean, &var, count, spec.momentum)?;
            (mean, var)
        } else {
            self.running_stats()?
        };
        let gamma = self.bn_param("weight")?;
        let beta = self.bn_param("bias")?;
        ops::batch_norm(x, &mean, &var, &gamma, &beta, spec.eps)
    }

    /// Conv followed by batch norm with the norm folded into the weights
    ///
    /// The folded weight `w * gamma / sqrt(running_var + eps)` goes through
    /// the weight fake-quantizer, and the folded bias is added afterwards.
    /// Training without frozen statistics first refreshes the running
    /// statistics from the raw conv output of the batch.
    fn conv_bn_forward(
        &mut self,
        x: &Tensor,
        stride: usize,
        padding: usize,
        freeze_bn: bool,
    ) -> Result<Tensor> {
        let weight = self
            .effective_param("weight")
            .map(Cow::into_owned)
            .ok_or_else(|| Error::ModuleNotFound("ConvBn2d weight".into()))?;
        let out_channels = weight.shape().first().copied().unwrap_or(0);
        let bias = self
            .effective_param("bias")
            .map(Cow::into_owned)
            .unwrap_or_else(|| Tensor::zeros(ndarray::IxDyn(&[out_channels])));
        let training = self.is_training();
        let bn = self
            .child_mut(BN)
            .ok_or_else(|| Error::ModuleNotFound("ConvBn2d bn".into()))?;
        let Layer::BatchNorm2d(bn_spec) = bn.layer().clone() else {
            return Err(Error::Unsupported("ConvBn2d bn child is not BatchNorm2d".into()));
        };

        if training && !freeze_bn {
            let raw = ops::conv2d(x, &weight, Some(&bias), stride, padding)?;
            let (mean, var, count) = ops::channel_stats(&raw)?;
            bn.update_running_stats(&mean, &var, count, bn_spec.momentum)?;
        }

        let (folded_w, folded_b) = bn.fold_into(&weight, &bias, bn_spec.eps)?;
        let folded_w = match self.child_mut(WEIGHT_FAKE_QUANT) {
            Some(fq) => fake_quant_forward(fq, &folded_w)?,
            None => folded_w,
        };
        ops::conv2d(x, &folded_w, Some(&folded_b), stride, padding)
    }

    /// Fold this batch norm's running statistics into conv weight and bias
    pub fn fold_into(&self, weight: &Tensor, bias: &Tensor, eps: f32) -> Result<(Tensor, Tensor)> {
        let (mean, var) = self.running_stats()?;
        let gamma = self.bn_param("weight")?;
        let beta = self.bn_param("bias")?;
        let mut folded_w = weight.clone();
        let mut folded_b = bias.clone();
        for (c, mut slice) in folded_w.outer_iter_mut().enumerate() {
            let scale = gamma[[c]] / (var[c] + eps).sqrt();
            slice.mapv_inplace(|v| v * scale);
            folded_b[[c]] = (bias[[c]] - mean[c]) * scale + beta[[c]];
        }
        Ok((folded_w, folded_b))
    }

    fn bn_param(&self, name: &str) -> Result<Tensor> {
        self.effective_param(name)
            .map(Cow::into_owned)
            .ok_or_else(|| Error::ModuleNotFound(format!("BatchNorm2d {name}")))
    }

    fn running_stats(&self) -> Result<(Vec<f32>, Vec<f32>)> {
        let mean = self
            .float_buffer("running_mean")
            .ok_or_else(|| Error::ModuleNotFound("BatchNorm2d running_mean".into()))?;
        let var = self
            .float_buffer("running_var")
            .ok_or_else(|| Error::ModuleNotFound("BatchNorm2d running_var".into()))?;
        Ok((mean.iter().copied().collect(), var.iter().copied().collect()))
    }

    fn update_running_stats(
        &mut self,
        mean: &[f32],
        var: &[f32],
        count: usize,
        momentum: f32,
    ) -> Result<()> {
        let unbias = if count > 1 {
            count as f32 / (count - 1) as f32
        } else {
            1.0
        };
        let running_mean = self
            .float_buffer_mut("running_mean")
            .ok_or_else(|| Error::ModuleNotFound("BatchNorm2d running_mean".into()))?;
        for (r, m) in running_mean.iter_mut().zip(mean) {
            *r = (1.0 - momentum) * *r + momentum * m;
        }
        let running_var = self
            .float_buffer_mut("running_var")
            .ok_or_else(|| Error::ModuleNotFound("BatchNorm2d running_var".into()))?;
        for (r, v) in running_var.iter_mut().zip(var) {
            *r = (1.0 - momentum) * *r + momentum * v * unbias;
        }
        Ok(())
    }

    /// Output `scale`/`zero_point` buffers of a converted module
    pub fn output_qparams(&self) -> Result<OutputQParams> {
        let read = |name: &str| {
            self.float_buffer(name)
                .and_then(|t| t.iter().next().copied())
                .ok_or_else(|| Error::ModuleNotFound(format!("{} {name}", self.layer().name())))
        };
        Ok(OutputQParams {
            scale: read("scale")?,
            zero_point: read("zero_point")?.round() as i32,
        })
    }

    fn quantized_weight_and_bias(&self) -> Result<(&QTensor, &Tensor)> {
        let weight = self
            .buffer("weight")
            .and_then(|t| t.as_quantized())
            .ok_or_else(|| Error::ModuleNotFound(format!("{} weight", self.layer().name())))?;
        let bias = self
            .float_buffer("bias")
            .ok_or_else(|| Error::ModuleNotFound(format!("{} bias", self.layer().name())))?;
        Ok((weight, bias))
    }
}

/// Activation dtype produced by the quant stub after conversion
pub const ACTIVATION_DTYPE: QDtype = QDtype::QUInt8;
