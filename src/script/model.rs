//! Compilation, persistence and execution of scripted models

use super::program::Op;
use crate::error::{Error, Result};
use crate::io::{load_state_dict, save_state_dict};
use crate::logging::LogSink;
use crate::nn::{
    join, ops, Activation, Forward, Layer, Module, StateDict, StateTensor, ACTIVATION_POST_PROCESS,
    BN, WEIGHT_FAKE_QUANT,
};
use crate::profile::Profiler;
use crate::quant::kernels::{self, OutputQParams};
use crate::quant::{QScheme, QTensor};
use crate::Tensor;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

/// Metadata key holding the JSON op program
pub const PROGRAM_KEY: &str = "program";
/// Metadata key holding the program format tag
pub const FORMAT_KEY: &str = "format";
/// Current program format tag
pub const FORMAT_VERSION: &str = "cuantizar-script/1";

/// Self-contained executable form of a model
///
/// The tensor table keeps every tensor of the source module (masks
/// included) plus any tensors derived while compiling, such as folded
/// conv/batch-norm weights.
#[derive(Clone, Debug, PartialEq)]
pub struct ScriptedModel {
    program: Vec<Op>,
    tensors: StateDict,
}

impl ScriptedModel {
    /// Build from an explicit program, validating its operands
    pub fn new(program: Vec<Op>, tensors: StateDict) -> Result<Self> {
        let model = Self { program, tensors };
        model.validate()?;
        Ok(model)
    }

    /// Trace a float or converted module tree into an op program
    ///
    /// Prepared modules still carrying observers are rejected; convert them
    /// first.
    pub fn compile(model: &Module) -> Result<Self> {
        let mut tensors = model.state_dict();
        let mut program = Vec::new();
        emit(model, "", &mut program, &mut tensors)?;
        Self::new(program, tensors)
    }

    pub fn program(&self) -> &[Op] {
        &self.program
    }

    pub fn tensors(&self) -> &StateDict {
        &self.tensors
    }

    /// Write the tensor table with the program as metadata
    pub fn save(&self, path: impl AsRef<Path>) -> Result<u64> {
        let program = serde_json::to_string(&self.program)
            .map_err(|e| Error::Serialization(format!("{PROGRAM_KEY}: {e}")))?;
        let mut metadata = BTreeMap::new();
        metadata.insert(PROGRAM_KEY.to_string(), program);
        metadata.insert(FORMAT_KEY.to_string(), FORMAT_VERSION.to_string());
        save_state_dict(path, &self.tensors, &metadata)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let loaded = load_state_dict(path)?;
        match loaded.metadata.get(FORMAT_KEY).map(String::as_str) {
            Some(FORMAT_VERSION) => {}
            other => {
                return Err(Error::Serialization(format!(
                    "{}: unsupported script format {other:?}",
                    path.display()
                )))
            }
        }
        let json = loaded.metadata.get(PROGRAM_KEY).ok_or_else(|| {
            Error::Serialization(format!("{}: missing '{PROGRAM_KEY}'", path.display()))
        })?;
        let program: Vec<Op> = serde_json::from_str(json)
            .map_err(|e| Error::Serialization(format!("{PROGRAM_KEY}: {e}")))?;
        Self::new(program, loaded.state_dict)
    }

    /// Log the op sequence and operand datatypes at debug level
    pub fn describe(&self, sink: &dyn LogSink) {
        for (i, op) in self.program.iter().enumerate() {
            let operands: Vec<String> = op
                .quantized_operands()
                .into_iter()
                .chain(op.float_operands())
                .map(|key| match self.tensors.get(key) {
                    Some(t) => format!("{key}: {}", t.dtype_name()),
                    None => key.to_string(),
                })
                .collect();
            sink.debug(&format!("{i:>3} {} [{}]", op.name(), operands.join(", ")));
        }
    }

    /// Run the program on a float batch
    pub fn run(&self, input: &Tensor) -> Result<Activation> {
        let mut x = Activation::Float(input.clone());
        for op in &self.program {
            x = self.step(op, x)?;
        }
        Ok(x)
    }

    fn validate(&self) -> Result<()> {
        for op in &self.program {
            for key in op.float_operands() {
                self.float(key)?;
            }
            for key in op.quantized_operands() {
                self.quantized(key)?;
            }
        }
        Ok(())
    }

    fn float(&self, key: &str) -> Result<&Tensor> {
        match self.tensors.get(key) {
            Some(StateTensor::Float(t)) => Ok(t),
            Some(other) => Err(Error::Serialization(format!(
                "script operand {key} must be float, found {}",
                other.dtype_name()
            ))),
            None => Err(Error::Serialization(format!("script operand {key} is missing"))),
        }
    }

    fn quantized(&self, key: &str) -> Result<&QTensor> {
        match self.tensors.get(key) {
            Some(StateTensor::Quantized(q)) => Ok(q),
            Some(_) => Err(Error::Serialization(format!(
                "script operand {key} must be quantized"
            ))),
            None => Err(Error::Serialization(format!("script operand {key} is missing"))),
        }
    }

    fn step(&self, op: &Op, x: Activation) -> Result<Activation> {
        let name = op.name();
        Ok(match op {
            Op::Quantize {
                dtype,
                scale,
                zero_point,
            } => Activation::Quantized(QTensor::quantize(
                &x.into_float(name)?,
                *dtype,
                QScheme::PerTensorAffine {
                    scale: *scale,
                    zero_point: *zero_point,
                },
            )?),
            Op::Dequantize => Activation::Float(x.to_float()),
            Op::QConv2d {
                weight,
                bias,
                stride,
                padding,
                relu,
                scale,
                zero_point,
            } => Activation::Quantized(kernels::qconv2d(
                &x.into_quantized(name)?,
                self.quantized(weight)?,
                self.float(bias)?,
                *stride,
                *padding,
                *relu,
                OutputQParams {
                    scale: *scale,
                    zero_point: *zero_point,
                },
            )?),
            Op::QLinear {
                weight,
                bias,
                relu,
                scale,
                zero_point,
            } => Activation::Quantized(kernels::qlinear(
                &x.into_quantized(name)?,
                self.quantized(weight)?,
                self.float(bias)?,
                *relu,
                OutputQParams {
                    scale: *scale,
                    zero_point: *zero_point,
                },
            )?),
            Op::Conv2d {
                weight,
                bias,
                stride,
                padding,
            } => {
                let bias = bias.as_deref().map(|b| self.float(b)).transpose()?;
                Activation::Float(ops::conv2d(
                    &x.into_float(name)?,
                    self.float(weight)?,
                    bias,
                    *stride,
                    *padding,
                )?)
            }
            Op::Linear { weight, bias } => {
                let bias = bias.as_deref().map(|b| self.float(b)).transpose()?;
                Activation::Float(ops::linear(&x.into_float(name)?, self.float(weight)?, bias)?)
            }
            Op::BatchNorm2d {
                weight,
                bias,
                running_mean,
                running_var,
                eps,
            } => {
                let mean: Vec<f32> = self.float(running_mean)?.iter().copied().collect();
                let var: Vec<f32> = self.float(running_var)?.iter().copied().collect();
                Activation::Float(ops::batch_norm(
                    &x.into_float(name)?,
                    &mean,
                    &var,
                    self.float(weight)?,
                    self.float(bias)?,
                    *eps,
                )?)
            }
            Op::ReLU => match x {
                Activation::Float(t) => Activation::Float(ops::relu(&t)),
                Activation::Quantized(q) => Activation::Quantized(kernels::qrelu(&q)?),
            },
            Op::MaxPool2d {
                kernel_size,
                stride,
            } => match x {
                Activation::Float(t) => {
                    Activation::Float(ops::max_pool2d(&t, *kernel_size, *stride)?)
                }
                Activation::Quantized(q) => {
                    Activation::Quantized(kernels::qmax_pool2d(&q, *kernel_size, *stride)?)
                }
            },
            Op::GlobalAvgPool => match x {
                Activation::Float(t) => Activation::Float(ops::global_avg_pool(&t)?),
                Activation::Quantized(q) => Activation::Quantized(kernels::qglobal_avg_pool(&q)?),
            },
            Op::Flatten => match x {
                Activation::Float(t) => Activation::Float(ops::flatten(&t)?),
                Activation::Quantized(q) => Activation::Quantized(kernels::qflatten(&q)?),
            },
        })
    }
}

impl Forward for ScriptedModel {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        Ok(self.run(input)?.to_float())
    }

    /// Each program op is timed under its op name
    fn forward_profiled(&mut self, input: &Tensor, profiler: &mut Profiler) -> Result<Tensor> {
        let mut x = Activation::Float(input.clone());
        for op in &self.program {
            let start = Instant::now();
            x = self.step(op, x)?;
            profiler.record(op.name(), start.elapsed());
        }
        Ok(x.to_float())
    }
}

/// Key of a float operand, materializing reparameterized tensors
fn float_operand(
    module: &Module,
    path: &str,
    attr: &str,
    tensors: &mut StateDict,
) -> Result<Option<String>> {
    let key = join(path, attr);
    match module.effective_param(attr) {
        Some(Cow::Borrowed(_)) => Ok(Some(key)),
        Some(Cow::Owned(t)) => {
            tensors.insert(key.clone(), t);
            Ok(Some(key))
        }
        None => match module.float_buffer(attr) {
            Some(_) => Ok(Some(key)),
            None => Ok(None),
        },
    }
}

fn required(module: &Module, path: &str, attr: &str, tensors: &mut StateDict) -> Result<String> {
    float_operand(module, path, attr, tensors)?
        .ok_or_else(|| Error::ModuleNotFound(join(path, attr)))
}

fn emit(module: &Module, path: &str, program: &mut Vec<Op>, tensors: &mut StateDict) -> Result<()> {
    let layer = module.layer();
    if layer.is_observer()
        || module.child(ACTIVATION_POST_PROCESS).is_some()
        || module.child(WEIGHT_FAKE_QUANT).is_some()
    {
        return Err(Error::Unsupported(format!(
            "scripting prepared module '{path}'; convert it first"
        )));
    }
    match layer {
        Layer::Sequential => {
            for (name, child) in module.children() {
                emit(child, &join(path, name), program, tensors)?;
            }
        }
        Layer::Identity | Layer::QuantStub | Layer::DeQuantStub => {}
        Layer::Conv2d(spec) | Layer::ConvReLU2d(spec) => {
            program.push(Op::Conv2d {
                weight: required(module, path, "weight", tensors)?,
                bias: float_operand(module, path, "bias", tensors)?,
                stride: spec.stride,
                padding: spec.padding,
            });
            if layer.has_relu() {
                program.push(Op::ReLU);
            }
        }
        Layer::ConvBn2d(spec) => {
            let weight = module
                .effective_param("weight")
                .map(Cow::into_owned)
                .ok_or_else(|| Error::ModuleNotFound(join(path, "weight")))?;
            let bias = module
                .effective_param("bias")
                .map(Cow::into_owned)
                .unwrap_or_else(|| Tensor::zeros(ndarray::IxDyn(&[spec.conv.out_channels])));
            let bn = module
                .child(BN)
                .ok_or_else(|| Error::ModuleNotFound(join(path, BN)))?;
            let Layer::BatchNorm2d(bn_spec) = bn.layer() else {
                return Err(Error::Unsupported(format!("{path}.{BN} is not BatchNorm2d")));
            };
            let (folded_w, folded_b) = bn.fold_into(&weight, &bias, bn_spec.eps)?;
            let weight_key = join(path, "folded_weight");
            let bias_key = join(path, "folded_bias");
            tensors.insert(weight_key.clone(), folded_w);
            tensors.insert(bias_key.clone(), folded_b);
            program.push(Op::Conv2d {
                weight: weight_key,
                bias: Some(bias_key),
                stride: spec.conv.stride,
                padding: spec.conv.padding,
            });
            if spec.relu {
                program.push(Op::ReLU);
            }
        }
        Layer::BatchNorm2d(spec) => program.push(Op::BatchNorm2d {
            weight: required(module, path, "weight", tensors)?,
            bias: required(module, path, "bias", tensors)?,
            running_mean: required(module, path, "running_mean", tensors)?,
            running_var: required(module, path, "running_var", tensors)?,
            eps: spec.eps,
        }),
        Layer::Linear(_) | Layer::LinearReLU(_) => {
            program.push(Op::Linear {
                weight: required(module, path, "weight", tensors)?,
                bias: float_operand(module, path, "bias", tensors)?,
            });
            if layer.has_relu() {
                program.push(Op::ReLU);
            }
        }
        Layer::ReLU => program.push(Op::ReLU),
        Layer::MaxPool2d {
            kernel_size,
            stride,
        } => program.push(Op::MaxPool2d {
            kernel_size: *kernel_size,
            stride: *stride,
        }),
        Layer::AdaptiveAvgPool2d => program.push(Op::GlobalAvgPool),
        Layer::Flatten => program.push(Op::Flatten),
        Layer::Quantize { dtype } => {
            let out = module.output_qparams()?;
            program.push(Op::Quantize {
                dtype: *dtype,
                scale: out.scale,
                zero_point: out.zero_point,
            });
        }
        Layer::DeQuantize => program.push(Op::Dequantize),
        Layer::QuantizedConv2d { conv, relu } => {
            let out = module.output_qparams()?;
            program.push(Op::QConv2d {
                weight: join(path, "weight"),
                bias: join(path, "bias"),
                stride: conv.stride,
                padding: conv.padding,
                relu: *relu,
                scale: out.scale,
                zero_point: out.zero_point,
            });
        }
        Layer::QuantizedLinear { relu, .. } => {
            let out = module.output_qparams()?;
            program.push(Op::QLinear {
                weight: join(path, "weight"),
                bias: join(path, "bias"),
                relu: *relu,
                scale: out.scale,
                zero_point: out.zero_point,
            });
        }
        Layer::Observer(_) | Layer::FakeQuantize(_) => {}
    }
    Ok(())
}
