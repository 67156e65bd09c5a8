//! Op program of a scripted model

use crate::quant::QDtype;
use serde::{Deserialize, Serialize};

/// One instruction of a scripted model
///
/// Ops run in order on a single activation. Tensor operands are referenced
/// by key into the model's tensor table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Quantize {
        dtype: QDtype,
        scale: f32,
        zero_point: i32,
    },
    Dequantize,
    #[serde(rename = "qconv2d")]
    QConv2d {
        weight: String,
        bias: String,
        stride: usize,
        padding: usize,
        relu: bool,
        scale: f32,
        zero_point: i32,
    },
    #[serde(rename = "qlinear")]
    QLinear {
        weight: String,
        bias: String,
        relu: bool,
        scale: f32,
        zero_point: i32,
    },
    Conv2d {
        weight: String,
        bias: Option<String>,
        stride: usize,
        padding: usize,
    },
    Linear {
        weight: String,
        bias: Option<String>,
    },
    BatchNorm2d {
        weight: String,
        bias: String,
        running_mean: String,
        running_var: String,
        eps: f32,
    },
    #[serde(rename = "relu")]
    ReLU,
    MaxPool2d {
        kernel_size: usize,
        stride: usize,
    },
    GlobalAvgPool,
    Flatten,
}

impl Op {
    /// Keys of float operands
    pub fn float_operands(&self) -> Vec<&str> {
        match self {
            Op::QConv2d { bias, .. } | Op::QLinear { bias, .. } => vec![bias.as_str()],
            Op::Conv2d { weight, bias, .. } | Op::Linear { weight, bias } => {
                std::iter::once(weight.as_str()).chain(bias.as_deref()).collect()
            }
            Op::BatchNorm2d {
                weight,
                bias,
                running_mean,
                running_var,
                ..
            } => vec![
                weight.as_str(),
                bias.as_str(),
                running_mean.as_str(),
                running_var.as_str(),
            ],
            _ => Vec::new(),
        }
    }

    /// Keys of quantized operands
    pub fn quantized_operands(&self) -> Vec<&str> {
        match self {
            Op::QConv2d { weight, .. } | Op::QLinear { weight, .. } => vec![weight.as_str()],
            _ => Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::Quantize { .. } => "quantize",
            Op::Dequantize => "dequantize",
            Op::QConv2d { .. } => "qconv2d",
            Op::QLinear { .. } => "qlinear",
            Op::Conv2d { .. } => "conv2d",
            Op::Linear { .. } => "linear",
            Op::BatchNorm2d { .. } => "batch_norm2d",
            Op::ReLU => "relu",
            Op::MaxPool2d { .. } => "max_pool2d",
            Op::GlobalAvgPool => "global_avg_pool",
            Op::Flatten => "flatten",
        }
    }
}
