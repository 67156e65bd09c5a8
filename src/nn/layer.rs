//! Layer kinds and their hyperparameters

use crate::quant::{ObserverSpec, QDtype};
use serde::{Deserialize, Serialize};

/// 2-D convolution hyperparameters
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv2dSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub bias: bool,
}

impl Conv2dSpec {
    /// Square convolution with stride 1 and no padding
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            stride: 1,
            padding: 0,
            bias: true,
        }
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn without_bias(mut self) -> Self {
        self.bias = false;
        self
    }

    /// Weight shape `[out, in, k, k]`
    pub fn weight_shape(&self) -> [usize; 4] {
        [
            self.out_channels,
            self.in_channels,
            self.kernel_size,
            self.kernel_size,
        ]
    }
}

/// Batch normalization hyperparameters
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchNormSpec {
    pub num_features: usize,
    pub eps: f32,
    pub momentum: f32,
}

impl BatchNormSpec {
    pub fn new(num_features: usize) -> Self {
        Self {
            num_features,
            eps: 1e-5,
            momentum: 0.1,
        }
    }
}

/// Fully connected layer hyperparameters
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearSpec {
    pub in_features: usize,
    pub out_features: usize,
    pub bias: bool,
}

impl LinearSpec {
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self {
            in_features,
            out_features,
            bias: true,
        }
    }
}

/// Fused convolution + batch norm (+ optional ReLU)
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvBnSpec {
    pub conv: Conv2dSpec,
    pub relu: bool,
    /// Keep running statistics fixed during training
    pub freeze_bn: bool,
}

/// Kind of a module in the tree
#[derive(Clone, Debug, PartialEq)]
pub enum Layer {
    /// Ordered container running its children in sequence
    Sequential,
    Conv2d(Conv2dSpec),
    BatchNorm2d(BatchNormSpec),
    Linear(LinearSpec),
    ReLU,
    MaxPool2d { kernel_size: usize, stride: usize },
    /// Global average pooling to `1x1`
    AdaptiveAvgPool2d,
    Flatten,
    /// Passthrough; also the placeholder left in slots absorbed by fusion
    Identity,
    /// Marks where float input becomes quantized
    QuantStub,
    /// Marks where quantized activations return to float
    DeQuantStub,
    ConvBn2d(ConvBnSpec),
    ConvReLU2d(Conv2dSpec),
    LinearReLU(LinearSpec),
    /// Range observer without fake quantization (static calibration)
    Observer(ObserverSpec),
    /// Observer plus simulated quantization (QAT)
    FakeQuantize(ObserverSpec),
    Quantize { dtype: QDtype },
    DeQuantize,
    QuantizedConv2d { conv: Conv2dSpec, relu: bool },
    QuantizedLinear { linear: LinearSpec, relu: bool },
}

/// Prunable base layer kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BaseKind {
    Conv2d,
    BatchNorm2d,
    Linear,
}

impl Layer {
    /// Type name used in diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Layer::Sequential => "Sequential",
            Layer::Conv2d(_) => "Conv2d",
            Layer::BatchNorm2d(_) => "BatchNorm2d",
            Layer::Linear(_) => "Linear",
            Layer::ReLU => "ReLU",
            Layer::MaxPool2d { .. } => "MaxPool2d",
            Layer::AdaptiveAvgPool2d => "AdaptiveAvgPool2d",
            Layer::Flatten => "Flatten",
            Layer::Identity => "Identity",
            Layer::QuantStub => "QuantStub",
            Layer::DeQuantStub => "DeQuantStub",
            Layer::ConvBn2d(spec) if spec.relu => "ConvBnReLU2d",
            Layer::ConvBn2d(_) => "ConvBn2d",
            Layer::ConvReLU2d(_) => "ConvReLU2d",
            Layer::LinearReLU(_) => "LinearReLU",
            Layer::Observer(_) => "Observer",
            Layer::FakeQuantize(_) => "FakeQuantize",
            Layer::Quantize { .. } => "Quantize",
            Layer::DeQuantize => "DeQuantize",
            Layer::QuantizedConv2d { relu: true, .. } => "QuantizedConvReLU2d",
            Layer::QuantizedConv2d { .. } => "QuantizedConv2d",
            Layer::QuantizedLinear { relu: true, .. } => "QuantizedLinearReLU",
            Layer::QuantizedLinear { .. } => "QuantizedLinear",
        }
    }

    /// Base kind for float layers holding prunable tensors
    ///
    /// Fused modules count as their leading base layer; the batch norm of a
    /// `ConvBn2d` lives in its own `bn` child and is reported there.
    pub fn base_kind(&self) -> Option<BaseKind> {
        match self {
            Layer::Conv2d(_) | Layer::ConvBn2d(_) | Layer::ConvReLU2d(_) => Some(BaseKind::Conv2d),
            Layer::BatchNorm2d(_) => Some(BaseKind::BatchNorm2d),
            Layer::Linear(_) | Layer::LinearReLU(_) => Some(BaseKind::Linear),
            _ => None,
        }
    }

    /// Convolution hyperparameters of any float conv variant
    pub fn conv_spec(&self) -> Option<&Conv2dSpec> {
        match self {
            Layer::Conv2d(spec) | Layer::ConvReLU2d(spec) => Some(spec),
            Layer::ConvBn2d(spec) => Some(&spec.conv),
            _ => None,
        }
    }

    /// Linear hyperparameters of any float linear variant
    pub fn linear_spec(&self) -> Option<&LinearSpec> {
        match self {
            Layer::Linear(spec) | Layer::LinearReLU(spec) => Some(spec),
            _ => None,
        }
    }

    /// Whether the layer applies a trailing ReLU
    pub fn has_relu(&self) -> bool {
        match self {
            Layer::ConvReLU2d(_) | Layer::LinearReLU(_) => true,
            Layer::ConvBn2d(spec) => spec.relu,
            Layer::QuantizedConv2d { relu, .. } | Layer::QuantizedLinear { relu, .. } => *relu,
            _ => false,
        }
    }

    /// Observer or fake-quantize layer
    pub fn is_observer(&self) -> bool {
        matches!(self, Layer::Observer(_) | Layer::FakeQuantize(_))
    }

    /// Integer-kernel layer produced by conversion
    pub fn is_quantized(&self) -> bool {
        matches!(
            self,
            Layer::Quantize { .. }
                | Layer::DeQuantize
                | Layer::QuantizedConv2d { .. }
                | Layer::QuantizedLinear { .. }
        )
    }
}
