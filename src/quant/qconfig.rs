//! Quantization configuration per backend

use super::qtensor::QDtype;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Target kernel backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// x86 server kernels: per-channel weights, reduce-range activations
    #[default]
    Fbgemm,
    /// ARM mobile kernels: per-tensor weights, full-range activations
    Qnnpack,
}

impl Backend {
    /// Backend identifier
    pub fn name(self) -> &'static str {
        match self {
            Backend::Fbgemm => "fbgemm",
            Backend::Qnnpack => "qnnpack",
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fbgemm" | "x86" => Ok(Backend::Fbgemm),
            "qnnpack" => Ok(Backend::Qnnpack),
            _ => Err(Error::ConfigError(format!(
                "Unknown quantization backend: {s}. Valid backends: fbgemm, qnnpack"
            ))),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How an observer derives qparams
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObserverScheme {
    /// Single affine range for the whole tensor
    PerTensorAffine,
    /// Single symmetric range for the whole tensor
    PerTensorSymmetric,
    /// One symmetric range per slice along `axis`
    PerChannelSymmetric { axis: usize },
}

impl ObserverScheme {
    /// Whether the observer tracks one range per channel
    pub fn is_per_channel(self) -> bool {
        matches!(self, ObserverScheme::PerChannelSymmetric { .. })
    }
}

/// Observer settings for one tensor role (activation or weight)
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObserverSpec {
    /// Storage type of the quantized tensor
    pub dtype: QDtype,
    /// Range scheme
    pub scheme: ObserverScheme,
    /// Halve the representable range (fbgemm activations)
    pub reduce_range: bool,
    /// Moving-average constant; `None` keeps the running min/max
    pub averaging_constant: Option<f32>,
}

impl ObserverSpec {
    /// Range for qparam computation
    pub fn quant_range(&self) -> (i32, i32) {
        self.dtype.quant_range(self.reduce_range)
    }
}

/// Activation and weight observer settings attached to a module
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QConfig {
    /// Observer for module outputs
    pub activation: ObserverSpec,
    /// Observer for module weights
    pub weight: ObserverSpec,
}

/// Default QAT qconfig for a backend
///
/// Both moving-average observers use an averaging constant of 0.01.
pub fn default_qat_qconfig(backend: Backend) -> QConfig {
    let activation = ObserverSpec {
        dtype: QDtype::QUInt8,
        scheme: ObserverScheme::PerTensorAffine,
        reduce_range: backend == Backend::Fbgemm,
        averaging_constant: Some(0.01),
    };
    let weight = match backend {
        Backend::Fbgemm => ObserverSpec {
            dtype: QDtype::QInt8,
            scheme: ObserverScheme::PerChannelSymmetric { axis: 0 },
            reduce_range: false,
            averaging_constant: Some(0.01),
        },
        Backend::Qnnpack => ObserverSpec {
            dtype: QDtype::QInt8,
            scheme: ObserverScheme::PerTensorSymmetric,
            reduce_range: false,
            averaging_constant: Some(0.01),
        },
    };
    QConfig { activation, weight }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_str() {
        assert_eq!("fbgemm".parse::<Backend>().unwrap(), Backend::Fbgemm);
        assert_eq!("QNNPACK".parse::<Backend>().unwrap(), Backend::Qnnpack);
        assert_eq!("x86".parse::<Backend>().unwrap(), Backend::Fbgemm);
        assert!("tensorrt".parse::<Backend>().is_err());
    }

    #[test]
    fn test_fbgemm_uses_per_channel_weights_and_reduce_range() {
        let qconfig = default_qat_qconfig(Backend::Fbgemm);
        assert!(qconfig.weight.scheme.is_per_channel());
        assert!(qconfig.activation.reduce_range);
        assert_eq!(qconfig.activation.quant_range(), (0, 127));
    }

    #[test]
    fn test_qnnpack_uses_per_tensor_weights_full_range() {
        let qconfig = default_qat_qconfig(Backend::Qnnpack);
        assert_eq!(qconfig.weight.scheme, ObserverScheme::PerTensorSymmetric);
        assert_eq!(qconfig.activation.quant_range(), (0, 255));
    }
}
