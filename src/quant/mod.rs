//! Eager-mode quantization
//!
//! - [`qconfig`]: backends and observer settings
//! - [`observer`]: moving-average min/max range tracking
//! - [`fake_quantize`]: simulated quantization with STE for QAT
//! - [`prepare`] / [`prepare_qat`]: observer insertion
//! - [`convert`]: float modules to integer kernels
//! - [`QTensor`]: integer tensors with affine qparams

mod convert;
pub mod fake_quantize;
pub mod kernels;
pub mod observer;
mod prepare;
mod qconfig;
mod qtensor;


pub use convert::convert;
pub use prepare::{
    attach_qconfig, disable_observer, enable_observer, freeze_bn_stats, prepare, prepare_qat,
};
pub use qconfig::{default_qat_qconfig, Backend, ObserverScheme, ObserverSpec, QConfig};
pub use qtensor::{QDtype, QScheme, QTensor};
