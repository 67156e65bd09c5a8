//! Quantized tensors
//!
//! Integer representations are kept as `i32` in memory and stored with one
//! byte per element on disk.

use crate::error::{Error, Result};
use crate::Tensor;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

/// Integer storage type of a quantized tensor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QDtype {
    /// Signed 8-bit (weights)
    QInt8,
    /// Unsigned 8-bit (activations)
    QUInt8,
}

impl QDtype {
    /// Full representable range
    pub fn range(self) -> (i32, i32) {
        match self {
            QDtype::QInt8 => (-128, 127),
            QDtype::QUInt8 => (0, 255),
        }
    }

    /// Range used for qparam computation (reduce-range halves it)
    pub fn quant_range(self, reduce_range: bool) -> (i32, i32) {
        match (self, reduce_range) {
            (QDtype::QInt8, false) => (-128, 127),
            (QDtype::QInt8, true) => (-64, 63),
            (QDtype::QUInt8, false) => (0, 255),
            (QDtype::QUInt8, true) => (0, 127),
        }
    }

    /// Display name
    pub fn name(self) -> &'static str {
        match self {
            QDtype::QInt8 => "qint8",
            QDtype::QUInt8 => "quint8",
        }
    }
}

/// Quantization parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum QScheme {
    /// One scale/zero-point for the whole tensor
    PerTensorAffine { scale: f32, zero_point: i32 },
    /// One scale/zero-point per slice along `axis`
    PerChannelAffine {
        axis: usize,
        scales: Vec<f32>,
        zero_points: Vec<i32>,
    },
}

impl QScheme {
    /// Scale and zero-point for the given channel index
    pub fn params_for(&self, channel: usize) -> (f32, i32) {
        match self {
            QScheme::PerTensorAffine { scale, zero_point } => (*scale, *zero_point),
            QScheme::PerChannelAffine {
                scales,
                zero_points,
                ..
            } => (
                scales.get(channel).copied().unwrap_or(1.0),
                zero_points.get(channel).copied().unwrap_or(0),
            ),
        }
    }

    /// Per-tensor scale/zero-point, if this is a per-tensor scheme
    pub fn per_tensor(&self) -> Option<(f32, i32)> {
        match self {
            QScheme::PerTensorAffine { scale, zero_point } => Some((*scale, *zero_point)),
            QScheme::PerChannelAffine { .. } => None,
        }
    }
}

/// Quantized tensor: integer values plus quantization parameters
#[derive(Clone, Debug, PartialEq)]
pub struct QTensor {
    dtype: QDtype,
    values: ArrayD<i32>,
    scheme: QScheme,
}

impl QTensor {
    /// Build from integer values, validating range and channel count
    pub fn from_parts(dtype: QDtype, values: ArrayD<i32>, scheme: QScheme) -> Result<Self> {
        let (lo, hi) = dtype.range();
        if values.iter().any(|&v| v < lo || v > hi) {
            return Err(Error::Serialization(format!(
                "quantized values outside {} range",
                dtype.name()
            )));
        }
        if let QScheme::PerChannelAffine {
            axis,
            scales,
            zero_points,
        } = &scheme
        {
            let channels = values.shape().get(*axis).copied().unwrap_or(0);
            if scales.len() != channels || zero_points.len() != channels {
                return Err(Error::shape_mismatch(
                    "qparams",
                    &[channels],
                    &[scales.len()],
                ));
            }
        }
        Ok(Self {
            dtype,
            values,
            scheme,
        })
    }

    /// Quantize a float tensor
    pub fn quantize(input: &Tensor, dtype: QDtype, scheme: QScheme) -> Result<Self> {
        let (lo, hi) = dtype.range();
        let values = match &scheme {
            QScheme::PerTensorAffine { scale, zero_point } => {
                input.mapv(|x| quantize_value(x, *scale, *zero_point, lo, hi))
            }
            QScheme::PerChannelAffine { axis, .. } => {
                let mut out = ArrayD::<i32>::zeros(input.raw_dim());
                for (idx, &x) in input.indexed_iter() {
                    let (scale, zp) = scheme.params_for(idx[*axis]);
                    out[&idx] = quantize_value(x, scale, zp, lo, hi);
                }
                out
            }
        };
        Self::from_parts(dtype, values, scheme)
    }

    /// Dequantize back to float
    pub fn dequantize(&self) -> Tensor {
        match &self.scheme {
            QScheme::PerTensorAffine { scale, zero_point } => {
                self.values.mapv(|q| (q - zero_point) as f32 * scale)
            }
            QScheme::PerChannelAffine { axis, .. } => {
                let mut out = Tensor::zeros(self.values.raw_dim());
                for (idx, &q) in self.values.indexed_iter() {
                    let (scale, zp) = self.scheme.params_for(idx[*axis]);
                    out[&idx] = (q - zp) as f32 * scale;
                }
                out
            }
        }
    }

    /// Storage dtype
    pub fn dtype(&self) -> QDtype {
        self.dtype
    }

    /// Quantization parameters
    pub fn scheme(&self) -> &QScheme {
        &self.scheme
    }

    /// Integer values
    pub fn int_repr(&self) -> &ArrayD<i32> {
        &self.values
    }

    /// Shape
    pub fn shape(&self) -> &[usize] {
        self.values.shape()
    }

    /// Same values with a new shape (per-tensor only)
    pub fn reshape(&self, shape: &[usize]) -> Result<Self> {
        if matches!(self.scheme, QScheme::PerChannelAffine { .. }) {
            return Err(Error::Unsupported(
                "reshape of a per-channel quantized tensor".into(),
            ));
        }
        let values = self
            .values
            .clone()
            .into_shape_with_order(IxDyn(shape))
            .map_err(|_| Error::shape_mismatch("reshape", shape, self.values.shape()))?;
        Ok(Self {
            dtype: self.dtype,
            values,
            scheme: self.scheme.clone(),
        })
    }

    /// Replace values keeping dtype and qparams
    pub fn with_values(&self, values: ArrayD<i32>) -> Self {
        Self {
            dtype: self.dtype,
            values,
            scheme: self.scheme.clone(),
        }
    }

    /// One byte per element, two's complement for signed storage
    pub fn to_bytes(&self) -> Vec<u8> {
        match self.dtype {
            QDtype::QInt8 => self.values.iter().map(|&v| (v as i8) as u8).collect(),
            QDtype::QUInt8 => self.values.iter().map(|&v| v as u8).collect(),
        }
    }

    /// Inverse of [`to_bytes`](Self::to_bytes)
    pub fn from_bytes(dtype: QDtype, shape: &[usize], bytes: &[u8], scheme: QScheme) -> Result<Self> {
        let ints: Vec<i32> = match dtype {
            QDtype::QInt8 => bytes.iter().map(|&b| i32::from(b as i8)).collect(),
            QDtype::QUInt8 => bytes.iter().map(|&b| i32::from(b)).collect(),
        };
        let values = ArrayD::from_shape_vec(IxDyn(shape), ints)
            .map_err(|e| Error::Serialization(format!("quantized tensor shape: {e}")))?;
        Self::from_parts(dtype, values, scheme)
    }

    /// Bytes occupied by the integer payload
    pub fn num_bytes(&self) -> usize {
        self.values.len()
    }
}

fn quantize_value(x: f32, scale: f32, zero_point: i32, lo: i32, hi: i32) -> i32 {
    ((x / scale).round() as i32 + zero_point).clamp(lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;
    use proptest::prelude::*;

    #[test]
    fn test_per_tensor_quantize_dequantize() {
        let x = arr1(&[-1.0f32, 0.0, 0.5, 1.0]).into_dyn();
        let q = QTensor::quantize(
            &x,
            QDtype::QUInt8,
            QScheme::PerTensorAffine {
                scale: 2.0 / 255.0,
                zero_point: 128,
            },
        )
        .unwrap();
        let back = q.dequantize();
        for (a, b) in x.iter().zip(back.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 0.01);
        }
    }

    #[test]
    fn test_per_channel_uses_channel_scale() {
        let x = ndarray::arr2(&[[1.0f32, -1.0], [10.0, -10.0]]).into_dyn();
        let scheme = QScheme::PerChannelAffine {
            axis: 0,
            scales: vec![1.0 / 127.0, 10.0 / 127.0],
            zero_points: vec![0, 0],
        };
        let q = QTensor::quantize(&x, QDtype::QInt8, scheme).unwrap();
        assert_eq!(q.int_repr()[[0, 0]], 127);
        assert_eq!(q.int_repr()[[1, 1]], -127);
    }

    #[test]
    fn test_values_clamped_to_dtype_range() {
        let x = arr1(&[1000.0f32, -1000.0]).into_dyn();
        let q = QTensor::quantize(
            &x,
            QDtype::QInt8,
            QScheme::PerTensorAffine {
                scale: 1.0,
                zero_point: 0,
            },
        )
        .unwrap();
        assert_eq!(q.int_repr().as_slice().unwrap(), &[127, -128]);
    }

    #[test]
    fn test_channel_count_validated() {
        let values = ArrayD::<i32>::zeros(IxDyn(&[3, 2]));
        let scheme = QScheme::PerChannelAffine {
            axis: 0,
            scales: vec![1.0; 2],
            zero_points: vec![0; 2],
        };
        assert!(QTensor::from_parts(QDtype::QInt8, values, scheme).is_err());
    }

    #[test]
    fn test_reshape_rejects_per_channel() {
        let x = ndarray::arr2(&[[1.0f32], [2.0]]).into_dyn();
        let scheme = QScheme::PerChannelAffine {
            axis: 0,
            scales: vec![1.0, 1.0],
            zero_points: vec![0, 0],
        };
        let q = QTensor::quantize(&x, QDtype::QInt8, scheme).unwrap();
        assert!(q.reshape(&[2]).is_err());
    }

    proptest! {
        #[test]
        fn prop_bytes_preserve_int_repr(values in prop::collection::vec(-128i32..=127, 1..32)) {
            let n = values.len();
            let arr = ArrayD::from_shape_vec(IxDyn(&[n]), values).unwrap();
            let scheme = QScheme::PerTensorAffine { scale: 0.1, zero_point: 0 };
            let q = QTensor::from_parts(QDtype::QInt8, arr, scheme.clone()).unwrap();
            let restored = QTensor::from_bytes(QDtype::QInt8, &[n], &q.to_bytes(), scheme).unwrap();
            prop_assert_eq!(restored, q);
        }

        #[test]
        fn prop_dequantize_error_bounded_by_half_scale(x in prop::collection::vec(-4.0f32..4.0, 1..32)) {
            let scale = 8.0 / 255.0;
            let input = ArrayD::from_shape_vec(IxDyn(&[x.len()]), x.clone()).unwrap();
            let q = QTensor::quantize(
                &input,
                QDtype::QUInt8,
                QScheme::PerTensorAffine { scale, zero_point: 128 },
            ).unwrap();
            let back = q.dequantize();
            for (a, b) in x.iter().zip(back.iter()) {
                prop_assert!((a - b).abs() <= scale * 0.5 + 1e-5 || *a > 127.0 * scale);
            }
        }
    }
}
