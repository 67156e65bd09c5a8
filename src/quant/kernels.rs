//! Integer kernels for converted modules
//!
//! Activations are per-tensor `quint8`; weights are `qint8` with per-tensor
//! or per-channel (axis 0) qparams. Products accumulate in `i32`, the
//! accumulator is rescaled to float, biased, optionally rectified, and
//! requantized with the output qparams.

use super::qtensor::{QDtype, QScheme, QTensor};
use crate::error::{Error, Result};
use crate::nn::ops::{flat_shape, out_size};
use crate::Tensor;
use ndarray::{ArrayD, IxDyn};

/// Output qparams of a quantized layer
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OutputQParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl OutputQParams {
    fn requantize(&self, real: f32) -> i32 {
        let (lo, hi) = QDtype::QUInt8.range();
        ((real / self.scale).round() as i32 + self.zero_point).clamp(lo, hi)
    }

    fn scheme(&self) -> QScheme {
        QScheme::PerTensorAffine {
            scale: self.scale,
            zero_point: self.zero_point,
        }
    }
}

fn activation_params(x: &QTensor) -> Result<(f32, i32)> {
    x.scheme().per_tensor().ok_or_else(|| {
        Error::Unsupported("quantized activations must use per-tensor qparams".into())
    })
}

fn dims4(x: &QTensor, what: &str) -> Result<(usize, usize, usize, usize)> {
    match x.shape() {
        [n, c, h, w] => Ok((*n, *c, *h, *w)),
        other => Err(Error::Unsupported(format!(
            "{what} expects NCHW input, got {other:?}"
        ))),
    }
}

fn finish(dtype: QDtype, values: Vec<i32>, shape: &[usize], scheme: QScheme) -> Result<QTensor> {
    let values = ArrayD::from_shape_vec(IxDyn(shape), values)
        .map_err(|e| Error::Serialization(format!("kernel output shape: {e}")))?;
    QTensor::from_parts(dtype, values, scheme)
}

/// Quantized 2-D convolution
#[allow(clippy::too_many_arguments)]
pub fn qconv2d(
    x: &QTensor,
    weight: &QTensor,
    bias: &Tensor,
    stride: usize,
    padding: usize,
    relu: bool,
    out: OutputQParams,
) -> Result<QTensor> {
    let (x_scale, x_zp) = activation_params(x)?;
    let (n, c, h, w) = dims4(x, "quantized conv2d")?;
    let (o, wc, k, _) = dims4(weight, "quantized conv2d weight")?;
    if c != wc {
        return Err(Error::shape_mismatch("quantized conv2d channels", &[wc], &[c]));
    }
    let oh = out_size(h, k, stride, padding)?;
    let ow = out_size(w, k, stride, padding)?;
    let xv = x.int_repr();
    let wv = weight.int_repr();

    let mut values = Vec::with_capacity(n * o * oh * ow);
    for b in 0..n {
        for oc in 0..o {
            let (w_scale, w_zp) = weight.scheme().params_for(oc);
            let bias_v = bias.get([oc]).copied().unwrap_or(0.0);
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc: i32 = 0;
                    for ic in 0..c {
                        for ky in 0..k {
                            let iy = (oy * stride + ky) as isize - padding as isize;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            for kx in 0..k {
                                let ix = (ox * stride + kx) as isize - padding as isize;
                                if ix < 0 || ix >= w as isize {
                                    continue;
                                }
                                let xq = xv[[b, ic, iy as usize, ix as usize]] - x_zp;
                                let wq = wv[[oc, ic, ky, kx]] - w_zp;
                                acc += xq * wq;
                            }
                        }
                    }
                    let mut real = acc as f32 * x_scale * w_scale + bias_v;
                    if relu {
                        real = real.max(0.0);
                    }
                    values.push(out.requantize(real));
                }
            }
        }
    }
    finish(QDtype::QUInt8, values, &[n, o, oh, ow], out.scheme())
}

/// Quantized fully connected layer over `[N, F]` input
pub fn qlinear(
    x: &QTensor,
    weight: &QTensor,
    bias: &Tensor,
    relu: bool,
    out: OutputQParams,
) -> Result<QTensor> {
    let (x_scale, x_zp) = activation_params(x)?;
    let (n, f) = match x.shape() {
        [n, f] => (*n, *f),
        other => {
            return Err(Error::Unsupported(format!(
                "quantized linear expects [N, F] input, got {other:?}"
            )))
        }
    };
    let (o, wf) = match weight.shape() {
        [o, wf] => (*o, *wf),
        other => {
            return Err(Error::Unsupported(format!(
                "quantized linear weight must be 2-D, got {other:?}"
            )))
        }
    };
    if f != wf {
        return Err(Error::shape_mismatch("quantized linear features", &[wf], &[f]));
    }
    let xv = x.int_repr();
    let wv = weight.int_repr();
    let mut values = Vec::with_capacity(n * o);
    for b in 0..n {
        for oc in 0..o {
            let (w_scale, w_zp) = weight.scheme().params_for(oc);
            let acc: i32 = (0..f)
                .map(|i| (xv[[b, i]] - x_zp) * (wv[[oc, i]] - w_zp))
                .sum();
            let mut real = acc as f32 * x_scale * w_scale + bias.get([oc]).copied().unwrap_or(0.0);
            if relu {
                real = real.max(0.0);
            }
            values.push(out.requantize(real));
        }
    }
    finish(QDtype::QUInt8, values, &[n, o], out.scheme())
}

/// ReLU in the integer domain: clamp below at the zero point
pub fn qrelu(x: &QTensor) -> Result<QTensor> {
    let (_, zp) = activation_params(x)?;
    Ok(x.with_values(x.int_repr().mapv(|q| q.max(zp))))
}

/// Max pooling on integer values (monotone under affine dequantization)
pub fn qmax_pool2d(x: &QTensor, kernel: usize, stride: usize) -> Result<QTensor> {
    activation_params(x)?;
    let (n, c, h, w) = dims4(x, "quantized max_pool2d")?;
    let oh = out_size(h, kernel, stride, 0)?;
    let ow = out_size(w, kernel, stride, 0)?;
    let xv = x.int_repr();
    let mut values = Vec::with_capacity(n * c * oh * ow);
    for b in 0..n {
        for ch in 0..c {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut best = i32::MIN;
                    for ky in 0..kernel {
                        for kx in 0..kernel {
                            best = best.max(xv[[b, ch, oy * stride + ky, ox * stride + kx]]);
                        }
                    }
                    values.push(best);
                }
            }
        }
    }
    finish(x.dtype(), values, &[n, c, oh, ow], x.scheme().clone())
}

/// Global average pooling with the mean rounded to the nearest integer
pub fn qglobal_avg_pool(x: &QTensor) -> Result<QTensor> {
    activation_params(x)?;
    let (n, c, h, w) = dims4(x, "quantized adaptive_avg_pool2d")?;
    let area = (h * w).max(1) as f32;
    let xv = x.int_repr();
    let mut values = Vec::with_capacity(n * c);
    for b in 0..n {
        for ch in 0..c {
            let mut sum: i64 = 0;
            for y in 0..h {
                for xx in 0..w {
                    sum += i64::from(xv[[b, ch, y, xx]]);
                }
            }
            values.push((sum as f32 / area).round() as i32);
        }
    }
    finish(x.dtype(), values, &[n, c, 1, 1], x.scheme().clone())
}

pub fn qflatten(x: &QTensor) -> Result<QTensor> {
    x.reshape(&flat_shape(x.shape()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2, Array4};

    fn act(values: Tensor, scale: f32, zero_point: i32) -> QTensor {
        QTensor::quantize(
            &values,
            QDtype::QUInt8,
            QScheme::PerTensorAffine { scale, zero_point },
        )
        .unwrap()
    }

    #[test]
    fn test_qlinear_matches_float_within_scale() {
        let x = arr2(&[[0.5f32, 1.0], [0.25, 0.0]]).into_dyn();
        let w = arr2(&[[1.0f32, -1.0], [0.5, 0.5]]).into_dyn();
        let bias = arr1(&[0.1f32, -0.1]).into_dyn();
        let qx = act(x.clone(), 1.0 / 128.0, 0);
        let qw = QTensor::quantize(
            &w,
            QDtype::QInt8,
            QScheme::PerTensorAffine {
                scale: 1.0 / 127.0,
                zero_point: 0,
            },
        )
        .unwrap();
        let out = OutputQParams {
            scale: 2.0 / 255.0,
            zero_point: 128,
        };
        let y = qlinear(&qx, &qw, &bias, false, out).unwrap().dequantize();
        let expected = crate::nn::ops::linear(&x, &w, Some(&bias)).unwrap();
        for (a, b) in y.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 0.02);
        }
    }

    #[test]
    fn test_qconv2d_relu_clamps_at_zero_point() {
        let x = Array4::<f32>::from_elem((1, 1, 3, 3), 1.0).into_dyn();
        let w = Array4::<f32>::from_elem((1, 1, 3, 3), -1.0).into_dyn();
        let qx = act(x, 1.0 / 64.0, 0);
        let qw = QTensor::quantize(
            &w,
            QDtype::QInt8,
            QScheme::PerChannelAffine {
                axis: 0,
                scales: vec![1.0 / 127.0],
                zero_points: vec![0],
            },
        )
        .unwrap();
        let out = OutputQParams {
            scale: 0.1,
            zero_point: 10,
        };
        let bias = Tensor::zeros(IxDyn(&[1]));
        let y = qconv2d(&qx, &qw, &bias, 1, 0, true, out).unwrap();
        assert_eq!(y.shape(), &[1, 1, 1, 1]);
        assert_eq!(y.int_repr()[[0, 0, 0, 0]], 10);
    }

    #[test]
    fn test_qrelu_and_pooling() {
        let values = ArrayD::from_shape_vec(IxDyn(&[1, 1, 2, 2]), vec![3, 9, 5, 7]).unwrap();
        let x = QTensor::from_parts(
            QDtype::QUInt8,
            values,
            QScheme::PerTensorAffine {
                scale: 0.5,
                zero_point: 6,
            },
        )
        .unwrap();
        let r = qrelu(&x).unwrap();
        assert_eq!(r.int_repr().iter().copied().collect::<Vec<_>>(), vec![6, 9, 6, 7]);
        let m = qmax_pool2d(&x, 2, 2).unwrap();
        assert_eq!(m.int_repr()[[0, 0, 0, 0]], 9);
        let a = qglobal_avg_pool(&x).unwrap();
        assert_eq!(a.int_repr()[[0, 0, 0, 0]], 6);
        let f = qflatten(&a).unwrap();
        assert_eq!(f.shape(), &[1, 1]);
    }

    #[test]
    fn test_per_channel_activation_rejected() {
        let x = QTensor::quantize(
            &arr2(&[[1.0f32]]).into_dyn(),
            QDtype::QUInt8,
            QScheme::PerChannelAffine {
                axis: 0,
                scales: vec![1.0],
                zero_points: vec![0],
            },
        )
        .unwrap();
        assert!(qrelu(&x).is_err());
    }
}
