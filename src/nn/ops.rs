//! Float kernels over NCHW tensors

use crate::error::{Error, Result};
use crate::Tensor;
use ndarray::{Array2, Array4, Axis, Ix2, Ix4, IxDyn};

/// View a tensor as 4-D NCHW
pub fn as_nchw(x: &Tensor, what: &str) -> Result<Array4<f32>> {
    x.clone()
        .into_dimensionality::<Ix4>()
        .map_err(|_| Error::Unsupported(format!("{what} expects NCHW input, got {:?}", x.shape())))
}

/// View a tensor as 2-D `[N, F]`
pub fn as_matrix(x: &Tensor, what: &str) -> Result<Array2<f32>> {
    x.clone()
        .into_dimensionality::<Ix2>()
        .map_err(|_| Error::Unsupported(format!("{what} expects [N, F] input, got {:?}", x.shape())))
}

/// Output spatial size of a sliding window
pub fn out_size(input: usize, kernel: usize, stride: usize, padding: usize) -> Result<usize> {
    let padded = input + 2 * padding;
    if padded < kernel || stride == 0 {
        return Err(Error::Unsupported(format!(
            "window {kernel} (stride {stride}) does not fit input {input} with padding {padding}"
        )));
    }
    Ok((padded - kernel) / stride + 1)
}

/// Direct 2-D convolution; `weight` is `[O, C, k, k]`
pub fn conv2d(
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    stride: usize,
    padding: usize,
) -> Result<Tensor> {
    let x = as_nchw(input, "conv2d")?;
    let w = as_nchw(weight, "conv2d weight")?;
    let (n, c, h, wd) = x.dim();
    let (o, wc, k, _) = w.dim();
    if c != wc {
        return Err(Error::shape_mismatch("conv2d input channels", &[wc], &[c]));
    }
    let oh = out_size(h, k, stride, padding)?;
    let ow = out_size(wd, k, stride, padding)?;

    let mut out = Array4::<f32>::zeros((n, o, oh, ow));
    for b in 0..n {
        for oc in 0..o {
            let bias_v = bias.map_or(0.0, |t| t[[oc]]);
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = 0.0f32;
                    for ic in 0..c {
                        for ky in 0..k {
                            let iy = (oy * stride + ky) as isize - padding as isize;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            for kx in 0..k {
                                let ix = (ox * stride + kx) as isize - padding as isize;
                                if ix < 0 || ix >= wd as isize {
                                    continue;
                                }
                                acc += x[[b, ic, iy as usize, ix as usize]] * w[[oc, ic, ky, kx]];
                            }
                        }
                    }
                    out[[b, oc, oy, ox]] = acc + bias_v;
                }
            }
        }
    }
    Ok(out.into_dyn())
}

/// Batch mean and biased variance per channel of an NCHW tensor
pub fn channel_stats(input: &Tensor) -> Result<(Vec<f32>, Vec<f32>, usize)> {
    let x = as_nchw(input, "batch_norm")?;
    let (n, c, h, w) = x.dim();
    let count = n * h * w;
    if count == 0 {
        return Err(Error::Unsupported("batch_norm over an empty batch".into()));
    }
    let mut mean = vec![0.0f32; c];
    let mut var = vec![0.0f32; c];
    for ch in 0..c {
        let slice = x.index_axis(Axis(1), ch);
        let m = slice.sum() / count as f32;
        mean[ch] = m;
        var[ch] = slice.mapv(|v| (v - m) * (v - m)).sum() / count as f32;
    }
    Ok((mean, var, count))
}

/// Per-channel affine normalization `(x - mean) / sqrt(var + eps) * gamma + beta`
pub fn batch_norm(
    input: &Tensor,
    mean: &[f32],
    var: &[f32],
    gamma: &Tensor,
    beta: &Tensor,
    eps: f32,
) -> Result<Tensor> {
    let mut x = as_nchw(input, "batch_norm")?;
    let c = x.dim().1;
    if mean.len() != c || gamma.len() != c {
        return Err(Error::shape_mismatch("batch_norm channels", &[mean.len()], &[c]));
    }
    for (ch, mut slice) in x.axis_iter_mut(Axis(1)).enumerate() {
        let inv = 1.0 / (var[ch] + eps).sqrt();
        let g = gamma[[ch]];
        let b = beta[[ch]];
        let m = mean[ch];
        slice.mapv_inplace(|v| (v - m) * inv * g + b);
    }
    Ok(x.into_dyn())
}

/// `x @ W^T + b` with `weight` shaped `[out, in]`
pub fn linear(input: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let x = as_matrix(input, "linear")?;
    let w = as_matrix(weight, "linear weight")?;
    if x.ncols() != w.ncols() {
        return Err(Error::shape_mismatch(
            "linear input features",
            &[w.ncols()],
            &[x.ncols()],
        ));
    }
    let mut out = x.dot(&w.t());
    if let Some(b) = bias {
        for mut row in out.rows_mut() {
            for (v, bv) in row.iter_mut().zip(b.iter()) {
                *v += bv;
            }
        }
    }
    Ok(out.into_dyn())
}

pub fn relu(input: &Tensor) -> Tensor {
    input.mapv(|v| v.max(0.0))
}

/// Max pooling without padding
pub fn max_pool2d(input: &Tensor, kernel: usize, stride: usize) -> Result<Tensor> {
    let x = as_nchw(input, "max_pool2d")?;
    let (n, c, h, w) = x.dim();
    let oh = out_size(h, kernel, stride, 0)?;
    let ow = out_size(w, kernel, stride, 0)?;
    let mut out = Array4::<f32>::from_elem((n, c, oh, ow), f32::NEG_INFINITY);
    for ((b, ch, oy, ox), slot) in out.indexed_iter_mut() {
        for ky in 0..kernel {
            for kx in 0..kernel {
                *slot = slot.max(x[[b, ch, oy * stride + ky, ox * stride + kx]]);
            }
        }
    }
    Ok(out.into_dyn())
}

/// Global average pooling to `[N, C, 1, 1]`
pub fn global_avg_pool(input: &Tensor) -> Result<Tensor> {
    let x = as_nchw(input, "adaptive_avg_pool2d")?;
    let (n, c, h, w) = x.dim();
    let area = (h * w).max(1) as f32;
    let mut out = Array4::<f32>::zeros((n, c, 1, 1));
    for b in 0..n {
        for ch in 0..c {
            out[[b, ch, 0, 0]] = x.index_axis(Axis(0), b).index_axis(Axis(0), ch).sum() / area;
        }
    }
    Ok(out.into_dyn())
}

/// Shape after flattening all but the batch dimension
pub fn flat_shape(shape: &[usize]) -> Vec<usize> {
    match shape.split_first() {
        Some((n, rest)) => vec![*n, rest.iter().product()],
        None => vec![0, 0],
    }
}

pub fn flatten(input: &Tensor) -> Result<Tensor> {
    let shape = flat_shape(input.shape());
    input
        .clone()
        .into_shape_with_order(IxDyn(&shape))
        .map_err(|_| Error::shape_mismatch("flatten", &shape, input.shape()))
}

/// Row-wise softmax of `[N, K]` logits
pub fn softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}

/// Index of the largest value per row
pub fn argmax_rows(logits: &Array2<f32>) -> Vec<usize> {
    logits
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                    if v > best.1 {
                        (i, v)
                    } else {
                        best
                    }
                })
                .0
        })
        .collect()
}
