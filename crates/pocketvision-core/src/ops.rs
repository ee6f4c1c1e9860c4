//! CPU reference kernels for the small set of operations the deployment
//! pipeline needs: grouped 2D convolution, batch normalization, ReLU and
//! global average pooling.
//!
//! Convolution is lowered through im2col and a per-group matrix multiply.
//! These are reference implementations; kernel efficiency is out of scope.

use ndarray::{Array2, ArrayView2};

use crate::error::{Result, TensorError};
use crate::tensor::{Element, Tensor};

/// Grouped 2D convolution over a `[N, C_in, H, W]` input with a
/// `[C_out, C_in / groups, KH, KW]` weight and symmetric zero padding.
pub fn conv2d<T: Element>(
    input: &Tensor<T>,
    weight: &Tensor<T>,
    bias: Option<&Tensor<T>>,
    stride: (usize, usize),
    padding: (usize, usize),
    groups: usize,
) -> Result<Tensor<T>> {
    if input.ndim() != 4 || weight.ndim() != 4 {
        return Err(TensorError::shape_mismatch(
            "conv2d",
            "4D input and 4D weight",
            format!("{}D input, {}D weight", input.ndim(), weight.ndim()),
        ));
    }
    let (n, c_in, h, w) = {
        let s = input.shape();
        (s[0], s[1], s[2], s[3])
    };
    let (c_out, wc, kh, kw) = {
        let s = weight.shape();
        (s[0], s[1], s[2], s[3])
    };
    if groups == 0 || c_in % groups != 0 || c_out % groups != 0 {
        return Err(TensorError::invalid_argument(
            "conv2d",
            format!("groups={groups} must evenly divide in={c_in} and out={c_out} channels"),
        ));
    }
    let cg = c_in / groups;
    let og = c_out / groups;
    if wc != cg {
        return Err(TensorError::shape_mismatch(
            "conv2d",
            format!("weight with {cg} input channels per group"),
            format!("weight with {wc} input channels per group"),
        ));
    }
    if let Some(b) = bias {
        if b.shape() != [c_out] {
            return Err(TensorError::shape_mismatch(
                "conv2d",
                format!("bias of shape [{c_out}]"),
                format!("{:?}", b.shape()),
            ));
        }
    }
    let (sh, sw) = stride;
    let (ph, pw) = padding;
    if sh == 0 || sw == 0 {
        return Err(TensorError::invalid_argument("conv2d", "stride must be >= 1"));
    }
    if h + 2 * ph < kh || w + 2 * pw < kw {
        return Err(TensorError::invalid_argument(
            "conv2d",
            format!("kernel ({kh}, {kw}) larger than padded input ({h}+2*{ph}, {w}+2*{pw})"),
        ));
    }
    let oh = (h + 2 * ph - kh) / sh + 1;
    let ow = (w + 2 * pw - kw) / sw + 1;
    let ohw = oh * ow;

    let x = input
        .as_slice()
        .ok_or_else(|| TensorError::unsupported_operation("conv2d", "non-contiguous input"))?;
    let wt = weight
        .as_slice()
        .ok_or_else(|| TensorError::unsupported_operation("conv2d", "non-contiguous weight"))?;
    let bias_slice = match bias {
        Some(b) => b.as_slice(),
        None => None,
    };

    let mut output = Tensor::<T>::zeros(&[n, c_out, oh, ow]);
    let rows = cg * kh * kw;
    let out = output
        .as_slice_mut()
        .expect("freshly allocated output is contiguous");

    let mut col = vec![T::zero(); rows * ohw];
    for ni in 0..n {
        for g in 0..groups {
            // im2col for this sample/group.
            col.iter_mut().for_each(|v| *v = T::zero());
            for ci in 0..cg {
                let src = (ni * c_in + g * cg + ci) * h * w;
                for ky in 0..kh {
                    for kx in 0..kw {
                        let row = (ci * kh + ky) * kw + kx;
                        let dst = row * ohw;
                        for oy in 0..oh {
                            let iy = (oy * sh + ky) as isize - ph as isize;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            let line = src + iy as usize * w;
                            for ox in 0..ow {
                                let ix = (ox * sw + kx) as isize - pw as isize;
                                if ix < 0 || ix >= w as isize {
                                    continue;
                                }
                                col[dst + oy * ow + ox] = x[line + ix as usize];
                            }
                        }
                    }
                }
            }

            let col_view = ArrayView2::from_shape((rows, ohw), &col)
                .expect("im2col buffer matches its shape");
            let wstart = g * og * rows;
            let wview = ArrayView2::from_shape((og, rows), &wt[wstart..wstart + og * rows])
                .expect("weight slice matches its shape");
            let result: Array2<T> = wview.dot(&col_view);

            let res = result.as_slice().expect("matmul result is contiguous");
            for oi in 0..og {
                let oc = g * og + oi;
                let dst = (ni * c_out + oc) * ohw;
                let src = oi * ohw;
                match bias_slice {
                    Some(b) => {
                        let bv = b[oc];
                        for i in 0..ohw {
                            out[dst + i] = res[src + i] + bv;
                        }
                    }
                    None => out[dst..dst + ohw].copy_from_slice(&res[src..src + ohw]),
                }
            }
        }
    }

    Ok(output)
}

/// Inference-mode batch normalization over `[N, C, H, W]` using running
/// statistics.
pub fn batch_norm2d<T: Element>(
    input: &Tensor<T>,
    gamma: &Tensor<T>,
    beta: &Tensor<T>,
    running_mean: &Tensor<T>,
    running_var: &Tensor<T>,
    eps: f64,
) -> Result<Tensor<T>> {
    if input.ndim() != 4 {
        return Err(TensorError::shape_mismatch(
            "batch_norm2d",
            "4D input",
            format!("{}D input", input.ndim()),
        ));
    }
    let c = input.shape()[1];
    for (name, t) in [
        ("gamma", gamma),
        ("beta", beta),
        ("running_mean", running_mean),
        ("running_var", running_var),
    ] {
        if t.shape() != [c] {
            return Err(TensorError::shape_mismatch(
                "batch_norm2d",
                format!("{name} of shape [{c}]"),
                format!("{:?}", t.shape()),
            ));
        }
    }
    let eps = T::from_f64(eps)
        .ok_or_else(|| TensorError::invalid_argument("batch_norm2d", "eps not representable"))?;

    let (n, _, h, w) = {
        let s = input.shape();
        (s[0], s[1], s[2], s[3])
    };
    let hw = h * w;
    let x = input
        .as_slice()
        .ok_or_else(|| TensorError::unsupported_operation("batch_norm2d", "non-contiguous input"))?;
    let g = gamma.as_slice().expect("1D parameter is contiguous");
    let b = beta.as_slice().expect("1D parameter is contiguous");
    let mu = running_mean.as_slice().expect("1D parameter is contiguous");
    let var = running_var.as_slice().expect("1D parameter is contiguous");

    let mut output = Tensor::<T>::zeros(input.shape());
    let out = output.as_slice_mut().expect("fresh output is contiguous");
    for ni in 0..n {
        for ci in 0..c {
            let scale = g[ci] / (var[ci] + eps).sqrt();
            let shift = b[ci] - mu[ci] * scale;
            let base = (ni * c + ci) * hw;
            for i in 0..hw {
                out[base + i] = x[base + i] * scale + shift;
            }
        }
    }
    Ok(output)
}

/// Elementwise `max(x, 0)`.
pub fn relu<T: Element>(input: &Tensor<T>) -> Tensor<T> {
    input.map(|&v| if v > T::zero() { v } else { T::zero() })
}

/// Global average pooling: `[N, C, H, W]` -> `[N, C, 1, 1]`.
pub fn global_avg_pool<T: Element>(input: &Tensor<T>) -> Result<Tensor<T>> {
    if input.ndim() != 4 {
        return Err(TensorError::shape_mismatch(
            "global_avg_pool",
            "4D input",
            format!("{}D input", input.ndim()),
        ));
    }
    let (n, c, h, w) = {
        let s = input.shape();
        (s[0], s[1], s[2], s[3])
    };
    let hw = h * w;
    let denom = T::from_usize(hw)
        .ok_or_else(|| TensorError::invalid_argument("global_avg_pool", "empty spatial extent"))?;
    let x = input.as_slice().ok_or_else(|| {
        TensorError::unsupported_operation("global_avg_pool", "non-contiguous input")
    })?;

    let mut output = Tensor::<T>::zeros(&[n, c, 1, 1]);
    let out = output.as_slice_mut().expect("fresh output is contiguous");
    for ni in 0..n {
        for ci in 0..c {
            let base = (ni * c + ci) * hw;
            let mut acc = T::zero();
            for i in 0..hw {
                acc = acc + x[base + i];
            }
            out[ni * c + ci] = acc / denom;
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn conv2d_same_padding_box_filter() {
        let input = Tensor::from_vec((1..=9).map(|v| v as f32).collect(), &[1, 1, 3, 3]).unwrap();
        let weight = Tensor::<f32>::ones(&[1, 1, 3, 3]);
        let out = conv2d(&input, &weight, None, (1, 1), (1, 1), 1).unwrap();
        assert_eq!(out.shape(), &[1, 1, 3, 3]);
        // Center tap sees the whole input.
        assert_relative_eq!(out.to_vec()[4], 45.0);
        // Top-left tap sees the 2x2 corner.
        assert_relative_eq!(out.to_vec()[0], 1.0 + 2.0 + 4.0 + 5.0);
    }

    #[test]
    fn conv2d_stride_and_bias() {
        let input = Tensor::<f32>::ones(&[1, 1, 4, 4]);
        let weight = Tensor::<f32>::ones(&[2, 1, 3, 3]);
        let bias = Tensor::from_vec(vec![0.5f32, -0.5], &[2]).unwrap();
        let out = conv2d(&input, &weight, Some(&bias), (2, 2), (1, 1), 1).unwrap();
        assert_eq!(out.shape(), &[1, 2, 2, 2]);
        let v = out.to_vec();
        assert_relative_eq!(v[0], 4.0 + 0.5);
        assert_relative_eq!(v[4], 4.0 - 0.5);
    }

    #[test]
    fn conv2d_depthwise_groups() {
        // Two channels, groups=2: each output channel convolves only its own
        // input channel.
        let mut data = vec![1.0f32; 9];
        data.extend(vec![2.0f32; 9]);
        let input = Tensor::from_vec(data, &[1, 2, 3, 3]).unwrap();
        let weight = Tensor::<f32>::ones(&[2, 1, 1, 1]);
        let out = conv2d(&input, &weight, None, (1, 1), (0, 0), 2).unwrap();
        let v = out.to_vec();
        assert!(v[..9].iter().all(|&x| x == 1.0));
        assert!(v[9..].iter().all(|&x| x == 2.0));
    }

    #[test]
    fn conv2d_rejects_channel_mismatch() {
        let input = Tensor::<f32>::zeros(&[1, 3, 8, 8]);
        let weight = Tensor::<f32>::zeros(&[4, 2, 3, 3]);
        let err = conv2d(&input, &weight, None, (1, 1), (1, 1), 1).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));
    }

    #[test]
    fn batch_norm_applies_running_stats() {
        let input = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[1, 1, 2, 2]).unwrap();
        let gamma = Tensor::from_vec(vec![2.0f32], &[1]).unwrap();
        let beta = Tensor::from_vec(vec![1.0f32], &[1]).unwrap();
        let mean = Tensor::from_vec(vec![2.0f32], &[1]).unwrap();
        let var = Tensor::from_vec(vec![4.0f32], &[1]).unwrap();
        let out = batch_norm2d(&input, &gamma, &beta, &mean, &var, 0.0).unwrap();
        let v = out.to_vec();
        assert_relative_eq!(v[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(v[3], 3.0, epsilon = 1e-6);
    }

    #[test]
    fn relu_clips_negatives() {
        let input = Tensor::from_vec(vec![-1.0f32, 0.0, 2.0], &[3]).unwrap();
        assert_eq!(relu(&input).to_vec(), vec![0.0, 0.0, 2.0]);
    }

    #[test]
    fn global_avg_pool_reduces_to_unit_spatial() {
        let input = Tensor::from_vec((0..8).map(|v| v as f32).collect(), &[1, 2, 2, 2]).unwrap();
        let out = global_avg_pool(&input).unwrap();
        assert_eq!(out.shape(), &[1, 2, 1, 1]);
        assert_eq!(out.to_vec(), vec![1.5, 5.5]);
    }
}
