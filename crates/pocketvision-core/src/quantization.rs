//! Post-training quantization primitives: affine scale/zero-point
//! parameters, a min/max range observer and u8 tensor conversion.

#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};

use crate::error::{Result, TensorError};
use crate::tensor::Tensor;

/// Affine quantization parameters for a single tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct QuantizationParams {
    /// Scale factor for quantization
    pub scale: f32,
    /// Zero point for quantization
    pub zero_point: i32,
    /// Minimum value in the quantization range
    pub qmin: i32,
    /// Maximum value in the quantization range
    pub qmax: i32,
}

impl QuantizationParams {
    /// Full-range 8-bit unsigned parameters.
    pub fn uint8() -> Self {
        Self {
            scale: 1.0,
            zero_point: 0,
            qmin: 0,
            qmax: 255,
        }
    }

    /// Reduced-range (7-bit) unsigned parameters, used by server-class
    /// kernels that need headroom in accumulator registers.
    pub fn uint8_reduced() -> Self {
        Self {
            scale: 1.0,
            zero_point: 0,
            qmin: 0,
            qmax: 127,
        }
    }

    /// Compute scale and zero point covering `[min_val, max_val]` over the
    /// integer range of `self`. The range is widened to include zero so the
    /// zero point is exactly representable.
    pub fn from_min_max(&self, min_val: f32, max_val: f32) -> Self {
        let min_val = min_val.min(0.0);
        let max_val = max_val.max(0.0);
        let qmin = self.qmin as f32;
        let qmax = self.qmax as f32;

        // Guard degenerate ranges to avoid a zero scale.
        let range = if (max_val - min_val).abs() < 1e-7 {
            1e-7
        } else {
            max_val - min_val
        };
        let scale = range / (qmax - qmin);
        let zero_point = (qmin - min_val / scale).round() as i32;

        Self {
            scale,
            zero_point: zero_point.clamp(self.qmin, self.qmax),
            qmin: self.qmin,
            qmax: self.qmax,
        }
    }

    /// Quantize a floating-point value to the integer range.
    pub fn quantize(&self, value: f32) -> i32 {
        let q = (value / self.scale + self.zero_point as f32).round() as i32;
        q.clamp(self.qmin, self.qmax)
    }

    /// Dequantize an integer value back to floating point.
    pub fn dequantize(&self, quantized: i32) -> f32 {
        self.scale * (quantized - self.zero_point) as f32
    }
}

/// Quantize an f32 tensor into u8 storage.
pub fn quantize_tensor(tensor: &Tensor<f32>, params: &QuantizationParams) -> Result<Tensor<u8>> {
    if params.qmin < 0 || params.qmax > 255 {
        return Err(TensorError::invalid_argument(
            "quantize_tensor",
            format!(
                "integer range [{}, {}] does not fit u8 storage",
                params.qmin, params.qmax
            ),
        ));
    }
    Ok(tensor.map(|&v| params.quantize(v) as u8))
}

/// Dequantize u8 storage back to f32.
pub fn dequantize_tensor(tensor: &Tensor<u8>, params: &QuantizationParams) -> Tensor<f32> {
    tensor.map(|&q| params.dequantize(q as i32))
}

/// Quantize-then-dequantize, simulating the numeric effect of the integer
/// path without leaving f32.
pub fn fake_quantize(tensor: &Tensor<f32>, params: &QuantizationParams) -> Tensor<f32> {
    tensor.map(|&v| params.dequantize(params.quantize(v)))
}

/// Running min/max range observer used during calibration.
#[derive(Debug, Clone, Default)]
pub struct MinMaxObserver {
    min_val: Option<f32>,
    max_val: Option<f32>,
    count: usize,
}

impl MinMaxObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an observed range into the running statistics.
    pub fn observe(&mut self, min: f32, max: f32) {
        self.min_val = Some(self.min_val.map_or(min, |v| v.min(min)));
        self.max_val = Some(self.max_val.map_or(max, |v| v.max(max)));
        self.count += 1;
    }

    /// Observe the full value range of a tensor. Empty tensors are ignored.
    pub fn observe_tensor(&mut self, tensor: &Tensor<f32>) {
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for &v in tensor.view().iter() {
            min = min.min(v);
            max = max.max(v);
        }
        if min <= max {
            self.observe(min, max);
        }
    }

    pub fn min_max(&self) -> Option<(f32, f32)> {
        match (self.min_val, self.max_val) {
            (Some(min), Some(max)) => Some((min, max)),
            _ => None,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn round_trip_error_is_bounded_by_scale() {
        let params = QuantizationParams::uint8().from_min_max(-4.0, 4.0);
        for value in [-3.7f32, -0.01, 0.0, 1.5, 3.99] {
            let deq = params.dequantize(params.quantize(value));
            assert!((value - deq).abs() <= params.scale, "value {value}");
        }
    }

    #[test]
    fn zero_is_exactly_representable() {
        let params = QuantizationParams::uint8().from_min_max(0.3, 7.0);
        assert_relative_eq!(params.dequantize(params.quantize(0.0)), 0.0);
    }

    #[test]
    fn degenerate_range_keeps_positive_scale() {
        let params = QuantizationParams::uint8().from_min_max(2.0, 2.0);
        assert!(params.scale > 0.0);
    }

    #[test]
    fn reduced_range_caps_qmax() {
        let params = QuantizationParams::uint8_reduced().from_min_max(0.0, 10.0);
        assert_eq!(params.qmax, 127);
        assert_eq!(params.quantize(1e9), 127);
    }

    #[test]
    fn tensor_round_trip() {
        let t = Tensor::from_vec(vec![-1.0f32, 0.0, 0.5, 1.0], &[4]).unwrap();
        let params = QuantizationParams::uint8().from_min_max(-1.0, 1.0);
        let q = quantize_tensor(&t, &params).unwrap();
        let deq = dequantize_tensor(&q, &params);
        for (a, b) in t.to_vec().iter().zip(deq.to_vec()) {
            assert!((a - b).abs() <= params.scale);
        }
    }

    #[test]
    fn observer_tracks_running_range() {
        let mut obs = MinMaxObserver::new();
        assert!(obs.min_max().is_none());
        obs.observe(-2.0, 3.0);
        obs.observe(-1.0, 5.0);
        assert_eq!(obs.count(), 2);
        assert_eq!(obs.min_max(), Some((-2.0, 5.0)));
        obs.reset();
        assert_eq!(obs.count(), 0);
    }

    #[test]
    fn observer_consumes_tensors() {
        let mut obs = MinMaxObserver::new();
        let t = Tensor::from_vec(vec![0.25f32, -0.5, 2.0], &[3]).unwrap();
        obs.observe_tensor(&t);
        assert_eq!(obs.min_max(), Some((-0.5, 2.0)));
    }
}
