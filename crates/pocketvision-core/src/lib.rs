//! # PocketVision Core
//!
//! Tensor container, CPU reference kernels and post-training quantization
//! primitives shared by the PocketVision deployment pipeline.
//!
//! The crate deliberately stays small: a dense [`Tensor`] over `ndarray`
//! storage, the handful of ops the toy classifier needs ([`ops`]), and the
//! affine quantization machinery ([`quantization`]) used by the calibration
//! and conversion passes in `pocketvision-neural`.

pub mod error;
pub mod ops;
pub mod quantization;
pub mod tensor;

pub use error::{Result, TensorError};
pub use quantization::{
    dequantize_tensor, fake_quantize, quantize_tensor, MinMaxObserver, QuantizationParams,
};
pub use tensor::{Element, Tensor};
