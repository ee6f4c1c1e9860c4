use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, IxDyn, LinalgScalar};
use num_traits::{Float, FromPrimitive, ToPrimitive};
use rand::distributions::uniform::SampleUniform;
use rand::distributions::{Distribution, Uniform};

use crate::error::{Result, TensorError};

/// Scalar element type accepted by the CPU reference kernels.
///
/// Satisfied by `f32` and `f64`; kernels that need narrower bounds (for
/// example the u8 quantized storage) spell them out explicitly instead.
pub trait Element:
    Float
    + FromPrimitive
    + ToPrimitive
    + LinalgScalar
    + SampleUniform
    + Default
    + std::fmt::Debug
    + Send
    + Sync
    + 'static
{
}

impl<T> Element for T where
    T: Float
        + FromPrimitive
        + ToPrimitive
        + LinalgScalar
        + SampleUniform
        + Default
        + std::fmt::Debug
        + Send
        + Sync
        + 'static
{
}

/// Dense n-dimensional tensor backed by `ndarray` storage.
///
/// Feature maps use the channels-first `[batch, channels, height, width]`
/// layout unless explicitly converted with [`Tensor::to_channels_last`].
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    data: ArrayD<T>,
}

impl<T: Clone> Tensor<T> {
    pub fn from_array(data: ArrayD<T>) -> Self {
        Self { data }
    }

    pub fn from_vec(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        let array = ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|e| {
            TensorError::invalid_argument("from_vec", format!("shape {shape:?}: {e}"))
        })?;
        Ok(Self { data: array })
    }

    pub fn full(shape: &[usize], value: T) -> Self {
        Self {
            data: ArrayD::from_elem(IxDyn(shape), value),
        }
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Contiguous view of the underlying storage, if standard layout.
    pub fn as_slice(&self) -> Option<&[T]> {
        self.data.as_slice()
    }

    pub fn as_slice_mut(&mut self) -> Option<&mut [T]> {
        self.data.as_slice_mut()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.data.iter().cloned().collect()
    }

    pub fn view(&self) -> ArrayViewD<'_, T> {
        self.data.view()
    }

    pub fn view_mut(&mut self) -> ArrayViewMutD<'_, T> {
        self.data.view_mut()
    }

    pub fn array(&self) -> &ArrayD<T> {
        &self.data
    }

    pub fn map<U: Clone>(&self, f: impl Fn(&T) -> U) -> Tensor<U> {
        Tensor {
            data: self.data.map(f),
        }
    }

    /// Permute a 4D `[N, C, H, W]` tensor to `[N, H, W, C]`.
    pub fn to_channels_last(&self) -> Result<Tensor<T>> {
        if self.ndim() != 4 {
            return Err(TensorError::invalid_argument(
                "to_channels_last",
                format!("expected a 4D tensor, got {} dimensions", self.ndim()),
            ));
        }
        let permuted = self.data.view().permuted_axes(vec![0, 2, 3, 1]);
        Ok(Tensor {
            data: permuted.as_standard_layout().to_owned(),
        })
    }

    /// Permute a 4D `[N, H, W, C]` tensor back to `[N, C, H, W]`.
    pub fn to_channels_first(&self) -> Result<Tensor<T>> {
        if self.ndim() != 4 {
            return Err(TensorError::invalid_argument(
                "to_channels_first",
                format!("expected a 4D tensor, got {} dimensions", self.ndim()),
            ));
        }
        let permuted = self.data.view().permuted_axes(vec![0, 3, 1, 2]);
        Ok(Tensor {
            data: permuted.as_standard_layout().to_owned(),
        })
    }
}

impl<T: Clone + num_traits::Zero> Tensor<T> {
    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, T::zero())
    }
}

impl<T: Clone + num_traits::One> Tensor<T> {
    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, T::one())
    }
}

impl<T: Clone + SampleUniform + PartialOrd> Tensor<T> {
    /// Tensor with elements drawn uniformly from `[low, high)`.
    pub fn rand_uniform(shape: &[usize], low: T, high: T) -> Self {
        let dist = Uniform::new(low, high);
        let mut rng = rand::thread_rng();
        let numel: usize = shape.iter().product();
        let data: Vec<T> = (0..numel).map(|_| dist.sample(&mut rng)).collect();
        Self {
            data: ArrayD::from_shape_vec(IxDyn(shape), data)
                .expect("length matches shape by construction"),
        }
    }
}
