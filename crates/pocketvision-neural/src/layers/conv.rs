//! 2D convolution layer with grouped-kernel support.

use pocketvision_core::{ops, Element, Result, Tensor, TensorError};

/// 2D convolutional layer over channels-first feature maps.
///
/// Supports grouped convolution; `groups == in_channels` gives the depthwise
/// form used by the separable block variant.
#[derive(Debug, Clone)]
pub struct Conv2D<T> {
    weight: Tensor<T>,
    bias: Option<Tensor<T>>,
    in_channels: usize,
    out_channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    groups: usize,
}

impl<T: Element> Conv2D<T> {
    /// Create a layer with uniform Kaiming-style initialization,
    /// `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        groups: usize,
        use_bias: bool,
    ) -> Result<Self> {
        if groups == 0 || in_channels % groups != 0 || out_channels % groups != 0 {
            return Err(TensorError::invalid_argument(
                "Conv2D::new",
                format!(
                    "groups={groups} must evenly divide in={in_channels} and out={out_channels}"
                ),
            ));
        }
        let fan_in = (in_channels / groups) * kernel.0 * kernel.1;
        let bound = T::from_f64(1.0 / (fan_in as f64).sqrt())
            .ok_or_else(|| TensorError::invalid_argument("Conv2D::new", "empty kernel"))?;
        let weight = Tensor::rand_uniform(
            &[out_channels, in_channels / groups, kernel.0, kernel.1],
            -bound,
            bound,
        );
        let bias = use_bias.then(|| Tensor::rand_uniform(&[out_channels], -bound, bound));

        Ok(Self {
            weight,
            bias,
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            groups,
        })
    }

    pub fn forward(&self, input: &Tensor<T>) -> Result<Tensor<T>> {
        ops::conv2d(
            input,
            &self.weight,
            self.bias.as_ref(),
            self.stride,
            self.padding,
            self.groups,
        )
    }

    pub fn weight(&self) -> &Tensor<T> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor<T>> {
        self.bias.as_ref()
    }

    pub fn set_weight(&mut self, weight: Tensor<T>) {
        self.weight = weight;
    }

    pub fn set_bias(&mut self, bias: Option<Tensor<T>>) {
        self.bias = bias;
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn kernel(&self) -> (usize, usize) {
        self.kernel
    }

    pub fn stride(&self) -> (usize, usize) {
        self.stride
    }

    pub fn padding(&self) -> (usize, usize) {
        self.padding
    }

    pub fn groups(&self) -> usize {
        self.groups
    }

    pub fn parameters(&self) -> Vec<&Tensor<T>> {
        let mut params = vec![&self.weight];
        if let Some(ref bias) = self.bias {
            params.push(bias);
        }
        params
    }

    /// Fold a per-output-channel affine `y = scale[oc] * conv(x) + shift[oc]`
    /// into the layer's own weight and bias. Used by conv+batch-norm fusion.
    pub fn fold_scale_shift(&mut self, scale: &[T], shift: &[T]) -> Result<()> {
        if scale.len() != self.out_channels || shift.len() != self.out_channels {
            return Err(TensorError::shape_mismatch(
                "Conv2D::fold_scale_shift",
                format!("{} per-channel factors", self.out_channels),
                format!("{} scale / {} shift", scale.len(), shift.len()),
            ));
        }
        let per_channel = self.weight.numel() / self.out_channels;
        let w = self
            .weight
            .as_slice_mut()
            .ok_or_else(|| {
                TensorError::unsupported_operation("fold_scale_shift", "non-contiguous weight")
            })?;
        for oc in 0..self.out_channels {
            for i in 0..per_channel {
                let idx = oc * per_channel + i;
                w[idx] = w[idx] * scale[oc];
            }
        }

        let old_bias = self.bias.take();
        let mut new_bias = vec![T::zero(); self.out_channels];
        if let Some(b) = old_bias {
            for (nb, (&ob, &s)) in new_bias.iter_mut().zip(b.to_vec().iter().zip(scale)) {
                *nb = ob * s;
            }
        }
        for (nb, &sh) in new_bias.iter_mut().zip(shift) {
            *nb = *nb + sh;
        }
        self.bias = Some(Tensor::from_vec(new_bias, &[self.out_channels])?);
        Ok(())
    }
}
