//! Batch normalization over channels-first feature maps.

use pocketvision_core::{ops, Element, Result, Tensor, TensorError};

/// Per-channel batch normalization in inference mode.
///
/// Normalizes with the stored running statistics, then applies the learned
/// affine `gamma * x + beta`. Training-time statistics updates are out of
/// scope; running stats are set at construction or by [`set_running_stats`].
///
/// [`set_running_stats`]: BatchNorm2D::set_running_stats
#[derive(Debug, Clone)]
pub struct BatchNorm2D<T> {
    gamma: Tensor<T>,
    beta: Tensor<T>,
    running_mean: Tensor<T>,
    running_var: Tensor<T>,
    eps: f64,
    num_features: usize,
}

impl<T: Element> BatchNorm2D<T> {
    pub fn new(num_features: usize) -> Self {
        Self {
            gamma: Tensor::ones(&[num_features]),
            beta: Tensor::zeros(&[num_features]),
            running_mean: Tensor::zeros(&[num_features]),
            running_var: Tensor::ones(&[num_features]),
            eps: 1e-5,
            num_features,
        }
    }

    pub fn forward(&self, input: &Tensor<T>) -> Result<Tensor<T>> {
        ops::batch_norm2d(
            input,
            &self.gamma,
            &self.beta,
            &self.running_mean,
            &self.running_var,
            self.eps,
        )
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn gamma(&self) -> &Tensor<T> {
        &self.gamma
    }

    pub fn beta(&self) -> &Tensor<T> {
        &self.beta
    }

    pub fn running_mean(&self) -> &Tensor<T> {
        &self.running_mean
    }

    pub fn running_var(&self) -> &Tensor<T> {
        &self.running_var
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Learnable parameters only: the running statistics are buffers, not
    /// parameters, and do not count toward the model's parameter total.
    pub fn parameters(&self) -> Vec<&Tensor<T>> {
        vec![&self.gamma, &self.beta]
    }

    pub fn set_affine(&mut self, gamma: Tensor<T>, beta: Tensor<T>) -> Result<()> {
        self.check_channel_vec("set_affine", &gamma)?;
        self.check_channel_vec("set_affine", &beta)?;
        self.gamma = gamma;
        self.beta = beta;
        Ok(())
    }

    pub fn set_running_stats(&mut self, mean: Tensor<T>, var: Tensor<T>) -> Result<()> {
        self.check_channel_vec("set_running_stats", &mean)?;
        self.check_channel_vec("set_running_stats", &var)?;
        self.running_mean = mean;
        self.running_var = var;
        Ok(())
    }

    /// Express the normalization as a per-channel affine
    /// `y = scale[c] * x + shift[c]`, the form consumed by conv fusion.
    pub fn scale_shift(&self) -> Result<(Vec<T>, Vec<T>)> {
        let eps = T::from_f64(self.eps).ok_or_else(|| {
            TensorError::invalid_argument("BatchNorm2D::scale_shift", "eps not representable")
        })?;
        let gamma = self.gamma.to_vec();
        let beta = self.beta.to_vec();
        let mean = self.running_mean.to_vec();
        let var = self.running_var.to_vec();

        let mut scale = Vec::with_capacity(self.num_features);
        let mut shift = Vec::with_capacity(self.num_features);
        for c in 0..self.num_features {
            let inv_std = T::one() / (var[c] + eps).sqrt();
            let s = gamma[c] * inv_std;
            scale.push(s);
            shift.push(beta[c] - mean[c] * s);
        }
        Ok((scale, shift))
    }

    fn check_channel_vec(&self, operation: &str, t: &Tensor<T>) -> Result<()> {
        if t.shape() != [self.num_features] {
            return Err(TensorError::shape_mismatch(
                operation,
                format!("[{}]", self.num_features),
                format!("{:?}", t.shape()),
            ));
        }
        Ok(())
    }
}
