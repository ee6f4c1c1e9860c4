//! Toy dataset and batching loader.

use pocketvision_core::{Element, Tensor, TensorError};

use crate::error::{NeuralError, Result};

/// Fixed-length source of same-shape samples.
pub trait Dataset<T: Element> {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample at `index`, or `None` past the end. Samples carry no batch
    /// dimension.
    fn get(&self, index: usize) -> Option<&Tensor<T>>;
}

/// Uniform-random image-shaped samples standing in for real data.
#[derive(Debug, Clone)]
pub struct ToyDataset<T> {
    samples: Vec<Tensor<T>>,
}

impl<T: Element> ToyDataset<T> {
    /// Ten 3x224x224 samples, matching the demo pipeline.
    pub fn new() -> Self {
        Self::with_shape(10, &[3, 224, 224])
    }

    pub fn with_shape(len: usize, sample_shape: &[usize]) -> Self {
        let samples = (0..len)
            .map(|_| Tensor::rand_uniform(sample_shape, T::zero(), T::one()))
            .collect();
        Self { samples }
    }

    /// A dataset with no samples; calibration against it is an error.
    pub fn empty() -> Self {
        Self {
            samples: Vec::new(),
        }
    }
}

impl<T: Element> Default for ToyDataset<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Element> Dataset<T> for ToyDataset<T> {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Option<&Tensor<T>> {
        self.samples.get(index)
    }
}

/// Batches a dataset into stacked tensors. The final batch may be short.
#[derive(Debug, Clone)]
pub struct DataLoader<D> {
    dataset: D,
    batch_size: usize,
}

impl<D> DataLoader<D> {
    pub fn new(dataset: D) -> Self {
        Self {
            dataset,
            batch_size: 1,
        }
    }

    pub fn with_batch_size(dataset: D, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }
}

impl<D> DataLoader<D> {
    pub fn len<T: Element>(&self) -> usize
    where
        D: Dataset<T>,
    {
        self.dataset.len()
    }

    pub fn is_empty<T: Element>(&self) -> bool
    where
        D: Dataset<T>,
    {
        self.dataset.is_empty()
    }

    /// Materialize every batch as an owned `[B, ...]` tensor.
    pub fn batches<T: Element>(&self) -> Result<Vec<Tensor<T>>>
    where
        D: Dataset<T>,
    {
        let mut batches = Vec::new();
        let mut index = 0;
        while index < self.dataset.len() {
            let take = self.batch_size.min(self.dataset.len() - index);
            let mut stacked: Vec<Tensor<T>> = Vec::with_capacity(take);
            for offset in 0..take {
                let sample = self.dataset.get(index + offset).ok_or_else(|| {
                    NeuralError::invalid_operation(
                        "DataLoader::batches",
                        format!("dataset lied about its length at index {}", index + offset),
                    )
                })?;
                stacked.push(sample.clone());
            }
            batches.push(stack_batch(&stacked)?);
            index += take;
        }
        Ok(batches)
    }
}

/// Stack same-shape samples along a new leading batch axis.
pub fn stack_batch<T: Element>(samples: &[Tensor<T>]) -> Result<Tensor<T>> {
    let first = samples.first().ok_or_else(|| {
        NeuralError::invalid_operation("stack_batch", "cannot stack zero samples")
    })?;
    let sample_shape = first.shape().to_vec();
    let mut data = Vec::with_capacity(first.numel() * samples.len());
    for sample in samples {
        if sample.shape() != sample_shape.as_slice() {
            return Err(NeuralError::Tensor(TensorError::shape_mismatch(
                "stack_batch",
                format!("{sample_shape:?}"),
                format!("{:?}", sample.shape()),
            )));
        }
        data.extend(sample.to_vec());
    }
    let mut shape = vec![samples.len()];
    shape.extend_from_slice(&sample_shape);
    Ok(Tensor::from_vec(data, &shape)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_dataset_matches_demo_dimensions() {
        let ds = ToyDataset::<f32>::new();
        assert_eq!(ds.len(), 10);
        assert_eq!(ds.get(0).unwrap().shape(), &[3, 224, 224]);
        assert!(ds.get(10).is_none());
    }

    #[test]
    fn loader_defaults_to_single_sample_batches() {
        let loader = DataLoader::new(ToyDataset::<f32>::with_shape(4, &[3, 6, 6]));
        let batches = loader.batches().unwrap();
        assert_eq!(batches.len(), 4);
        assert!(batches.iter().all(|b| b.shape() == [1, 3, 6, 6]));
    }

    #[test]
    fn final_batch_may_be_short() {
        let loader = DataLoader::with_batch_size(ToyDataset::<f32>::with_shape(5, &[2, 4, 4]), 2);
        let batches = loader.batches().unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].shape(), &[2, 2, 4, 4]);
        assert_eq!(batches[2].shape(), &[1, 2, 4, 4]);
    }

    #[test]
    fn empty_dataset_yields_no_batches() {
        let loader = DataLoader::new(ToyDataset::<f32>::empty());
        assert!(loader.batches::<f32>().unwrap().is_empty());
    }
}
