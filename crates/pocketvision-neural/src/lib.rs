//! # PocketVision Neural
//!
//! A toy convolutional classifier and the deployment pipeline around it:
//! conv/batch-norm fusion, post-training static quantization (native and
//! interchange-format flavors), mobile optimization, accelerator lowering
//! and artifact benchmarking.
//!
//! The demo flow lives in the `toy_deploy` binary; the building blocks are
//! exported here. A typical deployment:
//!
//! ```no_run
//! use pocketvision_neural::data::{DataLoader, ToyDataset};
//! use pocketvision_neural::deployment::{deploy_quantized, DeployConfig, QuantBackend};
//! use pocketvision_neural::model::{BlockVariant, ToyClassifier};
//!
//! # fn main() -> pocketvision_neural::error::Result<()> {
//! let model = ToyClassifier::<f32>::new(BlockVariant::Standard)?;
//! let loader = DataLoader::new(ToyDataset::new());
//! let cfg = DeployConfig::new("deploy_out");
//! let artifacts = deploy_quantized(&loader, &model, true, "classifier", QuantBackend::Fbgemm, &cfg)?;
//! # let _ = artifacts; Ok(())
//! # }
//! ```

pub mod benchmark;
pub mod data;
pub mod deployment;
pub mod error;
pub mod layers;
pub mod model;

pub use benchmark::{benchmark, file_size_mb, report_params, DeployArtifact};
pub use data::{DataLoader, Dataset, ToyDataset};
pub use error::{NeuralError, Result};
pub use model::{BlockVariant, ToyClassifier};
