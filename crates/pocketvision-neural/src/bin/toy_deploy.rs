//! Demo: build both classifier variants and push each through every
//! deployment path.
//!
//! Usage: `toy_deploy [out_dir] [bench_iters]`

use std::env;
use std::process;

use pocketvision_neural::benchmark::report_params;
use pocketvision_neural::data::{DataLoader, ToyDataset};
use pocketvision_neural::deployment::{
    deploy_float, deploy_nnapi, deploy_onnx_quantized, deploy_quantized, DeployConfig,
    QuantBackend,
};
use pocketvision_neural::error::{NeuralError, Result};
use pocketvision_neural::model::{BlockVariant, ToyClassifier};

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let out_dir = args.next().unwrap_or_else(|| "deploy_out".to_string());
    let mut cfg = DeployConfig::new(out_dir);
    if let Some(iters) = args.next() {
        cfg.bench_iters = iters.parse().map_err(|_| {
            NeuralError::invalid_operation(
                "toy_deploy",
                format!("bench_iters must be a positive integer, got `{iters}`"),
            )
        })?;
    }

    for (variant, name) in [
        (BlockVariant::Standard, "classifier"),
        (BlockVariant::Separable, "optimized_classifier"),
    ] {
        let model = ToyClassifier::<f32>::new(variant)?;
        report_params(name, model.num_params());

        let loader = DataLoader::new(ToyDataset::new());

        deploy_float(&model, name, &cfg)?;

        deploy_onnx_quantized(&loader, &model, false, name, &cfg)?;
        deploy_onnx_quantized(&loader, &model, true, name, &cfg)?;

        deploy_quantized(&loader, &model, false, name, QuantBackend::Fbgemm, &cfg)?;
        deploy_quantized(&loader, &model, true, name, QuantBackend::Fbgemm, &cfg)?;

        deploy_nnapi(&loader, &model, true, name, QuantBackend::Qnnpack, &cfg)?;
    }
    Ok(())
}
