//! Deployment orchestrators.
//!
//! Each orchestrator deep-copies the model before touching it, switches the
//! copy to eval mode, runs one deployment recipe end to end and returns the
//! artifacts it wrote. Failures are fatal and propagate; no partial artifact
//! is retried or cleaned up.

use std::fs;
use std::path::PathBuf;

use pocketvision_core::{fake_quantize, Tensor};

use crate::benchmark::{
    benchmark_artifact, benchmark_onnx_artifact, record_artifact, DeployArtifact,
};
use crate::data::{DataLoader, Dataset};
use crate::deployment::capture::{script_model, trace_model, trace_model_channels_last};
use crate::deployment::mobile::{optimize_for_mobile, MobileBackend};
use crate::deployment::nnapi::{lower_to_accelerator, wrap_float_interface};
use crate::deployment::onnx::{export_onnx, quantize_static, CalibrationReader, ONNX_INPUT_NAME};
use crate::deployment::quantize::{prepare, QuantBackend};
use crate::error::Result;
use crate::model::ToyClassifier;

/// Where artifacts go and how hard to benchmark them.
#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub out_dir: PathBuf,
    pub bench_iters: usize,
    /// Spatial extent of example and benchmark inputs.
    pub input_hw: (usize, usize),
}

impl DeployConfig {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            bench_iters: 100,
            input_hw: (224, 224),
        }
    }

    fn input_shape(&self, model: &ToyClassifier<f32>) -> Vec<usize> {
        vec![1, model.in_channels(), self.input_hw.0, self.input_hw.1]
    }

    fn example(&self, model: &ToyClassifier<f32>) -> Tensor<f32> {
        Tensor::rand_uniform(&self.input_shape(model), 0.0, 1.0)
    }
}

fn fuse_tag(fuse: bool) -> &'static str {
    if fuse {
        "_fused"
    } else {
        ""
    }
}

/// Float deployment: script capture, plain trace and Vulkan-optimized script,
/// each saved and benchmarked. The Vulkan artifact keeps the `_traced` file
/// name even though it is captured by scripting.
pub fn deploy_float(
    model: &ToyClassifier<f32>,
    name: &str,
    cfg: &DeployConfig,
) -> Result<Vec<DeployArtifact>> {
    fs::create_dir_all(&cfg.out_dir)?;
    let mut model = model.clone();
    model.eval();
    let shape = cfg.input_shape(&model);
    let mut artifacts = Vec::with_capacity(3);

    let scripted = script_model(&model)?;
    let path = cfg.out_dir.join(format!("{name}_float_scripted.pt"));
    scripted.save(&path)?;
    artifacts.push(benchmark_artifact(&path, &shape, cfg.bench_iters)?);

    let traced = trace_model(&model, &cfg.example(&model))?;
    let path = cfg.out_dir.join(format!("{name}_float_traced.pt"));
    traced.save(&path)?;
    artifacts.push(benchmark_artifact(&path, &shape, cfg.bench_iters)?);

    let vulkan = optimize_for_mobile(scripted, MobileBackend::Vulkan)?;
    let path = cfg.out_dir.join(format!("{name}_float_vulkan_traced.pt"));
    vulkan.save(&path)?;
    artifacts.push(benchmark_artifact(&path, &shape, cfg.bench_iters)?);

    Ok(artifacts)
}

fn calibrated_quantized<D: Dataset<f32>>(
    loader: &DataLoader<D>,
    model: &ToyClassifier<f32>,
    fuse: bool,
    backend: QuantBackend,
) -> Result<ToyClassifier<f32>> {
    let mut model = model.clone();
    model.eval();
    if fuse {
        model.fuse()?;
    }
    let mut prepared = prepare(model, backend);
    for batch in loader.batches()? {
        prepared.calibrate(&batch)?;
    }
    prepared.convert()
}

/// Native post-training static quantization: optional fusion, calibration
/// over the loader, conversion to u8 weights, then CPU-optimized script and
/// trace artifacts.
pub fn deploy_quantized<D: Dataset<f32>>(
    loader: &DataLoader<D>,
    model: &ToyClassifier<f32>,
    fuse: bool,
    name: &str,
    backend: QuantBackend,
    cfg: &DeployConfig,
) -> Result<Vec<DeployArtifact>> {
    fs::create_dir_all(&cfg.out_dir)?;
    let quantized = calibrated_quantized(loader, model, fuse, backend)?;
    let shape = cfg.input_shape(&quantized);
    let tag = fuse_tag(fuse);
    let mut artifacts = Vec::with_capacity(2);

    let scripted = optimize_for_mobile(script_model(&quantized)?, MobileBackend::Cpu)?;
    let path = cfg.out_dir.join(format!("{name}{tag}_quant_scripted.pt"));
    scripted.save(&path)?;
    artifacts.push(benchmark_artifact(&path, &shape, cfg.bench_iters)?);

    let traced = trace_model(&quantized, &cfg.example(&quantized))?;
    let traced = optimize_for_mobile(traced, MobileBackend::Cpu)?;
    let path = cfg.out_dir.join(format!("{name}{tag}_quant_traced.pt"));
    traced.save(&path)?;
    artifacts.push(benchmark_artifact(&path, &shape, cfg.bench_iters)?);

    Ok(artifacts)
}

/// Accelerator deployment: quantize as in [`deploy_quantized`], strip the
/// boundary stubs, trace on a quantized channels-last example, lower onto
/// the accelerator delegate and write both the lowered program and its
/// float-interface wrapper. Neither artifact is benchmarked.
pub fn deploy_nnapi<D: Dataset<f32>>(
    loader: &DataLoader<D>,
    model: &ToyClassifier<f32>,
    fuse: bool,
    name: &str,
    backend: QuantBackend,
    cfg: &DeployConfig,
) -> Result<Vec<DeployArtifact>> {
    fs::create_dir_all(&cfg.out_dir)?;
    let mut quantized = calibrated_quantized(loader, model, fuse, backend)?;
    let (input_params, output_params) = quantized.strip_quant_stubs()?;
    let tag = fuse_tag(fuse);
    let mut artifacts = Vec::with_capacity(2);

    let example = cfg.example(&quantized);
    let nhwc_example = fake_quantize(&example, &input_params).to_channels_last()?;
    let traced = trace_model_channels_last(&quantized, &nhwc_example)?;
    let lowered = lower_to_accelerator(traced)?;

    let path = cfg.out_dir.join(format!("{name}{tag}_nnapi_traced.pt"));
    lowered.save(&path)?;
    artifacts.push(record_artifact(&path)?);

    let wrapped = wrap_float_interface(lowered, input_params, output_params);
    let path = cfg
        .out_dir
        .join(format!("{name}{tag}_nnapi_float_interface_traced.pt"));
    wrapped.save(&path)?;
    artifacts.push(record_artifact(&path)?);

    Ok(artifacts)
}

/// Interchange-format deployment: export the float graph, statically
/// quantize it by replaying a calibration reader, and benchmark both
/// artifacts through inference sessions.
pub fn deploy_onnx_quantized<D: Dataset<f32>>(
    loader: &DataLoader<D>,
    model: &ToyClassifier<f32>,
    fuse: bool,
    name: &str,
    cfg: &DeployConfig,
) -> Result<Vec<DeployArtifact>> {
    fs::create_dir_all(&cfg.out_dir)?;
    let mut model = model.clone();
    model.eval();
    if fuse {
        model.fuse()?;
    }
    let shape = cfg.input_shape(&model);
    let tag = fuse_tag(fuse);
    let mut artifacts = Vec::with_capacity(2);

    let float_path = cfg.out_dir.join(format!("{name}{tag}_float.onnx"));
    export_onnx(&model, &cfg.example(&model), &float_path)?;

    let mut reader = CalibrationReader::new(loader, ONNX_INPUT_NAME)?;
    let quant_path = cfg.out_dir.join(format!("{name}{tag}_quant.onnx"));
    quantize_static(&float_path, &quant_path, &mut reader)?;

    artifacts.push(benchmark_onnx_artifact(&float_path, &shape, cfg.bench_iters)?);
    artifacts.push(benchmark_onnx_artifact(&quant_path, &shape, cfg.bench_iters)?);
    Ok(artifacts)
}
