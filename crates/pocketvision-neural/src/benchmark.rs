//! Latency and artifact-size measurement for deployed models.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use pocketvision_core::Tensor;

use crate::deployment::capture::GraphProgram;
use crate::deployment::onnx::InferenceSession;
use crate::error::{NeuralError, Result};

/// One deployed artifact and what was measured about it.
#[derive(Debug, Clone)]
pub struct DeployArtifact {
    pub path: PathBuf,
    /// Mean wall-clock latency; `None` for artifacts that are not
    /// benchmarked (accelerator-lowered programs).
    pub latency_ms: Option<f64>,
    pub size_mb: f64,
}

/// Artifact size in decimal megabytes.
pub fn file_size_mb(path: &Path) -> Result<f64> {
    Ok(fs::metadata(path)?.len() as f64 / 1e6)
}

/// Mean wall-clock latency of `run` over `iters` iterations, in
/// milliseconds. Every iteration gets a fresh uniform-random input; there is
/// no warm-up exclusion and no variance reporting.
pub fn benchmark<F>(mut run: F, input_shape: &[usize], iters: usize) -> Result<f64>
where
    F: FnMut(&Tensor<f32>) -> Result<Tensor<f32>>,
{
    if iters == 0 {
        return Err(NeuralError::invalid_operation(
            "benchmark",
            "iteration count must be positive",
        ));
    }
    let mut total_ms = 0.0;
    for _ in 0..iters {
        let input = Tensor::rand_uniform(input_shape, 0.0, 1.0);
        let start = Instant::now();
        run(&input)?;
        total_ms += start.elapsed().as_secs_f64() * 1e3;
    }
    Ok(total_ms / iters as f64)
}

fn report(path: &Path, latency_ms: f64, size_mb: f64) {
    println!(
        "Benchmarking {}: Avg. inference@CPU: {latency_ms:.2} ms, Size: {size_mb:.2} MB",
        path.display()
    );
}

/// Load a saved program, benchmark it and report one line.
pub fn benchmark_artifact(
    path: &Path,
    input_shape: &[usize],
    iters: usize,
) -> Result<DeployArtifact> {
    let program = GraphProgram::load(path)?;
    let latency_ms = benchmark(|input| program.run(input), input_shape, iters)?;
    let size_mb = file_size_mb(path)?;
    report(path, latency_ms, size_mb);
    Ok(DeployArtifact {
        path: path.to_path_buf(),
        latency_ms: Some(latency_ms),
        size_mb,
    })
}

/// Benchmark an interchange artifact through an inference session.
pub fn benchmark_onnx_artifact(
    path: &Path,
    input_shape: &[usize],
    iters: usize,
) -> Result<DeployArtifact> {
    let session = InferenceSession::new(path)?;
    let name = session.input_name().to_string();
    let latency_ms = benchmark(|input| session.run(&name, input), input_shape, iters)?;
    let size_mb = file_size_mb(path)?;
    report(path, latency_ms, size_mb);
    Ok(DeployArtifact {
        path: path.to_path_buf(),
        latency_ms: Some(latency_ms),
        size_mb,
    })
}

/// Record an artifact's size without running it.
pub fn record_artifact(path: &Path) -> Result<DeployArtifact> {
    Ok(DeployArtifact {
        path: path.to_path_buf(),
        latency_ms: None,
        size_mb: file_size_mb(path)?,
    })
}

/// `Model {name} has {count / 1e6:.2} M parameters`.
pub fn report_params(name: &str, count: usize) {
    println!("Model {name} has {:.2} M parameters", count as f64 / 1e6);
}
