//! End-to-end pipeline tests: model contracts at full resolution and the
//! deployment orchestrators run against real artifacts on disk.

use pocketvision_core::Tensor;
use pocketvision_neural::data::{DataLoader, ToyDataset};
use pocketvision_neural::deployment::{
    deploy_float, deploy_nnapi, deploy_onnx_quantized, deploy_quantized, DeployConfig,
    GraphProgram, OnnxModel, QuantBackend,
};
use pocketvision_neural::model::{BlockVariant, ToyClassifier};

fn tiny_cfg(dir: &std::path::Path) -> DeployConfig {
    let mut cfg = DeployConfig::new(dir);
    cfg.bench_iters = 2;
    cfg.input_hw = (8, 8);
    cfg
}

#[test]
fn canonical_classifier_processes_a_full_resolution_image() {
    let mut model = ToyClassifier::<f32>::new(BlockVariant::Standard).unwrap();
    model.eval();
    let input = Tensor::<f32>::zeros(&[1, 3, 224, 224]);
    let out = model.forward(&input).unwrap();
    assert_eq!(out.shape(), &[1, 1000]);
}

#[test]
fn canonical_separable_classifier_processes_a_full_resolution_image() {
    let mut model = ToyClassifier::<f32>::new(BlockVariant::Separable).unwrap();
    model.eval();
    let input = Tensor::<f32>::zeros(&[1, 3, 224, 224]);
    let out = model.forward(&input).unwrap();
    assert_eq!(out.shape(), &[1, 1000]);
}

#[test]
fn arbitrary_schedules_produce_class_logits() {
    let schedules: [&[(usize, usize, usize)]; 3] = [
        &[(3, 5, 1)],
        &[(3, 7, 2), (7, 9, 1)],
        &[(3, 4, 1), (4, 11, 2), (11, 13, 1), (13, 13, 2)],
    ];
    for schedule in schedules {
        for variant in [BlockVariant::Standard, BlockVariant::Separable] {
            let model = ToyClassifier::<f32>::with_schedule(schedule, variant, 21).unwrap();
            let input = Tensor::rand_uniform(&[2, 3, 16, 16], 0.0, 1.0);
            let out = model.forward(&input).unwrap();
            assert_eq!(out.shape(), &[2, 21], "{schedule:?} {variant:?}");
        }
    }
}

#[test]
fn quantized_deployment_writes_two_loadable_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let model =
        ToyClassifier::<f32>::with_schedule(&[(3, 6, 1), (6, 10, 2)], BlockVariant::Standard, 8)
            .unwrap();
    let loader = DataLoader::new(ToyDataset::with_shape(10, &[3, 8, 8]));

    let artifacts = deploy_quantized(
        &loader,
        &model,
        false,
        "toy",
        QuantBackend::Fbgemm,
        &tiny_cfg(dir.path()),
    )
    .unwrap();

    assert_eq!(artifacts.len(), 2);
    for artifact in &artifacts {
        let program = GraphProgram::load(&artifact.path).unwrap();
        assert!(program.meta.quantized);
        let out = program
            .run(&Tensor::rand_uniform(&[1, 3, 8, 8], 0.0, 1.0))
            .unwrap();
        assert_eq!(out.shape(), &[1, 8]);
    }
}

#[test]
fn every_deployment_path_runs_on_one_model() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = tiny_cfg(dir.path());
    let model =
        ToyClassifier::<f32>::with_schedule(&[(3, 4, 1), (4, 6, 2)], BlockVariant::Separable, 5)
            .unwrap();
    let loader = DataLoader::new(ToyDataset::with_shape(4, &[3, 8, 8]));

    let float = deploy_float(&model, "sep", &cfg).unwrap();
    let onnx = deploy_onnx_quantized(&loader, &model, true, "sep", &cfg).unwrap();
    let quant = deploy_quantized(&loader, &model, true, "sep", QuantBackend::Fbgemm, &cfg).unwrap();
    let nnapi = deploy_nnapi(&loader, &model, true, "sep", QuantBackend::Qnnpack, &cfg).unwrap();

    assert_eq!(float.len(), 3);
    assert_eq!(onnx.len(), 2);
    assert_eq!(quant.len(), 2);
    assert_eq!(nnapi.len(), 2);
    for artifact in float.iter().chain(&onnx).chain(&quant).chain(&nnapi) {
        assert!(artifact.path.exists(), "{:?}", artifact.path);
        assert!(artifact.size_mb > 0.0);
    }

    // Interchange artifacts load through their own reader.
    let quant_onnx = OnnxModel::load(&onnx[1].path).unwrap();
    assert!(quant_onnx.graph.meta.quantized);
    assert_eq!(quant_onnx.input_name, "input_image");
    assert_eq!(quant_onnx.output_name, "logits");
}

#[test]
fn orchestrators_leave_the_base_model_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = tiny_cfg(dir.path());
    let model =
        ToyClassifier::<f32>::with_schedule(&[(3, 6, 1), (6, 8, 1)], BlockVariant::Standard, 6)
            .unwrap();
    let loader = DataLoader::new(ToyDataset::with_shape(3, &[3, 8, 8]));
    let before: Vec<Vec<f32>> = model.parameters().iter().map(|p| p.to_vec()).collect();

    deploy_onnx_quantized(&loader, &model, true, "base", &cfg).unwrap();
    deploy_quantized(&loader, &model, false, "base", QuantBackend::Qnnpack, &cfg).unwrap();

    let after: Vec<Vec<f32>> = model.parameters().iter().map(|p| p.to_vec()).collect();
    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(&after) {
        assert_eq!(a.len(), b.len());
        assert!(a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits()));
    }
    assert!(!model.is_fused());
}

#[test]
fn rerunning_a_deployment_overwrites_its_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = tiny_cfg(dir.path());
    let model =
        ToyClassifier::<f32>::with_schedule(&[(3, 4, 1)], BlockVariant::Standard, 3).unwrap();

    let first = deploy_float(&model, "again", &cfg).unwrap();
    let second = deploy_float(&model, "again", &cfg).unwrap();
    assert_eq!(
        first.iter().map(|a| &a.path).collect::<Vec<_>>(),
        second.iter().map(|a| &a.path).collect::<Vec<_>>()
    );
    for artifact in &second {
        GraphProgram::load(&artifact.path).unwrap();
    }
}
