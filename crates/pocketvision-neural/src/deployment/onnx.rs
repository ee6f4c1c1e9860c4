//! Interchange-format export, inference sessions and static quantization.
//!
//! This is the pipeline's stand-in for an ONNX toolchain: models export to a
//! named-IO container around a captured program, load back into an
//! [`InferenceSession`], and quantize offline by replaying a calibration
//! reader through the loaded graph.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use pocketvision_core::{quantize_tensor, MinMaxObserver, QuantizationParams, Tensor};

use crate::data::{DataLoader, Dataset};
use crate::deployment::capture::{trace_model, GraphOp, GraphProgram, InitTensor, FORMAT_VERSION};
use crate::error::{NeuralError, Result};
use crate::model::ToyClassifier;

pub const ONNX_MAGIC: [u8; 4] = *b"PVNX";
pub const ONNX_INPUT_NAME: &str = "input_image";
pub const ONNX_OUTPUT_NAME: &str = "logits";

/// A captured program with named input/output bindings and a fixed batch
/// axis of 1.
#[derive(Debug, Clone)]
pub struct OnnxModel {
    pub graph: GraphProgram,
    pub input_name: String,
    pub output_name: String,
}

#[derive(Serialize, Deserialize)]
struct OnnxHeader {
    format_version: u32,
    input_name: String,
    output_name: String,
}

impl OnnxModel {
    pub fn save(&self, path: &Path) -> Result<()> {
        let header = serde_json::to_vec(&OnnxHeader {
            format_version: FORMAT_VERSION,
            input_name: self.input_name.clone(),
            output_name: self.output_name.clone(),
        })?;
        let graph = self.graph.to_bytes()?;

        let mut bytes = Vec::with_capacity(8 + header.len() + graph.len());
        bytes.extend_from_slice(&ONNX_MAGIC);
        bytes.extend_from_slice(&(header.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&graph);
        fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let display = path.display().to_string();
        let bytes = fs::read(path)?;
        let rest = bytes
            .strip_prefix(&ONNX_MAGIC[..])
            .ok_or_else(|| NeuralError::malformed_artifact(&display, "bad magic"))?;
        if rest.len() < 4 {
            return Err(NeuralError::malformed_artifact(
                &display,
                "truncated header length",
            ));
        }
        let header_len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let header_end = 4 + header_len;
        if rest.len() < header_end {
            return Err(NeuralError::malformed_artifact(&display, "truncated header"));
        }
        let header: OnnxHeader = serde_json::from_slice(&rest[4..header_end])?;
        if header.format_version != FORMAT_VERSION {
            return Err(NeuralError::malformed_artifact(
                &display,
                format!("unsupported format version {}", header.format_version),
            ));
        }
        let graph = GraphProgram::from_bytes(&rest[header_end..])?;
        Ok(Self {
            graph,
            input_name: header.input_name,
            output_name: header.output_name,
        })
    }
}

/// Export a model in the interchange format by tracing it on `example`.
/// The batch axis is fixed to 1.
pub fn export_onnx(
    model: &ToyClassifier<f32>,
    example: &Tensor<f32>,
    path: &Path,
) -> Result<()> {
    if example.ndim() == 0 || example.shape()[0] != 1 {
        return Err(NeuralError::invalid_operation(
            "export_onnx",
            format!(
                "batch axis is fixed to 1, example has shape {:?}",
                example.shape()
            ),
        ));
    }
    let graph = trace_model(model, example)?;
    OnnxModel {
        graph,
        input_name: ONNX_INPUT_NAME.to_string(),
        output_name: ONNX_OUTPUT_NAME.to_string(),
    }
    .save(path)
}

/// Runs a loaded interchange model against named inputs.
#[derive(Debug)]
pub struct InferenceSession {
    model: OnnxModel,
}

impl InferenceSession {
    pub fn new(path: &Path) -> Result<Self> {
        Ok(Self {
            model: OnnxModel::load(path)?,
        })
    }

    pub fn input_name(&self) -> &str {
        &self.model.input_name
    }

    pub fn output_name(&self) -> &str {
        &self.model.output_name
    }

    pub fn run(&self, input_name: &str, input: &Tensor<f32>) -> Result<Tensor<f32>> {
        if input_name != self.model.input_name {
            return Err(NeuralError::invalid_operation(
                "InferenceSession::run",
                format!(
                    "unknown input `{input_name}`, model expects `{}`",
                    self.model.input_name
                ),
            ));
        }
        if input.ndim() == 0 || input.shape()[0] != 1 {
            return Err(NeuralError::invalid_operation(
                "InferenceSession::run",
                format!("batch axis is fixed to 1, input has shape {:?}", input.shape()),
            ));
        }
        self.model.graph.run(input)
    }
}

/// One named, individually-batched calibration input.
#[derive(Debug, Clone)]
pub struct CalibrationRecord {
    pub input_name: String,
    pub tensor: Tensor<f32>,
}

/// Feeds a dataset to static quantization one record at a time.
///
/// Every sample is materialized eagerly as its own `[1, ...]` batch,
/// whatever batch size the loader was built with. `get_next` yields each
/// record exactly once and then `None` forever.
#[derive(Debug)]
pub struct CalibrationReader {
    records: VecDeque<CalibrationRecord>,
}

impl CalibrationReader {
    pub fn new<D: Dataset<f32>>(loader: &DataLoader<D>, input_name: &str) -> Result<Self> {
        let dataset = loader.dataset();
        let mut records = VecDeque::with_capacity(dataset.len());
        for index in 0..dataset.len() {
            let sample = dataset.get(index).ok_or_else(|| {
                NeuralError::invalid_operation(
                    "CalibrationReader::new",
                    format!("dataset lied about its length at index {index}"),
                )
            })?;
            let mut shape = vec![1];
            shape.extend_from_slice(sample.shape());
            records.push_back(CalibrationRecord {
                input_name: input_name.to_string(),
                tensor: Tensor::from_vec(sample.to_vec(), &shape)?,
            });
        }
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get_next(&mut self) -> Option<CalibrationRecord> {
        self.records.pop_front()
    }
}

/// Post-training static quantization of an exported interchange model.
///
/// Replays every calibration record through the float graph, observes the
/// input, per-op and output ranges, rewrites convolution weights to u8
/// storage, clamps each convolution's output through its observed range and
/// wraps the program in a quantize/dequantize boundary.
pub fn quantize_static(
    float_path: &Path,
    quant_path: &Path,
    reader: &mut CalibrationReader,
) -> Result<()> {
    let model = OnnxModel::load(float_path)?;
    let mut graph = model.graph.clone();

    let mut input_obs = MinMaxObserver::new();
    let mut op_obs = vec![MinMaxObserver::new(); graph.ops.len()];
    while let Some(record) = reader.get_next() {
        if record.input_name != model.input_name {
            return Err(NeuralError::invalid_operation(
                "quantize_static",
                format!(
                    "calibration record for `{}`, model expects `{}`",
                    record.input_name, model.input_name
                ),
            ));
        }
        input_obs.observe_tensor(&record.tensor);
        let stages = graph.run_stages(&record.tensor)?;
        for (obs, stage) in op_obs.iter_mut().zip(&stages) {
            obs.observe_tensor(stage);
        }
    }
    if input_obs.count() == 0 {
        return Err(NeuralError::EmptyCalibration);
    }

    let template = QuantizationParams::uint8();
    let observed = |obs: &MinMaxObserver| -> Result<QuantizationParams> {
        let (min, max) = obs.min_max().ok_or(NeuralError::EmptyCalibration)?;
        Ok(template.from_min_max(min, max))
    };

    // Rewrite conv weights to u8 and clamp each conv's output through its
    // observed range.
    let mut ops = Vec::with_capacity(graph.ops.len() + 2);
    ops.push(GraphOp::Quantize {
        params: observed(&input_obs)?,
    });
    for (index, op) in graph.ops.iter().enumerate() {
        if let GraphOp::Conv2d { weight, .. } = op {
            quantize_initializer(&mut graph.initializers, *weight)?;
        }
        ops.push(op.clone());
        if matches!(op, GraphOp::Conv2d { .. }) {
            ops.push(GraphOp::Requantize {
                params: observed(&op_obs[index])?,
            });
        }
    }
    let last = op_obs.last().ok_or_else(|| {
        NeuralError::invalid_operation("quantize_static", "model graph has no ops")
    })?;
    ops.push(GraphOp::Dequantize {
        params: observed(last)?,
    });

    graph.ops = ops;
    graph.meta.quantized = true;
    // Recorded shapes no longer line up with the rewritten op list.
    graph.meta.op_output_shapes = None;

    OnnxModel {
        graph,
        input_name: model.input_name,
        output_name: model.output_name,
    }
    .save(quant_path)
}

fn quantize_initializer(initializers: &mut [InitTensor], index: usize) -> Result<()> {
    let init = initializers.get_mut(index).ok_or_else(|| {
        NeuralError::invalid_operation(
            "quantize_static",
            format!("initializer index {index} out of range"),
        )
    })?;
    if let InitTensor::F32(t) = init {
        let (min, max) = t
            .to_vec()
            .iter()
            .fold((0.0f32, 0.0f32), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let params = QuantizationParams::uint8().from_min_max(min, max);
        *init = InitTensor::U8 {
            values: quantize_tensor(t, &params)?,
            params,
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ToyDataset;
    use crate::model::{BlockVariant, ToyClassifier};

    fn tiny_model() -> ToyClassifier<f32> {
        ToyClassifier::with_schedule(&[(3, 4, 1), (4, 6, 2)], BlockVariant::Standard, 5).unwrap()
    }

    #[test]
    fn reader_yields_each_sample_once_with_batch_one() {
        let loader = DataLoader::with_batch_size(ToyDataset::<f32>::with_shape(3, &[3, 4, 4]), 2);
        let mut reader = CalibrationReader::new(&loader, ONNX_INPUT_NAME).unwrap();
        assert_eq!(reader.len(), 3);
        for _ in 0..3 {
            let record = reader.get_next().unwrap();
            assert_eq!(record.input_name, ONNX_INPUT_NAME);
            assert_eq!(record.tensor.shape()[0], 1);
        }
        assert!(reader.get_next().is_none());
        assert!(reader.get_next().is_none());
    }

    #[test]
    fn export_rejects_batched_examples() {
        let dir = tempfile::tempdir().unwrap();
        let model = tiny_model();
        let example = Tensor::rand_uniform(&[2, 3, 8, 8], 0.0, 1.0);
        assert!(export_onnx(&model, &example, &dir.path().join("m.onnx")).is_err());
    }

    #[test]
    fn session_round_trip_matches_eager_forward() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("float.onnx");
        let mut model = tiny_model();
        model.eval();
        let example = Tensor::rand_uniform(&[1, 3, 8, 8], 0.0, 1.0);
        export_onnx(&model, &example, &path).unwrap();

        let session = InferenceSession::new(&path).unwrap();
        assert_eq!(session.input_name(), ONNX_INPUT_NAME);
        assert_eq!(session.output_name(), ONNX_OUTPUT_NAME);
        let out = session.run(ONNX_INPUT_NAME, &example).unwrap();
        let eager = model.forward(&example).unwrap();
        for (a, b) in out.to_vec().iter().zip(eager.to_vec()) {
            assert!((a - b).abs() < 1e-5);
        }
        assert!(session.run("wrong_name", &example).is_err());
    }

    #[test]
    fn static_quantization_produces_a_runnable_quantized_model() {
        let dir = tempfile::tempdir().unwrap();
        let float_path = dir.path().join("float.onnx");
        let quant_path = dir.path().join("quant.onnx");
        let mut model = tiny_model();
        model.eval();
        let example = Tensor::rand_uniform(&[1, 3, 8, 8], 0.0, 1.0);
        export_onnx(&model, &example, &float_path).unwrap();

        let loader = DataLoader::new(ToyDataset::<f32>::with_shape(4, &[3, 8, 8]));
        let mut reader = CalibrationReader::new(&loader, ONNX_INPUT_NAME).unwrap();
        quantize_static(&float_path, &quant_path, &mut reader).unwrap();
        assert!(reader.is_empty());

        let session = InferenceSession::new(&quant_path).unwrap();
        let out = session.run(ONNX_INPUT_NAME, &example).unwrap();
        assert_eq!(out.shape(), &[1, 5]);
        let quantized_weights = {
            let model = OnnxModel::load(&quant_path).unwrap();
            model
                .graph
                .initializers
                .iter()
                .filter(|i| matches!(i, InitTensor::U8 { .. }))
                .count()
        };
        assert!(quantized_weights >= 3);
    }

    #[test]
    fn static_quantization_requires_samples() {
        let dir = tempfile::tempdir().unwrap();
        let float_path = dir.path().join("float.onnx");
        let model = tiny_model();
        let example = Tensor::rand_uniform(&[1, 3, 8, 8], 0.0, 1.0);
        export_onnx(&model, &example, &float_path).unwrap();

        let loader = DataLoader::new(ToyDataset::<f32>::empty());
        let mut reader = CalibrationReader::new(&loader, ONNX_INPUT_NAME).unwrap();
        assert!(matches!(
            quantize_static(&float_path, &dir.path().join("q.onnx"), &mut reader),
            Err(NeuralError::EmptyCalibration)
        ));
    }
}
