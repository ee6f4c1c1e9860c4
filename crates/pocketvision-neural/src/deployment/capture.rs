//! Graph capture and the on-disk artifact format.
//!
//! A model is captured into a [`GraphProgram`]: a straight-line op list over
//! an initializer table, plus capture metadata. Script capture walks the
//! model's structure without running it; trace capture additionally executes
//! one forward pass on an example input and records concrete shapes.
//!
//! Artifacts are written as a 4-byte magic, a little-endian `u32` header
//! length, a JSON header (ops, initializer descriptors, metadata) and a raw
//! weight blob.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use pocketvision_core::{
    dequantize_tensor, fake_quantize, ops, Element, QuantizationParams, Tensor,
};

use crate::deployment::mobile::MobileBackend;
use crate::error::{NeuralError, Result};
use crate::model::ToyClassifier;

pub const ARTIFACT_MAGIC: [u8; 4] = *b"PVGM";
pub const FORMAT_VERSION: u32 = 1;

/// How a program was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureMode {
    /// Structure-driven capture; no example input, no recorded shapes.
    Script,
    /// Example-driven capture; input and per-op output shapes recorded.
    Trace,
}

/// Layout the program expects its input in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputLayout {
    ChannelsFirst,
    ChannelsLast,
}

/// One step of a captured program. Each op consumes the previous op's output;
/// tensor-valued attributes are indices into the initializer table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GraphOp {
    Conv2d {
        weight: usize,
        bias: Option<usize>,
        stride: (usize, usize),
        padding: (usize, usize),
        groups: usize,
    },
    BatchNorm2d {
        gamma: usize,
        beta: usize,
        mean: usize,
        var: usize,
        eps: f64,
    },
    Relu,
    GlobalAvgPool,
    /// Collapse all trailing axes into one: `[N, ...]` -> `[N, rest]`.
    Flatten,
    Quantize { params: QuantizationParams },
    Dequantize { params: QuantizationParams },
    /// Clamp activations through an observed integer range.
    Requantize { params: QuantizationParams },
    Identity,
}

impl GraphOp {
    pub fn name(&self) -> &'static str {
        match self {
            GraphOp::Conv2d { .. } => "conv2d",
            GraphOp::BatchNorm2d { .. } => "batch_norm2d",
            GraphOp::Relu => "relu",
            GraphOp::GlobalAvgPool => "global_avg_pool",
            GraphOp::Flatten => "flatten",
            GraphOp::Quantize { .. } => "quantize",
            GraphOp::Dequantize { .. } => "dequantize",
            GraphOp::Requantize { .. } => "requantize",
            GraphOp::Identity => "identity",
        }
    }
}

/// Stored tensor referenced by ops.
#[derive(Debug, Clone)]
pub enum InitTensor {
    F32(Tensor<f32>),
    U8 {
        values: Tensor<u8>,
        params: QuantizationParams,
    },
}

impl InitTensor {
    pub fn shape(&self) -> &[usize] {
        match self {
            InitTensor::F32(t) => t.shape(),
            InitTensor::U8 { values, .. } => values.shape(),
        }
    }
}

/// Capture metadata carried alongside the op list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphMeta {
    pub capture: CaptureMode,
    pub input_layout: InputLayout,
    /// Concrete example shape; trace capture only.
    pub input_shape: Option<Vec<usize>>,
    /// Per-op output shapes in op order; trace capture only.
    pub op_output_shapes: Option<Vec<Vec<usize>>>,
    /// Mobile backend the program was optimized for, if any.
    pub optimized_for: Option<MobileBackend>,
    /// Accelerator delegate the program was lowered to, if any.
    pub delegate: Option<String>,
    pub quantized: bool,
    pub producer: String,
}

pub(crate) fn producer_string() -> String {
    format!("pocketvision {}", env!("CARGO_PKG_VERSION"))
}

/// Accumulates ops and initializers while a model describes itself.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    ops: Vec<GraphOp>,
    initializers: Vec<InitTensor>,
}

/// f32 and f64 always convert; the fallback is unreachable for the element
/// types the kernels accept.
pub(crate) fn tensor_to_f32<T: Element>(t: &Tensor<T>) -> Tensor<f32> {
    t.map(|&v| v.to_f32().unwrap_or(f32::NAN))
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_f32<T: Element>(&mut self, t: &Tensor<T>) -> usize {
        self.initializers.push(InitTensor::F32(tensor_to_f32(t)));
        self.initializers.len() - 1
    }

    pub fn push_u8(&mut self, values: Tensor<u8>, params: QuantizationParams) -> usize {
        self.initializers.push(InitTensor::U8 { values, params });
        self.initializers.len() - 1
    }

    pub fn push_op(&mut self, op: GraphOp) {
        self.ops.push(op);
    }

    fn finish(self, meta: GraphMeta) -> GraphProgram {
        GraphProgram {
            ops: self.ops,
            initializers: self.initializers,
            meta,
        }
    }
}

/// A captured, runnable, serializable program.
#[derive(Debug, Clone)]
pub struct GraphProgram {
    pub ops: Vec<GraphOp>,
    pub initializers: Vec<InitTensor>,
    pub meta: GraphMeta,
}

/// Capture a model's structure without running it.
pub fn script_model<T: Element>(model: &ToyClassifier<T>) -> Result<GraphProgram> {
    let mut builder = GraphBuilder::new();
    model.describe(&mut builder)?;
    Ok(builder.finish(GraphMeta {
        capture: CaptureMode::Script,
        input_layout: InputLayout::ChannelsFirst,
        input_shape: None,
        op_output_shapes: None,
        optimized_for: None,
        delegate: None,
        quantized: model.is_quantized(),
        producer: producer_string(),
    }))
}

/// Capture a model by running one forward pass on `example` and recording
/// the shapes it produces. Forward errors propagate.
pub fn trace_model(model: &ToyClassifier<f32>, example: &Tensor<f32>) -> Result<GraphProgram> {
    trace_with_layout(model, example, InputLayout::ChannelsFirst)
}

/// Trace against an example already converted to `[N, H, W, C]`. The program
/// remembers the layout and converts at its boundary when run.
pub fn trace_model_channels_last(
    model: &ToyClassifier<f32>,
    example: &Tensor<f32>,
) -> Result<GraphProgram> {
    trace_with_layout(model, example, InputLayout::ChannelsLast)
}

fn trace_with_layout(
    model: &ToyClassifier<f32>,
    example: &Tensor<f32>,
    layout: InputLayout,
) -> Result<GraphProgram> {
    let mut program = script_model(model)?;
    program.meta.capture = CaptureMode::Trace;
    program.meta.input_layout = layout;
    program.meta.input_shape = Some(example.shape().to_vec());
    let (_, shapes) = program.run_recording(example)?;
    program.meta.op_output_shapes = Some(shapes);
    Ok(program)
}

impl GraphProgram {
    fn initializer(&self, idx: usize) -> Result<&InitTensor> {
        self.initializers.get(idx).ok_or_else(|| {
            NeuralError::invalid_operation(
                "GraphProgram::run",
                format!("initializer index {idx} out of range"),
            )
        })
    }

    /// Materialize an initializer as f32, dequantizing u8 storage.
    fn float_initializer(&self, idx: usize) -> Result<Tensor<f32>> {
        Ok(match self.initializer(idx)? {
            InitTensor::F32(t) => t.clone(),
            InitTensor::U8 { values, params } => dequantize_tensor(values, params),
        })
    }

    /// Execute the program on a channels-first or (per metadata) channels-last
    /// input, returning the final output.
    pub fn run(&self, input: &Tensor<f32>) -> Result<Tensor<f32>> {
        Ok(self.run_recording(input)?.0)
    }

    pub(crate) fn run_recording(
        &self,
        input: &Tensor<f32>,
    ) -> Result<(Tensor<f32>, Vec<Vec<usize>>)> {
        let stages = self.run_stages(input)?;
        let shapes = stages.iter().map(|t| t.shape().to_vec()).collect();
        let out = stages.into_iter().last().ok_or_else(|| {
            NeuralError::invalid_operation("GraphProgram::run", "program has no ops")
        })?;
        Ok((out, shapes))
    }

    /// Execute the program, keeping every op's output. Used by calibration
    /// passes that observe intermediate activation ranges.
    pub(crate) fn run_stages(&self, input: &Tensor<f32>) -> Result<Vec<Tensor<f32>>> {
        let mut x = match self.meta.input_layout {
            InputLayout::ChannelsFirst => input.clone(),
            InputLayout::ChannelsLast => input.to_channels_first()?,
        };
        let mut stages = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            x = self.apply(op, &x)?;
            stages.push(x.clone());
        }
        Ok(stages)
    }

    fn apply(&self, op: &GraphOp, x: &Tensor<f32>) -> Result<Tensor<f32>> {
        Ok(match op {
            GraphOp::Conv2d {
                weight,
                bias,
                stride,
                padding,
                groups,
            } => {
                let w = self.float_initializer(*weight)?;
                let b = match bias {
                    Some(idx) => Some(self.float_initializer(*idx)?),
                    None => None,
                };
                ops::conv2d(x, &w, b.as_ref(), *stride, *padding, *groups)?
            }
            GraphOp::BatchNorm2d {
                gamma,
                beta,
                mean,
                var,
                eps,
            } => {
                let g = self.float_initializer(*gamma)?;
                let b = self.float_initializer(*beta)?;
                let mu = self.float_initializer(*mean)?;
                let v = self.float_initializer(*var)?;
                ops::batch_norm2d(x, &g, &b, &mu, &v, *eps)?
            }
            GraphOp::Relu => ops::relu(x),
            GraphOp::GlobalAvgPool => ops::global_avg_pool(x)?,
            GraphOp::Flatten => {
                if x.ndim() == 0 {
                    return Err(NeuralError::invalid_operation(
                        "GraphProgram::run",
                        "cannot flatten a scalar",
                    ));
                }
                let n = x.shape()[0];
                let rest = x.numel() / n.max(1);
                Tensor::from_vec(x.to_vec(), &[n, rest]).map_err(NeuralError::Tensor)?
            }
            GraphOp::Quantize { params } | GraphOp::Requantize { params } => {
                fake_quantize(x, params)
            }
            // Values upstream are already on the dequantized grid.
            GraphOp::Dequantize { .. } => x.clone(),
            GraphOp::Identity => x.clone(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&ARTIFACT_MAGIC);
        bytes.extend_from_slice(&self.to_bytes()?);
        fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let rest = bytes.strip_prefix(&ARTIFACT_MAGIC[..]).ok_or_else(|| {
            NeuralError::malformed_artifact(path.display().to_string(), "bad magic")
        })?;
        Self::from_bytes(rest).map_err(|e| match e {
            NeuralError::MalformedArtifact { reason, .. } => {
                NeuralError::malformed_artifact(path.display().to_string(), reason)
            }
            other => other,
        })
    }

    /// Header-length prefix + JSON header + weight blob, without the magic.
    /// Split out so container formats can embed a program.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut blob: Vec<u8> = Vec::new();
        let mut descriptors = Vec::with_capacity(self.initializers.len());
        for init in &self.initializers {
            let offset = blob.len() as u64;
            let (dtype, shape, params) = match init {
                InitTensor::F32(t) => {
                    for &v in t.to_vec().iter() {
                        blob.extend_from_slice(&v.to_le_bytes());
                    }
                    (InitDtype::F32, t.shape().to_vec(), None)
                }
                InitTensor::U8 { values, params } => {
                    blob.extend_from_slice(&values.to_vec());
                    (InitDtype::U8, values.shape().to_vec(), Some(*params))
                }
            };
            descriptors.push(InitDescriptor {
                dtype,
                shape,
                offset,
                byte_len: blob.len() as u64 - offset,
                params,
            });
        }

        let header = ArtifactHeader {
            format_version: FORMAT_VERSION,
            meta: self.meta.clone(),
            ops: self.ops.clone(),
            initializers: descriptors,
        };
        let header_json = serde_json::to_vec(&header)?;

        let mut bytes = Vec::with_capacity(8 + header_json.len() + blob.len());
        bytes.extend_from_slice(&(header_json.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&header_json);
        bytes.extend_from_slice(&blob);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let malformed = |reason: &str| NeuralError::malformed_artifact("<buffer>", reason);
        if bytes.len() < 4 {
            return Err(malformed("truncated header length"));
        }
        let header_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let header_end = 4 + header_len;
        if bytes.len() < header_end {
            return Err(malformed("truncated header"));
        }
        let header: ArtifactHeader = serde_json::from_slice(&bytes[4..header_end])?;
        if header.format_version != FORMAT_VERSION {
            return Err(malformed(&format!(
                "unsupported format version {}",
                header.format_version
            )));
        }
        let blob = &bytes[header_end..];

        let mut initializers = Vec::with_capacity(header.initializers.len());
        for desc in &header.initializers {
            let start = desc.offset as usize;
            let end = start + desc.byte_len as usize;
            if end > blob.len() {
                return Err(malformed("initializer range outside weight blob"));
            }
            let raw = &blob[start..end];
            let init = match desc.dtype {
                InitDtype::F32 => {
                    if raw.len() % 4 != 0 {
                        return Err(malformed("f32 initializer length not a multiple of 4"));
                    }
                    let data: Vec<f32> = raw
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect();
                    InitTensor::F32(
                        Tensor::from_vec(data, &desc.shape).map_err(NeuralError::Tensor)?,
                    )
                }
                InitDtype::U8 => {
                    let params = desc
                        .params
                        .ok_or_else(|| malformed("u8 initializer without quantization params"))?;
                    InitTensor::U8 {
                        values: Tensor::from_vec(raw.to_vec(), &desc.shape)
                            .map_err(NeuralError::Tensor)?,
                        params,
                    }
                }
            };
            initializers.push(init);
        }

        Ok(Self {
            ops: header.ops,
            initializers,
            meta: header.meta,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum InitDtype {
    F32,
    U8,
}

#[derive(Serialize, Deserialize)]
struct InitDescriptor {
    dtype: InitDtype,
    shape: Vec<usize>,
    offset: u64,
    byte_len: u64,
    params: Option<QuantizationParams>,
}

#[derive(Serialize, Deserialize)]
struct ArtifactHeader {
    format_version: u32,
    meta: GraphMeta,
    ops: Vec<GraphOp>,
    initializers: Vec<InitDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_program() -> GraphProgram {
        let mut b = GraphBuilder::new();
        let weight = b.push_f32(&Tensor::<f32>::ones(&[2, 1, 1, 1]));
        b.push_op(GraphOp::Conv2d {
            weight,
            bias: None,
            stride: (1, 1),
            padding: (0, 0),
            groups: 1,
        });
        b.push_op(GraphOp::Relu);
        b.push_op(GraphOp::GlobalAvgPool);
        b.push_op(GraphOp::Flatten);
        b.finish(GraphMeta {
            capture: CaptureMode::Script,
            input_layout: InputLayout::ChannelsFirst,
            input_shape: None,
            op_output_shapes: None,
            optimized_for: None,
            delegate: None,
            quantized: false,
            producer: producer_string(),
        })
    }

    #[test]
    fn straight_line_execution() {
        let program = tiny_program();
        let input = Tensor::from_vec(vec![1.0f32, -2.0, 3.0, -4.0], &[1, 1, 2, 2]).unwrap();
        let out = program.run(&input).unwrap();
        assert_eq!(out.shape(), &[1, 2]);
        // Both output channels are a relu'd copy of the single input channel,
        // averaged.
        assert_eq!(out.to_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn artifact_round_trip_preserves_execution() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.pt");
        let program = tiny_program();
        program.save(&path).unwrap();

        let loaded = GraphProgram::load(&path).unwrap();
        assert_eq!(loaded.ops.len(), program.ops.len());
        let input = Tensor::rand_uniform(&[1, 1, 3, 3], -1.0, 1.0);
        assert_eq!(
            loaded.run(&input).unwrap().to_vec(),
            program.run(&input).unwrap().to_vec()
        );
    }

    #[test]
    fn load_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.pt");
        std::fs::write(&path, b"not an artifact").unwrap();
        assert!(matches!(
            GraphProgram::load(&path),
            Err(NeuralError::MalformedArtifact { .. })
        ));
    }

    #[test]
    fn channels_last_program_converts_at_the_boundary() {
        let mut program = tiny_program();
        program.meta.input_layout = InputLayout::ChannelsLast;
        let nchw = Tensor::rand_uniform(&[1, 1, 2, 2], 0.0, 1.0);
        let nhwc = nchw.to_channels_last().unwrap();
        let expected = {
            let mut p = tiny_program();
            p.meta.input_layout = InputLayout::ChannelsFirst;
            p.run(&nchw).unwrap()
        };
        assert_eq!(program.run(&nhwc).unwrap().to_vec(), expected.to_vec());
    }
}
