//! The toy image classifier: a chain of conv blocks between quantization
//! stubs, global average pooling and a 1x1 classification head.

use pocketvision_core::{ops, Element, QuantizationParams, Tensor};

use crate::deployment::capture::{GraphBuilder, GraphOp};
use crate::error::{NeuralError, Result};
use crate::layers::Conv2D;
use crate::model::block::{
    fake_quantize_t, make_divisible, ConvBlock, ConvBnRelu, QuantizedConv, SeparableConvBnRelu,
};

/// Which block the schedule is instantiated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockVariant {
    /// Full 3x3 convolutions; schedule widths used verbatim.
    Standard,
    /// Depthwise-separable convolutions; widths rounded up to multiples of 8
    /// (the raw image channels excepted).
    Separable,
}

/// The fixed schedule of the demo classifier, as
/// `(in_channels, out_channels, stride)` triples.
pub const CANONICAL_SCHEDULE: [(usize, usize, usize); 8] = [
    (3, 18, 1),
    (18, 36, 2),
    (36, 74, 1),
    (74, 146, 2),
    (146, 290, 1),
    (290, 578, 2),
    (578, 1154, 1),
    (1154, 1154, 2),
];

pub const DEFAULT_NUM_CLASSES: usize = 1000;

/// Marks where activations enter the quantized domain. Pass-through until
/// conversion installs calibrated input parameters.
#[derive(Debug, Clone, Default)]
pub struct QuantStub {
    params: Option<QuantizationParams>,
}

/// Marks where activations leave the quantized domain.
#[derive(Debug, Clone, Default)]
pub struct DeQuantStub {
    params: Option<QuantizationParams>,
}

impl QuantStub {
    fn forward<T: Element>(&self, input: &Tensor<T>) -> Tensor<T> {
        match &self.params {
            Some(p) => fake_quantize_t(input, p),
            None => input.clone(),
        }
    }

    fn describe(&self, builder: &mut GraphBuilder) {
        match self.params {
            Some(params) => builder.push_op(GraphOp::Quantize { params }),
            None => builder.push_op(GraphOp::Identity),
        }
    }
}

impl DeQuantStub {
    /// Upstream requantize ops already put values on the dequantized grid,
    /// so eager execution passes through here.
    fn forward_identity<T: Element>(&self, input: &Tensor<T>) -> Tensor<T> {
        input.clone()
    }

    fn describe(&self, builder: &mut GraphBuilder) {
        match self.params {
            Some(params) => builder.push_op(GraphOp::Dequantize { params }),
            None => builder.push_op(GraphOp::Identity),
        }
    }
}

/// Classification head: a 1x1 convolution over the pooled features, in float
/// or converted form.
#[derive(Debug, Clone)]
pub enum ClassifierHead<T> {
    Float(Conv2D<T>),
    Quantized {
        conv: QuantizedConv<T>,
        out_params: QuantizationParams,
    },
}

impl<T: Element> ClassifierHead<T> {
    fn forward(&self, input: &Tensor<T>) -> Result<Tensor<T>> {
        match self {
            ClassifierHead::Float(conv) => Ok(conv.forward(input)?),
            ClassifierHead::Quantized { conv, out_params } => {
                let x = conv.forward(input)?;
                Ok(fake_quantize_t(&x, out_params))
            }
        }
    }

    fn parameters(&self) -> Vec<&Tensor<T>> {
        match self {
            ClassifierHead::Float(conv) => conv.parameters(),
            ClassifierHead::Quantized { conv, .. } => conv.bias().into_iter().collect(),
        }
    }

    fn describe(&self, builder: &mut GraphBuilder) {
        match self {
            ClassifierHead::Float(conv) => {
                let weight = builder.push_f32(conv.weight());
                let bias = conv.bias().map(|b| builder.push_f32(b));
                builder.push_op(GraphOp::Conv2d {
                    weight,
                    bias,
                    stride: conv.stride(),
                    padding: conv.padding(),
                    groups: conv.groups(),
                });
            }
            ClassifierHead::Quantized { conv, out_params } => {
                conv.describe(builder);
                builder.push_op(GraphOp::Requantize {
                    params: *out_params,
                });
            }
        }
    }

    fn is_quantized(&self) -> bool {
        matches!(self, ClassifierHead::Quantized { .. })
    }
}

/// Per-block activations from one forward pass, used by calibration.
#[derive(Debug)]
pub struct StageActivations<T> {
    pub block_outputs: Vec<Tensor<T>>,
    pub logits: Tensor<T>,
}

/// Small CNN classifier: quantize stub, conv blocks, global average pool,
/// 1x1 head, dequantize stub. External contract: `[N, 3, H, W]` in,
/// `[N, num_classes]` logits out.
#[derive(Debug, Clone)]
pub struct ToyClassifier<T: Element> {
    variant: BlockVariant,
    in_channels: usize,
    num_classes: usize,
    quant: QuantStub,
    blocks: Vec<Box<dyn ConvBlock<T>>>,
    head: ClassifierHead<T>,
    dequant: DeQuantStub,
    training: bool,
}

impl<T: Element> ToyClassifier<T> {
    /// Classifier over the canonical schedule with 1000 output classes.
    pub fn new(variant: BlockVariant) -> Result<Self> {
        Self::with_schedule(&CANONICAL_SCHEDULE, variant, DEFAULT_NUM_CLASSES)
    }

    /// Classifier over an arbitrary schedule. Channel chaining is validated
    /// eagerly; widths of zero are rejected.
    pub fn with_schedule(
        schedule: &[(usize, usize, usize)],
        variant: BlockVariant,
        num_classes: usize,
    ) -> Result<Self> {
        if schedule.is_empty() {
            return Err(NeuralError::InvalidSchedule(
                "schedule must contain at least one block".into(),
            ));
        }
        if num_classes == 0 {
            return Err(NeuralError::InvalidSchedule(
                "number of classes must be positive".into(),
            ));
        }
        for (i, &(cin, cout, stride)) in schedule.iter().enumerate() {
            if cin == 0 || cout == 0 {
                return Err(NeuralError::InvalidSchedule(format!(
                    "block {i} has a zero channel width"
                )));
            }
            if stride == 0 {
                return Err(NeuralError::InvalidSchedule(format!(
                    "block {i} has stride 0"
                )));
            }
        }
        for (i, window) in schedule.windows(2).enumerate() {
            let (_, out_prev, _) = window[0];
            let (in_next, _, _) = window[1];
            if out_prev != in_next {
                return Err(NeuralError::InvalidSchedule(format!(
                    "block {} consumes {in_next} channels but block {i} produces {out_prev}",
                    i + 1
                )));
            }
        }

        let mut blocks: Vec<Box<dyn ConvBlock<T>>> = Vec::with_capacity(schedule.len());
        for (i, &(cin, cout, stride)) in schedule.iter().enumerate() {
            let block: Box<dyn ConvBlock<T>> = match variant {
                BlockVariant::Standard => Box::new(ConvBnRelu::new(cin, cout, stride)?),
                BlockVariant::Separable => {
                    // The raw image channel count stays as-is; every derived
                    // width is rounded.
                    let cin = if i == 0 { cin } else { make_divisible(cin) };
                    Box::new(SeparableConvBnRelu::new(cin, make_divisible(cout), stride)?)
                }
            };
            blocks.push(block);
        }

        let head_in = blocks
            .last()
            .map(|b| b.out_channels())
            .unwrap_or_default();
        let head = Conv2D::new(head_in, num_classes, (1, 1), (1, 1), (0, 0), 1, true)?;

        Ok(Self {
            variant,
            in_channels: schedule[0].0,
            num_classes,
            quant: QuantStub::default(),
            blocks,
            head: ClassifierHead::Float(head),
            dequant: DeQuantStub::default(),
            training: true,
        })
    }

    pub fn forward(&self, input: &Tensor<T>) -> Result<Tensor<T>> {
        let mut x = self.quant.forward(input);
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        let x = ops::global_avg_pool(&x)?;
        let x = self.head.forward(&x)?;
        let logits = flatten_batch(&x)?;
        Ok(self.dequant.forward_identity(&logits))
    }

    /// Forward pass that keeps every block's output, for range calibration.
    pub fn forward_stages(&self, input: &Tensor<T>) -> Result<StageActivations<T>> {
        let mut x = self.quant.forward(input);
        let mut block_outputs = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            x = block.forward(&x)?;
            block_outputs.push(x.clone());
        }
        let x = ops::global_avg_pool(&x)?;
        let x = self.head.forward(&x)?;
        let logits = flatten_batch(&x)?;
        Ok(StageActivations {
            block_outputs,
            logits,
        })
    }

    /// Fold every block's batch norm into its convolution, in schedule order.
    /// The first failure propagates.
    pub fn fuse(&mut self) -> Result<()> {
        for block in &mut self.blocks {
            block.fuse()?;
        }
        Ok(())
    }

    pub fn is_fused(&self) -> bool {
        self.blocks.iter().all(|b| b.is_fused())
    }

    pub fn is_quantized(&self) -> bool {
        self.head.is_quantized() || self.blocks.iter().any(|b| b.is_quantized())
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn variant(&self) -> BlockVariant {
        self.variant
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// All learnable parameter tensors, in schedule order.
    pub fn parameters(&self) -> Vec<&Tensor<T>> {
        let mut params: Vec<&Tensor<T>> = Vec::new();
        for block in &self.blocks {
            params.extend(block.parameters());
        }
        params.extend(self.head.parameters());
        params
    }

    /// Total learnable parameter count. Batch-norm running statistics are
    /// buffers and excluded.
    pub fn num_params(&self) -> usize {
        self.parameters().iter().map(|p| p.numel()).sum()
    }

    /// Emit the whole model into a capture in progress.
    pub fn describe(&self, builder: &mut GraphBuilder) -> Result<()> {
        self.quant.describe(builder);
        for block in &self.blocks {
            block.describe(builder)?;
        }
        builder.push_op(GraphOp::GlobalAvgPool);
        self.head.describe(builder);
        builder.push_op(GraphOp::Flatten);
        self.dequant.describe(builder);
        Ok(())
    }

    /// Remove the quantization boundary stubs from a converted model,
    /// returning their `(input, output)` parameters. Used by accelerator
    /// lowering, which handles the boundary itself.
    pub fn strip_quant_stubs(&mut self) -> Result<(QuantizationParams, QuantizationParams)> {
        match (self.quant.params.take(), self.dequant.params.take()) {
            (Some(input), Some(output)) => Ok((input, output)),
            (input, output) => {
                // Put back whatever was there; the model is unchanged on error.
                self.quant.params = input;
                self.dequant.params = output;
                Err(NeuralError::invalid_operation(
                    "strip_quant_stubs",
                    "model has not been converted to its quantized form",
                ))
            }
        }
    }

    pub(crate) fn set_stub_params(
        &mut self,
        input: QuantizationParams,
        output: QuantizationParams,
    ) {
        self.quant.params = Some(input);
        self.dequant.params = Some(output);
    }

    pub(crate) fn quantize_blocks(&mut self, act_params: &[QuantizationParams]) -> Result<()> {
        if act_params.len() != self.blocks.len() {
            return Err(NeuralError::invalid_operation(
                "quantize_blocks",
                format!(
                    "{} activation ranges for {} blocks",
                    act_params.len(),
                    self.blocks.len()
                ),
            ));
        }
        for (block, &params) in self.blocks.iter_mut().zip(act_params) {
            *block = block.quantize(params)?;
        }
        Ok(())
    }

    pub(crate) fn quantize_head(&mut self, out_params: QuantizationParams) -> Result<()> {
        match &self.head {
            ClassifierHead::Float(conv) => {
                self.head = ClassifierHead::Quantized {
                    conv: QuantizedConv::from_float(conv)?,
                    out_params,
                };
                Ok(())
            }
            ClassifierHead::Quantized { .. } => Err(NeuralError::invalid_operation(
                "quantize_head",
                "head has already been converted",
            )),
        }
    }
}

/// `[N, ...]` -> `[N, rest]`.
fn flatten_batch<T: Element>(x: &Tensor<T>) -> Result<Tensor<T>> {
    if x.ndim() == 0 {
        return Err(NeuralError::invalid_operation(
            "flatten_batch",
            "cannot flatten a scalar",
        ));
    }
    let n = x.shape()[0];
    let rest = x.numel() / n.max(1);
    Ok(Tensor::from_vec(x.to_vec(), &[n, rest])?)
}
