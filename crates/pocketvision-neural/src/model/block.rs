//! Convolutional building blocks and their fusion / quantization forms.

use std::fmt;

use pocketvision_core::{
    fake_quantize, ops, quantize_tensor, Element, QuantizationParams, Tensor,
};

use crate::deployment::capture::{tensor_to_f32, GraphBuilder, GraphOp};
use crate::error::{NeuralError, Result};
use crate::layers::{BatchNorm2D, Conv2D};

/// Round a channel width up to the next multiple of 8. Widths are never
/// reduced: 18 -> 24, 16 -> 16.
pub fn make_divisible(width: usize) -> usize {
    width.div_ceil(8) * 8
}

/// Widen an f32 tensor into any kernel element type.
pub(crate) fn tensor_from_f32<T: Element>(t: &Tensor<f32>) -> Tensor<T> {
    t.map(|&v| T::from_f32(v).unwrap_or_else(T::zero))
}

/// Quantize-then-dequantize in the model's element type.
pub(crate) fn fake_quantize_t<T: Element>(t: &Tensor<T>, params: &QuantizationParams) -> Tensor<T> {
    tensor_from_f32(&fake_quantize(&tensor_to_f32(t), params))
}

/// A convolutional stage of the classifier.
///
/// Blocks are held as trait objects so float, fused and quantized forms can
/// coexist in one model; `clone_box` gives the deep copy the deployment
/// orchestrators rely on.
pub trait ConvBlock<T: Element>: fmt::Debug {
    fn forward(&self, input: &Tensor<T>) -> Result<Tensor<T>>;

    /// Fold batch norm into the convolution. Fusing twice is an error.
    fn fuse(&mut self) -> Result<()>;

    fn is_fused(&self) -> bool;

    fn is_quantized(&self) -> bool {
        false
    }

    fn out_channels(&self) -> usize;

    fn parameters(&self) -> Vec<&Tensor<T>>;

    /// Emit the block's ops and initializers into a capture in progress.
    fn describe(&self, builder: &mut GraphBuilder) -> Result<()>;

    /// Replace the block with its quantized form: u8 weights quantized from
    /// their own range, activations clamped through `act_params`.
    fn quantize(&self, act_params: QuantizationParams) -> Result<Box<dyn ConvBlock<T>>>;

    fn clone_box(&self) -> Box<dyn ConvBlock<T>>;
}

impl<T: Element> Clone for Box<dyn ConvBlock<T>> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Fusion state of a conv + batch-norm pair. The fused form has no batch
/// norm left to fold, so a second fuse cannot silently corrupt weights.
#[derive(Debug, Clone)]
pub enum BlockState<T> {
    Unfused { conv: Conv2D<T>, bn: BatchNorm2D<T> },
    Fused { conv: Conv2D<T> },
}

impl<T: Element> BlockState<T> {
    fn fuse(self) -> Result<Self> {
        match self {
            BlockState::Fused { .. } => Err(NeuralError::AlreadyFused),
            BlockState::Unfused { mut conv, bn } => {
                let (scale, shift) = bn.scale_shift()?;
                conv.fold_scale_shift(&scale, &shift)?;
                Ok(BlockState::Fused { conv })
            }
        }
    }

    fn is_fused(&self) -> bool {
        matches!(self, BlockState::Fused { .. })
    }

    fn conv(&self) -> &Conv2D<T> {
        match self {
            BlockState::Unfused { conv, .. } | BlockState::Fused { conv } => conv,
        }
    }

    fn bn(&self) -> Option<&BatchNorm2D<T>> {
        match self {
            BlockState::Unfused { bn, .. } => Some(bn),
            BlockState::Fused { .. } => None,
        }
    }
}

fn describe_conv<T: Element>(conv: &Conv2D<T>, builder: &mut GraphBuilder) {
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

fn describe_bn<T: Element>(bn: &BatchNorm2D<T>, builder: &mut GraphBuilder) {
    let gamma = builder.push_f32(bn.gamma());
    let beta = builder.push_f32(bn.beta());
    let mean = builder.push_f32(bn.running_mean());
    let var = builder.push_f32(bn.running_var());
    builder.push_op(GraphOp::BatchNorm2d {
        gamma,
        beta,
        mean,
        var,
        eps: bn.eps(),
    });
}

/// Standard block: 3x3 conv (padding 1, no bias) + batch norm + ReLU.
#[derive(Debug, Clone)]
pub struct ConvBnRelu<T> {
    state: BlockState<T>,
    out_channels: usize,
}

impl<T: Element> ConvBnRelu<T> {
    pub fn new(in_channels: usize, out_channels: usize, stride: usize) -> Result<Self> {
        let conv = Conv2D::new(
            in_channels,
            out_channels,
            (3, 3),
            (stride, stride),
            (1, 1),
            1,
            false,
        )?;
        Ok(Self {
            state: BlockState::Unfused {
                conv,
                bn: BatchNorm2D::new(out_channels),
            },
            out_channels,
        })
    }
}

impl<T: Element> ConvBlock<T> for ConvBnRelu<T> {
    fn forward(&self, input: &Tensor<T>) -> Result<Tensor<T>> {
        let mut x = self.state.conv().forward(input)?;
        if let Some(bn) = self.state.bn() {
            x = bn.forward(&x)?;
        }
        Ok(ops::relu(&x))
    }

    fn fuse(&mut self) -> Result<()> {
        // Transition on a copy so a folding error leaves the block intact.
        self.state = self.state.clone().fuse()?;
        Ok(())
    }

    fn is_fused(&self) -> bool {
        self.state.is_fused()
    }

    fn out_channels(&self) -> usize {
        self.out_channels
    }

    fn parameters(&self) -> Vec<&Tensor<T>> {
        let mut params = self.state.conv().parameters();
        if let Some(bn) = self.state.bn() {
            params.extend(bn.parameters());
        }
        params
    }

    fn describe(&self, builder: &mut GraphBuilder) -> Result<()> {
        describe_conv(self.state.conv(), builder);
        if let Some(bn) = self.state.bn() {
            describe_bn(bn, builder);
        }
        builder.push_op(GraphOp::Relu);
        Ok(())
    }

    fn quantize(&self, act_params: QuantizationParams) -> Result<Box<dyn ConvBlock<T>>> {
        let post = match self.state.bn() {
            Some(bn) => Some(bn.scale_shift()?),
            None => None,
        };
        Ok(Box::new(QuantizedConvBlock {
            convs: vec![QuantizedConv::from_float(self.state.conv())?],
            post,
            act_params,
            out_channels: self.out_channels,
        }))
    }

    fn clone_box(&self) -> Box<dyn ConvBlock<T>> {
        Box::new(self.clone())
    }
}

/// Separable block: depthwise 3x3 + pointwise 1x1 (both bias-free) + batch
/// norm + ReLU. Fusion folds the batch norm into the pointwise conv; the
/// depthwise conv is untouched.
#[derive(Debug, Clone)]
pub struct SeparableConvBnRelu<T> {
    depthwise: Conv2D<T>,
    state: BlockState<T>,
    out_channels: usize,
}

impl<T: Element> SeparableConvBnRelu<T> {
    pub fn new(in_channels: usize, out_channels: usize, stride: usize) -> Result<Self> {
        let depthwise = Conv2D::new(
            in_channels,
            in_channels,
            (3, 3),
            (stride, stride),
            (1, 1),
            in_channels,
            false,
        )?;
        let pointwise = Conv2D::new(in_channels, out_channels, (1, 1), (1, 1), (0, 0), 1, false)?;
        Ok(Self {
            depthwise,
            state: BlockState::Unfused {
                conv: pointwise,
                bn: BatchNorm2D::new(out_channels),
            },
            out_channels,
        })
    }
}

impl<T: Element> ConvBlock<T> for SeparableConvBnRelu<T> {
    fn forward(&self, input: &Tensor<T>) -> Result<Tensor<T>> {
        let x = self.depthwise.forward(input)?;
        let mut x = self.state.conv().forward(&x)?;
        if let Some(bn) = self.state.bn() {
            x = bn.forward(&x)?;
        }
        Ok(ops::relu(&x))
    }

    fn fuse(&mut self) -> Result<()> {
        self.state = self.state.clone().fuse()?;
        Ok(())
    }

    fn is_fused(&self) -> bool {
        self.state.is_fused()
    }

    fn out_channels(&self) -> usize {
        self.out_channels
    }

    fn parameters(&self) -> Vec<&Tensor<T>> {
        let mut params = self.depthwise.parameters();
        params.extend(self.state.conv().parameters());
        if let Some(bn) = self.state.bn() {
            params.extend(bn.parameters());
        }
        params
    }

    fn describe(&self, builder: &mut GraphBuilder) -> Result<()> {
        describe_conv(&self.depthwise, builder);
        describe_conv(self.state.conv(), builder);
        if let Some(bn) = self.state.bn() {
            describe_bn(bn, builder);
        }
        builder.push_op(GraphOp::Relu);
        Ok(())
    }

    fn quantize(&self, act_params: QuantizationParams) -> Result<Box<dyn ConvBlock<T>>> {
        let post = match self.state.bn() {
            Some(bn) => Some(bn.scale_shift()?),
            None => None,
        };
        Ok(Box::new(QuantizedConvBlock {
            convs: vec![
                QuantizedConv::from_float(&self.depthwise)?,
                QuantizedConv::from_float(self.state.conv())?,
            ],
            post,
            act_params,
            out_channels: self.out_channels,
        }))
    }

    fn clone_box(&self) -> Box<dyn ConvBlock<T>> {
        Box::new(self.clone())
    }
}

/// Convolution with u8 weight storage and per-tensor weight parameters.
#[derive(Debug, Clone)]
pub struct QuantizedConv<T> {
    weight_q: Tensor<u8>,
    weight_params: QuantizationParams,
    bias: Option<Tensor<T>>,
    stride: (usize, usize),
    padding: (usize, usize),
    groups: usize,
}

impl<T: Element> QuantizedConv<T> {
    /// Quantize a float conv's weight over its own min/max range.
    pub fn from_float(conv: &Conv2D<T>) -> Result<Self> {
        let weight = tensor_to_f32(conv.weight());
        let values = weight.to_vec();
        let (min, max) = values.iter().fold((0.0f32, 0.0f32), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
        let params = QuantizationParams::uint8().from_min_max(min, max);
        Ok(Self {
            weight_q: quantize_tensor(&weight, &params)?,
            weight_params: params,
            bias: conv.bias().cloned(),
            stride: conv.stride(),
            padding: conv.padding(),
            groups: conv.groups(),
        })
    }

    fn float_weight(&self) -> Tensor<T> {
        let params = self.weight_params;
        self.weight_q
            .map(|&q| T::from_f32(params.dequantize(q as i32)).unwrap_or_else(T::zero))
    }

    pub fn forward(&self, input: &Tensor<T>) -> Result<Tensor<T>> {
        let weight = self.float_weight();
        ops::conv2d(
            input,
            &weight,
            self.bias.as_ref(),
            self.stride,
            self.padding,
            self.groups,
        )
        .map_err(NeuralError::Tensor)
    }

    pub fn describe(&self, builder: &mut GraphBuilder) {
        let weight = builder.push_u8(self.weight_q.clone(), self.weight_params);
        let bias = self.bias.as_ref().map(|b| builder.push_f32(b));
        builder.push_op(GraphOp::Conv2d {
            weight,
            bias,
            stride: self.stride,
            padding: self.padding,
            groups: self.groups,
        });
    }

    pub fn weight_params(&self) -> QuantizationParams {
        self.weight_params
    }

    pub fn bias(&self) -> Option<&Tensor<T>> {
        self.bias.as_ref()
    }
}

/// Converted form of either block variant. Weights live in u8 storage; an
/// unfused block carries its batch norm as an explicit per-channel affine.
/// Execution dequantizes the weights, runs the float kernels and clamps the
/// activations through the calibrated range.
#[derive(Debug, Clone)]
pub struct QuantizedConvBlock<T> {
    convs: Vec<QuantizedConv<T>>,
    post: Option<(Vec<T>, Vec<T>)>,
    act_params: QuantizationParams,
    out_channels: usize,
}

impl<T: Element> ConvBlock<T> for QuantizedConvBlock<T> {
    fn forward(&self, input: &Tensor<T>) -> Result<Tensor<T>> {
        let mut x = input.clone();
        for conv in &self.convs {
            x = conv.forward(&x)?;
        }
        if let Some((scale, shift)) = &self.post {
            let gamma = Tensor::from_vec(scale.clone(), &[scale.len()])?;
            let beta = Tensor::from_vec(shift.clone(), &[shift.len()])?;
            let mean = Tensor::<T>::zeros(&[scale.len()]);
            let var = Tensor::<T>::ones(&[scale.len()]);
            x = ops::batch_norm2d(&x, &gamma, &beta, &mean, &var, 0.0)?;
        }
        let x = ops::relu(&x);
        Ok(fake_quantize_t(&x, &self.act_params))
    }

    fn fuse(&mut self) -> Result<()> {
        Err(NeuralError::invalid_operation(
            "fuse",
            "block has already been converted to its quantized form",
        ))
    }

    fn is_fused(&self) -> bool {
        self.post.is_none()
    }

    fn is_quantized(&self) -> bool {
        true
    }

    fn out_channels(&self) -> usize {
        self.out_channels
    }

    fn parameters(&self) -> Vec<&Tensor<T>> {
        self.convs.iter().filter_map(|c| c.bias()).collect()
    }

    fn describe(&self, builder: &mut GraphBuilder) -> Result<()> {
        for conv in &self.convs {
            conv.describe(builder);
        }
        if let Some((scale, shift)) = &self.post {
            let gamma = builder.push_f32(&Tensor::from_vec(scale.clone(), &[scale.len()])?);
            let beta = builder.push_f32(&Tensor::from_vec(shift.clone(), &[shift.len()])?);
            let mean = builder.push_f32(&Tensor::<T>::zeros(&[scale.len()]));
            let var = builder.push_f32(&Tensor::<T>::ones(&[scale.len()]));
            builder.push_op(GraphOp::BatchNorm2d {
                gamma,
                beta,
                mean,
                var,
                eps: 0.0,
            });
        }
        builder.push_op(GraphOp::Relu);
        builder.push_op(GraphOp::Requantize {
            params: self.act_params,
        });
        Ok(())
    }

    fn quantize(&self, _act_params: QuantizationParams) -> Result<Box<dyn ConvBlock<T>>> {
        Err(NeuralError::invalid_operation(
            "quantize",
            "block has already been converted to its quantized form",
        ))
    }

    fn clone_box(&self) -> Box<dyn ConvBlock<T>> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_multiples_of_eight() {
        assert_eq!(make_divisible(18), 24);
        assert_eq!(make_divisible(16), 16);
        assert_eq!(make_divisible(1), 8);
        for w in 1..200 {
            let r = make_divisible(w);
            assert!(r >= w);
            assert_eq!(r % 8, 0);
        }
    }

    #[test]
    fn fused_forward_matches_unfused() {
        let mut block = ConvBnRelu::<f32>::new(3, 6, 1).unwrap();
        let input = Tensor::rand_uniform(&[1, 3, 5, 5], -1.0, 1.0);
        let before = block.forward(&input).unwrap();
        block.fuse().unwrap();
        let after = block.forward(&input).unwrap();
        assert!(block.is_fused());
        for (a, b) in before.to_vec().iter().zip(after.to_vec()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn separable_fused_forward_matches_unfused() {
        let mut block = SeparableConvBnRelu::<f32>::new(8, 16, 2).unwrap();
        let input = Tensor::rand_uniform(&[1, 8, 6, 6], -1.0, 1.0);
        let before = block.forward(&input).unwrap();
        block.fuse().unwrap();
        let after = block.forward(&input).unwrap();
        for (a, b) in before.to_vec().iter().zip(after.to_vec()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn double_fuse_is_an_error() {
        let mut block = ConvBnRelu::<f32>::new(3, 4, 1).unwrap();
        block.fuse().unwrap();
        assert!(matches!(block.fuse(), Err(NeuralError::AlreadyFused)));
    }

    #[test]
    fn quantized_block_stays_close_to_float() {
        let mut block = ConvBnRelu::<f32>::new(2, 4, 1).unwrap();
        block.fuse().unwrap();
        let input = Tensor::rand_uniform(&[1, 2, 4, 4], 0.0, 1.0);
        let float_out = block.forward(&input).unwrap();

        let (min, max) = float_out
            .to_vec()
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let act = QuantizationParams::uint8().from_min_max(min, max);
        let qblock = block.quantize(act).unwrap();
        assert!(qblock.is_quantized());
        assert!(qblock.is_fused());
        let quant_out = qblock.forward(&input).unwrap();

        // Weight and activation quantization each contribute at most a few
        // quantization steps of error on a range this small.
        let weight_abs_max = block
            .parameters()
            .iter()
            .flat_map(|p| p.to_vec())
            .fold(0.0f32, |m, v| m.max(v.abs()));
        let tol = act.scale + weight_abs_max * 0.1 + 0.05;
        for (a, b) in float_out.to_vec().iter().zip(quant_out.to_vec()) {
            assert!((a - b).abs() < tol, "{a} vs {b}");
        }
    }

    #[test]
    fn quantized_block_rejects_fuse_and_requantize() {
        let block = ConvBnRelu::<f32>::new(2, 2, 1).unwrap();
        let mut qblock = block.quantize(QuantizationParams::uint8()).unwrap();
        assert!(qblock.fuse().is_err());
        assert!(qblock.quantize(QuantizationParams::uint8()).is_err());
    }
}
