//! Accelerator (NNAPI-style) lowering of captured programs.
//!
//! The accelerator consumes already-quantized channels-last tensors, so the
//! model's quantize/dequantize boundary stubs must be stripped before
//! tracing; a program that still contains them does not lower. The
//! float-interface wrapper reintroduces the boundary around the lowered
//! program for callers that hold float tensors.

use pocketvision_core::QuantizationParams;

use crate::deployment::capture::{GraphOp, GraphProgram};
use crate::error::{NeuralError, Result};

pub const NNAPI_DELEGATE: &str = "nnapi";

/// Lower a traced program onto the accelerator delegate. Identity steps are
/// elided; quantization boundary ops are rejected.
pub fn lower_to_accelerator(mut program: GraphProgram) -> Result<GraphProgram> {
    for op in &program.ops {
        if matches!(op, GraphOp::Quantize { .. } | GraphOp::Dequantize { .. }) {
            return Err(NeuralError::NotLowerable {
                op: op.name().to_string(),
            });
        }
    }

    let keep: Vec<bool> = program
        .ops
        .iter()
        .map(|op| !matches!(op, GraphOp::Identity))
        .collect();
    if let Some(shapes) = program.meta.op_output_shapes.take() {
        program.meta.op_output_shapes = Some(
            shapes
                .into_iter()
                .zip(&keep)
                .filter_map(|(s, &k)| k.then_some(s))
                .collect(),
        );
    }
    let mut keep_iter = keep.into_iter();
    program.ops.retain(|_| keep_iter.next().unwrap_or(true));

    program.meta.delegate = Some(NNAPI_DELEGATE.to_string());
    Ok(program)
}

/// Wrap a lowered program with a float boundary: quantize the caller's float
/// input with the model's input parameters, dequantize the output.
pub fn wrap_float_interface(
    mut program: GraphProgram,
    input_params: QuantizationParams,
    output_params: QuantizationParams,
) -> GraphProgram {
    program.ops.insert(0, GraphOp::Quantize {
        params: input_params,
    });
    program.ops.push(GraphOp::Dequantize {
        params: output_params,
    });
    // Recorded shapes no longer line up with the rewritten op list.
    program.meta.op_output_shapes = None;
    program
}
