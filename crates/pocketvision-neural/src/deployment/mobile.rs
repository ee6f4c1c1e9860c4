//! Mobile optimization pass over captured programs.

use serde::{Deserialize, Serialize};

use crate::deployment::capture::{GraphOp, GraphProgram};
use crate::error::{NeuralError, Result};

/// Target the optimization pass specializes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MobileBackend {
    Cpu,
    Vulkan,
}

/// Specialize a captured program for a mobile target: no-op identity steps
/// are elided and the program is annotated with its backend.
///
/// The Vulkan path has no integer kernels, so quantized programs are
/// rejected rather than silently run in float.
pub fn optimize_for_mobile(
    mut program: GraphProgram,
    backend: MobileBackend,
) -> Result<GraphProgram> {
    if backend == MobileBackend::Vulkan && program.meta.quantized {
        return Err(NeuralError::invalid_operation(
            "optimize_for_mobile",
            "vulkan backend does not support quantized programs",
        ));
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

    program.meta.optimized_for = Some(backend);
    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::capture::{script_model, trace_model};
    use crate::deployment::quantize::{prepare, QuantBackend};
    use crate::model::{BlockVariant, ToyClassifier};
    use pocketvision_core::Tensor;

    fn tiny_model() -> ToyClassifier<f32> {
        ToyClassifier::with_schedule(&[(3, 4, 1)], BlockVariant::Standard, 3).unwrap()
    }

    #[test]
    fn identity_ops_are_elided() {
        let program = script_model(&tiny_model()).unwrap();
        let before = program.ops.len();
        let optimized = optimize_for_mobile(program, MobileBackend::Cpu).unwrap();
        // An unconverted model carries two identity stubs.
        assert_eq!(optimized.ops.len(), before - 2);
        assert_eq!(optimized.meta.optimized_for, Some(MobileBackend::Cpu));
        assert!(optimized
            .ops
            .iter()
            .all(|op| !matches!(op, GraphOp::Identity)));
    }

    #[test]
    fn elision_keeps_recorded_shapes_aligned() {
        let model = tiny_model();
        let example = Tensor::rand_uniform(&[1, 3, 6, 6], 0.0, 1.0);
        let traced = trace_model(&model, &example).unwrap();
        let optimized = optimize_for_mobile(traced, MobileBackend::Cpu).unwrap();
        let shapes = optimized.meta.op_output_shapes.as_ref().unwrap();
        assert_eq!(shapes.len(), optimized.ops.len());
        assert_eq!(shapes.last().unwrap(), &[1, 3]);
    }

    #[test]
    fn vulkan_rejects_quantized_programs() {
        let mut prepared = prepare(tiny_model(), QuantBackend::Qnnpack);
        prepared
            .calibrate(&Tensor::rand_uniform(&[1, 3, 6, 6], 0.0, 1.0))
            .unwrap();
        let qmodel = prepared.convert().unwrap();
        let program = script_model(&qmodel).unwrap();
        assert!(optimize_for_mobile(program.clone(), MobileBackend::Cpu).is_ok());
        assert!(optimize_for_mobile(program, MobileBackend::Vulkan).is_err());
    }

    #[test]
    fn optimized_program_still_runs() {
        let model = tiny_model();
        let example = Tensor::rand_uniform(&[1, 3, 6, 6], 0.0, 1.0);
        let traced = trace_model(&model, &example).unwrap();
        let expected = traced.run(&example).unwrap();
        let optimized = optimize_for_mobile(traced, MobileBackend::Cpu).unwrap();
        assert_eq!(optimized.run(&example).unwrap().to_vec(), expected.to_vec());
    }
}
