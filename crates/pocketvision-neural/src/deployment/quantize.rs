//! Post-training static quantization workflow: prepare a model with range
//! observers, calibrate on representative data, convert to u8 weights.

use pocketvision_core::{MinMaxObserver, QuantizationParams, Tensor};

use crate::error::{NeuralError, Result};
use crate::model::ToyClassifier;

/// Kernel library the quantized model targets. Chosen per call; there is no
/// process-wide engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantBackend {
    /// Server-class x86 kernels; activations use a reduced 7-bit range.
    Fbgemm,
    /// Mobile ARM kernels; full 8-bit activation range.
    Qnnpack,
}

impl QuantBackend {
    /// Integer range template for activation tensors on this backend.
    pub fn activation_params(&self) -> QuantizationParams {
        match self {
            QuantBackend::Fbgemm => QuantizationParams::uint8_reduced(),
            QuantBackend::Qnnpack => QuantizationParams::uint8(),
        }
    }
}

/// A model instrumented for calibration. Consumes the model: the prepared
/// form is a distinct state, not a flag on the original.
#[derive(Debug)]
pub struct PreparedClassifier {
    model: ToyClassifier<f32>,
    backend: QuantBackend,
    input_obs: MinMaxObserver,
    block_obs: Vec<MinMaxObserver>,
    output_obs: MinMaxObserver,
}

/// Attach min/max observers at the model's quantization boundaries and after
/// every block.
pub fn prepare(model: ToyClassifier<f32>, backend: QuantBackend) -> PreparedClassifier {
    let block_obs = vec![MinMaxObserver::new(); model.num_blocks()];
    PreparedClassifier {
        model,
        backend,
        input_obs: MinMaxObserver::new(),
        block_obs,
        output_obs: MinMaxObserver::new(),
    }
}

impl PreparedClassifier {
    /// Run one batch through the model, folding every observed activation
    /// range into the running statistics.
    pub fn calibrate(&mut self, batch: &Tensor<f32>) -> Result<()> {
        let stages = self.model.forward_stages(batch)?;
        self.input_obs.observe_tensor(batch);
        for (obs, out) in self.block_obs.iter_mut().zip(&stages.block_outputs) {
            obs.observe_tensor(out);
        }
        self.output_obs.observe_tensor(&stages.logits);
        Ok(())
    }

    pub fn samples_seen(&self) -> usize {
        self.input_obs.count()
    }

    pub fn backend(&self) -> QuantBackend {
        self.backend
    }

    /// Convert to the quantized model. Requires at least one calibrated
    /// sample; an uncalibrated model has no ranges to quantize against.
    pub fn convert(self) -> Result<ToyClassifier<f32>> {
        let template = self.backend.activation_params();
        let input = observed_params(&self.input_obs, &template)?;
        let output = observed_params(&self.output_obs, &template)?;
        let block_params = self
            .block_obs
            .iter()
            .map(|obs| observed_params(obs, &template))
            .collect::<Result<Vec<_>>>()?;

        let mut model = self.model;
        model.quantize_blocks(&block_params)?;
        model.quantize_head(output)?;
        model.set_stub_params(input, output);
        Ok(model)
    }
}

fn observed_params(
    obs: &MinMaxObserver,
    template: &QuantizationParams,
) -> Result<QuantizationParams> {
    let (min, max) = obs.min_max().ok_or(NeuralError::EmptyCalibration)?;
    Ok(template.from_min_max(min, max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlockVariant;

    fn tiny_model() -> ToyClassifier<f32> {
        ToyClassifier::with_schedule(&[(3, 6, 1), (6, 8, 2)], BlockVariant::Standard, 5).unwrap()
    }

    #[test]
    fn convert_without_calibration_is_an_error() {
        let prepared = prepare(tiny_model(), QuantBackend::Fbgemm);
        assert!(matches!(
            prepared.convert(),
            Err(NeuralError::EmptyCalibration)
        ));
    }

    #[test]
    fn converted_model_is_quantized_and_runs() {
        let mut prepared = prepare(tiny_model(), QuantBackend::Qnnpack);
        for _ in 0..3 {
            let batch = Tensor::rand_uniform(&[1, 3, 8, 8], 0.0, 1.0);
            prepared.calibrate(&batch).unwrap();
        }
        assert_eq!(prepared.samples_seen(), 3);
        let model = prepared.convert().unwrap();
        assert!(model.is_quantized());
        let out = model
            .forward(&Tensor::rand_uniform(&[1, 3, 8, 8], 0.0, 1.0))
            .unwrap();
        assert_eq!(out.shape(), &[1, 5]);
    }

    #[test]
    fn fbgemm_uses_the_reduced_activation_range() {
        let mut prepared = prepare(tiny_model(), QuantBackend::Fbgemm);
        prepared
            .calibrate(&Tensor::rand_uniform(&[1, 3, 8, 8], 0.0, 1.0))
            .unwrap();
        assert_eq!(prepared.backend().activation_params().qmax, 127);
        let model = prepared.convert().unwrap();
        // Conversion preserves executability under the reduced range.
        model
            .forward(&Tensor::rand_uniform(&[1, 3, 8, 8], 0.0, 1.0))
            .unwrap();
    }

    #[test]
    fn quantized_output_tracks_float_output() {
        let float_model = tiny_model();
        let mut prepared = prepare(float_model.clone(), QuantBackend::Qnnpack);
        let calib: Vec<_> = (0..4)
            .map(|_| Tensor::rand_uniform(&[1, 3, 8, 8], 0.0, 1.0))
            .collect();
        for batch in &calib {
            prepared.calibrate(batch).unwrap();
        }
        let qmodel = prepared.convert().unwrap();

        let probe = &calib[0];
        let float_out = float_model.forward(probe).unwrap().to_vec();
        let quant_out = qmodel.forward(probe).unwrap().to_vec();
        let float_span = float_out
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let tol = ((float_span.1 - float_span.0).abs() * 0.5).max(0.5);
        for (a, b) in float_out.iter().zip(&quant_out) {
            assert!((a - b).abs() < tol, "{a} vs {b}");
        }
    }
}
