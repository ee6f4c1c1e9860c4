//! Model capture, optimization and deployment.

pub mod capture;
pub mod deploy;
pub mod mobile;
pub mod nnapi;
pub mod onnx;
pub mod quantize;

pub use capture::{
    script_model, trace_model, trace_model_channels_last, CaptureMode, GraphBuilder, GraphMeta,
    GraphOp, GraphProgram, InitTensor, InputLayout,
};
pub use deploy::{
    deploy_float, deploy_nnapi, deploy_onnx_quantized, deploy_quantized, DeployConfig,
};
pub use mobile::{optimize_for_mobile, MobileBackend};
pub use nnapi::{lower_to_accelerator, wrap_float_interface, NNAPI_DELEGATE};
pub use onnx::{
    export_onnx, quantize_static, CalibrationReader, CalibrationRecord, InferenceSession,
    OnnxModel, ONNX_INPUT_NAME, ONNX_OUTPUT_NAME,
};
pub use quantize::{prepare, PreparedClassifier, QuantBackend};
