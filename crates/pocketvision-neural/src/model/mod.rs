pub mod block;
pub mod classifier;

pub use block::{
    make_divisible, BlockState, ConvBlock, ConvBnRelu, QuantizedConv, QuantizedConvBlock,
    SeparableConvBnRelu,
};
pub use classifier::{
    BlockVariant, ClassifierHead, DeQuantStub, QuantStub, StageActivations, ToyClassifier,
    CANONICAL_SCHEDULE, DEFAULT_NUM_CLASSES,
};
