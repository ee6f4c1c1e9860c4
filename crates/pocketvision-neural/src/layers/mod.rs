pub mod conv;
pub mod norm;

pub use conv::Conv2D;
pub use norm::BatchNorm2D;
