//! Numeric kernels: convolution, pooling, dense layers.

pub mod conv;

pub use conv::*;
