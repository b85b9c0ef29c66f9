//! Convolution dispatchers: shallow (§4.4), deep (§4.5), and transpose (§4.6).

pub mod deep;
pub mod shallow;
pub mod transpose;

pub use deep::DeepConvLayer;
pub use shallow::ShallowConvLayer;
pub use transpose::TransposeConvLayer;
