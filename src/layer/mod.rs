//! Layer base state, the function-layer render loop, builders, and the layer factory (§3.3).

pub mod base;
pub mod builder;
pub mod factory;
pub mod function;

pub use base::{Activation, DispatchContext, Layer, LayerBase, LayerFlags};
pub use builder::{ConvParams, LayerBuilder, LayerShape};
pub use factory::LayerFactory;
pub use function::{FunctionLayer, FunctionOp};
