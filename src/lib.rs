//! GPU-executed neural-network inference engine: tensor operations expressed as fragment-shader
//! render passes over `wgpu`, following the architecture of a mobile/embedded inference runtime
//! that treats the graphics pipeline as a general compute substrate.
//!
//! See [`tensor`] for the four storage layouts, [`gfx`] for the `wgpu` primitives every
//! dispatcher builds on, [`layer`]/[`conv`]/[`concat`]/[`attention`]/[`embedding`] for the
//! concrete operations, and [`engine`] for how a network's layer list runs end to end.

pub mod attention;
pub mod concat;
pub mod conv;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod gfx;
pub mod layer;
pub mod params;
pub mod pool;
pub mod tensor;

pub use engine::Engine;
pub use error::{Error, Result};
pub use gfx::{Capabilities, Gpu};
pub use params::{DataBlob, ParameterProvider};
pub use pool::BufferPool;
