//! Graphics primitives: the thin `wgpu` wrappers every dispatcher is built on top of.

pub mod buffer;
pub mod device;
pub mod dispatch;
pub mod framebuffer;
pub mod layout;
pub mod program;
pub mod snippets;
pub mod texture;
pub mod uniform;

pub use buffer::{
    conv_lane_vertex_layout, create_storage, create_uniform, quad_vertex_layout, GeometryCache,
};
pub use device::{Capabilities, Gpu};
pub use dispatch::{draw, DrawCall};
pub use framebuffer::Framebuffer;
pub use layout::{sampler_entry, storage_entry, texture_entry, uint_texture_entry, uniform_entry};
pub use program::{Program, ProgramCache, ProgramDescriptor, StencilTest};
pub use texture::{TensorTexture, TextureDescriptor, TextureUsage, TextureUsageKey};
pub use uniform::UniformState;
