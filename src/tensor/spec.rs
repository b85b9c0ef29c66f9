//! Value-type descriptor for a tensor buffer, produced by layers and consumed by the buffer pool.

use super::format::{ElementType, TensorFormat};

/// What role a buffer plays for the layer that declared it.
///
/// Mirrors the reference engine's buffer-usage enumerator one-for-one; the buffer pool uses this
/// only to decide eligibility for pooling (residual/concat/oes/cpu boundaries behave differently
/// from ordinary function buffers).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Usage {
    ResidualSource,
    FunctionSource,
    FunctionDest,
    ConcatSource,
    ConcatDest,
    OesDest,
    CpuSource,
    GpuDest,
    CpuDest,
}

/// Spatial interpolation mode for sampling a GPU tensor buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Interpolation {
    Nearest,
    Linear,
}

impl Interpolation {
    pub fn to_wgpu(self) -> wgpu::FilterMode {
        match self {
            Interpolation::Nearest => wgpu::FilterMode::Nearest,
            Interpolation::Linear => wgpu::FilterMode::Linear,
        }
    }
}

/// A value-type descriptor for one tensor buffer (one or more textures, depending on format).
///
/// Layers produce a list of these during `setup` to describe their required inputs and outputs;
/// the [`crate::pool::BufferPool`] resolves each one to an actual GPU texture, either freshly
/// allocated or recycled from a prior layer whose last use has passed.
#[derive(Clone, Debug, PartialEq)]
pub struct BufferSpec {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    /// Which four-channel slice this spec names, for multi-texture shallow buffers.
    pub channel_tile_index: u32,
    /// Which input/output port this spec belongs to, for multi-port layers.
    pub port: u32,
    pub element_type: ElementType,
    pub usage: Usage,
    pub interpolation: Interpolation,
    pub format: TensorFormat,
    /// Number of parallel copies to allocate (double-buffering for async upload/download).
    pub multiplicity: u32,
    /// Output handle equals the input handle unchanged; no allocation performed.
    pub pass_through: bool,
    /// Exempt from pool reuse; allocated and freed per-layer.
    pub lock: bool,
    /// Subject to an asynchronous read or write (implies `lock`).
    pub async_io: bool,
}

impl BufferSpec {
    /// Construct a minimal function-layer buffer spec; further fields are set with the builder
    /// methods below, following the reference engine's fluent `BufferSpec` API.
    pub fn new(
        width: u32,
        height: u32,
        channels: u32,
        element_type: ElementType,
        usage: Usage,
        format: TensorFormat,
    ) -> Self {
        BufferSpec {
            width,
            height,
            channels,
            channel_tile_index: 0,
            port: 0,
            element_type,
            usage,
            interpolation: Interpolation::Nearest,
            format,
            multiplicity: 1,
            pass_through: false,
            lock: false,
            async_io: false,
        }
    }

    pub fn with_channel_tile_index(mut self, index: u32) -> Self {
        self.channel_tile_index = index;
        self
    }

    pub fn with_port(mut self, port: u32) -> Self {
        self.port = port;
        self
    }

    pub fn with_interpolation(mut self, interpolation: Interpolation) -> Self {
        self.interpolation = interpolation;
        self
    }

    pub fn with_multiplicity(mut self, multiplicity: u32) -> Self {
        self.multiplicity = multiplicity;
        self.lock |= multiplicity > 1;
        self
    }

    pub fn with_pass_through(mut self, enable: bool) -> Self {
        self.pass_through = enable;
        self
    }

    pub fn with_lock(mut self, enable: bool) -> Self {
        self.lock |= enable;
        self
    }

    pub fn with_async(mut self, enable: bool) -> Self {
        self.async_io = enable;
        self.lock |= enable;
        self
    }

    /// Whether two specs describe textures that could be recycled for each other: same
    /// dimensions, element type, tensor format, and interpolation. Usage, port, and tile index
    /// are irrelevant to physical compatibility.
    pub fn is_pool_compatible(&self, other: &BufferSpec) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.element_type == other.element_type
            && self.format == other.format
            && self.interpolation == other.interpolation
    }

    /// A spec is eligible for the shared pool only if it is neither locked nor pass-through.
    pub fn is_poolable(&self) -> bool {
        !self.lock && !self.pass_through && !self.async_io
    }

    /// Number of 4-channel textures a shallow-format buffer with this spec's channel count needs.
    pub fn shallow_texture_count(&self) -> u32 {
        TensorFormat::shallow_texture_count(self.channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn async_implies_lock() {
        let spec = BufferSpec::new(
            4,
            4,
            4,
            ElementType::Float16,
            Usage::GpuDest,
            TensorFormat::Shallow,
        )
        .with_async(true);
        assert!(spec.lock);
        assert!(!spec.is_poolable());
    }

    #[test]
    fn multiplicity_above_one_implies_lock() {
        let spec = BufferSpec::new(
            4,
            4,
            4,
            ElementType::Float16,
            Usage::GpuDest,
            TensorFormat::Shallow,
        )
        .with_multiplicity(2);
        assert!(spec.lock);
    }

    #[test]
    fn pool_compatibility_ignores_usage_and_port() {
        let a = BufferSpec::new(
            8,
            8,
            4,
            ElementType::Float16,
            Usage::FunctionSource,
            TensorFormat::Shallow,
        );
        let b = BufferSpec::new(
            8,
            8,
            4,
            ElementType::Float16,
            Usage::FunctionDest,
            TensorFormat::Shallow,
        )
        .with_port(3);
        assert!(a.is_pool_compatible(&b));
    }
}
