//! The four on-device/host tensor storage formats and their element types.

/// How a tensor's values are laid out across textures or host memory.
///
/// See the data model notes in the crate root docs for the invariants each format upholds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TensorFormat {
    /// One or more 2-D four-channel textures, each holding four consecutive channels.
    Shallow,
    /// A single 2-D texture split into a tile grid of four-channel tiles.
    Deep,
    /// A single 2-D texture whose rows are tokens.
    Sequence,
    /// Planar `(width * height) * channels` host memory, used only at system boundaries.
    CpuChannelwise,
}

impl TensorFormat {
    /// Number of four-channel textures a shallow tensor with `channels` channels needs.
    ///
    /// Only meaningful for [`TensorFormat::Shallow`]; callers are expected to have already
    /// matched on the format.
    pub fn shallow_texture_count(channels: u32) -> u32 {
        channels.div_ceil(4)
    }
}

/// Element (sample) type of a tensor buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElementType {
    Uint8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float16,
    Float32,
}

impl ElementType {
    /// Size in bytes of a single scalar element on the host side.
    pub fn byte_size(self) -> usize {
        match self {
            ElementType::Uint8 => 1,
            ElementType::Uint16 | ElementType::Int16 | ElementType::Float16 => 2,
            ElementType::Uint32 | ElementType::Int32 | ElementType::Float32 => 4,
        }
    }

    /// The wgpu texture format for a 4-channel texel of this element type.
    pub fn rgba_texture_format(self) -> wgpu::TextureFormat {
        use wgpu::TextureFormat as F;
        match self {
            ElementType::Uint8 => F::Rgba8Unorm,
            ElementType::Uint16 => F::Rgba16Uint,
            ElementType::Int16 => F::Rgba16Sint,
            ElementType::Uint32 => F::Rgba32Uint,
            ElementType::Int32 => F::Rgba32Sint,
            ElementType::Float16 => F::Rgba16Float,
            ElementType::Float32 => F::Rgba32Float,
        }
    }
}

impl Default for ElementType {
    /// Default element type is FP16 with 4-channel packing (RGBA16F).
    fn default() -> Self {
        ElementType::Float16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shallow_texture_count_rounds_up() {
        assert_eq!(TensorFormat::shallow_texture_count(1), 1);
        assert_eq!(TensorFormat::shallow_texture_count(4), 1);
        assert_eq!(TensorFormat::shallow_texture_count(5), 2);
        assert_eq!(TensorFormat::shallow_texture_count(32), 8);
    }

    #[test]
    fn default_element_type_is_float16() {
        assert_eq!(ElementType::default(), ElementType::Float16);
    }
}
