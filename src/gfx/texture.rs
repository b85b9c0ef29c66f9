//! Texture descriptor and thin owned-texture wrapper used by the tensor buffer pool.

use std::sync::Arc;

use crate::tensor::{ElementType, Interpolation};

/// How a texture will be used, collapsed to the handful of usage combinations the engine needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureUsage {
    /// Copy destination + sampled: upload targets, weight/bias textures.
    DataIn,
    /// Copy source + render attachment: ordinary function/conv output.
    DataOut,
    /// Copy src/dst + sampled + render attachment: ping-ponged intermediate buffers.
    Storage,
    /// Render attachment only, `Stencil8` format: the hardware stencil test backing for
    /// stencil-stratified passes (§4.6). Never sampled in-shader.
    Stencil,
}

impl TextureUsage {
    pub fn to_wgpu(self) -> wgpu::TextureUsages {
        use wgpu::TextureUsages as U;
        match self {
            TextureUsage::DataIn => U::COPY_DST | U::TEXTURE_BINDING,
            TextureUsage::DataOut => U::COPY_SRC | U::RENDER_ATTACHMENT | U::TEXTURE_BINDING,
            TextureUsage::Storage => {
                U::COPY_SRC | U::COPY_DST | U::TEXTURE_BINDING | U::RENDER_ATTACHMENT
            }
            TextureUsage::Stencil => U::RENDER_ATTACHMENT,
        }
    }
}

/// Value-type key the buffer pool groups textures by. Two descriptors that compare equal can
/// serve as substitutes for one another.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: wgpu::TextureFormat,
    pub usage: TextureUsageKey,
}

/// `wgpu::TextureUsages` isn't `Hash`/`Eq`; this is the poolable-key projection of
/// [`TextureUsage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureUsageKey(pub TextureUsage);

impl TextureDescriptor {
    pub fn for_tensor_texture(
        width: u32,
        height: u32,
        element_type: ElementType,
        usage: TextureUsage,
    ) -> Self {
        TextureDescriptor {
            width,
            height,
            format: element_type.rgba_texture_format(),
            usage: TextureUsageKey(usage),
        }
    }

    /// Descriptor for the stencil attachment backing a stencil-stratified dispatch (§4.6): a
    /// single-channel `Stencil8` texture, not sampled in-shader.
    pub fn for_stencil(width: u32, height: u32) -> Self {
        TextureDescriptor {
            width,
            height,
            format: wgpu::TextureFormat::Stencil8,
            usage: TextureUsageKey(TextureUsage::Stencil),
        }
    }

    pub fn to_wgpu(&self, label: Option<&str>) -> wgpu::TextureDescriptor<'_> {
        wgpu::TextureDescriptor {
            label,
            size: wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: self.format,
            usage: self.usage.0.to_wgpu(),
            view_formats: &[],
        }
    }
}

/// An allocated tensor texture plus the view and sampler it is always accessed through.
///
/// Cloning is cheap: the underlying `wgpu::Texture` and the sampler are reference counted, since
/// a tensor buffer may be read by several downstream layers concurrently (single-writer,
/// multi-reader per §5).
#[derive(Clone)]
pub struct TensorTexture {
    pub texture: Arc<wgpu::Texture>,
    pub view: Arc<wgpu::TextureView>,
    pub sampler: Arc<wgpu::Sampler>,
    pub descriptor: TextureDescriptor,
}

impl TensorTexture {
    pub fn create(
        device: &wgpu::Device,
        descriptor: TextureDescriptor,
        interpolation: Interpolation,
        label: Option<&str>,
    ) -> Self {
        let texture = device.create_texture(&descriptor.to_wgpu(label));
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let filter = interpolation.to_wgpu();
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label,
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: filter,
            min_filter: filter,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        TensorTexture {
            texture: Arc::new(texture),
            view: Arc::new(view),
            sampler: Arc::new(sampler),
            descriptor,
        }
    }
}
