//! Rotary positional encoding (§4.8 step 2), applied to Q and K. The K texture produced here is
//! persisted across `forward` calls to support incremental decoding.

use crate::error::Result;
use crate::gfx::texture::TextureUsage;
use crate::gfx::{self, Framebuffer, Gpu, ProgramDescriptor, TensorTexture, TextureDescriptor};
use crate::layer::base::DispatchContext;
use crate::tensor::{ElementType, Interpolation};

/// Per-draw uniform matching `attention/rotary.wgsl`'s `Uniforms` struct exactly.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct RotaryUniforms {
    head_dim: u32,
    token_base: u32,
    theta: f32,
    _pad: u32,
}

pub struct RotaryEncoder {
    pub head_dim: u32,
    pub theta: f32,
}

impl RotaryEncoder {
    pub fn new(head_dim: u32, theta: f32) -> Self {
        RotaryEncoder { head_dim, theta }
    }

    /// Allocate the persisted K-cache texture for incremental decoding: one row per token up to
    /// `max_seq_len`, `head_dim/4` texels wide per head.
    pub fn allocate_k_cache(&self, gpu: &Gpu, max_seq_len: u32, num_heads: u32) -> TensorTexture {
        let descriptor = TextureDescriptor::for_tensor_texture(
            (self.head_dim / 4) * num_heads,
            max_seq_len,
            ElementType::Float16,
            TextureUsage::Storage,
        );
        TensorTexture::create(&gpu.device, descriptor, Interpolation::Nearest, Some("rotary-k-cache"))
    }

    pub fn run(
        &self,
        ctx: &mut DispatchContext<'_>,
        label: &str,
        input_tex: &TensorTexture,
        framebuffer: &Framebuffer,
        token_base: u32,
    ) -> Result<()> {
        let bind_group_layout_entries = [gfx::sampler_entry(0), gfx::texture_entry(1), gfx::uniform_entry(2)];
        let color_formats = [Some(wgpu::ColorTargetState {
            format: ElementType::Float16.rgba_texture_format(),
            blend: None,
            write_mask: wgpu::ColorWrites::ALL,
        })];

        let descriptor = ProgramDescriptor {
            label,
            vertex_source: include_str!("../../shaders/common/quad_vertex.wgsl"),
            fragment_source: include_str!("../../shaders/attention/rotary.wgsl"),
            defines: &[("HEAD_DIM", self.head_dim.to_string()), ("TOKEN_BASE", token_base.to_string())],
            vertex_layout: gfx::quad_vertex_layout(),
            color_formats: &color_formats,
            bind_group_layout_entries: &bind_group_layout_entries,
            blend_accumulate: false,
            stencil_test: None,
        };
        let program = ctx.programs.get_or_compile(ctx.gpu, &descriptor)?;

        let uniforms = RotaryUniforms {
            head_dim: self.head_dim,
            token_base,
            theta: self.theta,
            _pad: 0,
        };
        let uniform_buffer =
            gfx::create_uniform(&ctx.gpu.device, &format!("{}-uniforms", label), bytemuck::bytes_of(&uniforms));

        let quad = ctx.geometry.unit_quad(&ctx.gpu.device);

        let entries = [
            wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Sampler(&input_tex.sampler),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::TextureView(&input_tex.view),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: uniform_buffer.as_entire_binding(),
            },
        ];

        gfx::draw(
            ctx.gpu,
            &gfx::DrawCall {
                label,
                program: &program,
                bind_group_entries: &entries,
                vertex_buffer: quad,
                vertex_range: 0..6,
                framebuffer,
                clear: true,
                stencil_reference: 0,
            },
        )
    }
}
