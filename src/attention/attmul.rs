//! Attention-value multiply (§4.8 step 5): softmax output times V along the key dimension,
//! mirroring the batched/single distinction of the dot-product stage.

use crate::error::Result;
use crate::gfx::{self, Framebuffer, ProgramDescriptor, TensorTexture};
use crate::layer::base::DispatchContext;
use crate::tensor::ElementType;

use super::dotprod::DotProductMode;

/// Per-draw uniform matching `attention/attmul.wgsl`'s `Uniforms` struct exactly.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct AttMulUniforms {
    key_len: u32,
    head_dim: u32,
    _pad0: u32,
    _pad1: u32,
}

#[allow(clippy::too_many_arguments)]
pub fn run(
    ctx: &mut DispatchContext<'_>,
    label: &str,
    prob_tex: &TensorTexture,
    v_tex: &TensorTexture,
    framebuffer: &Framebuffer,
    key_len: u32,
    head_dim: u32,
    mode: DotProductMode,
) -> Result<()> {
    let _ = mode;

    let bind_group_layout_entries = [gfx::sampler_entry(0), gfx::texture_entry(1), gfx::texture_entry(2), gfx::uniform_entry(3)];
    let color_formats = [Some(wgpu::ColorTargetState {
        format: ElementType::Float16.rgba_texture_format(),
        blend: None,
        write_mask: wgpu::ColorWrites::ALL,
    })];

    let descriptor = ProgramDescriptor {
        label,
        vertex_source: include_str!("../../shaders/common/quad_vertex.wgsl"),
        fragment_source: include_str!("../../shaders/attention/attmul.wgsl"),
        defines: &[("KEY_LEN", key_len.to_string()), ("HEAD_DIM", head_dim.to_string())],
        vertex_layout: gfx::quad_vertex_layout(),
        color_formats: &color_formats,
        bind_group_layout_entries: &bind_group_layout_entries,
        blend_accumulate: false,
        stencil_test: None,
    };
    let program = ctx.programs.get_or_compile(ctx.gpu, &descriptor)?;

    let uniforms = AttMulUniforms {
        key_len,
        head_dim,
        _pad0: 0,
        _pad1: 0,
    };
    let uniform_buffer = gfx::create_uniform(&ctx.gpu.device, &format!("{}-uniforms", label), bytemuck::bytes_of(&uniforms));

    let quad = ctx.geometry.unit_quad(&ctx.gpu.device);

    let entries = [
        wgpu::BindGroupEntry {
            binding: 0,
            resource: wgpu::BindingResource::Sampler(&prob_tex.sampler),
        },
        wgpu::BindGroupEntry {
            binding: 1,
            resource: wgpu::BindingResource::TextureView(&prob_tex.view),
        },
        wgpu::BindGroupEntry {
            binding: 2,
            resource: wgpu::BindingResource::TextureView(&v_tex.view),
        },
        wgpu::BindGroupEntry {
            binding: 3,
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
