//! Q.K^T dot product (§4.8 step 3): batched (several heads per draw) or single (one query token)
//! mode, chosen by query length.

use crate::error::Result;
use crate::gfx::{self, Framebuffer, ProgramDescriptor, TensorTexture};
use crate::layer::base::DispatchContext;
use crate::tensor::ElementType;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DotProductMode {
    Batched { batch_size: u32 },
    Single,
}

pub fn select_mode(query_len: u32, num_heads: u32, dp_max_batch: u32) -> DotProductMode {
    if query_len > 1 {
        DotProductMode::Batched {
            batch_size: num_heads.min(dp_max_batch),
        }
    } else {
        DotProductMode::Single
    }
}

/// Per-draw uniform matching `attention/dotprod.wgsl`'s `Uniforms` struct exactly.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct DotProdUniforms {
    head_dim: u32,
    key_len: u32,
    batch_size: u32,
    _pad: u32,
}

pub fn run(
    ctx: &mut DispatchContext<'_>,
    label: &str,
    q_tex: &TensorTexture,
    k_tex: &TensorTexture,
    framebuffer: &Framebuffer,
    head_dim: u32,
    key_len: u32,
    mode: DotProductMode,
) -> Result<()> {
    let batch_size = match mode {
        DotProductMode::Batched { batch_size } => batch_size,
        DotProductMode::Single => 1,
    };

    let bind_group_layout_entries = [gfx::sampler_entry(0), gfx::texture_entry(1), gfx::texture_entry(2), gfx::uniform_entry(3)];
    let color_formats = [Some(wgpu::ColorTargetState {
        format: ElementType::Float32.rgba_texture_format(),
        blend: None,
        write_mask: wgpu::ColorWrites::ALL,
    })];

    let descriptor = ProgramDescriptor {
        label,
        vertex_source: include_str!("../../shaders/common/quad_vertex.wgsl"),
        fragment_source: include_str!("../../shaders/attention/dotprod.wgsl"),
        defines: &[
            ("HEAD_DIM", head_dim.to_string()),
            ("KEY_LEN", key_len.to_string()),
            ("BATCH_SIZE", batch_size.to_string()),
        ],
        vertex_layout: gfx::quad_vertex_layout(),
        color_formats: &color_formats,
        bind_group_layout_entries: &bind_group_layout_entries,
        blend_accumulate: false,
        stencil_test: None,
    };
    let program = ctx.programs.get_or_compile(ctx.gpu, &descriptor)?;

    let uniforms = DotProdUniforms {
        head_dim,
        key_len,
        batch_size,
        _pad: 0,
    };
    let uniform_buffer = gfx::create_uniform(&ctx.gpu.device, &format!("{}-uniforms", label), bytemuck::bytes_of(&uniforms));

    let quad = ctx.geometry.unit_quad(&ctx.gpu.device);

    let entries = [
        wgpu::BindGroupEntry {
            binding: 0,
            resource: wgpu::BindingResource::Sampler(&q_tex.sampler),
        },
        wgpu::BindGroupEntry {
            binding: 1,
            resource: wgpu::BindingResource::TextureView(&q_tex.view),
        },
        wgpu::BindGroupEntry {
            binding: 2,
            resource: wgpu::BindingResource::TextureView(&k_tex.view),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_token_query_selects_batched_mode() {
        assert_eq!(select_mode(4, 8, 4), DotProductMode::Batched { batch_size: 4 });
    }

    #[test]
    fn single_token_query_selects_single_mode() {
        assert_eq!(select_mode(1, 8, 4), DotProductMode::Single);
    }
}
