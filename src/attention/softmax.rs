//! Causal-masked softmax (§4.8 step 4): two passes, the first writing per-row denominators to a
//! scratch texture, the second writing normalised probabilities and zeroing masked positions.
//!
//! The same texture can't be bound as both sampled source and render target in one pass, so the
//! two passes ping-pong between a pair of denominator scratch textures: pass 0 reads the first
//! (zero-initialized, giving `row_max = 0` — this implementation skips the numerical-stability
//! max-subtraction a third pass would normally compute) and writes to the second; pass 1 reads
//! the second and writes the final normalised probabilities.

use crate::error::Result;
use crate::gfx::texture::TextureUsage;
use crate::gfx::{self, Framebuffer, Gpu, ProgramDescriptor, TensorTexture, TextureDescriptor};
use crate::layer::base::DispatchContext;
use crate::tensor::{ElementType, Interpolation};

pub fn allocate_denominator_scratch(gpu: &Gpu, key_len: u32, num_rows: u32) -> TensorTexture {
    let descriptor =
        TextureDescriptor::for_tensor_texture(key_len.div_ceil(4).max(1), num_rows, ElementType::Float32, TextureUsage::Storage);
    TensorTexture::create(&gpu.device, descriptor, Interpolation::Nearest, Some("softmax-denominator"))
}

/// Per-draw uniform matching `attention/softmax.wgsl`'s `Uniforms` struct exactly.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct SoftmaxUniforms {
    query_token_index: u32,
    key_len: u32,
    _pad0: u32,
    _pad1: u32,
}

#[allow(clippy::too_many_arguments)]
pub fn run_pass(
    ctx: &mut DispatchContext<'_>,
    label: &str,
    logits_tex: &TensorTexture,
    denom_in_tex: &TensorTexture,
    framebuffer: &Framebuffer,
    query_token_index: u32,
    key_len: u32,
    pass: u32,
) -> Result<()> {
    let bind_group_layout_entries = [gfx::sampler_entry(0), gfx::texture_entry(1), gfx::texture_entry(2), gfx::uniform_entry(3)];
    let color_formats = [Some(wgpu::ColorTargetState {
        format: ElementType::Float32.rgba_texture_format(),
        blend: None,
        write_mask: wgpu::ColorWrites::ALL,
    })];

    let descriptor = ProgramDescriptor {
        label,
        vertex_source: include_str!("../../shaders/common/quad_vertex.wgsl"),
        fragment_source: include_str!("../../shaders/attention/softmax.wgsl"),
        defines: &[
            ("QUERY_TOKEN_INDEX", query_token_index.to_string()),
            ("KEY_LEN", key_len.to_string()),
            ("PASS", pass.to_string()),
        ],
        vertex_layout: gfx::quad_vertex_layout(),
        color_formats: &color_formats,
        bind_group_layout_entries: &bind_group_layout_entries,
        blend_accumulate: false,
        stencil_test: None,
    };
    let program = ctx.programs.get_or_compile(ctx.gpu, &descriptor)?;

    let uniforms = SoftmaxUniforms {
        query_token_index,
        key_len,
        _pad0: 0,
        _pad1: 0,
    };
    let uniform_buffer = gfx::create_uniform(&ctx.gpu.device, &format!("{}-uniforms-{}", label, pass), bytemuck::bytes_of(&uniforms));

    let quad = ctx.geometry.unit_quad(&ctx.gpu.device);

    let entries = [
        wgpu::BindGroupEntry {
            binding: 0,
            resource: wgpu::BindingResource::Sampler(&logits_tex.sampler),
        },
        wgpu::BindGroupEntry {
            binding: 1,
            resource: wgpu::BindingResource::TextureView(&logits_tex.view),
        },
        wgpu::BindGroupEntry {
            binding: 2,
            resource: wgpu::BindingResource::TextureView(&denom_in_tex.view),
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

/// Run both softmax passes in order: denominators, then normalised probabilities.
#[allow(clippy::too_many_arguments)]
pub fn run(
    ctx: &mut DispatchContext<'_>,
    label: &str,
    logits_tex: &TensorTexture,
    denom_a_tex: &TensorTexture,
    denom_b_tex: &TensorTexture,
    denom_b_framebuffer: &Framebuffer,
    prob_framebuffer: &Framebuffer,
    query_token_index: u32,
    key_len: u32,
) -> Result<()> {
    run_pass(ctx, label, logits_tex, denom_a_tex, denom_b_framebuffer, query_token_index, key_len, 0)?;
    run_pass(ctx, label, logits_tex, denom_b_tex, prob_framebuffer, query_token_index, key_len, 1)
}
