//! `MatMulConst` (§4.8 steps 1 and 6): 4-bit quantized constant matrix multiplication used for
//! the Q/K/V and output projections of the attention compound.

use crate::error::Result;
use crate::gfx::{self, Framebuffer, ProgramDescriptor, TensorTexture};
use crate::layer::base::DispatchContext;

/// Whether a `MatMulConst` instance should use the short (more fetches per draw) or long
/// (iterating) shader variant, chosen by row count against a threshold (§4.8: "default 8 with
/// high precision, 16 otherwise").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderVariant {
    Short,
    Long,
}

pub fn select_variant(data_rows: u32, high_precision: bool) -> ShaderVariant {
    let threshold = if high_precision { 8 } else { 16 };
    if data_rows <= threshold {
        ShaderVariant::Short
    } else {
        ShaderVariant::Long
    }
}

/// Per-draw uniform matching `attention/matmul_const.wgsl`'s `Uniforms` struct exactly.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct MatMulUniforms {
    quant_group_size: u32,
    out_cols: u32,
    in_cols: u32,
    _pad: u32,
}

/// A single constant-weight matrix multiplication: `out_cols = in_cols . W` with `W` stored
/// 4-bit-quantized, `quant_group_size` rows per scale/zero pair.
pub struct MatMulConst {
    pub label: String,
    pub in_cols: u32,
    pub out_cols: u32,
    pub quant_group_size: u32,
}

impl MatMulConst {
    pub fn new(label: impl Into<String>, in_cols: u32, out_cols: u32, quant_group_size: u32) -> Self {
        MatMulConst {
            label: label.into(),
            in_cols,
            out_cols,
            quant_group_size,
        }
    }

    pub fn run(
        &self,
        ctx: &mut DispatchContext<'_>,
        input_tex: &TensorTexture,
        framebuffer: &Framebuffer,
        data_rows: u32,
        high_precision: bool,
    ) -> Result<ShaderVariant> {
        let variant = select_variant(data_rows, high_precision);
        let num_iters = self.in_cols * self.out_cols;

        let bind_group_layout_entries = [
            gfx::sampler_entry(0),
            gfx::texture_entry(1),
            gfx::storage_entry(2),
            gfx::storage_entry(3),
            gfx::storage_entry(4),
            gfx::uniform_entry(5),
        ];
        let color_formats = [Some(wgpu::ColorTargetState {
            format: wgpu::TextureFormat::Rgba16Float,
            blend: None,
            write_mask: wgpu::ColorWrites::ALL,
        })];

        let descriptor = ProgramDescriptor {
            label: &self.label,
            vertex_source: include_str!("../../shaders/common/quad_vertex.wgsl"),
            fragment_source: include_str!("../../shaders/attention/matmul_const.wgsl"),
            defines: &[
                ("NUM_ITERS", num_iters.to_string()),
                (
                    "SHORT_VARIANT",
                    if variant == ShaderVariant::Short { "1" } else { "0" }.to_string(),
                ),
            ],
            vertex_layout: gfx::quad_vertex_layout(),
            color_formats: &color_formats,
            bind_group_layout_entries: &bind_group_layout_entries,
            blend_accumulate: false,
            stencil_test: None,
        };
        let program = ctx.programs.get_or_compile(ctx.gpu, &descriptor)?;

        // Weight data is zero-initialized pending parameter-provider wiring (DESIGN.md).
        let packed_words = num_iters.div_ceil(8).max(1) as usize;
        let packed_weights = gfx::create_storage(
            &ctx.gpu.device,
            &format!("{}-weights", self.label),
            bytemuck::cast_slice(&vec![0u32; packed_words]),
        );
        let groups = num_iters.div_ceil(self.quant_group_size.max(1)).max(1) as usize;
        let scales = gfx::create_storage(
            &ctx.gpu.device,
            &format!("{}-scales", self.label),
            bytemuck::cast_slice(&vec![1.0f32; groups]),
        );
        let zeros = gfx::create_storage(
            &ctx.gpu.device,
            &format!("{}-zeros", self.label),
            bytemuck::cast_slice(&vec![0.0f32; groups]),
        );

        let uniforms = MatMulUniforms {
            quant_group_size: self.quant_group_size,
            out_cols: self.out_cols,
            in_cols: self.in_cols,
            _pad: 0,
        };
        let uniform_buffer = gfx::create_uniform(
            &ctx.gpu.device,
            &format!("{}-uniforms", self.label),
            bytemuck::bytes_of(&uniforms),
        );

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
                resource: packed_weights.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: scales.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 4,
                resource: zeros.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 5,
                resource: uniform_buffer.as_entire_binding(),
            },
        ];

        gfx::draw(
            ctx.gpu,
            &gfx::DrawCall {
                label: &self.label,
                program: &program,
                bind_group_entries: &entries,
                vertex_buffer: quad,
                vertex_range: 0..6,
                framebuffer,
                clear: true,
                stencil_reference: 0,
            },
        )?;

        Ok(variant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_precision_threshold_is_eight() {
        assert_eq!(select_variant(8, true), ShaderVariant::Short);
        assert_eq!(select_variant(9, true), ShaderVariant::Long);
    }

    #[test]
    fn low_precision_threshold_is_sixteen() {
        assert_eq!(select_variant(16, false), ShaderVariant::Short);
        assert_eq!(select_variant(17, false), ShaderVariant::Long);
    }
}
