//! Transpose-convolution dispatcher (§4.6): a 2x upsampling transpose convolution executed as
//! four stencil-stratified passes into the same output texture, avoiding a zero-padding upsample
//! pre-pass.

use crate::error::Result;
use crate::gfx::{
    self, Framebuffer, Gpu, ProgramDescriptor, StencilTest, TensorTexture, TextureDescriptor,
};
use crate::layer::base::{Activation, DispatchContext, Layer, LayerBase, LayerFlags};
use crate::tensor::{BufferSpec, ElementType, Interpolation, TensorFormat, Usage};

/// Per-draw uniform matching `conv/transpose.wgsl`'s `Uniforms` struct exactly.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct TransposeUniforms {
    bias: [f32; 4],
    apply_bias_and_activation: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

/// One of the four `(2x2)`-phase strata an 8-bit stencil attachment divides a transpose-conv
/// output into. `tap_count` is `ceil(k/2)^2` for stratum 0 and strictly fewer for the rest
/// (§4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stratum {
    pub index: u32,
    pub tap_count: u32,
    pub tap_stride: u32,
}

/// Compute the four strata's tap counts for a given kernel size.
pub fn strata_for_kernel(kernel_size: u32) -> [Stratum; 4] {
    let base = (kernel_size as f32 / 2.0).ceil() as u32;
    let base_taps = base * base;
    [
        Stratum { index: 0, tap_count: base_taps, tap_stride: base },
        Stratum { index: 1, tap_count: (base_taps / 2).max(1), tap_stride: base },
        Stratum { index: 2, tap_count: (base_taps / 2).max(1), tap_stride: base },
        Stratum { index: 3, tap_count: (base_taps / 4).max(1), tap_stride: base },
    ]
}

pub struct TransposeConvLayer {
    base: LayerBase,
    width: u32,
    height: u32,
    in_channels: u32,
    out_channels: u32,
    element_type: ElementType,
    kernel_size: u32,
    stencil: Option<TensorTexture>,
}

impl TransposeConvLayer {
    pub fn new(
        number: u32,
        name: impl Into<String>,
        width: u32,
        height: u32,
        in_channels: u32,
        out_channels: u32,
        element_type: ElementType,
        kernel_size: u32,
        flags: LayerFlags,
    ) -> Self {
        TransposeConvLayer {
            base: LayerBase::new(number, name, 1, 1, flags),
            width,
            height,
            in_channels,
            out_channels,
            element_type,
            kernel_size,
            stencil: None,
        }
    }

    /// Populate the stencil attachment once at setup (§4.6: "the stencil is populated once at
    /// setup"). The output extent is double the input since this is a 2x transpose convolution.
    fn allocate_stencil(&mut self, gpu: &Gpu) {
        let descriptor = TextureDescriptor::for_stencil(self.width * 2, self.height * 2);
        self.stencil = Some(TensorTexture::create(
            &gpu.device,
            descriptor,
            Interpolation::Nearest,
            Some("transpose-conv-stencil"),
        ));
    }

    /// Write the 2x2-phase checkerboard into the stencil attachment: one full-screen draw per
    /// phase, each discarding three of every four fragments, stamping the surviving quarter with
    /// `stencil = phase` via an always-pass, always-replace test.
    fn populate_stencil(&self, ctx: &mut DispatchContext<'_>) -> Result<()> {
        let stencil = self
            .stencil
            .as_ref()
            .expect("populate_stencil called before allocate_stencil");
        let framebuffer = Framebuffer::new(Vec::new()).with_stencil(stencil.clone());

        let bind_group_layout_entries = [gfx::uniform_entry(0)];
        let descriptor = ProgramDescriptor {
            label: "transpose-conv-stencil-populate",
            vertex_source: include_str!("../../shaders/common/quad_vertex.wgsl"),
            fragment_source: include_str!("../../shaders/conv/stencil_populate.wgsl"),
            defines: &[],
            vertex_layout: gfx::quad_vertex_layout(),
            color_formats: &[],
            bind_group_layout_entries: &bind_group_layout_entries,
            blend_accumulate: false,
            stencil_test: Some(StencilTest {
                compare: wgpu::CompareFunction::Always,
                pass_op: wgpu::StencilOperation::Replace,
            }),
        };
        let program = ctx.programs.get_or_compile(ctx.gpu, &descriptor)?;
        let quad = ctx.geometry.unit_quad(&ctx.gpu.device);

        for phase in 0..4u32 {
            let uniforms = [phase, 0u32, 0u32, 0u32];
            let uniform_buffer = gfx::create_uniform(
                &ctx.gpu.device,
                "transpose-conv-stencil-phase",
                bytemuck::cast_slice(&uniforms),
            );
            let entries = [wgpu::BindGroupEntry {
                binding: 0,
                resource: uniform_buffer.as_entire_binding(),
            }];
            gfx::draw(
                ctx.gpu,
                &gfx::DrawCall {
                    label: "transpose-conv-stencil-populate",
                    program: &program,
                    bind_group_entries: &entries,
                    vertex_buffer: quad,
                    vertex_range: 0..6,
                    framebuffer: &framebuffer,
                    clear: phase == 0,
                    stencil_reference: phase,
                },
            )?;
        }
        Ok(())
    }

    fn activation_define(&self) -> &'static str {
        match self.base.flags.activation {
            Activation::None => "act_none",
            Activation::Relu | Activation::LeakyRelu | Activation::Clip => "act_relu",
        }
    }

    /// Run the four gated stratum passes of §4.6. Every pixel of the doubled output belongs to
    /// exactly one phase, so each pass writes disjoint texels directly (no blending needed); the
    /// first pass clears the color attachment to zero before the stencil test gates its quarter.
    pub fn run(&mut self, ctx: &mut DispatchContext<'_>) -> Result<()> {
        self.base.require_valid()?;
        let strata = strata_for_kernel(self.kernel_size);
        let activation_define = self.activation_define();

        let bind_group_layout_entries = [
            gfx::sampler_entry(0),
            gfx::texture_entry(1),
            gfx::storage_entry(2),
            gfx::uniform_entry(3),
        ];
        let color_formats = [Some(wgpu::ColorTargetState {
            format: self.element_type.rgba_texture_format(),
            blend: None,
            write_mask: wgpu::ColorWrites::ALL,
        })];

        for stratum in strata {
            let is_final = stratum.index == 3;
            let descriptor = ProgramDescriptor {
                label: &self.base.name,
                vertex_source: include_str!("../../shaders/common/quad_vertex.wgsl"),
                fragment_source: include_str!("../../shaders/conv/transpose.wgsl"),
                defines: &[
                    ("STRATUM_TAPS", stratum.tap_count.to_string()),
                    ("STRATUM_STRIDE", stratum.tap_stride.to_string()),
                    ("ACTIVATION_KIND", activation_define.to_string()),
                ],
                vertex_layout: gfx::quad_vertex_layout(),
                color_formats: &color_formats,
                bind_group_layout_entries: &bind_group_layout_entries,
                blend_accumulate: false,
                stencil_test: Some(StencilTest {
                    compare: wgpu::CompareFunction::Equal,
                    pass_op: wgpu::StencilOperation::Keep,
                }),
            };
            let program = ctx.programs.get_or_compile(ctx.gpu, &descriptor)?;

            let input_tex = ctx.pool.texture(self.base.input_buffers[0])?;
            let tap_count = stratum.tap_count as usize;
            let weights = vec![0.0f32; tap_count.max(1)];
            let weight_buffer = gfx::create_storage(
                &ctx.gpu.device,
                &format!("{}-weights", self.base.name),
                bytemuck::cast_slice(&weights),
            );

            let uniforms = TransposeUniforms {
                bias: [0.0; 4],
                apply_bias_and_activation: is_final as u32,
                _pad0: 0,
                _pad1: 0,
                _pad2: 0,
            };
            let uniform_buffer = gfx::create_uniform(
                &ctx.gpu.device,
                &format!("{}-uniforms", self.base.name),
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
                    resource: weight_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: uniform_buffer.as_entire_binding(),
                },
            ];

            gfx::draw(
                ctx.gpu,
                &gfx::DrawCall {
                    label: &self.base.name,
                    program: &program,
                    bind_group_entries: &entries,
                    vertex_buffer: quad,
                    vertex_range: 0..6,
                    framebuffer: &self.base.framebuffers[0],
                    clear: stratum.index == 0,
                    stencil_reference: stratum.index,
                },
            )?;
        }
        Ok(())
    }
}

impl Layer for TransposeConvLayer {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn input_specs(&self) -> Vec<BufferSpec> {
        vec![BufferSpec::new(
            self.width,
            self.height,
            self.in_channels,
            self.element_type,
            Usage::FunctionSource,
            TensorFormat::Shallow,
        )]
    }

    fn output_specs(&self) -> Vec<BufferSpec> {
        vec![BufferSpec::new(
            self.width * 2,
            self.height * 2,
            self.out_channels,
            self.element_type,
            Usage::FunctionDest,
            TensorFormat::Shallow,
        )]
    }

    fn setup(&mut self, ctx: &mut DispatchContext<'_>) -> Result<()> {
        let input_spec = BufferSpec::new(
            self.width,
            self.height,
            self.in_channels.min(4).max(1),
            self.element_type,
            Usage::FunctionSource,
            TensorFormat::Shallow,
        );
        let input_key = ctx.pool.claim(ctx.gpu, &input_spec)?;
        self.base.input_buffers.push(input_key);

        let output_spec = BufferSpec::new(
            self.width * 2,
            self.height * 2,
            self.out_channels.min(4).max(1),
            self.element_type,
            Usage::FunctionDest,
            TensorFormat::Shallow,
        );
        let output_key = ctx.pool.claim(ctx.gpu, &output_spec)?;
        let output_texture = ctx.pool.texture(output_key)?.clone();

        self.allocate_stencil(ctx.gpu);
        let stencil = self.stencil.clone().expect("just allocated");
        self.base
            .framebuffers
            .push(Framebuffer::new(vec![output_texture]).with_stencil(stencil));
        self.base.output_buffers.push(output_key);

        self.populate_stencil(ctx)?;

        self.base.mark_valid();
        Ok(())
    }

    fn forward(&mut self, ctx: &mut DispatchContext<'_>, _sequence_no: u64) -> Result<()> {
        self.base.require_valid()?;
        self.run(ctx)
    }

    fn cleanup(&mut self, ctx: &mut DispatchContext<'_>) {
        self.stencil = None;
        self.base.release_buffers(ctx.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stratum_zero_has_most_taps() {
        let strata = strata_for_kernel(3);
        assert!(strata[0].tap_count >= strata[1].tap_count);
        assert!(strata[0].tap_count >= strata[2].tap_count);
        assert!(strata[0].tap_count >= strata[3].tap_count);
    }

    #[test]
    fn output_extent_is_doubled() {
        let layer = TransposeConvLayer::new(
            0, "tconv", 16, 16, 4, 4, ElementType::Float16, 3, LayerFlags::default(),
        );
        let specs = layer.output_specs();
        assert_eq!(specs[0].width, 32);
        assert_eq!(specs[0].height, 32);
    }
}
