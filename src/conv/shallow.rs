//! Shallow 2-D convolution dispatcher (§4.4): one texture per four channels in and out, output
//! passes accumulated via the fixed-function blend unit in additive mode.

use crate::error::{Error, Result};
use crate::gfx::{self, Framebuffer, ProgramDescriptor};
use crate::layer::base::{Activation, DispatchContext, Layer, LayerBase, LayerFlags};
use crate::layer::builder::ConvParams;
use crate::tensor::{BufferSpec, ElementType, TensorFormat, Usage};

/// Per-draw uniform payload matching `conv/shallow.wgsl`'s `Uniforms` struct exactly.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ShallowUniforms {
    bias: [f32; 4],
    bn_scale: [f32; 4],
    bn_bias: [f32; 4],
    is_first_pass: u32,
    is_final_pass: u32,
    apply_residual: u32,
    _pad: u32,
}

/// A shallow-format 2-D convolution layer: ordinary, depthwise, or fractional-stride.
pub struct ShallowConvLayer {
    base: LayerBase,
    width: u32,
    height: u32,
    in_channels: u32,
    out_channels: u32,
    element_type: ElementType,
    conv: ConvParams,
    depthwise: bool,
    /// `< 1.0` reparameterises vertex texture coordinates for upsampling-before-convolution
    /// (§4.4 "Fractional stride"); `1.0` for ordinary stride.
    source_step: f32,
}

impl ShallowConvLayer {
    /// Validate and construct. Rejects the three combinations named in §4.4: group-without-full-
    /// depthwise, 1x1 depthwise, and even kernel sizes.
    pub fn new(
        number: u32,
        name: impl Into<String>,
        width: u32,
        height: u32,
        in_channels: u32,
        out_channels: u32,
        element_type: ElementType,
        conv: ConvParams,
        flags: LayerFlags,
        source_step: f32,
    ) -> Result<Self> {
        if conv.kernel_size % 2 == 0 {
            return Err(Error::invalid_builder(format!(
                "shallow convolution kernel size must be odd, got {}",
                conv.kernel_size
            )));
        }
        let depthwise = conv.group == in_channels && conv.group == out_channels && conv.group > 1;
        if conv.group > 1 && conv.group != in_channels {
            return Err(Error::invalid_builder(
                "group convolution other than full depthwise is not supported",
            ));
        }
        if depthwise && conv.kernel_size == 1 {
            return Err(Error::invalid_builder("1x1 depthwise convolution is degenerate"));
        }

        let name = name.into();
        Ok(ShallowConvLayer {
            base: LayerBase::new(number, name, 1, 1, flags),
            width,
            height,
            in_channels,
            out_channels,
            element_type,
            conv,
            depthwise,
            source_step,
        })
    }

    fn in_tiles(&self) -> u32 {
        self.in_channels.div_ceil(4).max(1)
    }

    fn out_tiles(&self) -> u32 {
        self.out_channels.div_ceil(4).max(1)
    }

    /// Weight array length for this layer's configuration (§4.4): `k*k*4*m*in_tiles` for ordinary
    /// convolution, `k*k*4*out_tiles` when depthwise.
    pub fn weight_len(&self, batch_width: u32) -> u32 {
        let k2 = self.conv.kernel_size * self.conv.kernel_size;
        if self.depthwise {
            k2 * 4 * self.out_tiles()
        } else {
            k2 * 4 * batch_width * self.in_tiles()
        }
    }

    fn activation_define(&self) -> &'static str {
        match self.base.flags.activation {
            Activation::None => "act_none",
            Activation::Relu => "act_relu",
            Activation::LeakyRelu => "act_leaky_relu",
            Activation::Clip => "act_clip",
        }
    }

    /// Run the blending protocol in §4.4: pass 0 clears and writes bias (plus residual if set);
    /// middle passes accumulate one input tile's contribution each via additive blending; the
    /// final pass disables blending and applies batchnorm + activation. The fragment shader
    /// produces one `out_0` color target, so each output tile is its own draw sequence rather than
    /// a batch of `m` tiles sharing one pass (§4.4's `NUM_LANES` records the nominal batch width
    /// the shader was compiled for, fixed at 1 here since there is one render target per draw).
    pub fn run(&mut self, ctx: &mut DispatchContext<'_>) -> Result<()> {
        self.base.require_valid()?;

        let total_out_tiles = self.out_tiles();
        let passes = if self.depthwise { 1 } else { self.in_tiles() };
        let k = self.conv.kernel_size;
        let tap_count = (k * k) as usize;
        let activation_define = self.activation_define();

        let bind_group_layout_entries = [
            gfx::sampler_entry(0),
            gfx::texture_entry(1),
            gfx::uniform_entry(2),
            gfx::storage_entry(3),
        ];
        let color_formats = [Some(wgpu::ColorTargetState {
            format: self.element_type.rgba_texture_format(),
            blend: None,
            write_mask: wgpu::ColorWrites::ALL,
        })];

        for out_tile in 0..total_out_tiles {
            for pass in 0..passes {
                let is_first = pass == 0;
                let is_final = pass == passes - 1;

                let descriptor = ProgramDescriptor {
                    label: &self.base.name,
                    vertex_source: include_str!("../../shaders/common/quad_vertex.wgsl"),
                    fragment_source: include_str!("../../shaders/conv/shallow.wgsl"),
                    defines: &[
                        ("KERNEL_SIZE", k.to_string()),
                        ("NUM_LANES", "1".to_string()),
                        ("ACTIVATION_KIND", activation_define.to_string()),
                    ],
                    vertex_layout: gfx::quad_vertex_layout(),
                    color_formats: &color_formats,
                    bind_group_layout_entries: &bind_group_layout_entries,
                    blend_accumulate: !is_final,
                    stencil_test: None,
                };
                let program = ctx.programs.get_or_compile(ctx.gpu, &descriptor)?;

                let input_tile_index = if self.depthwise { out_tile } else { pass };
                let input_tex = ctx.pool.texture(self.base.input_buffers[input_tile_index as usize])?;

                // Weight data is zero-initialized pending parameter-provider wiring (DESIGN.md).
                let weights = vec![0.0f32; tap_count];
                let weight_buffer = gfx::create_storage(
                    &ctx.gpu.device,
                    &format!("{}-weights", self.base.name),
                    bytemuck::cast_slice(&weights),
                );

                let uniforms = ShallowUniforms {
                    bias: [0.0; 4],
                    bn_scale: [1.0; 4],
                    bn_bias: [0.0; 4],
                    is_first_pass: is_first as u32,
                    is_final_pass: is_final as u32,
                    apply_residual: self.base.flags.residual_input as u32,
                    _pad: 0,
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
                        resource: uniform_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: weight_buffer.as_entire_binding(),
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
                        framebuffer: &self.base.framebuffers[out_tile as usize],
                        clear: is_first,
                        stencil_reference: 0,
                    },
                )?;
            }
        }

        Ok(())
    }
}

impl Layer for ShallowConvLayer {
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
        )
        .with_interpolation(if self.source_step < 1.0 {
            crate::tensor::Interpolation::Linear
        } else {
            crate::tensor::Interpolation::Nearest
        })]
    }

    fn output_specs(&self) -> Vec<BufferSpec> {
        vec![BufferSpec::new(
            self.width,
            self.height,
            self.out_channels,
            self.element_type,
            Usage::FunctionDest,
            TensorFormat::Shallow,
        )]
    }

    fn setup(&mut self, ctx: &mut DispatchContext<'_>) -> Result<()> {
        for tile in 0..self.in_tiles() {
            let channels = self.in_channels.saturating_sub(tile * 4).min(4).max(1);
            let spec = BufferSpec::new(
                self.width,
                self.height,
                channels,
                self.element_type,
                Usage::FunctionSource,
                TensorFormat::Shallow,
            )
            .with_channel_tile_index(tile)
            .with_interpolation(if self.source_step < 1.0 {
                crate::tensor::Interpolation::Linear
            } else {
                crate::tensor::Interpolation::Nearest
            });
            let key = ctx.pool.claim(ctx.gpu, &spec)?;
            self.base.input_buffers.push(key);
        }

        for tile in 0..self.out_tiles() {
            let channels = self.out_channels.saturating_sub(tile * 4).min(4).max(1);
            let spec = BufferSpec::new(
                self.width,
                self.height,
                channels,
                self.element_type,
                Usage::FunctionDest,
                TensorFormat::Shallow,
            )
            .with_channel_tile_index(tile);
            let key = ctx.pool.claim(ctx.gpu, &spec)?;
            let texture = ctx.pool.texture(key)?.clone();
            self.base.framebuffers.push(Framebuffer::new(vec![texture]));
            self.base.output_buffers.push(key);
        }

        self.base.mark_valid();
        Ok(())
    }

    fn forward(&mut self, ctx: &mut DispatchContext<'_>, _sequence_no: u64) -> Result<()> {
        self.base.require_valid()?;
        self.run(ctx)
    }

    fn cleanup(&mut self, ctx: &mut DispatchContext<'_>) {
        self.base.release_buffers(ctx.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(kernel_size: u32, group: u32) -> ConvParams {
        ConvParams {
            kernel_size,
            stride: 1,
            dilation: 1,
            group,
        }
    }

    #[test]
    fn rejects_even_kernel_size() {
        let result = ShallowConvLayer::new(
            0, "conv", 8, 8, 4, 4, ElementType::Float16, params(4, 1), LayerFlags::default(), 1.0,
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_partial_group_convolution() {
        let result = ShallowConvLayer::new(
            0, "conv", 8, 8, 8, 8, ElementType::Float16, params(3, 4), LayerFlags::default(), 1.0,
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_1x1_depthwise() {
        let result = ShallowConvLayer::new(
            0, "conv", 8, 8, 4, 4, ElementType::Float16, params(1, 4), LayerFlags::default(), 1.0,
        );
        assert!(result.is_err());
    }

    #[test]
    fn accepts_ordinary_3x3_convolution() {
        let layer = ShallowConvLayer::new(
            0, "conv", 8, 8, 4, 8, ElementType::Float16, params(3, 1), LayerFlags::default(), 1.0,
        )
        .unwrap();
        assert_eq!(layer.weight_len(2), 3 * 3 * 4 * 2 * 1);
    }

    #[test]
    fn depthwise_weight_layout_degenerates_to_out_tiles() {
        let layer = ShallowConvLayer::new(
            0, "conv", 8, 8, 8, 8, ElementType::Float16, params(3, 8), LayerFlags::default(), 1.0,
        )
        .unwrap();
        assert_eq!(layer.weight_len(1), 3 * 3 * 4 * 2);
    }
}
