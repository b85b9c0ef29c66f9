//! Function-layer render loop (§4.3): unary and binary per-element operations and simple
//! reductions on shallow or sequence tensors, dispatched in batches of up to `M` output textures
//! per pass where `M` is the device's capped draw-buffer count.

use crate::error::Result;
use crate::gfx::{self, Framebuffer, ProgramDescriptor};
use crate::layer::base::{DispatchContext, Layer, LayerBase, LayerFlags};
use crate::tensor::{BufferSpec, ElementType, TensorFormat, Usage};

/// Which per-element function a [`FunctionLayer`] evaluates. Unary ops consume one input texture
/// per output texture; `Add`/`Mul` consume two (§4.3 step 3: "typically `m`, or `2m` for binary
/// layers").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionOp {
    Relu,
    LeakyRelu,
    Clip,
    Identity,
    Add,
    Mul,
}

impl FunctionOp {
    fn is_binary(self) -> bool {
        matches!(self, FunctionOp::Add | FunctionOp::Mul)
    }

    fn shader_source(self) -> &'static str {
        if self.is_binary() {
            include_str!("../../shaders/function/binary.wgsl")
        } else {
            include_str!("../../shaders/function/unary.wgsl")
        }
    }

    fn op_define(self) -> (&'static str, &'static str) {
        match self {
            FunctionOp::Relu => ("OP_KIND", "op_relu"),
            FunctionOp::LeakyRelu => ("OP_KIND", "op_leaky_relu"),
            FunctionOp::Clip => ("OP_KIND", "op_clip"),
            FunctionOp::Identity => ("OP_KIND", "op_identity"),
            FunctionOp::Add => ("BINARY_OP", "op_add"),
            FunctionOp::Mul => ("BINARY_OP", "op_mul"),
        }
    }
}

/// A unary or binary per-element function layer.
pub struct FunctionLayer {
    base: LayerBase,
    op: FunctionOp,
    width: u32,
    height: u32,
    channels: u32,
    element_type: ElementType,
}

impl FunctionLayer {
    pub fn new(
        number: u32,
        name: impl Into<String>,
        op: FunctionOp,
        width: u32,
        height: u32,
        channels: u32,
        element_type: ElementType,
        flags: LayerFlags,
    ) -> Self {
        let input_ports = if op.is_binary() { 2 } else { 1 };
        FunctionLayer {
            base: LayerBase::new(number, name, input_ports, 1, flags),
            op,
            width,
            height,
            channels,
            element_type,
        }
    }

    /// Number of 4-channel output tiles this layer covers.
    fn total_tiles(&self) -> u32 {
        self.channels.div_ceil(4).max(1)
    }

    /// Channel count carried by the `tile`-th 4-channel texture (the last tile may be partial).
    fn channels_in_tile(&self, tile: u32) -> u32 {
        self.channels.saturating_sub(tile * 4).min(4).max(1)
    }

    fn input_spec(&self, port: u32, tile: u32) -> BufferSpec {
        BufferSpec::new(
            self.width,
            self.height,
            self.channels_in_tile(tile),
            self.element_type,
            Usage::FunctionSource,
            TensorFormat::Shallow,
        )
        .with_port(port)
        .with_channel_tile_index(tile)
    }

    fn output_spec(&self, tile: u32) -> BufferSpec {
        BufferSpec::new(
            self.width,
            self.height,
            self.channels_in_tile(tile),
            self.element_type,
            Usage::FunctionDest,
            TensorFormat::Shallow,
        )
        .with_channel_tile_index(tile)
    }

    /// Run the render loop described in §4.3: one draw per 4-channel output tile. The unary and
    /// binary shaders each produce exactly one `out_0` color target, so a tile's draw is bound to
    /// its own input texture(s) and writes its own output texture directly; the `NUM_LANES` define
    /// records the batch width for shader-variant bookkeeping without widening the draw itself,
    /// since there is no second render target to widen it onto.
    pub fn run(&mut self, ctx: &mut DispatchContext<'_>) -> Result<()> {
        self.base.require_valid()?;

        let total_tiles = self.total_tiles();
        let is_binary = self.op.is_binary();
        let (define_name, define_value) = self.op.op_define();
        let vertex_source = include_str!("../../shaders/common/quad_vertex.wgsl");

        let bind_group_layout_entries: Vec<wgpu::BindGroupLayoutEntry> = if is_binary {
            vec![
                gfx::sampler_entry(0),
                gfx::texture_entry(1),
                gfx::texture_entry(2),
            ]
        } else {
            vec![gfx::sampler_entry(0), gfx::texture_entry(1)]
        };

        let color_formats = [Some(wgpu::ColorTargetState {
            format: self.element_type.rgba_texture_format(),
            blend: None,
            write_mask: wgpu::ColorWrites::ALL,
        })];

        let descriptor = ProgramDescriptor {
            label: &self.base.name,
            vertex_source,
            fragment_source: self.op.shader_source(),
            defines: &[
                ("NUM_LANES", "1".to_string()),
                (define_name, define_value.to_string()),
            ],
            vertex_layout: gfx::quad_vertex_layout(),
            color_formats: &color_formats,
            bind_group_layout_entries: &bind_group_layout_entries,
            blend_accumulate: false,
            stencil_test: None,
        };
        let program = ctx.programs.get_or_compile(ctx.gpu, &descriptor)?;
        let quad = ctx.geometry.unit_quad(&ctx.gpu.device);

        for tile in 0..total_tiles {
            let input_a = ctx.pool.texture(self.base.input_buffers[tile as usize])?;
            let sampler = &input_a.sampler;
            let entries: Vec<wgpu::BindGroupEntry> = if is_binary {
                let offset = total_tiles as usize;
                let input_b = ctx.pool.texture(self.base.input_buffers[offset + tile as usize])?;
                vec![
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::Sampler(sampler),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(&input_a.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(&input_b.view),
                    },
                ]
            } else {
                vec![
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::Sampler(sampler),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(&input_a.view),
                    },
                ]
            };

            gfx::draw(
                ctx.gpu,
                &gfx::DrawCall {
                    label: &self.base.name,
                    program: &program,
                    bind_group_entries: &entries,
                    vertex_buffer: quad,
                    vertex_range: 0..6,
                    framebuffer: &self.base.framebuffers[tile as usize],
                    clear: true,
                    stencil_reference: 0,
                },
            )?;
        }

        Ok(())
    }
}

impl Layer for FunctionLayer {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn input_specs(&self) -> Vec<BufferSpec> {
        let usage = Usage::FunctionSource;
        (0..self.base.input_ports)
            .map(|port| {
                BufferSpec::new(
                    self.width,
                    self.height,
                    self.channels,
                    self.element_type,
                    usage,
                    TensorFormat::Shallow,
                )
                .with_port(port)
            })
            .collect()
    }

    fn output_specs(&self) -> Vec<BufferSpec> {
        vec![BufferSpec::new(
            self.width,
            self.height,
            self.channels,
            self.element_type,
            Usage::FunctionDest,
            TensorFormat::Shallow,
        )]
    }

    fn setup(&mut self, ctx: &mut DispatchContext<'_>) -> Result<()> {
        let total_tiles = self.total_tiles();
        let input_ports = self.base.input_ports;

        for port in 0..input_ports {
            for tile in 0..total_tiles {
                let spec = self.input_spec(port, tile);
                let key = ctx.pool.claim(ctx.gpu, &spec)?;
                self.base.input_buffers.push(key);
            }
        }

        for tile in 0..total_tiles {
            let spec = self.output_spec(tile);
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

    #[test]
    fn binary_op_declares_two_input_ports() {
        let layer = FunctionLayer::new(
            0,
            "add",
            FunctionOp::Add,
            32,
            32,
            16,
            ElementType::Float16,
            LayerFlags::default(),
        );
        assert_eq!(layer.input_specs().len(), 2);
    }

    #[test]
    fn unary_op_declares_one_input_port() {
        let layer = FunctionLayer::new(
            0,
            "relu",
            FunctionOp::Relu,
            32,
            32,
            16,
            ElementType::Float16,
            LayerFlags::default(),
        );
        assert_eq!(layer.input_specs().len(), 1);
    }
}
