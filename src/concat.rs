//! Channel-axis concatenation of shallow tensors (§4.7): a fast path that relabels texture lists
//! when every port's channel count is a multiple of 4, and a slow path that renders consolidated
//! tiles otherwise.

use crate::error::{Error, Result};
use crate::gfx::{self, Framebuffer, ProgramDescriptor};
use crate::layer::base::{Activation, DispatchContext, Layer, LayerBase, LayerFlags};
use crate::pool::PoolKey;
use crate::tensor::{BufferSpec, ElementType, TensorFormat, Usage};

/// One of the twelve specialised consolidation shaders, indexed by how many input textures a
/// single output texel's worth of work consumes, how many components are carried over from the
/// first of those textures, and how many total components the output texel packs (§4.7).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConsolidationKey {
    pub consumed_textures: u32,
    pub shift_in_4: u32,
    pub packed_components: u32,
}

pub struct ConcatLayer {
    base: LayerBase,
    width: u32,
    height: u32,
    element_type: ElementType,
    port_channels: Vec<u32>,
    /// Shared activation across every port, or `None` if every port carries no activation.
    /// Mixed activations are rejected at construction (§4.7).
    shared_activation: Activation,
}

impl ConcatLayer {
    pub fn new(
        number: u32,
        name: impl Into<String>,
        width: u32,
        height: u32,
        element_type: ElementType,
        port_channels: Vec<u32>,
        port_activations: &[Activation],
    ) -> Result<Self> {
        if port_channels.is_empty() {
            return Err(Error::invalid_builder("concatenation requires at least one port"));
        }
        let first = port_activations.first().copied().unwrap_or(Activation::None);
        if port_activations.iter().any(|a| *a != first) {
            return Err(Error::invalid_builder(
                "concatenation requires all inputs to share one activation, or none",
            ));
        }

        let input_ports = port_channels.len() as u32;
        Ok(ConcatLayer {
            base: LayerBase::new(
                number,
                name,
                input_ports,
                1,
                LayerFlags {
                    activation: first,
                    residual_input: false,
                    post_batchnorm: false,
                },
            ),
            width,
            height,
            element_type,
            port_channels,
            shared_activation: first,
        })
    }

    /// `true` when every port's channel count is a multiple of 4: the output texture list is
    /// just the concatenation of the inputs' texture lists, no render (§4.7 fast path).
    pub fn is_fast_path(&self) -> bool {
        self.port_channels.iter().all(|c| c % 4 == 0)
    }

    pub fn total_channels(&self) -> u32 {
        self.port_channels.iter().sum()
    }

    /// Run the fast path: relabel the input texture handles as the output handle list, in port
    /// order, with no draw call.
    pub fn run_fast_path(&self, input_textures: &[PoolKey]) -> Vec<PoolKey> {
        debug_assert!(self.is_fast_path());
        input_textures.to_vec()
    }

    /// Valid (non-padding) channel count of every input tile, in the same flattened
    /// port-then-tile order `setup` claims `base.input_buffers` in.
    fn tile_valid_counts(&self) -> Vec<u32> {
        let mut counts = Vec::new();
        for &channels in &self.port_channels {
            let tiles = channels.div_ceil(4).max(1);
            let mut remaining = channels;
            for _ in 0..tiles {
                counts.push(remaining.min(4).max(1));
                remaining = remaining.saturating_sub(4);
            }
        }
        counts
    }

    /// Consolidation shader specialisation for a draw whose leading `shift_in_4` output
    /// components come from the first bound texture, the rest from the second (§4.7).
    fn consolidation_key(&self, shift_in_4: u32, consumed_textures: u32) -> ConsolidationKey {
        ConsolidationKey {
            consumed_textures,
            shift_in_4,
            packed_components: 4,
        }
    }

    /// Walk the flattened input tile sequence, repacking it into 4-channel-aligned output
    /// tiles wherever a port boundary falls mid-tile. Each output tile draws from at most two
    /// input tiles, matching `consolidate.wgsl`'s two bound source textures; a boundary that
    /// would need a third (several sub-4-channel ports landing in one output tile) is not
    /// representable by this shader and is left as a follow-on (DESIGN.md).
    pub fn run_slow_path(&mut self, ctx: &mut DispatchContext<'_>) -> Result<()> {
        self.base.require_valid()?;
        debug_assert!(!self.is_fast_path());

        let valid_counts = self.tile_valid_counts();
        let out_tiles = self.base.output_buffers.len();

        let bind_group_layout_entries = [
            gfx::sampler_entry(0),
            gfx::texture_entry(1),
            gfx::texture_entry(2),
        ];
        let color_formats = [Some(wgpu::ColorTargetState {
            format: self.element_type.rgba_texture_format(),
            blend: None,
            write_mask: wgpu::ColorWrites::ALL,
        })];

        let mut seg = 0usize;
        let mut seg_used = 0u32;

        for out_tile in 0..out_tiles {
            while seg < valid_counts.len() && seg_used >= valid_counts[seg] {
                seg += 1;
                seg_used = 0;
            }
            if seg >= valid_counts.len() {
                break;
            }
            let remaining = valid_counts[seg] - seg_used;

            let (a_index, b_index, shift_in_4, consumed_textures) = if remaining >= 4 {
                let a = self.base.input_buffers[seg];
                seg_used += 4;
                (a, a, 0u32, 1u32)
            } else {
                let a = self.base.input_buffers[seg];
                let shift = remaining;
                seg += 1;
                seg_used = 0;
                if seg < valid_counts.len() {
                    let need = 4 - shift;
                    let b = self.base.input_buffers[seg];
                    seg_used = need.min(valid_counts[seg]);
                    (a, b, shift, 2u32)
                } else {
                    (a, a, 0u32, 1u32)
                }
            };

            let key = self.consolidation_key(shift_in_4, consumed_textures);
            let descriptor = ProgramDescriptor {
                label: &self.base.name,
                vertex_source: include_str!("../shaders/common/quad_vertex.wgsl"),
                fragment_source: include_str!("../shaders/concat/consolidate.wgsl"),
                defines: &[
                    ("CONSUMED_TEXTURES", key.consumed_textures.to_string()),
                    ("SHIFT_IN_4", key.shift_in_4.to_string()),
                    ("PACKED_COMPONENTS", key.packed_components.to_string()),
                ],
                vertex_layout: gfx::quad_vertex_layout(),
                color_formats: &color_formats,
                bind_group_layout_entries: &bind_group_layout_entries,
                blend_accumulate: false,
                stencil_test: None,
            };
            let program = ctx.programs.get_or_compile(ctx.gpu, &descriptor)?;

            let a_tex = ctx.pool.texture(a_index)?;
            let b_tex = ctx.pool.texture(b_index)?;
            let quad = ctx.geometry.unit_quad(&ctx.gpu.device);

            let entries = [
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Sampler(&a_tex.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&a_tex.view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&b_tex.view),
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
                    framebuffer: &self.base.framebuffers[out_tile],
                    clear: true,
                    stencil_reference: 0,
                },
            )?;
        }

        Ok(())
    }
}

impl Layer for ConcatLayer {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn input_specs(&self) -> Vec<BufferSpec> {
        self.port_channels
            .iter()
            .enumerate()
            .map(|(port, &channels)| {
                BufferSpec::new(
                    self.width,
                    self.height,
                    channels,
                    self.element_type,
                    Usage::ConcatSource,
                    TensorFormat::Shallow,
                )
                .with_port(port as u32)
            })
            .collect()
    }

    fn output_specs(&self) -> Vec<BufferSpec> {
        let mut spec = BufferSpec::new(
            self.width,
            self.height,
            self.total_channels(),
            self.element_type,
            Usage::ConcatDest,
            TensorFormat::Shallow,
        );
        if self.is_fast_path() {
            spec = spec.with_pass_through(true);
        }
        vec![spec]
    }

    fn setup(&mut self, ctx: &mut DispatchContext<'_>) -> Result<()> {
        for &port_channels in &self.port_channels {
            let tiles = port_channels.div_ceil(4).max(1);
            for tile in 0..tiles {
                let channels = port_channels.saturating_sub(tile * 4).min(4).max(1);
                let spec = BufferSpec::new(
                    self.width,
                    self.height,
                    channels,
                    self.element_type,
                    Usage::ConcatSource,
                    TensorFormat::Shallow,
                )
                .with_channel_tile_index(tile);
                let key = ctx.pool.claim(ctx.gpu, &spec)?;
                self.base.input_buffers.push(key);
            }
        }

        if self.is_fast_path() {
            self.base.output_buffers = self.base.input_buffers.clone();
        } else {
            let total = self.total_channels();
            let out_tiles = total.div_ceil(4).max(1);
            for tile in 0..out_tiles {
                let channels = total.saturating_sub(tile * 4).min(4).max(1);
                let spec = BufferSpec::new(
                    self.width,
                    self.height,
                    channels,
                    self.element_type,
                    Usage::ConcatDest,
                    TensorFormat::Shallow,
                )
                .with_channel_tile_index(tile);
                let key = ctx.pool.claim(ctx.gpu, &spec)?;
                let texture = ctx.pool.texture(key)?.clone();
                self.base.framebuffers.push(Framebuffer::new(vec![texture]));
                self.base.output_buffers.push(key);
            }
        }

        self.base.mark_valid();
        Ok(())
    }

    fn forward(&mut self, ctx: &mut DispatchContext<'_>, _sequence_no: u64) -> Result<()> {
        self.base.require_valid()?;
        if self.is_fast_path() {
            Ok(())
        } else {
            self.run_slow_path(ctx)
        }
    }

    fn cleanup(&mut self, ctx: &mut DispatchContext<'_>) {
        // Fast path's output_buffers alias input_buffers; release_buffers releasing the same
        // key twice is harmless (release is idempotent).
        self.base.release_buffers(ctx.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_multiples_of_four_take_fast_path() {
        let layer = ConcatLayer::new(
            0, "concat", 8, 8, ElementType::Float16, vec![4, 4, 12], &[Activation::None; 3],
        )
        .unwrap();
        assert!(layer.is_fast_path());
        assert_eq!(layer.total_channels(), 20);
    }

    #[test]
    fn non_multiple_of_four_takes_slow_path() {
        let layer = ConcatLayer::new(
            0, "concat", 8, 8, ElementType::Float16, vec![3, 5, 8], &[Activation::None; 3],
        )
        .unwrap();
        assert!(!layer.is_fast_path());
        assert_eq!(layer.total_channels(), 16);
    }

    #[test]
    fn mixed_activations_are_rejected() {
        let result = ConcatLayer::new(
            0,
            "concat",
            8,
            8,
            ElementType::Float16,
            vec![4, 4],
            &[Activation::None, Activation::Relu],
        );
        assert!(result.is_err());
    }
}
