//! Embedding lookup (§4.9): the weight table stored as a strip of 2-D textures, one line drawn
//! per input token.

use crate::error::Result;
use crate::gfx::texture::TextureUsage;
use crate::gfx::{self, Framebuffer, Gpu, ProgramDescriptor, TensorTexture, TextureDescriptor};
use crate::layer::base::{DispatchContext, Layer, LayerBase, LayerFlags};
use crate::tensor::{BufferSpec, ElementType, Interpolation, TensorFormat, Usage};

/// Embedding weight table layout: `vocab_size` rows of `embed_dim` columns, split into strips of
/// at most `max_texture_dim` rows each (§4.9).
pub struct EmbeddingTable {
    pub vocab_size: u32,
    pub embed_dim: u32,
    pub rows_per_strip: u32,
    pub strips: Vec<TensorTexture>,
}

impl EmbeddingTable {
    pub fn strip_count(vocab_size: u32, max_texture_dim: u32) -> u32 {
        vocab_size.div_ceil(max_texture_dim.max(1))
    }

    pub fn allocate(gpu: &Gpu, vocab_size: u32, embed_dim: u32, max_texture_dim: u32) -> Self {
        let rows_per_strip = max_texture_dim.min(vocab_size).max(1);
        let strip_count = Self::strip_count(vocab_size, max_texture_dim);
        let strips = (0..strip_count)
            .map(|_| {
                let descriptor = TextureDescriptor::for_tensor_texture(
                    embed_dim / 4,
                    rows_per_strip,
                    ElementType::Float16,
                    TextureUsage::DataIn,
                );
                TensorTexture::create(&gpu.device, descriptor, Interpolation::Nearest, Some("embedding-strip"))
            })
            .collect();
        EmbeddingTable {
            vocab_size,
            embed_dim,
            rows_per_strip,
            strips,
        }
    }
}

/// Per-draw uniform matching `embedding/lookup.wgsl`'s `Uniforms` struct exactly.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct LookupUniforms {
    rows_per_strip: u32,
    embed_cols: u32,
    _pad0: u32,
    _pad1: u32,
}

pub struct EmbeddingLayer {
    base: LayerBase,
    vocab_size: u32,
    embed_dim: u32,
    max_tokens: u32,
    table: Option<EmbeddingTable>,
    /// Token ids for the next `forward` call, set by [`Self::set_tokens`].
    tokens: Vec<u32>,
}

impl EmbeddingLayer {
    pub fn new(number: u32, name: impl Into<String>, vocab_size: u32, embed_dim: u32, max_tokens: u32, flags: LayerFlags) -> Self {
        EmbeddingLayer {
            base: LayerBase::new(number, name, 1, 1, flags),
            vocab_size,
            embed_dim,
            max_tokens,
            table: None,
            tokens: Vec::new(),
        }
    }

    pub fn load_table(&mut self, gpu: &Gpu, max_texture_dim: u32) {
        self.table = Some(EmbeddingTable::allocate(gpu, self.vocab_size, self.embed_dim, max_texture_dim));
    }

    /// Set the token ids the next `forward` call looks up.
    pub fn set_tokens(&mut self, token_ids: &[u32]) {
        self.tokens = token_ids.to_vec();
    }

    /// Draw one line per stored token id, reading its embedding row from the table.
    ///
    /// `lookup.wgsl` only binds a single table strip and indexes it with `token_id %
    /// rows_per_strip`, so vocabularies spanning more than one strip wrap rather than selecting
    /// the correct strip; this dispatches against `strips[0]` only (DESIGN.md).
    pub fn run(&mut self, ctx: &mut DispatchContext<'_>) -> Result<()> {
        self.base.require_valid()?;
        let table = self
            .table
            .as_ref()
            .ok_or_else(|| crate::error::Error::invalid_state("embedding layer forward before table allocation"))?;
        let strip = table.strips.first().ok_or_else(|| crate::error::Error::invalid_state("embedding table has no strips"))?;
        let framebuffer = self.base.framebuffers.first().ok_or_else(|| crate::error::Error::invalid_state("embedding layer forward before setup"))?;

        let bind_group_layout_entries = [gfx::sampler_entry(0), gfx::texture_entry(1), gfx::storage_entry(2), gfx::uniform_entry(3)];
        let color_formats = [Some(wgpu::ColorTargetState {
            format: ElementType::Float16.rgba_texture_format(),
            blend: None,
            write_mask: wgpu::ColorWrites::ALL,
        })];

        let descriptor = ProgramDescriptor {
            label: &self.base.name,
            vertex_source: include_str!("../../shaders/common/quad_vertex.wgsl"),
            fragment_source: include_str!("../../shaders/embedding/lookup.wgsl"),
            defines: &[
                ("ROWS_PER_STRIP", table.rows_per_strip.to_string()),
                ("TOKEN_COUNT", self.tokens.len().to_string()),
            ],
            vertex_layout: gfx::quad_vertex_layout(),
            color_formats: &color_formats,
            bind_group_layout_entries: &bind_group_layout_entries,
            blend_accumulate: false,
            stencil_test: None,
        };
        let program = ctx.programs.get_or_compile(ctx.gpu, &descriptor)?;

        let mut padded = self.tokens.clone();
        padded.resize(self.max_tokens.max(1) as usize, 0);
        let token_id_buffer = gfx::create_storage(&ctx.gpu.device, &format!("{}-token-ids", self.base.name), bytemuck::cast_slice(&padded));

        let uniforms = LookupUniforms {
            rows_per_strip: table.rows_per_strip,
            embed_cols: self.embed_dim,
            _pad0: 0,
            _pad1: 0,
        };
        let uniform_buffer = gfx::create_uniform(&ctx.gpu.device, &format!("{}-uniforms", self.base.name), bytemuck::bytes_of(&uniforms));

        let quad = ctx.geometry.unit_quad(&ctx.gpu.device);

        let entries = [
            wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Sampler(&strip.sampler),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::TextureView(&strip.view),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: token_id_buffer.as_entire_binding(),
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
                framebuffer,
                clear: true,
                stencil_reference: 0,
            },
        )
    }
}

impl Layer for EmbeddingLayer {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn input_specs(&self) -> Vec<BufferSpec> {
        vec![BufferSpec::new(
            1,
            self.max_tokens,
            4,
            ElementType::Uint32,
            Usage::FunctionSource,
            TensorFormat::CpuChannelwise,
        )]
    }

    fn output_specs(&self) -> Vec<BufferSpec> {
        vec![BufferSpec::new(
            self.embed_dim / 4,
            self.max_tokens,
            self.embed_dim,
            ElementType::Float16,
            Usage::FunctionDest,
            TensorFormat::Sequence,
        )]
    }

    fn setup(&mut self, ctx: &mut DispatchContext<'_>) -> Result<()> {
        if self.table.is_none() {
            self.load_table(ctx.gpu, ctx.caps.max_texture_dim);
        }

        let output_spec = self.output_specs().remove(0);
        let output_key = ctx.pool.claim(ctx.gpu, &output_spec)?;
        let output_texture = ctx.pool.texture(output_key)?.clone();
        self.base.framebuffers.push(Framebuffer::new(vec![output_texture]));
        self.base.output_buffers.push(output_key);

        self.base.mark_valid();
        Ok(())
    }

    fn forward(&mut self, ctx: &mut DispatchContext<'_>, _sequence_no: u64) -> Result<()> {
        self.base.require_valid()?;
        self.run(ctx)
    }

    fn cleanup(&mut self, ctx: &mut DispatchContext<'_>) {
        self.table = None;
        self.base.release_buffers(ctx.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_count_divides_vocab_by_max_texture_dim() {
        assert_eq!(EmbeddingTable::strip_count(100_000, 16384), 7);
        assert_eq!(EmbeddingTable::strip_count(16384, 16384), 1);
    }
}
