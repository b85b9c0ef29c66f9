//! Causal multi-head attention compound (§4.8): Q/K/V projection, optional rotary encoding,
//! dot product, causal-masked softmax, attention-value multiply, and output projection, with an
//! incremental-decode mode that reuses previously written K/V rows.

pub mod attmul;
pub mod dotprod;
pub mod projection;
pub mod rotary;
pub mod softmax;

use crate::error::Result;
use crate::gfx::texture::TextureUsage;
use crate::gfx::{Framebuffer, TensorTexture, TextureDescriptor};
use crate::layer::base::{DispatchContext, Layer, LayerBase, LayerFlags};
use crate::tensor::{BufferSpec, ElementType, Interpolation, TensorFormat, Usage};

use projection::MatMulConst;
use rotary::RotaryEncoder;

/// Hyperparameters fixed at construction (§4.8).
#[derive(Clone, Copy, Debug)]
pub struct AttentionConfig {
    pub num_heads: u32,
    pub head_dim: u32,
    pub max_seq_len: u32,
    pub quant_group_size: u32,
    pub rotary: bool,
    pub auto_residual: bool,
    pub dp_max_batch: u32,
}

impl AttentionConfig {
    pub fn embed_dim(&self) -> u32 {
        self.num_heads * self.head_dim
    }
}

/// Causal multi-head self-attention over a sequence-format embedding texture.
///
/// Every intermediate stage (Q/K/V projection, rotary encoding, dot product, softmax, Q.K^T
/// scratch) is sized at `max_seq_len` and drawn full-screen each forward call rather than
/// windowed to `data_rows` rows — the same single-full-pass simplification used by the deep and
/// transpose convolution dispatchers (DESIGN.md).
pub struct AttentionLayer {
    base: LayerBase,
    config: AttentionConfig,
    q_proj: MatMulConst,
    k_proj: MatMulConst,
    v_proj: MatMulConst,
    out_proj: MatMulConst,
    rotary: Option<RotaryEncoder>,
    /// Persisted K/V textures across forward calls, enabling incremental decode (§4.8).
    k_cache: Option<TensorTexture>,
    v_cache: Option<TensorTexture>,
    /// Number of tokens already present in the K/V cache; `0` until the first forward call.
    tokens_written: u32,

    q_scratch: Option<TensorTexture>,
    q_rotated: Option<TensorTexture>,
    k_scratch: Option<TensorTexture>,
    logits: Option<TensorTexture>,
    denom_a: Option<TensorTexture>,
    denom_b: Option<TensorTexture>,
    prob: Option<TensorTexture>,
    attmul_out: Option<TensorTexture>,
}

impl AttentionLayer {
    pub fn new(number: u32, name: impl Into<String>, config: AttentionConfig, flags: LayerFlags) -> Self {
        let embed_dim = config.embed_dim();
        let rotary = config
            .rotary
            .then(|| RotaryEncoder::new(config.head_dim, 10000.0));

        AttentionLayer {
            base: LayerBase::new(number, name, 1, 1, flags),
            q_proj: MatMulConst::new("attn-q", embed_dim, embed_dim, config.quant_group_size),
            k_proj: MatMulConst::new("attn-k", embed_dim, embed_dim, config.quant_group_size),
            v_proj: MatMulConst::new("attn-v", embed_dim, embed_dim, config.quant_group_size),
            out_proj: MatMulConst::new("attn-out", embed_dim, embed_dim, config.quant_group_size),
            rotary,
            k_cache: None,
            v_cache: None,
            tokens_written: 0,
            q_scratch: None,
            q_rotated: None,
            k_scratch: None,
            logits: None,
            denom_a: None,
            denom_b: None,
            prob: None,
            attmul_out: None,
            config,
        }
    }

    /// `true` when this forward call is an incremental decode step: a single new query token
    /// appended after at least one prior call (§4.8: "query_len == 1 with token_index > 0").
    pub fn is_incremental(&self, query_len: u32) -> bool {
        query_len == 1 && self.tokens_written > 0
    }

    fn alloc(&self, ctx: &DispatchContext<'_>, width: u32, height: u32, element_type: ElementType, label: &str) -> TensorTexture {
        let descriptor = TextureDescriptor::for_tensor_texture(width.max(1), height.max(1), element_type, TextureUsage::Storage);
        TensorTexture::create(&ctx.gpu.device, descriptor, Interpolation::Nearest, Some(label))
    }

    /// Run the full compound for a batch of `query_len` tokens starting at `token_index`.
    pub fn run(&mut self, ctx: &mut DispatchContext<'_>, query_len: u32, token_index: u32) -> Result<()> {
        self.base.require_valid()?;

        let data_rows = query_len.max(1);
        let high_precision = self.config.quant_group_size == 32;
        let key_len = token_index + query_len;

        let input_tex = ctx.pool.texture(self.base.input_buffers[0])?.clone();
        let output_framebuffer_tex = ctx.pool.texture(self.base.output_buffers[0])?.clone();

        let q_scratch = self.q_scratch.as_ref().expect("allocated in setup").clone();
        let v_cache = self.v_cache.as_ref().expect("allocated in setup").clone();
        let k_cache = self.k_cache.as_ref().expect("allocated in setup").clone();

        self.q_proj.run(ctx, &input_tex, &Framebuffer::new(vec![q_scratch.clone()]), data_rows, high_precision)?;
        self.v_proj.run(ctx, &input_tex, &Framebuffer::new(vec![v_cache.clone()]), data_rows, high_precision)?;

        let q_final = if let Some(rotary) = &self.rotary {
            // Rotary reads and writes distinct textures, so K projects into scratch first and the
            // rotary pass writes the rotated result straight into the persisted cache.
            let k_scratch = self.k_scratch.as_ref().expect("allocated in setup").clone();
            let q_rotated = self.q_rotated.as_ref().expect("allocated in setup").clone();
            self.k_proj.run(ctx, &input_tex, &Framebuffer::new(vec![k_scratch.clone()]), data_rows, high_precision)?;
            rotary.run(ctx, "attn-rotary-q", &q_scratch, &Framebuffer::new(vec![q_rotated.clone()]), token_index)?;
            rotary.run(ctx, "attn-rotary-k", &k_scratch, &Framebuffer::new(vec![k_cache.clone()]), token_index)?;
            q_rotated
        } else {
            // No rotary: K projects straight into the persisted cache, Q scratch is already final.
            self.k_proj.run(ctx, &input_tex, &Framebuffer::new(vec![k_cache.clone()]), data_rows, high_precision)?;
            q_scratch.clone()
        };

        let mode = dotprod::select_mode(query_len, self.config.num_heads, self.config.dp_max_batch);
        let logits = self.logits.as_ref().expect("allocated in setup").clone();
        dotprod::run(
            ctx,
            "attn-dotprod",
            &q_final,
            &k_cache,
            &Framebuffer::new(vec![logits.clone()]),
            self.config.head_dim,
            key_len,
            mode,
        )?;

        let denom_a = self.denom_a.as_ref().expect("allocated in setup").clone();
        let denom_b = self.denom_b.as_ref().expect("allocated in setup").clone();
        let prob = self.prob.as_ref().expect("allocated in setup").clone();
        softmax::run(
            ctx,
            "attn-softmax",
            &logits,
            &denom_a,
            &denom_b,
            &Framebuffer::new(vec![denom_b.clone()]),
            &Framebuffer::new(vec![prob.clone()]),
            token_index + query_len.saturating_sub(1),
            key_len,
        )?;

        let attmul_out = self.attmul_out.as_ref().expect("allocated in setup").clone();
        attmul::run(
            ctx,
            "attn-attmul",
            &prob,
            &v_cache,
            &Framebuffer::new(vec![attmul_out.clone()]),
            key_len,
            self.config.head_dim,
            mode,
        )?;

        self.out_proj.run(
            ctx,
            &attmul_out,
            &Framebuffer::new(vec![output_framebuffer_tex]),
            data_rows,
            high_precision,
        )?;

        self.tokens_written = key_len;
        Ok(())
    }
}

impl Layer for AttentionLayer {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn input_specs(&self) -> Vec<BufferSpec> {
        let embed_dim = self.config.embed_dim();
        vec![BufferSpec::new(
            embed_dim / 4,
            self.config.max_seq_len,
            embed_dim,
            ElementType::Float16,
            Usage::FunctionSource,
            TensorFormat::Sequence,
        )]
    }

    fn output_specs(&self) -> Vec<BufferSpec> {
        let embed_dim = self.config.embed_dim();
        vec![BufferSpec::new(
            embed_dim / 4,
            self.config.max_seq_len,
            embed_dim,
            ElementType::Float16,
            Usage::FunctionDest,
            TensorFormat::Sequence,
        )]
    }

    fn setup(&mut self, ctx: &mut DispatchContext<'_>) -> Result<()> {
        let embed_dim = self.config.embed_dim();
        let width = embed_dim / 4;
        let height = self.config.max_seq_len;

        let input_spec = self.input_specs().remove(0);
        let input_key = ctx.pool.claim(ctx.gpu, &input_spec)?;
        self.base.input_buffers.push(input_key);

        let output_spec = self.output_specs().remove(0);
        let output_key = ctx.pool.claim(ctx.gpu, &output_spec)?;
        self.base.output_buffers.push(output_key);

        let rotary = RotaryEncoder::new(self.config.head_dim, 10000.0);
        self.k_cache = Some(rotary.allocate_k_cache(ctx.gpu, self.config.max_seq_len, self.config.num_heads));
        self.v_cache = Some(rotary.allocate_k_cache(ctx.gpu, self.config.max_seq_len, self.config.num_heads));

        self.q_scratch = Some(self.alloc(ctx, width, height, ElementType::Float16, "attn-q-scratch"));
        if self.rotary.is_some() {
            self.k_scratch = Some(self.alloc(ctx, width, height, ElementType::Float16, "attn-k-scratch"));
            self.q_rotated = Some(self.alloc(ctx, width, height, ElementType::Float16, "attn-q-rotated"));
        }

        let key_width = self.config.max_seq_len.div_ceil(4);
        self.logits = Some(self.alloc(ctx, key_width, height, ElementType::Float32, "attn-logits"));
        self.denom_a = Some(softmax::allocate_denominator_scratch(ctx.gpu, self.config.max_seq_len, height));
        self.denom_b = Some(softmax::allocate_denominator_scratch(ctx.gpu, self.config.max_seq_len, height));
        self.prob = Some(self.alloc(ctx, key_width, height, ElementType::Float32, "attn-prob"));
        self.attmul_out = Some(self.alloc(ctx, width, height, ElementType::Float16, "attn-attmul-out"));

        self.base.mark_valid();
        Ok(())
    }

    fn forward(&mut self, ctx: &mut DispatchContext<'_>, _sequence_no: u64) -> Result<()> {
        self.base.require_valid()?;
        let query_len = 1;
        let token_index = self.tokens_written;
        self.run(ctx, query_len, token_index)
    }

    fn cleanup(&mut self, ctx: &mut DispatchContext<'_>) {
        self.k_cache = None;
        self.v_cache = None;
        self.q_scratch = None;
        self.q_rotated = None;
        self.k_scratch = None;
        self.logits = None;
        self.denom_a = None;
        self.denom_b = None;
        self.prob = None;
        self.attmul_out = None;
        self.tokens_written = 0;
        self.base.release_buffers(ctx.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AttentionConfig {
        AttentionConfig {
            num_heads: 4,
            head_dim: 16,
            max_seq_len: 128,
            quant_group_size: 32,
            rotary: true,
            auto_residual: true,
            dp_max_batch: 4,
        }
    }

    #[test]
    fn embed_dim_is_heads_times_head_dim() {
        assert_eq!(config().embed_dim(), 64);
    }

    #[test]
    fn incremental_mode_requires_prior_tokens() {
        let layer = AttentionLayer::new(0, "attn", config(), LayerFlags::default());
        assert!(!layer.is_incremental(1));
    }
}
