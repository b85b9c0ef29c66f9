//! Layer factory (§3.3, "Layer factory" row): dispatches a [`LayerBuilder`] to a concrete layer
//! implementation, gated on kernel size, group size, and tensor format the way the reference
//! engine's factory switches constructors.

use crate::attention::{AttentionConfig, AttentionLayer};
use crate::concat::ConcatLayer;
use crate::conv::{DeepConvLayer, ShallowConvLayer, TransposeConvLayer};
use crate::embedding::{EmbeddingLayer, ScoringRule, TokenScoringLayer};
use crate::error::Result;
use crate::gfx::Capabilities;
use crate::layer::base::Layer;
use crate::layer::builder::LayerBuilder;
use crate::layer::function::FunctionLayer;

/// Builds the concrete layer a [`LayerBuilder`] describes.
///
/// Holds the device capability probe since some dispatch decisions (Mali-variant deep
/// convolution, float16 packing) depend on what the adapter supports, not just on the builder's
/// own fields.
pub struct LayerFactory<'a> {
    caps: &'a Capabilities,
}

impl<'a> LayerFactory<'a> {
    pub fn new(caps: &'a Capabilities) -> Self {
        LayerFactory { caps }
    }

    pub fn build(&self, builder: LayerBuilder) -> Result<Box<dyn Layer>> {
        match builder {
            LayerBuilder::Function { shape, op } => Ok(Box::new(FunctionLayer::new(
                shape.number,
                shape.name,
                op,
                shape.width,
                shape.height,
                shape.in_channels,
                shape.element_type,
                shape.flags(),
            ))),

            LayerBuilder::Convolution {
                shape,
                conv,
                format,
                transpose,
            } => self.build_convolution(shape, conv, format, transpose),

            LayerBuilder::Concatenation { shape, port_channels } => {
                let activations = vec![shape.activation; port_channels.len()];
                Ok(Box::new(ConcatLayer::new(
                    shape.number,
                    shape.name,
                    shape.width,
                    shape.height,
                    shape.element_type,
                    port_channels,
                    &activations,
                )?))
            }

            LayerBuilder::Attention {
                shape,
                num_heads,
                head_dim,
                max_seq_len,
                quant_group_size,
                rotary,
                auto_residual,
            } => Ok(Box::new(AttentionLayer::new(
                shape.number,
                shape.name,
                AttentionConfig {
                    num_heads,
                    head_dim,
                    max_seq_len,
                    quant_group_size,
                    rotary,
                    auto_residual,
                    dp_max_batch: self.caps.max_draw_buffers,
                },
                shape.flags(),
            ))),

            LayerBuilder::Embedding { shape, vocab_size } => Ok(Box::new(EmbeddingLayer::new(
                shape.number,
                shape.name,
                vocab_size,
                shape.out_channels,
                shape.height,
                shape.flags(),
            ))),

            LayerBuilder::TokenScoring { shape, vocab_size } => Ok(Box::new(TokenScoringLayer::new(
                shape.number,
                shape.name,
                vocab_size,
                shape.in_channels,
                ScoringRule::Greedy,
                1.0,
                shape.flags(),
            ))),
        }
    }

    fn build_convolution(
        &self,
        shape: crate::layer::builder::LayerShape,
        conv: crate::layer::builder::ConvParams,
        format: crate::tensor::TensorFormat,
        transpose: bool,
    ) -> Result<Box<dyn Layer>> {
        if transpose {
            return Ok(Box::new(TransposeConvLayer::new(
                shape.number,
                shape.name,
                shape.width,
                shape.height,
                shape.in_channels,
                shape.out_channels,
                shape.element_type,
                conv.kernel_size,
                shape.flags(),
            )));
        }

        match format {
            crate::tensor::TensorFormat::Shallow => Ok(Box::new(ShallowConvLayer::new(
                shape.number,
                shape.name,
                shape.width,
                shape.height,
                shape.in_channels,
                shape.out_channels,
                shape.element_type,
                conv,
                shape.flags(),
                1.0,
            )?)),
            crate::tensor::TensorFormat::Deep => Ok(Box::new(DeepConvLayer::new(
                shape.number,
                shape.name,
                shape.width,
                shape.height,
                shape.in_channels,
                shape.out_channels,
                shape.element_type,
                conv,
                shape.flags(),
                !self.caps.float16_renderable,
                self.caps.mobile_vendor,
            ))),
            other => Err(crate::error::Error::invalid_builder(format!(
                "convolution dispatcher has no implementation for tensor format {other:?}"
            ))),
        }
    }
}
