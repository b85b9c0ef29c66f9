//! Layer builder types: the plain-data description of a layer that [`super::factory::LayerFactory`]
//! turns into a concrete [`super::base::Layer`] implementation.

use crate::layer::base::{Activation, LayerFlags};
use crate::layer::function::FunctionOp;
use crate::tensor::{ElementType, TensorFormat};

/// Shape common to every layer builder: identity, extent, and the behavioral flags.
#[derive(Clone, Debug)]
pub struct LayerShape {
    pub number: u32,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub in_channels: u32,
    pub out_channels: u32,
    pub element_type: ElementType,
    pub activation: Activation,
    pub residual_input: bool,
    pub post_batchnorm: bool,
}

impl LayerShape {
    pub fn flags(&self) -> LayerFlags {
        LayerFlags {
            activation: self.activation,
            residual_input: self.residual_input,
            post_batchnorm: self.post_batchnorm,
        }
    }
}

/// Convolution-specific parameters shared by shallow, deep, and transpose builders.
#[derive(Clone, Copy, Debug)]
pub struct ConvParams {
    pub kernel_size: u32,
    pub stride: u32,
    pub dilation: u32,
    pub group: u32,
}

/// Discriminates which concrete layer a [`LayerFactory`](super::factory::LayerFactory) should
/// build, carrying just enough of each variant's parameters to make the dispatch decision and
/// construct it (§3.3, §4.3-§4.9).
#[derive(Clone, Debug)]
pub enum LayerBuilder {
    Function {
        shape: LayerShape,
        op: FunctionOp,
    },
    Convolution {
        shape: LayerShape,
        conv: ConvParams,
        format: TensorFormat,
        transpose: bool,
    },
    Concatenation {
        shape: LayerShape,
        port_channels: Vec<u32>,
    },
    Attention {
        shape: LayerShape,
        num_heads: u32,
        head_dim: u32,
        max_seq_len: u32,
        quant_group_size: u32,
        rotary: bool,
        auto_residual: bool,
    },
    Embedding {
        shape: LayerShape,
        vocab_size: u32,
    },
    TokenScoring {
        shape: LayerShape,
        vocab_size: u32,
    },
}

impl LayerBuilder {
    pub fn shape(&self) -> &LayerShape {
        match self {
            LayerBuilder::Function { shape, .. }
            | LayerBuilder::Convolution { shape, .. }
            | LayerBuilder::Concatenation { shape, .. }
            | LayerBuilder::Attention { shape, .. }
            | LayerBuilder::Embedding { shape, .. }
            | LayerBuilder::TokenScoring { shape, .. } => shape,
        }
    }
}
