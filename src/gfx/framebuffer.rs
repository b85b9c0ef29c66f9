//! Framebuffer wrapper: a fixed list of color attachments (and optional stencil) a render pass
//! writes into, matching one batch of the function-layer render loop or one transpose-convolution
//! stratum pass.

use super::texture::TensorTexture;

/// A render target set: up to `M` color attachments covering one batch of output channel tiles,
/// plus an optional stencil attachment for stencil-stratified passes (§4.6).
pub struct Framebuffer {
    pub color_attachments: Vec<TensorTexture>,
    pub stencil: Option<TensorTexture>,
}

impl Framebuffer {
    pub fn new(color_attachments: Vec<TensorTexture>) -> Self {
        Framebuffer {
            color_attachments,
            stencil: None,
        }
    }

    pub fn with_stencil(mut self, stencil: TensorTexture) -> Self {
        self.stencil = Some(stencil);
        self
    }

    pub fn width(&self) -> u32 {
        self.color_attachments
            .first()
            .map(|t| t.descriptor.width)
            .unwrap_or(0)
    }

    pub fn height(&self) -> u32 {
        self.color_attachments
            .first()
            .map(|t| t.descriptor.height)
            .unwrap_or(0)
    }

    /// Build the `wgpu` color attachment descriptors for a pass.
    ///
    /// `clear` selects between clearing to zero (pass 0 of a blended sequence) and loading the
    /// existing contents (subsequent accumulation passes, per the blending protocol in §4.4).
    pub fn color_attachment_ops(&self, clear: bool) -> Vec<Option<wgpu::RenderPassColorAttachment<'_>>> {
        self.color_attachments
            .iter()
            .map(|tex| {
                Some(wgpu::RenderPassColorAttachment {
                    view: &tex.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: if clear {
                            wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT)
                        } else {
                            wgpu::LoadOp::Load
                        },
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect()
    }

    /// Build the stencil-attachment descriptor for a pass, if this framebuffer carries one.
    ///
    /// `clear` selects between clearing the stencil plane to zero (the populate pass, §4.6) and
    /// loading the existing contents (every gated stratum pass after that).
    pub fn depth_stencil_attachment_ops(&self, clear: bool) -> Option<wgpu::RenderPassDepthStencilAttachment<'_>> {
        self.stencil.as_ref().map(|tex| wgpu::RenderPassDepthStencilAttachment {
            view: &tex.view,
            depth_ops: None,
            stencil_ops: Some(wgpu::Operations {
                load: if clear {
                    wgpu::LoadOp::Clear(0)
                } else {
                    wgpu::LoadOp::Load
                },
                store: wgpu::StoreOp::Store,
            }),
        })
    }
}
