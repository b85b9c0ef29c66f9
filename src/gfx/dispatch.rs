//! Shared draw-call plumbing: build one bind group, open one render pass against a framebuffer,
//! issue one draw, submit. Every dispatcher funnels its per-pass GPU work through [`draw`] so
//! there is exactly one place in the crate that assembles a `wgpu::RenderPass`.

use std::ops::Range;

use crate::error::Result;
use crate::gfx::device::Gpu;
use crate::gfx::framebuffer::Framebuffer;
use crate::gfx::program::Program;

/// One render-pass draw: a compiled program, the resources it binds, the framebuffer it targets,
/// and the vertex range to draw.
pub struct DrawCall<'a> {
    pub label: &'a str,
    pub program: &'a Program,
    pub bind_group_entries: &'a [wgpu::BindGroupEntry<'a>],
    pub vertex_buffer: &'a wgpu::Buffer,
    pub vertex_range: Range<u32>,
    pub framebuffer: &'a Framebuffer,
    /// Clear color (and stencil) attachments before drawing instead of loading existing contents.
    pub clear: bool,
    /// Stencil reference value compared against the attachment for this draw. Ignored by
    /// pipelines compiled without a stencil test.
    pub stencil_reference: u32,
}

/// Build a bind group against `call.program`'s layout, open one render pass over
/// `call.framebuffer`, and issue the draw. Submits its own command buffer immediately; callers
/// needing to batch several draws into one submission are not a case any dispatcher needs yet.
pub fn draw(gpu: &Gpu, call: &DrawCall<'_>) -> Result<()> {
    let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(call.label),
        layout: &call.program.bind_group_layout,
        entries: call.bind_group_entries,
    });

    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(call.label),
        });

    let color_attachments = call.framebuffer.color_attachment_ops(call.clear);
    let depth_stencil_attachment = call.framebuffer.depth_stencil_attachment_ops(call.clear);

    {
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(call.label),
            color_attachments: &color_attachments,
            depth_stencil_attachment,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(&call.program.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.set_vertex_buffer(0, call.vertex_buffer.slice(..));
        pass.set_stencil_reference(call.stencil_reference);
        pass.draw(call.vertex_range.clone(), 0..1);
    }

    gpu.queue.submit(std::iter::once(encoder.finish()));
    Ok(())
}
