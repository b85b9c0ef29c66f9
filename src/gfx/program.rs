//! Shader/program cache keyed by a 64-bit FNV-1a hash of the fully preprocessed source (§4.1).
//!
//! Every dispatcher asks the cache for a pipeline by `(label, source, defines)` rather than
//! compiling directly; two call sites that end up with byte-identical expanded source after
//! `#include`/`#define` substitution share one `wgpu::RenderPipeline`, regardless of how many
//! logical layers requested it. The cache never evicts: the pipeline population is bounded by the
//! number of distinct shader variants in the binary, not by network size.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::gfx::device::Gpu;
use crate::gfx::snippets;

/// FNV-1a over raw bytes, matching the hash the cache keys preprocessed source by.
fn fnv1a_64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// A compiled render pipeline plus the bind group layout dispatchers need to build bind groups
/// against it.
pub struct Program {
    pub pipeline: Arc<wgpu::RenderPipeline>,
    pub bind_group_layout: Arc<wgpu::BindGroupLayout>,
}

/// Everything needed to request a program: the two-stage WGSL sources (already textually
/// preprocessed, or raw with `preprocess` applied via [`ProgramCache::get_or_compile`]), the
/// vertex buffer layout, and the target color attachment formats.
pub struct ProgramDescriptor<'a> {
    pub label: &'a str,
    pub vertex_source: &'a str,
    pub fragment_source: &'a str,
    pub defines: &'a [(&'a str, String)],
    pub vertex_layout: wgpu::VertexBufferLayout<'a>,
    pub color_formats: &'a [Option<wgpu::ColorTargetState>],
    pub bind_group_layout_entries: &'a [wgpu::BindGroupLayoutEntry],
    pub blend_accumulate: bool,
    /// Hardware stencil test for stencil-stratified dispatches (§4.6). `None` for every ordinary
    /// pass; the reference value is set per-draw, not baked into the pipeline.
    pub stencil_test: Option<StencilTest>,
}

/// Stencil comparison/write configuration shared by the populate pass and the four gated stratum
/// passes of a stencil-stratified dispatch; only the reference value differs between them.
#[derive(Clone, Copy, Debug)]
pub struct StencilTest {
    pub compare: wgpu::CompareFunction,
    pub pass_op: wgpu::StencilOperation,
}

struct CacheEntry {
    pipeline: Arc<wgpu::RenderPipeline>,
    bind_group_layout: Arc<wgpu::BindGroupLayout>,
}

/// Process-local cache of compiled programs, one per `Gpu`. Not `Clone`: dispatchers hold a
/// `&mut ProgramCache` or share one behind a lock, one cache per context instance.
#[derive(Default)]
pub struct ProgramCache {
    entries: HashMap<u64, CacheEntry>,
}

impl ProgramCache {
    pub fn new() -> Self {
        ProgramCache {
            entries: HashMap::new(),
        }
    }

    /// Look up or compile the program described by `desc`. The cache key is the FNV-1a hash of
    /// the two preprocessed source strings concatenated; a collision would silently serve the
    /// wrong pipeline; 64 bits makes this not worth guarding against in practice.
    pub fn get_or_compile(&mut self, gpu: &Gpu, desc: &ProgramDescriptor<'_>) -> Result<Program> {
        let vertex_expanded = snippets::preprocess(desc.label, desc.vertex_source, desc.defines)?;
        let fragment_expanded =
            snippets::preprocess(desc.label, desc.fragment_source, desc.defines)?;

        let mut keyed = Vec::with_capacity(vertex_expanded.len() + fragment_expanded.len() + 1);
        keyed.extend_from_slice(vertex_expanded.as_bytes());
        keyed.push(0);
        keyed.extend_from_slice(fragment_expanded.as_bytes());
        let key = fnv1a_64(&keyed);

        if let Some(entry) = self.entries.get(&key) {
            return Ok(Program {
                pipeline: entry.pipeline.clone(),
                bind_group_layout: entry.bind_group_layout.clone(),
            });
        }

        let compiled = self.compile(gpu, desc, &vertex_expanded, &fragment_expanded)?;
        let program = Program {
            pipeline: compiled.pipeline.clone(),
            bind_group_layout: compiled.bind_group_layout.clone(),
        };
        self.entries.insert(key, compiled);
        Ok(program)
    }

    fn compile(
        &self,
        gpu: &Gpu,
        desc: &ProgramDescriptor<'_>,
        vertex_expanded: &str,
        fragment_expanded: &str,
    ) -> Result<CacheEntry> {
        let vertex_module = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(desc.label),
                source: wgpu::ShaderSource::Wgsl(vertex_expanded.into()),
            });
        let fragment_module = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(desc.label),
                source: wgpu::ShaderSource::Wgsl(fragment_expanded.into()),
            });

        let bind_group_layout =
            gpu.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(desc.label),
                    entries: desc.bind_group_layout_entries,
                });

        let pipeline_layout = gpu
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(desc.label),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });

        let blend = if desc.blend_accumulate {
            Some(wgpu::BlendState {
                color: wgpu::BlendComponent {
                    src_factor: wgpu::BlendFactor::One,
                    dst_factor: wgpu::BlendFactor::One,
                    operation: wgpu::BlendOperation::Add,
                },
                alpha: wgpu::BlendComponent {
                    src_factor: wgpu::BlendFactor::One,
                    dst_factor: wgpu::BlendFactor::One,
                    operation: wgpu::BlendOperation::Add,
                },
            })
        } else {
            None
        };

        let color_formats: Vec<Option<wgpu::ColorTargetState>> = desc
            .color_formats
            .iter()
            .map(|target| {
                target.as_ref().map(|t| wgpu::ColorTargetState {
                    format: t.format,
                    blend: blend.or(t.blend),
                    write_mask: t.write_mask,
                })
            })
            .collect();

        let pipeline = gpu
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(desc.label),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &vertex_module,
                    entry_point: "vs_main",
                    compilation_options: Default::default(),
                    buffers: &[desc.vertex_layout.clone()],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &fragment_module,
                    entry_point: "fs_main",
                    compilation_options: Default::default(),
                    targets: &color_formats,
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: desc.stencil_test.map(|stencil| wgpu::DepthStencilState {
                    format: wgpu::TextureFormat::Stencil8,
                    depth_write_enabled: false,
                    depth_compare: wgpu::CompareFunction::Always,
                    stencil: wgpu::StencilState {
                        front: wgpu::StencilFaceState {
                            compare: stencil.compare,
                            fail_op: wgpu::StencilOperation::Keep,
                            depth_fail_op: wgpu::StencilOperation::Keep,
                            pass_op: stencil.pass_op,
                        },
                        back: wgpu::StencilFaceState {
                            compare: stencil.compare,
                            fail_op: wgpu::StencilOperation::Keep,
                            depth_fail_op: wgpu::StencilOperation::Keep,
                            pass_op: stencil.pass_op,
                        },
                        read_mask: 0xff,
                        write_mask: 0xff,
                    },
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            });

        Ok(CacheEntry {
            pipeline: Arc::new(pipeline),
            bind_group_layout: Arc::new(bind_group_layout),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_is_stable_and_sensitive_to_single_bytes() {
        let a = fnv1a_64(b"fragment source a");
        let b = fnv1a_64(b"fragment source b");
        let a_again = fnv1a_64(b"fragment source a");
        assert_eq!(a, a_again);
        assert_ne!(a, b);
    }
}
