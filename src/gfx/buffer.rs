//! GPU-side vertex, index, and uniform buffer helpers shared by every dispatcher.

use std::collections::HashMap;

use wgpu::util::DeviceExt;

/// Usage combination for a device buffer, collapsed from `wgpu::BufferUsages` to the handful of
/// roles the engine actually needs (mirrors [`crate::gfx::texture::TextureUsage`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Vertex data for proxy polygons.
    Vertices,
    /// Per-draw uniform data (weights, bias, push-constant-sized parameters).
    Uniform,
    /// Read-only shader storage: quantised weight arrays, convolution taps, token id lists.
    Storage,
    /// Host-visible staging buffer used by upload/download layers (the PBO equivalent).
    Staging,
}

impl BufferUsage {
    pub fn to_wgpu(self) -> wgpu::BufferUsages {
        use wgpu::BufferUsages as U;
        match self {
            BufferUsage::Vertices => U::VERTEX | U::COPY_DST,
            BufferUsage::Uniform => U::UNIFORM | U::COPY_DST,
            BufferUsage::Storage => U::STORAGE | U::COPY_DST,
            BufferUsage::Staging => U::MAP_READ | U::MAP_WRITE | U::COPY_SRC | U::COPY_DST,
        }
    }
}

/// Create a read-only storage buffer pre-populated with `contents`.
pub fn create_storage(device: &wgpu::Device, label: &str, contents: &[u8]) -> wgpu::Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        // wgpu requires non-empty contents for `create_buffer_init`; callers with a
        // statically-zero-sized array substitute a single zero element (see call sites).
        contents,
        usage: BufferUsage::Storage.to_wgpu(),
    })
}

/// Vertex attributes for the plain unit quad: `(position, uv)`, matching every dispatcher whose
/// vertex shader is `common/quad_vertex.wgsl`'s `VertexInput`.
pub const QUAD_ATTRIBUTES: [wgpu::VertexAttribute; 2] =
    wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2];

/// Vertex attributes for per-lane convolution geometry: `(position, uv, tap_offset)`.
pub const CONV_LANE_ATTRIBUTES: [wgpu::VertexAttribute; 3] =
    wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2, 2 => Float32x2];

/// The `wgpu::VertexBufferLayout` every plain-unit-quad dispatch draws with.
pub fn quad_vertex_layout() -> wgpu::VertexBufferLayout<'static> {
    wgpu::VertexBufferLayout {
        array_stride: (std::mem::size_of::<f32>() * 4) as u64,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &QUAD_ATTRIBUTES,
    }
}

/// The `wgpu::VertexBufferLayout` every conv-lane dispatch draws with.
pub fn conv_lane_vertex_layout() -> wgpu::VertexBufferLayout<'static> {
    wgpu::VertexBufferLayout {
        array_stride: std::mem::size_of::<ProxyVertex>() as u64,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &CONV_LANE_ATTRIBUTES,
    }
}

/// Lazily-created vertex geometry shared by every dispatcher against one `Gpu`: the unit quad,
/// plus one conv-lane buffer per kernel size actually requested. Threaded through
/// [`crate::layer::base::DispatchContext`] so no dispatcher allocates its own duplicate geometry.
#[derive(Default)]
pub struct GeometryCache {
    unit_quad: Option<wgpu::Buffer>,
    conv_lanes: HashMap<u32, wgpu::Buffer>,
}

impl GeometryCache {
    pub fn new() -> Self {
        GeometryCache::default()
    }

    pub fn unit_quad(&mut self, device: &wgpu::Device) -> &wgpu::Buffer {
        self.unit_quad.get_or_insert_with(|| create_unit_quad(device))
    }

    pub fn conv_lanes(&mut self, device: &wgpu::Device, kernel_size: u32) -> &wgpu::Buffer {
        self.conv_lanes
            .entry(kernel_size)
            .or_insert_with(|| create_conv_lane_vertices(device, kernel_size))
    }
}

/// The unit quad (two triangles, positions + UVs) that every full-screen render pass draws.
///
/// Shared by all dispatchers: a single vertex buffer is created once per `Gpu` and re-bound for
/// every proxy-polygon draw whose geometry is just "cover the viewport".
pub fn create_unit_quad(device: &wgpu::Device) -> wgpu::Buffer {
    // (position.xy, uv.xy) per vertex, two triangles covering NDC [-1, 1]^2.
    #[rustfmt::skip]
    let verts: [[f32; 4]; 6] = [
        [-1.0, -1.0, 0.0, 1.0],
        [ 1.0, -1.0, 1.0, 1.0],
        [ 1.0,  1.0, 1.0, 0.0],
        [-1.0, -1.0, 0.0, 1.0],
        [ 1.0,  1.0, 1.0, 0.0],
        [-1.0,  1.0, 0.0, 0.0],
    ];
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("unit-quad"),
        contents: bytemuck::cast_slice(&verts),
        usage: BufferUsage::Vertices.to_wgpu(),
    })
}

/// Create a uniform buffer pre-populated with `contents`, sized exactly to the payload.
pub fn create_uniform(device: &wgpu::Device, label: &str, contents: &[u8]) -> wgpu::Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents,
        usage: BufferUsage::Uniform.to_wgpu(),
    })
}

/// Proxy-polygon geometry for a single convolution lane: one vertical lane position plus `k`
/// per-lane texel offsets, uploaded as an instanced vertex attribute so the vertex shader can
/// emit `k` vertical lanes without a draw call per lane.
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct ProxyVertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
    pub tap_offset: [f32; 2],
}

/// Build the proxy geometry for a `k x k` convolution: `k` vertical lanes, each a full-viewport
/// quad with a constant per-lane vertical texel offset; horizontal taps are resolved inside the
/// fragment shader instead (§4.4).
pub fn create_conv_lane_vertices(device: &wgpu::Device, kernel_size: u32) -> wgpu::Buffer {
    let half = (kernel_size as f32 - 1.0) / 2.0;
    let mut verts = Vec::with_capacity(kernel_size as usize * 6);
    for lane in 0..kernel_size {
        let tap_offset = [0.0, lane as f32 - half];
        #[rustfmt::skip]
        let quad: [[f32; 4]; 6] = [
            [-1.0, -1.0, 0.0, 1.0],
            [ 1.0, -1.0, 1.0, 1.0],
            [ 1.0,  1.0, 1.0, 0.0],
            [-1.0, -1.0, 0.0, 1.0],
            [ 1.0,  1.0, 1.0, 0.0],
            [-1.0,  1.0, 0.0, 0.0],
        ];
        for v in quad {
            verts.push(ProxyVertex {
                position: [v[0], v[1]],
                uv: [v[2], v[3]],
                tap_offset,
            });
        }
    }
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("conv-lane-vertices"),
        contents: bytemuck::cast_slice(&verts),
        usage: BufferUsage::Vertices.to_wgpu(),
    })
}
