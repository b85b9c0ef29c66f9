//! Thin wrapper around a `wgpu` device/queue pair, and the capability probe used to gate which
//! dispatcher variants a factory may build.

use std::sync::Arc;

use crate::error::{Error, Result};

/// A device + queue pair, shared by reference among everything that needs to issue commands.
///
/// This is deliberately thin: all state that depends on the device (programs, textures,
/// framebuffers) lives in the owning pool/cache, not here.
#[derive(Clone)]
pub struct Gpu {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
}

impl Gpu {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Gpu {
            device: Arc::new(device),
            queue: Arc::new(queue),
        }
    }

    /// Block the calling thread until all submitted work has completed.
    ///
    /// Used at the few explicit `readback` points the concurrency model allows the primary
    /// thread to block on the GPU.
    pub fn wait_idle(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }
}

/// Per-adapter capability probe.
///
/// Queried once when a [`Gpu`] is created and threaded through factory and dispatcher
/// construction; gates which shader variants and batch widths are legal to request.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Capabilities {
    /// Maximum simultaneous render targets, capped at 8 regardless of device limits (§4.3).
    pub max_draw_buffers: u32,
    pub max_texture_dim: u32,
    pub float16_renderable: bool,
    /// Hint for picking the fewer-varyings deep-convolution shader variant (§4.5).
    pub mobile_vendor: bool,
}

impl Capabilities {
    /// Probe capabilities from an adapter's reported limits and features.
    pub fn probe(adapter: &wgpu::Adapter) -> Result<Capabilities> {
        let limits = adapter.limits();
        let features = adapter.features();

        if limits.max_texture_dimension_2d == 0 {
            return Err(Error::gfx_unavailable(
                "adapter reports zero maximum 2D texture dimension",
            ));
        }

        let max_draw_buffers = limits.max_color_attachments.min(8);
        if max_draw_buffers == 0 {
            return Err(Error::gfx_unavailable(
                "adapter supports no color attachments",
            ));
        }

        let float16_renderable = features.contains(wgpu::Features::FLOAT32_FILTERABLE)
            || adapter
                .get_texture_format_features(wgpu::TextureFormat::Rgba16Float)
                .allowed_usages
                .contains(wgpu::TextureUsages::RENDER_ATTACHMENT);

        Ok(Capabilities {
            max_draw_buffers,
            max_texture_dim: limits.max_texture_dimension_2d,
            float16_renderable,
            mobile_vendor: is_mobile_vendor(&adapter.get_info()),
        })
    }

    /// Greedy batch width for the function-layer render loop: `min(M, remaining/4)`, at least 1.
    pub fn batch_width(&self, remaining_channels: u32) -> u32 {
        let groups = (remaining_channels / 4).max(1);
        groups.min(self.max_draw_buffers)
    }
}

fn is_mobile_vendor(info: &wgpu::AdapterInfo) -> bool {
    let name = info.name.to_ascii_lowercase();
    matches!(info.device_type, wgpu::DeviceType::IntegratedGpu)
        || name.contains("mali")
        || name.contains("adreno")
        || name.contains("powervr")
        || name.contains("apple")
}

/// Request an adapter/device/queue synchronously for unit tests, by polling the `wgpu` futures
/// once with a no-op waker. Native backends resolve `request_adapter`/`request_device`
/// immediately, so a single poll is enough; this avoids pulling an async executor into the crate
/// just to exercise engine/layer plumbing that never touches real GPU state.
#[cfg(test)]
pub(crate) fn test_gpu() -> Gpu {
    use std::pin::pin;
    use std::task::{Context, Poll};

    let waker = waker_fn::waker_fn(|| {});
    let mut cx = Context::from_waker(&waker);

    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
    let adapter = match pin!(instance.request_adapter(&wgpu::RequestAdapterOptions::default())).poll(&mut cx) {
        Poll::Ready(adapter) => adapter.expect("no wgpu adapter available for tests"),
        Poll::Pending => panic!("adapter request did not resolve synchronously"),
    };

    let device_fut = adapter.request_device(&wgpu::DeviceDescriptor::default(), None);
    let (device, queue) = match pin!(device_fut).poll(&mut cx) {
        Poll::Ready(result) => result.expect("failed to request wgpu device for tests"),
        Poll::Pending => panic!("device request did not resolve synchronously"),
    };

    Gpu::new(device, queue)
}

#[cfg(test)]
pub(crate) fn test_caps() -> Capabilities {
    Capabilities {
        max_draw_buffers: 8,
        max_texture_dim: 4096,
        float16_renderable: true,
        mobile_vendor: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_width_is_greedy_and_capped() {
        let caps = Capabilities {
            max_draw_buffers: 8,
            max_texture_dim: 4096,
            float16_renderable: true,
            mobile_vendor: false,
        };
        assert_eq!(caps.batch_width(4), 1);
        assert_eq!(caps.batch_width(12), 3);
        assert_eq!(caps.batch_width(64), 8);
    }

    #[test]
    fn batch_width_never_zero() {
        let caps = Capabilities {
            max_draw_buffers: 8,
            max_texture_dim: 4096,
            float16_renderable: true,
            mobile_vendor: false,
        };
        assert_eq!(caps.batch_width(0), 1);
    }
}
