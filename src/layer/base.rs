//! Common layer state and lifecycle (§3.3): every concrete layer embeds a [`LayerBase`] and
//! delegates bookkeeping (number, name, flags, port counts, texture/framebuffer handles, the
//! `valid` bit) to it, implementing only the parts specific to its operation.

use crate::error::{Error, Result};
use crate::gfx::{Capabilities, Framebuffer, GeometryCache, Gpu, ProgramCache};
use crate::pool::{BufferPool, PoolKey};
use crate::tensor::BufferSpec;

/// Everything a layer's `setup`/`forward`/`cleanup` needs to do real GPU work, bundled so the
/// `Layer` trait takes one argument instead of four. The engine owns the actual `Gpu`, caches, and
/// pool; every layer borrows them for the duration of one call.
pub struct DispatchContext<'a> {
    pub gpu: &'a Gpu,
    pub caps: &'a Capabilities,
    pub programs: &'a mut ProgramCache,
    pub pool: &'a mut BufferPool,
    pub geometry: &'a mut GeometryCache,
}

/// Output activation applied on a layer's final pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Activation {
    #[default]
    None,
    Relu,
    LeakyRelu,
    Clip,
}

/// Behavioral flags a layer builder may set, orthogonal to its specific parameters.
#[derive(Clone, Copy, Debug, Default)]
pub struct LayerFlags {
    pub activation: Activation,
    /// Add the layer's (single) input to its output during the final pass (§4.4's blending
    /// protocol, §4.8's `auto_residual`).
    pub residual_input: bool,
    /// Apply a per-channel scale/bias after activation, folded from a preceding batchnorm.
    pub post_batchnorm: bool,
}

/// Shared bookkeeping every layer implementation embeds.
///
/// Holds no GPU state directly; `input_buffers`/`output_buffers`/`framebuffers` are populated by
/// `setup` and cleared by `cleanup`, so a `LayerBase` can be inspected to answer "is this layer
/// ready to run" without downcasting to a concrete layer type.
pub struct LayerBase {
    pub number: u32,
    pub name: String,
    pub flags: LayerFlags,
    pub input_ports: u32,
    pub output_ports: u32,
    pub input_buffers: Vec<PoolKey>,
    pub output_buffers: Vec<PoolKey>,
    pub framebuffers: Vec<Framebuffer>,
    valid: bool,
}

impl LayerBase {
    pub fn new(number: u32, name: impl Into<String>, input_ports: u32, output_ports: u32, flags: LayerFlags) -> Self {
        LayerBase {
            number,
            name: name.into(),
            flags,
            input_ports,
            output_ports,
            input_buffers: Vec::new(),
            output_buffers: Vec::new(),
            framebuffers: Vec::new(),
            valid: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Mark setup complete. Callers invoke this only after every output buffer and framebuffer
    /// has been populated; `forward`/`cleanup` implementations should check `is_valid` first.
    pub fn mark_valid(&mut self) {
        self.valid = true;
    }

    /// Clear per-layer GFX state and the `valid` bit. Idempotent: calling `cleanup` twice, or on
    /// a layer that never finished `setup`, is not an error (§3.3, §7: "cleanup is idempotent and
    /// safe after a partial setup").
    pub fn reset(&mut self) {
        self.input_buffers.clear();
        self.output_buffers.clear();
        self.framebuffers.clear();
        self.valid = false;
    }

    /// Release every claimed pool buffer back to `pool`, then reset as [`Self::reset`] does.
    /// `cleanup` implementations call this instead of `reset` so the pool can reuse the memory.
    pub fn release_buffers(&mut self, pool: &mut BufferPool) {
        for key in self.input_buffers.drain(..) {
            let _ = pool.release(key);
        }
        for key in self.output_buffers.drain(..) {
            let _ = pool.release(key);
        }
        self.framebuffers.clear();
        self.valid = false;
    }

    pub fn require_valid(&self) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(Error::invalid_state(format!(
                "layer '{}' (#{}) used before successful setup",
                self.name, self.number
            )))
        }
    }
}

/// The full layer lifecycle (§3.3): constructed from a builder, optionally loaded with
/// parameters, `setup` allocates GFX resources, `forward` runs repeatedly, `cleanup` releases
/// resources. Concrete layers (function, shallow/deep/transpose conv, concat, attention,
/// embedding, scoring) implement this directly rather than through a builder-produced trait
/// object, since each has a distinct `forward` signature's worth of per-layer state, but all
/// share the lifecycle shape.
pub trait Layer {
    fn base(&self) -> &LayerBase;
    fn base_mut(&mut self) -> &mut LayerBase;

    /// Buffer specs this layer requires as input, in port order.
    fn input_specs(&self) -> Vec<BufferSpec>;
    /// Buffer specs this layer will produce as output, in port order.
    fn output_specs(&self) -> Vec<BufferSpec>;

    fn setup(&mut self, ctx: &mut DispatchContext<'_>) -> Result<()>;
    fn forward(&mut self, ctx: &mut DispatchContext<'_>, sequence_no: u64) -> Result<()>;
    fn cleanup(&mut self, ctx: &mut DispatchContext<'_>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_valid_and_handles() {
        let mut base = LayerBase::new(0, "layer", 1, 1, LayerFlags::default());
        base.mark_valid();
        base.framebuffers.push(
            Framebuffer::new(Vec::new()),
        );
        base.reset();
        assert!(!base.is_valid());
        assert!(base.framebuffers.is_empty());
    }

    #[test]
    fn require_valid_fails_before_setup() {
        let base = LayerBase::new(1, "layer", 1, 1, LayerFlags::default());
        assert!(base.require_valid().is_err());
    }
}
