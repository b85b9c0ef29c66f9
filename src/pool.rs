//! Tensor buffer pool (§4.2): a slot map of allocated textures plus a descriptor-keyed index for
//! finding an existing allocation compatible with a requested [`BufferSpec`], so layers that
//! don't need a persistent buffer reuse one another's memory instead of each allocating their own.
//!
//! A `SlotMap`-backed store of resources plus a separate grouping view that groups unused entries
//! by descriptor equality. The physical resource here is
//! always a [`TensorTexture`] (the engine has no host-buffer pool entries; CPU-channelwise tensors
//! are plain `Vec<u8>` owned by the layer that produced them), and grouping keys on
//! width/height/element-type/format/interpolation via [`BufferSpec::is_pool_compatible`] rather
//! than on the full descriptor, since usage/port/tile-index are bookkeeping, not physical shape.

use std::collections::HashMap;

use slotmap::{new_key_type, SlotMap};

use crate::error::{Error, Result};
use crate::gfx::{Gpu, TensorTexture, TextureDescriptor, TextureUsage};
use crate::tensor::BufferSpec;

new_key_type! {
    /// Handle to a pooled tensor texture. Stable across releases; only invalidated if the pool
    /// itself is dropped.
    pub struct PoolKey;
}

struct Entry {
    spec: BufferSpec,
    texture: TensorTexture,
    /// `true` while a layer holds this entry as one of its live input/output buffers; cleared by
    /// `release` once that layer's forward pass no longer needs it.
    in_use: bool,
}

/// Owns every tensor texture allocated for a network and tracks which ones are currently claimed.
#[derive(Default)]
pub struct BufferPool {
    entries: SlotMap<PoolKey, Entry>,
}

impl BufferPool {
    pub fn new() -> Self {
        BufferPool {
            entries: SlotMap::with_key(),
        }
    }

    /// Claim a texture satisfying `spec`, reusing an unused pool-compatible entry if one exists.
    ///
    /// Buffers marked `lock`, `pass_through`, or `async_io` in their spec are never shared: each
    /// such request gets a dedicated allocation (§4.2), and an entry allocated this way is never
    /// considered by a later `claim`'s reuse search (`is_poolable` gates search membership).
    pub fn claim(&mut self, gpu: &Gpu, spec: &BufferSpec) -> Result<PoolKey> {
        if spec.is_poolable() {
            if let Some(key) = self.find_reusable(spec) {
                self.entries[key].in_use = true;
                self.entries[key].spec = spec.clone();
                return Ok(key);
            }
        }
        self.allocate(gpu, spec)
    }

    fn find_reusable(&self, spec: &BufferSpec) -> Option<PoolKey> {
        self.entries
            .iter()
            .find(|(_, e)| !e.in_use && e.spec.is_poolable() && e.spec.is_pool_compatible(spec))
            .map(|(key, _)| key)
    }

    fn allocate(&mut self, gpu: &Gpu, spec: &BufferSpec) -> Result<PoolKey> {
        let usage = if spec.pass_through {
            TextureUsage::Storage
        } else {
            TextureUsage::DataOut
        };
        let descriptor =
            TextureDescriptor::for_tensor_texture(spec.width, spec.height, spec.element_type, usage);
        let texture = TensorTexture::create(&gpu.device, descriptor, spec.interpolation, None);
        let key = self.entries.insert(Entry {
            spec: spec.clone(),
            texture,
            in_use: true,
        });
        Ok(key)
    }

    /// Release a claimed entry back to the pool for reuse by a later, compatible claim.
    pub fn release(&mut self, key: PoolKey) -> Result<()> {
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| Error::invalid_state("release of unknown pool key"))?;
        entry.in_use = false;
        Ok(())
    }

    pub fn texture(&self, key: PoolKey) -> Result<&TensorTexture> {
        self.entries
            .get(key)
            .map(|e| &e.texture)
            .ok_or_else(|| Error::invalid_state("texture lookup of unknown pool key"))
    }

    pub fn spec(&self, key: PoolKey) -> Result<&BufferSpec> {
        self.entries
            .get(key)
            .map(|e| &e.spec)
            .ok_or_else(|| Error::invalid_state("spec lookup of unknown pool key"))
    }

    /// Number of live allocations, used by tests to assert that reuse actually happened.
    pub fn allocation_count(&self) -> usize {
        self.entries.len()
    }
}

/// Allocates one [`PoolKey`] per tile for a multiplicity-shadowed buffer (§4.2's "multi" flag):
/// a buffer declared with `multiplicity > 1` gets `multiplicity` independent backing textures so
/// concurrent in-flight passes don't alias.
pub struct ShadowedClaim {
    pub keys: Vec<PoolKey>,
}

impl ShadowedClaim {
    pub fn claim(pool: &mut BufferPool, gpu: &Gpu, spec: &BufferSpec) -> Result<Self> {
        let keys = (0..spec.multiplicity.max(1))
            .map(|_| pool.allocate(gpu, spec))
            .collect::<Result<Vec<_>>>()?;
        Ok(ShadowedClaim { keys })
    }
}

/// Dependency-order scan helper: given the buffer specs a layer list declares, in declaration
/// order, partitions them by spatial extent so a scheduler can restrict its reuse search to
/// buffers that could possibly be pool-compatible, rather than scanning the whole pool on every
/// claim.
pub fn compatibility_groups(specs: &[BufferSpec]) -> HashMap<(u32, u32), Vec<usize>> {
    let mut groups: HashMap<(u32, u32), Vec<usize>> = HashMap::new();
    for (index, spec) in specs.iter().enumerate() {
        groups
            .entry((spec.width, spec.height))
            .or_default()
            .push(index);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{ElementType, TensorFormat, Usage};

    fn plain_spec(w: u32, h: u32) -> BufferSpec {
        BufferSpec::new(w, h, 4, ElementType::Float16, Usage::FunctionDest, TensorFormat::Shallow)
    }

    #[test]
    fn compatibility_groups_partition_by_extent() {
        let specs = vec![plain_spec(32, 32), plain_spec(32, 32), plain_spec(16, 16)];
        let groups = compatibility_groups(&specs);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&(32, 32)].len(), 2);
        assert_eq!(groups[&(16, 16)].len(), 1);
    }
}
