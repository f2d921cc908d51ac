//! Bidirectional gpu id translation.
//!
//! The checkpoint map is keyed by the local (actual) id and yields the
//! portable (user) id written to the image. The restore map runs the other
//! way: user id from the image to the actual id chosen on this host.

use std::collections::HashMap;

use crate::error::{GpuCrError, Result};
use crate::types::{GpuId, INVALID_GPU_ID};

/// One-to-one mapping between two gpu id spaces. Neither side may be `0`.
#[derive(Debug, Clone, Default)]
pub struct GpuIdMap {
    pairs: Vec<(GpuId, GpuId)>,
    forward: HashMap<GpuId, GpuId>,
    reverse: HashMap<GpuId, GpuId>,
}

impl GpuIdMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `src → dest`. Re-inserting an identical pair is a no-op; a pair
    /// that conflicts with an existing one on either side is rejected.
    pub fn insert(&mut self, src: GpuId, dest: GpuId) -> Result<()> {
        if src == INVALID_GPU_ID || dest == INVALID_GPU_ID {
            return Err(GpuCrError::mapping(format!(
                "gpu id 0 is reserved (0x{src:04x} -> 0x{dest:04x})"
            )));
        }
        match (self.forward.get(&src), self.reverse.get(&dest)) {
            (Some(&d), Some(&s)) if d == dest && s == src => return Ok(()),
            (None, None) => {}
            _ => {
                return Err(GpuCrError::mapping(format!(
                    "0x{src:04x} -> 0x{dest:04x} conflicts with an existing mapping"
                )));
            }
        }
        self.pairs.push((src, dest));
        self.forward.insert(src, dest);
        self.reverse.insert(dest, src);
        Ok(())
    }

    pub fn dest(&self, src: GpuId) -> Option<GpuId> {
        self.forward.get(&src).copied()
    }

    pub fn src(&self, dest: GpuId) -> Option<GpuId> {
        self.reverse.get(&dest).copied()
    }

    /// Translate forwards or fail with `UnmappedGpu`.
    pub fn resolve(&self, src: GpuId) -> Result<GpuId> {
        self.dest(src)
            .ok_or(GpuCrError::UnmappedGpu { gpu_id: src })
    }

    /// Translate backwards or fail with `UnmappedGpu`.
    pub fn resolve_back(&self, dest: GpuId) -> Result<GpuId> {
        self.src(dest)
            .ok_or(GpuCrError::UnmappedGpu { gpu_id: dest })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (GpuId, GpuId)> + '_ {
        self.pairs.iter().copied()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
        self.forward.clear();
        self.reverse.clear();
    }
}
