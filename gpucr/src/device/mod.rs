//! Seams between the checkpoint core and the hardware it drives.
//!
//! - [`KfdDevice`]: one open compute-driver handle; bucket-array exchange,
//!   pause and resume.
//! - [`RenderDevice`]: one render node; CPU mappings and an optional
//!   [`CopyEngine`] for hardware copies.
//! - [`ProcessMemory`]: the target process's address space.
//! - [`Platform`]: discovers the local topology and opens the above.
//!
//! Linux implementations live in the `gpucr-kfd` crate; tests use in-memory
//! emulations.

use std::sync::Arc;

use crate::error::Result;
use crate::protocol::{BucketArray, ProcessInfo};
use crate::topology::{Topology, TopologyNode};
use crate::types::{GpuId, Pid};

/// One handle on the compute driver.
pub trait KfdDevice {
    /// Per-class object counts and private-payload totals.
    fn process_info(&self) -> Result<ProcessInfo>;

    /// Stop (`true`) or restart (`false`) the process's GPU queues.
    fn set_paused(&self, paused: bool) -> Result<()>;

    /// Fill `array` with every object of its class.
    fn dump_objects(&self, array: &mut BucketArray) -> Result<()>;

    /// Re-create the objects described by `array`. The driver may write
    /// output fields back into the buckets.
    fn restore_objects(&self, array: &mut BucketArray) -> Result<()>;

    /// Start queues and notifiers of a fully restored process.
    fn resume(&self, pid: Pid) -> Result<()>;

    /// Close a dma-buf descriptor the driver handed back in a bucket.
    fn release_dmabuf(&self, _fd: i32) {}
}

/// CPU access requested for a render-node mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapAccess {
    /// Reserve the range without any access; contents are reached through
    /// [`ProcessMemory`] instead.
    None,
    Read,
    Write,
}

/// A buffer mapped into the current address space. Unmapped on drop.
pub trait MappedRegion {
    fn addr(&self) -> u64;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the mapping into `out`. Fails unless mapped readable.
    fn read(&self, out: &mut [u8]) -> Result<()>;

    /// Copy `data` into the mapping. Fails unless mapped writable.
    fn write(&mut self, data: &[u8]) -> Result<()>;
}

/// Shared-handle reference to a buffer object for the copy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoHandle {
    pub dmabuf_fd: i32,
    pub size: u64,
}

/// A device DMA engine able to move buffer contents without CPU mappings.
pub trait CopyEngine: Send + Sync {
    /// Device buffer → `out` (`out.len() == bo.size`).
    fn read(&self, bo: &BoHandle, out: &mut [u8]) -> Result<()>;

    /// `data` → device buffer (`data.len() == bo.size`).
    fn write(&self, bo: &BoHandle, data: &[u8]) -> Result<()>;
}

/// An open render node.
pub trait RenderDevice: Send + Sync {
    /// Host-local gpu id of the node.
    fn gpu_id(&self) -> GpuId;

    fn render_minor(&self) -> u32;

    /// Raw descriptor passed to the driver in device buckets.
    fn raw_handle(&self) -> i32;

    /// Hardware copy path, if this device provides one.
    fn copy_engine(&self) -> Option<&dyn CopyEngine> {
        None
    }

    /// Map `size` bytes of the node at mmap `offset`.
    fn map(&self, offset: u64, size: usize, access: MapAccess) -> Result<Box<dyn MappedRegion + '_>>;
}

/// Read/write access to a process's virtual memory.
pub trait ProcessMemory: Send {
    fn read_at(&self, addr: u64, out: &mut [u8]) -> Result<()>;

    fn write_at(&self, addr: u64, data: &[u8]) -> Result<()>;
}

/// What kind of device file a checkpointed handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFile {
    Kfd,
    RenderNode { minor: u32 },
}

/// Local device discovery and handle management.
pub trait Platform: Sync {
    /// The host's notion of an open file (a raw fd on Linux).
    type Handle;
    type Kfd: KfdDevice;

    fn classify(&self, handle: &Self::Handle) -> Result<DeviceFile>;

    /// Driver access through a handle owned by the host.
    fn attach_kfd(&self, handle: &Self::Handle) -> Result<Self::Kfd>;

    /// Open a fresh driver handle for restore or resume.
    fn open_kfd(&self) -> Result<Self::Kfd>;

    /// Give up ownership of a driver handle to the host.
    fn into_handle(&self, kfd: Self::Kfd) -> Self::Handle;

    /// Open a render node as a host handle for a restored render-node file.
    fn open_render_handle(&self, node: &TopologyNode) -> Result<Self::Handle>;

    /// Enumerate the local topology with io-links validated.
    fn local_topology(&self, label: &'static str) -> Result<Topology>;

    fn open_render_node(&self, node: &TopologyNode) -> Result<Arc<dyn RenderDevice>>;
}
