//! Portable records written to checkpoint images.
//!
//! Every gpu id stored here is a user id. Host-local ids never leave the
//! collector or installer.

use crate::error::{GpuCrError, Result};
use crate::topology::{GpuProperties, IoLink, Topology, TopologyNode};
use crate::types::{AllocFlags, GpuId, NodeId, event_type};

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub private: Vec<u8>,
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoLinkRecord {
    pub kind: u32,
    pub node_to: NodeId,
}

/// One topology node. GPU nodes carry the driver's private payload; CPU
/// nodes have `gpu_id == 0` and only a core count.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DeviceRecord {
    pub node_id: NodeId,
    pub gpu_id: GpuId,
    pub cpu_cores_count: u32,
    pub gpu: GpuProperties,
    pub numa_domain: Option<u32>,
    pub io_links: Vec<IoLinkRecord>,
    pub private: Vec<u8>,
}

impl DeviceRecord {
    pub fn is_gpu(&self) -> bool {
        self.gpu_id != 0
    }

    /// Portable record for `node`, with `gpu_id` already translated to a
    /// user id. Invalid io-links are dropped.
    pub fn from_node(node: &TopologyNode, gpu_id: GpuId) -> Self {
        Self {
            node_id: node.id,
            gpu_id,
            cpu_cores_count: node.cpu_cores_count,
            gpu: node.gpu.clone(),
            numa_domain: node.numa_domain,
            io_links: node
                .valid_io_links()
                .map(|l| IoLinkRecord {
                    kind: l.kind,
                    node_to: l.node_to,
                })
                .collect(),
            private: Vec::new(),
        }
    }

    pub fn to_node(&self) -> TopologyNode {
        TopologyNode {
            id: self.node_id,
            gpu_id: self.gpu_id,
            cpu_cores_count: self.cpu_cores_count,
            gpu: self.gpu.clone(),
            numa_domain: self.numa_domain,
            io_links: self
                .io_links
                .iter()
                .map(|l| IoLink {
                    kind: l.kind,
                    node_to: l.node_to,
                    valid: true,
                })
                .collect(),
        }
    }
}

/// Rebuild the checkpoint host's topology from its device records. Gpu ids
/// in the result are user ids.
pub fn topology_from_records(label: &'static str, devices: &[DeviceRecord]) -> Result<Topology> {
    if devices.is_empty() {
        return Err(GpuCrError::Topology {
            reason: format!("{label}: image has no device records"),
        });
    }
    let mut topology = Topology::new(label);
    for d in devices {
        topology.add_node(d.to_node())?;
    }
    Ok(topology)
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BoRecord {
    pub addr: u64,
    pub size: u64,
    pub offset: u64,
    pub gpu_id: GpuId,
    pub alloc_flags: u32,
    /// Buffer contents. Present exactly when the buffer is device-backed.
    pub rawdata: Option<Vec<u8>>,
    pub private: Vec<u8>,
}

impl BoRecord {
    pub fn flags(&self) -> AllocFlags {
        AllocFlags::from_bits_retain(self.alloc_flags)
    }
}

/// A user-mode queue. `data` holds the CU mask, MQD and control stack back to
/// back; their lengths are the three `*_size` fields.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Default, PartialEq)]
pub struct QueueRecord {
    pub gpu_id: GpuId,
    pub kind: u32,
    pub format: u32,
    pub q_id: u32,
    pub q_address: u64,
    pub q_size: u64,
    pub priority: u32,
    pub q_percent: u32,
    pub read_ptr_addr: u64,
    pub write_ptr_addr: u64,
    pub doorbell_id: u32,
    pub doorbell_off: u64,
    pub is_gws: u32,
    pub sdma_id: u32,
    pub eop_ring_buffer_address: u64,
    pub eop_ring_buffer_size: u32,
    pub ctx_save_restore_area_address: u64,
    pub ctx_save_restore_area_size: u32,
    pub ctl_stack_size: u32,
    pub cu_mask_size: u32,
    pub mqd_size: u32,
    pub data: Vec<u8>,
    pub private: Vec<u8>,
}

impl QueueRecord {
    /// Length of the three blobs in `data`.
    pub fn blobs_len(&self) -> usize {
        self.cu_mask_size as usize + self.mqd_size as usize + self.ctl_stack_size as usize
    }

    pub fn cu_mask(&self) -> &[u8] {
        let end = self.cu_mask_size as usize;
        self.data.get(..end).unwrap_or_default()
    }

    pub fn mqd(&self) -> &[u8] {
        let start = self.cu_mask_size as usize;
        let end = start + self.mqd_size as usize;
        self.data.get(start..end).unwrap_or_default()
    }

    pub fn ctl_stack(&self) -> &[u8] {
        let start = self.cu_mask_size as usize + self.mqd_size as usize;
        let end = start + self.ctl_stack_size as usize;
        self.data.get(start..end).unwrap_or_default()
    }
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EventRecord {
    pub event_id: u32,
    pub auto_reset: u32,
    pub kind: u32,
    pub signaled: u32,
    pub mem_exc_gpu_id: GpuId,
    pub mem_exc_va: u64,
    pub mem_exc_fail_not_present: bool,
    pub mem_exc_fail_read_only: bool,
    pub mem_exc_fail_no_execute: bool,
    pub hw_exc_gpu_id: GpuId,
    pub hw_exc_reset_type: u32,
    pub hw_exc_reset_cause: u32,
    pub hw_exc_memory_lost: u32,
    pub private: Vec<u8>,
}

impl EventRecord {
    pub fn is_memory_exception(&self) -> bool {
        self.kind == event_type::MEMORY
    }

    pub fn is_hw_exception(&self) -> bool {
        self.kind == event_type::HW_EXCEPTION
    }
}

/// Size and leading magic of the runtime's shared-memory segment.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SharedMemDescriptor {
    pub size: u64,
    pub magic: u32,
}

/// State of one compute-driver file descriptor.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Default, PartialEq)]
pub struct KfdImage {
    pub process: ProcessRecord,
    pub num_of_cpus: u32,
    pub num_of_gpus: u32,
    pub devices: Vec<DeviceRecord>,
    pub bos: Vec<BoRecord>,
    pub queues: Vec<QueueRecord>,
    pub events: Vec<EventRecord>,
    pub shared_mem: SharedMemDescriptor,
}

/// State of one render-node file descriptor.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderNodeRecord {
    pub gpu_id: GpuId,
}
