//! In-memory model of a host's compute topology: CPU and GPU nodes plus the
//! io-links between them.
//!
//! One `Topology` is built for the checkpoint host and another for the restore
//! host. They are independent snapshots and are never merged.

mod matching;

pub use matching::{first_incompatibility, match_gpus};

use crate::error::{GpuCrError, Result};
use crate::types::{GpuId, NodeId};
use indexmap::IndexMap;

/// GPU capability attributes. Zeroed on CPU nodes.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuProperties {
    pub simd_count: u32,
    pub mem_banks_count: u32,
    pub caches_count: u32,
    pub io_links_count: u32,
    pub max_waves_per_simd: u32,
    pub lds_size_in_kb: u32,
    pub num_gws: u32,
    pub wave_front_size: u32,
    pub array_count: u32,
    pub simd_arrays_per_engine: u32,
    pub cu_per_simd_array: u32,
    pub simd_per_cu: u32,
    pub max_slots_scratch_cu: u32,
    pub vendor_id: u32,
    pub device_id: u32,
    pub domain: u32,
    pub drm_render_minor: u32,
    pub hive_id: u64,
    pub num_sdma_engines: u32,
    pub num_sdma_xgmi_engines: u32,
    pub num_sdma_queues_per_engine: u32,
    pub num_cp_queues: u32,
    pub fw_version: u32,
    pub capability: u32,
    pub sdma_fw_version: u32,
    pub vram_public: u32,
    pub vram_size: u64,
}

/// A link from one node to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoLink {
    /// Link type as reported by the driver (PCIe, XGMI, ...).
    pub kind: u32,
    pub node_to: NodeId,
    /// Cleared by [`Topology::validate_io_links`] when the link fails the
    /// consistency check. Invalid links are never written to an image.
    pub valid: bool,
}

/// One CPU or GPU node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyNode {
    pub id: NodeId,
    /// Non-zero for GPU nodes.
    pub gpu_id: GpuId,
    pub cpu_cores_count: u32,
    pub gpu: GpuProperties,
    /// NUMA domain of the node. For GPUs this is the CPU node they hang off.
    pub numa_domain: Option<u32>,
    pub io_links: Vec<IoLink>,
}

impl TopologyNode {
    pub fn cpu(id: NodeId, cpu_cores_count: u32) -> Self {
        Self {
            id,
            cpu_cores_count,
            numa_domain: Some(id),
            ..Self::default()
        }
    }

    pub fn gpu(id: NodeId, gpu_id: GpuId, gpu: GpuProperties) -> Self {
        Self {
            id,
            gpu_id,
            gpu,
            ..Self::default()
        }
    }

    pub fn is_gpu(&self) -> bool {
        self.gpu_id != 0
    }

    pub fn valid_io_links(&self) -> impl Iterator<Item = &IoLink> {
        self.io_links.iter().filter(|l| l.valid)
    }
}

/// Node graph for one host, in enumeration order.
#[derive(Debug, Clone)]
pub struct Topology {
    label: &'static str,
    nodes: IndexMap<NodeId, TopologyNode>,
}

impl Topology {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            nodes: IndexMap::new(),
        }
    }

    /// Short name for log lines ("checkpoint", "local", ...).
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn add_node(&mut self, node: TopologyNode) -> Result<&mut TopologyNode> {
        if self.nodes.contains_key(&node.id) {
            return Err(GpuCrError::Topology {
                reason: format!("{}: duplicate node {}", self.label, node.id),
            });
        }
        if node.is_gpu() && self.by_gpu_id(node.gpu_id).is_some() {
            return Err(GpuCrError::Topology {
                reason: format!("{}: duplicate gpu_id 0x{:04x}", self.label, node.gpu_id),
            });
        }
        let id = node.id;
        Ok(self.nodes.entry(id).or_insert(node))
    }

    /// Append an io-link to `node`. New links start out valid.
    pub fn add_io_link(&mut self, node: NodeId, kind: u32, node_to: NodeId) -> Result<()> {
        let label = self.label;
        let n = self.nodes.get_mut(&node).ok_or_else(|| GpuCrError::Topology {
            reason: format!("{label}: io-link from unknown node {node}"),
        })?;
        n.io_links.push(IoLink {
            kind,
            node_to,
            valid: true,
        });
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Option<&TopologyNode> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TopologyNode> {
        self.nodes.values()
    }

    /// GPU nodes in enumeration order.
    pub fn gpus(&self) -> impl Iterator<Item = &TopologyNode> {
        self.nodes.values().filter(|n| n.is_gpu())
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_gpus(&self) -> usize {
        self.gpus().count()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn by_gpu_id(&self, gpu_id: GpuId) -> Option<&TopologyNode> {
        if gpu_id == 0 {
            return None;
        }
        self.nodes.values().find(|n| n.gpu_id == gpu_id)
    }

    pub fn by_render_minor(&self, minor: u32) -> Option<&TopologyNode> {
        self.gpus().find(|n| n.gpu.drm_render_minor == minor)
    }

    /// The `index`-th GPU in enumeration order.
    pub fn gpu_by_index(&self, index: usize) -> Option<&TopologyNode> {
        self.gpus().nth(index)
    }

    /// Mark io-links invalid when their destination does not exist or does
    /// not link back. Returns the number of links invalidated.
    pub fn validate_io_links(&mut self) -> usize {
        let mut verdicts: Vec<(NodeId, usize, bool)> = Vec::new();
        for node in self.nodes.values() {
            for (i, link) in node.io_links.iter().enumerate() {
                let reverse = self
                    .nodes
                    .get(&link.node_to)
                    .is_some_and(|peer| peer.io_links.iter().any(|l| l.node_to == node.id));
                verdicts.push((node.id, i, reverse));
            }
        }

        let mut invalidated = 0;
        for (node_id, idx, ok) in verdicts {
            if let Some(node) = self.nodes.get_mut(&node_id) {
                let link = &mut node.io_links[idx];
                if !ok && link.valid {
                    tracing::debug!(
                        topology = self.label,
                        from = node_id,
                        to = link.node_to,
                        "io-link has no valid peer, excluding"
                    );
                    invalidated += 1;
                }
                link.valid = ok;
            }
        }
        invalidated
    }

    /// Fill in each GPU's NUMA domain from its first valid link to a CPU node,
    /// unless the domain is already known.
    pub fn assign_numa_domains(&mut self) {
        let cpu_ids: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| !n.is_gpu())
            .map(|n| n.id)
            .collect();
        for node in self.nodes.values_mut().filter(|n| n.is_gpu()) {
            if node.numa_domain.is_some() {
                continue;
            }
            node.numa_domain = node
                .io_links
                .iter()
                .filter(|l| l.valid)
                .find(|l| cpu_ids.contains(&l.node_to))
                .map(|l| l.node_to);
        }
    }
}
