//! Local topology discovery from the compute driver's sysfs tree.
//!
//! ```text
//! <root>/nodes/<n>/gpu_id
//! <root>/nodes/<n>/properties            "key value" lines
//! <root>/nodes/<n>/mem_banks/<m>/properties
//! <root>/nodes/<n>/io_links/<m>/properties
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use gpucr::{GpuProperties, NodeId, Topology, TopologyNode};

use crate::error::{KfdError, Result};

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/kfd/kfd/topology";

const HEAP_TYPE_FB_PUBLIC: u64 = 1;
const HEAP_TYPE_FB_PRIVATE: u64 = 2;

type Properties = HashMap<String, u64>;

fn read_properties(path: &Path) -> Result<Properties> {
    let text = fs::read_to_string(path).map_err(|e| KfdError::sysfs(path, e.to_string()))?;
    let mut props = Properties::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        match value.parse::<u64>() {
            Ok(v) => {
                props.insert(key.to_string(), v);
            }
            Err(_) => tracing::trace!(path = %path.display(), key, value, "non-numeric property"),
        }
    }
    Ok(props)
}

/// Numeric subdirectories of `dir` in ascending order. A missing directory
/// has no entries.
fn numbered_entries(dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let rd = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(KfdError::sysfs(dir, e.to_string())),
    };
    let mut out = Vec::new();
    for entry in rd {
        let entry = entry.map_err(|e| KfdError::sysfs(dir, e.to_string()))?;
        if let Some(n) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) {
            out.push((n, entry.path()));
        }
    }
    out.sort_by_key(|(n, _)| *n);
    Ok(out)
}

fn get_u32(props: &Properties, key: &str) -> u32 {
    props.get(key).copied().unwrap_or(0) as u32
}

fn gpu_properties(props: &Properties) -> GpuProperties {
    GpuProperties {
        simd_count: get_u32(props, "simd_count"),
        mem_banks_count: get_u32(props, "mem_banks_count"),
        caches_count: get_u32(props, "caches_count"),
        io_links_count: get_u32(props, "io_links_count"),
        max_waves_per_simd: get_u32(props, "max_waves_per_simd"),
        lds_size_in_kb: get_u32(props, "lds_size_in_kb"),
        num_gws: get_u32(props, "num_gws"),
        wave_front_size: get_u32(props, "wave_front_size"),
        array_count: get_u32(props, "array_count"),
        simd_arrays_per_engine: get_u32(props, "simd_arrays_per_engine"),
        cu_per_simd_array: get_u32(props, "cu_per_simd_array"),
        simd_per_cu: get_u32(props, "simd_per_cu"),
        max_slots_scratch_cu: get_u32(props, "max_slots_scratch_cu"),
        vendor_id: get_u32(props, "vendor_id"),
        device_id: get_u32(props, "device_id"),
        domain: get_u32(props, "domain"),
        drm_render_minor: get_u32(props, "drm_render_minor"),
        hive_id: props.get("hive_id").copied().unwrap_or(0),
        num_sdma_engines: get_u32(props, "num_sdma_engines"),
        num_sdma_xgmi_engines: get_u32(props, "num_sdma_xgmi_engines"),
        num_sdma_queues_per_engine: get_u32(props, "num_sdma_queues_per_engine"),
        num_cp_queues: get_u32(props, "num_cp_queues"),
        fw_version: get_u32(props, "fw_version"),
        capability: get_u32(props, "capability"),
        sdma_fw_version: get_u32(props, "sdma_fw_version"),
        vram_public: 0,
        vram_size: 0,
    }
}

/// Reader for one sysfs topology tree.
#[derive(Debug, Clone)]
pub struct SysfsTopology {
    root: PathBuf,
}

impl Default for SysfsTopology {
    fn default() -> Self {
        Self::new(DEFAULT_SYSFS_ROOT)
    }
}

impl SysfsTopology {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parse every node and io-link, then validate links and assign NUMA
    /// domains.
    pub fn read(&self, label: &'static str) -> Result<Topology> {
        let nodes_dir = self.root.join("nodes");
        let nodes = numbered_entries(&nodes_dir)?;
        if nodes.is_empty() {
            return Err(KfdError::sysfs(nodes_dir, "no topology nodes"));
        }

        let mut topology = Topology::new(label);
        let mut links: Vec<(NodeId, u32, NodeId)> = Vec::new();
        for (id, dir) in nodes {
            let node = self.read_node(id, &dir)?;
            tracing::debug!(
                topology = label,
                node = id,
                gpu_id = node.gpu_id,
                minor = node.gpu.drm_render_minor,
                "sysfs node"
            );
            topology.add_node(node)?;

            for (_, link_dir) in numbered_entries(&dir.join("io_links"))? {
                let props = read_properties(&link_dir.join("properties"))?;
                let to = props
                    .get("node_to")
                    .copied()
                    .ok_or_else(|| KfdError::sysfs(&link_dir, "io-link without node_to"))?;
                links.push((id, get_u32(&props, "type"), to as NodeId));
            }
        }
        for (from, kind, to) in links {
            topology.add_io_link(from, kind, to)?;
        }

        let dropped = topology.validate_io_links();
        if dropped > 0 {
            tracing::debug!(topology = label, dropped, "io-links excluded");
        }
        topology.assign_numa_domains();
        tracing::info!(
            topology = label,
            nodes = topology.num_nodes(),
            gpus = topology.num_gpus(),
            "topology parsed"
        );
        Ok(topology)
    }

    fn read_node(&self, id: NodeId, dir: &Path) -> Result<TopologyNode> {
        let gpu_id_path = dir.join("gpu_id");
        let gpu_id = fs::read_to_string(&gpu_id_path)
            .map_err(|e| KfdError::sysfs(&gpu_id_path, e.to_string()))?
            .trim()
            .parse::<u32>()
            .map_err(|e| KfdError::sysfs(&gpu_id_path, e.to_string()))?;
        let props = read_properties(&dir.join("properties"))?;

        if gpu_id == 0 {
            return Ok(TopologyNode::cpu(id, get_u32(&props, "cpu_cores_count")));
        }

        let mut gpu = gpu_properties(&props);
        for (_, bank) in numbered_entries(&dir.join("mem_banks"))? {
            let bank_props = read_properties(&bank.join("properties"))?;
            let heap = bank_props.get("heap_type").copied().unwrap_or(0);
            let size = bank_props.get("size_in_bytes").copied().unwrap_or(0);
            match heap {
                HEAP_TYPE_FB_PUBLIC => {
                    gpu.vram_public = 1;
                    gpu.vram_size += size;
                }
                HEAP_TYPE_FB_PRIVATE => gpu.vram_size += size,
                _ => {}
            }
        }
        let mut node = TopologyNode::gpu(id, gpu_id, gpu);
        node.cpu_cores_count = get_u32(&props, "cpu_cores_count");
        Ok(node)
    }
}
