//! Greedy assignment of checkpointed GPUs to local GPUs.
//!
//! For each source GPU, in source enumeration order, the first unclaimed
//! destination GPU that passes the compatibility predicate is claimed. The
//! result depends on enumeration order: with several interchangeable GPUs the
//! first-fit assignment wins, and no global optimum is searched for.

use super::{GpuProperties, Topology, TopologyNode};
use crate::config::MatchChecks;
use crate::error::{GpuCrError, Result};
use crate::identity::GpuIdMap;

/// Name of the first property that rules out restoring `src` onto `dest`,
/// or `None` if the two are compatible.
pub fn first_incompatibility(
    src: &TopologyNode,
    dest: &TopologyNode,
    checks: &MatchChecks,
) -> Option<&'static str> {
    if let Some(field) = mandatory_mismatch(&src.gpu, &dest.gpu) {
        return Some(field);
    }

    let (s, d) = (&src.gpu, &dest.gpu);
    if checks.fw_version && s.fw_version != d.fw_version {
        return Some("fw_version");
    }
    if checks.sdma_fw_version && s.sdma_fw_version != d.sdma_fw_version {
        return Some("sdma_fw_version");
    }
    if checks.caches_count && s.caches_count != d.caches_count {
        return Some("caches_count");
    }
    if checks.num_gws && s.num_gws != d.num_gws {
        return Some("num_gws");
    }
    if checks.vram_size && s.vram_size != d.vram_size {
        return Some("vram_size");
    }
    if checks.numa
        && let (Some(a), Some(b)) = (src.numa_domain, dest.numa_domain)
        && a != b
    {
        return Some("numa_domain");
    }
    None
}

/// Structural properties that must always agree.
fn mandatory_mismatch(s: &GpuProperties, d: &GpuProperties) -> Option<&'static str> {
    macro_rules! require_eq {
        ($($field:ident),+ $(,)?) => {
            $(
                if s.$field != d.$field {
                    return Some(stringify!($field));
                }
            )+
        };
    }
    require_eq!(
        simd_count,
        mem_banks_count,
        io_links_count,
        max_waves_per_simd,
        lds_size_in_kb,
        wave_front_size,
        array_count,
        simd_arrays_per_engine,
        cu_per_simd_array,
        simd_per_cu,
        max_slots_scratch_cu,
        vendor_id,
        device_id,
        num_sdma_engines,
        num_sdma_xgmi_engines,
        num_sdma_queues_per_engine,
        num_cp_queues,
        capability,
    );
    None
}

/// Build the restore map (checkpointed gpu_id → local gpu_id).
///
/// Fails with `DeviceMapping` if any checkpointed GPU has no compatible,
/// unclaimed local GPU.
pub fn match_gpus(src: &Topology, dest: &Topology, checks: &MatchChecks) -> Result<GpuIdMap> {
    let src_gpus = src.num_gpus();
    let dest_gpus = dest.num_gpus();
    if src_gpus > dest_gpus {
        return Err(GpuCrError::mapping(format!(
            "{} has {src_gpus} gpus but {} only has {dest_gpus}",
            src.label(),
            dest.label()
        )));
    }

    let mut map = GpuIdMap::new();
    let mut claimed = vec![false; dest.num_nodes()];

    for s in src.gpus() {
        let mut chosen = None;
        for (idx, d) in dest.nodes().enumerate() {
            if !d.is_gpu() || claimed[idx] {
                continue;
            }
            match first_incompatibility(s, d, checks) {
                None => {
                    chosen = Some((idx, d));
                    break;
                }
                Some(field) => tracing::debug!(
                    src_gpu = format_args!("0x{:04x}", s.gpu_id),
                    dest_gpu = format_args!("0x{:04x}", d.gpu_id),
                    field,
                    "gpu not compatible"
                ),
            }
        }

        let (idx, d) = chosen.ok_or_else(|| {
            GpuCrError::mapping(format!(
                "no compatible {} gpu for {} gpu 0x{:04x} (node {})",
                dest.label(),
                src.label(),
                s.gpu_id,
                s.id
            ))
        })?;
        claimed[idx] = true;
        map.insert(s.gpu_id, d.gpu_id)?;
        tracing::info!(
            src_gpu = format_args!("0x{:04x}", s.gpu_id),
            dest_gpu = format_args!("0x{:04x}", d.gpu_id),
            "mapped gpu"
        );
    }

    Ok(map)
}
