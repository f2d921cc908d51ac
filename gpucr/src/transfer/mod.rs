//! Buffer content transfer engine.
//!
//! Moves the bytes of every device-backed buffer between GPU memory and its
//! record. One scoped thread runs per GPU that owns at least one buffer; the
//! buffers are split into per-GPU groups of `&mut BoSlot` before any thread
//! starts, so no two workers can reach the same record.
//!
//! A failing worker does not stop its siblings. Every thread is joined before
//! the engine reports which GPUs failed.

mod worker;

use std::sync::Arc;

use indexmap::IndexMap;

use crate::config::TransferConfig;
use crate::device::RenderDevice;
use crate::error::{GpuCrError, Result};
use crate::host::Host;
use crate::protocol::BoSlot;
use crate::types::{GpuId, Pid};

use worker::Worker;
pub use worker::WorkerStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device memory → record.
    Dump,
    /// Record → device memory.
    Restore,
}

impl Direction {
    pub fn name(self) -> &'static str {
        match self {
            Direction::Dump => "dump",
            Direction::Restore => "restore",
        }
    }
}

/// Render device for each gpu id found in the buffer records.
pub type DeviceTable = IndexMap<GpuId, Arc<dyn RenderDevice>>;

pub struct TransferEngine<'a> {
    config: &'a TransferConfig,
    host: &'a dyn Host,
    pid: Pid,
}

impl<'a> TransferEngine<'a> {
    pub fn new(config: &'a TransferConfig, host: &'a dyn Host, pid: Pid) -> Self {
        Self { config, host, pid }
    }

    /// Run one worker per GPU over `slots` and wait for all of them.
    ///
    /// `devices` is keyed by the gpu id stored in `slot.record.gpu_id`.
    pub fn run(
        &self,
        direction: Direction,
        slots: &mut [BoSlot],
        devices: &DeviceTable,
    ) -> Result<Vec<WorkerStats>> {
        let mut groups: IndexMap<GpuId, Vec<&mut BoSlot>> = IndexMap::new();
        for slot in slots.iter_mut() {
            let gpu = slot.gpu_id();
            if !devices.contains_key(&gpu) {
                return Err(GpuCrError::UnmappedGpu { gpu_id: gpu });
            }
            groups.entry(gpu).or_default().push(slot);
        }
        if groups.is_empty() {
            return Ok(Vec::new());
        }

        tracing::info!(
            direction = direction.name(),
            workers = groups.len(),
            hardware_copy = self.config.hardware_copy,
            "starting buffer transfer"
        );

        let outcomes: Vec<(GpuId, Result<WorkerStats>)> = std::thread::scope(|s| {
            let mut handles = Vec::with_capacity(groups.len());
            for (gpu, bos) in groups {
                let worker = Worker {
                    gpu_id: gpu,
                    direction,
                    device: devices[&gpu].as_ref(),
                    config: self.config,
                    host: self.host,
                    pid: self.pid,
                };
                let spawned = std::thread::Builder::new()
                    .name(format!("gpucr-xfer-{gpu:04x}"))
                    .spawn_scoped(s, move || worker.run(bos));
                handles.push((gpu, spawned));
            }

            handles
                .into_iter()
                .map(|(gpu, spawned)| {
                    let outcome = match spawned {
                        Ok(handle) => handle.join().unwrap_or_else(|_| {
                            Err(GpuCrError::transfer(gpu, "worker thread panicked"))
                        }),
                        Err(e) => Err(GpuCrError::Transfer {
                            gpu_id: gpu,
                            message: "failed to spawn worker".into(),
                            source: Some(Box::new(e)),
                        }),
                    };
                    (gpu, outcome)
                })
                .collect()
        });

        let mut stats = Vec::with_capacity(outcomes.len());
        let mut failed = Vec::new();
        for (gpu, outcome) in outcomes {
            match outcome {
                Ok(s) => {
                    tracing::info!(
                        gpu_id = format_args!("0x{gpu:04x}"),
                        buffers = s.buffers,
                        hardware = s.hardware,
                        mapped = s.mapped,
                        indirect = s.indirect,
                        "worker finished"
                    );
                    stats.push(s);
                }
                Err(e) => {
                    tracing::error!(gpu_id = format_args!("0x{gpu:04x}"), "worker failed: {e}");
                    failed.push(gpu);
                }
            }
        }

        if failed.is_empty() {
            Ok(stats)
        } else {
            Err(GpuCrError::WorkersFailed { gpus: failed })
        }
    }
}
