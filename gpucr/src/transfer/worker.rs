use super::Direction;
use crate::config::TransferConfig;
use crate::device::{BoHandle, CopyEngine, MapAccess, ProcessMemory, RenderDevice};
use crate::error::{GpuCrError, Result};
use crate::host::Host;
use crate::protocol::BoSlot;
use crate::types::{AllocFlags, GpuId, Pid};

/// What one worker did, by path taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub gpu_id: GpuId,
    /// Buffers owned by this GPU, device-backed or not.
    pub buffers: usize,
    pub hardware: usize,
    /// Fallback through a CPU mapping of the render node.
    pub mapped: usize,
    /// Fallback through the process's memory image.
    pub indirect: usize,
}

pub(super) struct Worker<'a> {
    pub gpu_id: GpuId,
    pub direction: Direction,
    pub device: &'a dyn RenderDevice,
    pub config: &'a TransferConfig,
    pub host: &'a dyn Host,
    pub pid: Pid,
}

impl Worker<'_> {
    pub fn run(self, bos: Vec<&mut BoSlot>) -> Result<WorkerStats> {
        let mut stats = WorkerStats {
            gpu_id: self.gpu_id,
            buffers: bos.len(),
            ..Default::default()
        };
        let mut memory: Option<Box<dyn ProcessMemory>> = None;

        for slot in bos {
            if !slot.record.flags().is_device_backed() {
                continue;
            }
            match self.direction {
                Direction::Dump => self.dump_one(slot, &mut memory, &mut stats)?,
                Direction::Restore => self.restore_one(slot, &mut memory, &mut stats)?,
            }
        }
        Ok(stats)
    }

    fn size_of(&self, slot: &BoSlot) -> Result<usize> {
        usize::try_from(slot.record.size).map_err(|_| GpuCrError::ResourceExhaustion {
            what: "bo contents",
            bytes: usize::MAX,
        })
    }

    fn memory<'m>(
        &self,
        memory: &'m mut Option<Box<dyn ProcessMemory>>,
    ) -> Result<&'m dyn ProcessMemory> {
        if memory.is_none() {
            let writable = self.direction == Direction::Restore;
            *memory = Some(self.host.open_process_memory(self.pid, writable)?);
        }
        match memory.as_deref() {
            Some(m) => Ok(m),
            None => Err(GpuCrError::device("process memory unavailable")),
        }
    }

    /// Try the copy engine. `Ok(false)` means the caller should fall back.
    fn try_hardware(
        &self,
        slot: &BoSlot,
        op: impl FnOnce(&BoHandle, &dyn CopyEngine) -> Result<()>,
    ) -> Result<bool> {
        if !self.config.hardware_copy || slot.dmabuf_fd < 0 {
            return Ok(false);
        }
        let Some(engine) = self.device.copy_engine() else {
            return Ok(false);
        };
        let handle = BoHandle {
            dmabuf_fd: slot.dmabuf_fd,
            size: slot.record.size,
        };
        match op(&handle, engine) {
            Ok(()) => Ok(true),
            Err(e) if e.is_recoverable() => {
                tracing::warn!(
                    gpu_id = format_args!("0x{:04x}", self.gpu_id),
                    addr = format_args!("0x{:x}", slot.record.addr),
                    "hardware copy failed, falling back: {e}"
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn dump_one(
        &self,
        slot: &mut BoSlot,
        memory: &mut Option<Box<dyn ProcessMemory>>,
        stats: &mut WorkerStats,
    ) -> Result<()> {
        let size = self.size_of(slot)?;
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| GpuCrError::ResourceExhaustion {
                what: "bo contents",
                bytes: size,
            })?;
        data.resize(size, 0);

        if self.try_hardware(slot, |bo, engine| engine.read(bo, &mut data))? {
            stats.hardware += 1;
        } else if slot.record.flags().contains(AllocFlags::PUBLIC) {
            let region = self.device.map(slot.record.offset, size, MapAccess::Read)?;
            region.read(&mut data)?;
            stats.mapped += 1;
        } else {
            self.memory(memory)?.read_at(slot.record.addr, &mut data)?;
            stats.indirect += 1;
        }

        tracing::debug!(
            gpu_id = format_args!("0x{:04x}", self.gpu_id),
            addr = format_args!("0x{:x}", slot.record.addr),
            size,
            "captured bo contents"
        );
        slot.record.rawdata = Some(data);
        Ok(())
    }

    fn restore_one(
        &self,
        slot: &mut BoSlot,
        memory: &mut Option<Box<dyn ProcessMemory>>,
        stats: &mut WorkerStats,
    ) -> Result<()> {
        let size = self.size_of(slot)?;
        let Some(data) = slot.record.rawdata.as_deref() else {
            return Err(GpuCrError::invalid(format!(
                "device-backed bo at 0x{:x} has no contents",
                slot.record.addr
            )));
        };
        if data.len() != size {
            return Err(GpuCrError::invalid(format!(
                "bo at 0x{:x} has {} content bytes, expected {size}",
                slot.record.addr,
                data.len()
            )));
        }

        if self.try_hardware(slot, |bo, engine| engine.write(bo, data))? {
            stats.hardware += 1;
        } else if slot.record.flags().contains(AllocFlags::PUBLIC) {
            let mut region = self.device.map(slot.restored_offset, size, MapAccess::Write)?;
            region.write(data)?;
            stats.mapped += 1;
        } else {
            // Reserve the buffer inaccessibly in our address space and write
            // it through the memory image, which bypasses page protections.
            let region = self.device.map(slot.restored_offset, size, MapAccess::None)?;
            self.memory(memory)?.write_at(region.addr(), data)?;
            stats.indirect += 1;
        }

        tracing::debug!(
            gpu_id = format_args!("0x{:04x}", self.gpu_id),
            addr = format_args!("0x{:x}", slot.record.addr),
            size,
            "restored bo contents"
        );
        Ok(())
    }
}
