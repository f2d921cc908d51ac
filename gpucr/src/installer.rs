//! Restore side of the device protocol.
//!
//! Matches the checkpointed GPUs onto local ones, then replays each object
//! class into a fresh driver handle with gpu ids translated user→actual.
//! Matching happens before the first ioctl, so an incompatible host leaves
//! the driver untouched.

use crate::collector::RenderOpener;
use crate::config::GpuCrConfig;
use crate::device::KfdDevice;
use crate::error::{GpuCrError, Result};
use crate::host::Host;
use crate::identity::GpuIdMap;
use crate::protocol::{BoSlot, DeviceSlot, Phase, WireRecord, decode_into, encode};
use crate::records::{BoRecord, KfdImage, ProcessRecord};
use crate::relocation::{VmaRelocation, VmaRelocationTable};
use crate::topology::{Topology, match_gpus};
use crate::transfer::{DeviceTable, Direction, TransferEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    Idle,
    Mapped,
    WroteProcess,
    WroteDevices,
    WroteBos,
    WroteQueues,
    WroteEvents,
    Restored,
    Failed,
}

pub struct DeviceStateInstaller<'a> {
    kfd: &'a dyn KfdDevice,
    /// Topology rebuilt from the image, user gpu ids.
    src: &'a Topology,
    /// Local topology, actual gpu ids.
    dest: &'a Topology,
    config: &'a GpuCrConfig,
    host: &'a dyn Host,
    open_render: RenderOpener<'a>,
    state: RestoreState,
}

impl<'a> DeviceStateInstaller<'a> {
    pub fn new(
        kfd: &'a dyn KfdDevice,
        src: &'a Topology,
        dest: &'a Topology,
        config: &'a GpuCrConfig,
        host: &'a dyn Host,
        open_render: RenderOpener<'a>,
    ) -> Self {
        Self {
            kfd,
            src,
            dest,
            config,
            host,
            open_render,
            state: RestoreState::Idle,
        }
    }

    pub fn state(&self) -> RestoreState {
        self.state
    }

    fn enter(&mut self, state: RestoreState) {
        tracing::debug!(from = ?self.state, to = ?state, "restore state");
        self.state = state;
    }

    /// Re-create everything in `image`. `restore_map` receives the
    /// user→actual pairs; `relocations` an entry per device-file mapping.
    pub fn restore(
        &mut self,
        image: KfdImage,
        restore_map: &mut GpuIdMap,
        relocations: &mut VmaRelocationTable,
    ) -> Result<()> {
        match self.install(image, restore_map, relocations) {
            Ok(()) => {
                self.enter(RestoreState::Restored);
                Ok(())
            }
            Err(e) => {
                self.enter(RestoreState::Failed);
                tracing::error!("restore failed: {e}");
                Err(e)
            }
        }
    }

    fn install(
        &mut self,
        image: KfdImage,
        restore_map: &mut GpuIdMap,
        relocations: &mut VmaRelocationTable,
    ) -> Result<()> {
        *restore_map = match_gpus(self.src, self.dest, &self.config.checks)?;
        let devices = self.render_devices(restore_map)?;
        self.enter(RestoreState::Mapped);

        let KfdImage {
            process,
            devices: device_records,
            bos,
            queues,
            events,
            shared_mem,
            ..
        } = image;
        let pid = process.pid;

        self.submit::<ProcessRecord>(&[process], None)?;
        self.enter(RestoreState::WroteProcess);

        let mut slots = Vec::with_capacity(device_records.len());
        for record in device_records.into_iter().filter(|d| d.is_gpu()) {
            let actual_gpu_id = restore_map.resolve(record.gpu_id)?;
            slots.push(DeviceSlot {
                user_gpu_id: record.gpu_id,
                actual_gpu_id,
                drm_fd: devices
                    .get(&record.gpu_id)
                    .ok_or(GpuCrError::UnmappedGpu { gpu_id: record.gpu_id })?
                    .raw_handle(),
                private: record.private,
            });
        }
        self.submit(&slots, None)?;
        drop(slots);
        self.enter(RestoreState::WroteDevices);

        self.restore_bos(bos, pid, restore_map, &devices, relocations)?;
        self.enter(RestoreState::WroteBos);

        self.submit(&queues, Some(restore_map))?;
        drop(queues);
        self.enter(RestoreState::WroteQueues);

        self.submit(&events, Some(restore_map))?;
        self.enter(RestoreState::WroteEvents);

        self.host.recreate_shared_memory(&shared_mem)?;
        Ok(())
    }

    /// Open the mapped local render node for every checkpointed gpu, keyed
    /// by user id.
    fn render_devices(&self, restore_map: &GpuIdMap) -> Result<DeviceTable> {
        let mut devices = DeviceTable::new();
        for (user, actual) in restore_map.iter() {
            let node = self
                .dest
                .by_gpu_id(actual)
                .ok_or(GpuCrError::UnmappedGpu { gpu_id: actual })?;
            devices.insert(user, (self.open_render)(node)?);
        }
        Ok(devices)
    }

    /// One restore ioctl for class `R`. Input fields only.
    fn submit<R: WireRecord>(&self, records: &[R], ids: Option<&GpuIdMap>) -> Result<()> {
        let mut array = encode(records, Phase::RESTORE_IN, ids)?;
        self.kfd.restore_objects(&mut array)?;
        tracing::debug!(class = R::CLASS.name(), count = records.len(), "restored objects");
        Ok(())
    }

    fn restore_bos(
        &self,
        bos: Vec<BoRecord>,
        pid: u32,
        restore_map: &GpuIdMap,
        devices: &DeviceTable,
        relocations: &mut VmaRelocationTable,
    ) -> Result<()> {
        let mut slots: Vec<BoSlot> = bos.into_iter().map(BoSlot::new).collect();
        {
            let mut array = encode(&slots, Phase::RESTORE_IN, Some(restore_map))?;
            self.kfd.restore_objects(&mut array)?;
            decode_into(&array, &mut slots, Phase::RESTORE_OUT, None)?;
        }
        tracing::debug!(count = slots.len(), "restored buffer objects");

        for slot in slots.iter().filter(|s| s.record.flags().needs_relocation()) {
            let actual = restore_map.resolve(slot.gpu_id())?;
            let node = self
                .dest
                .by_gpu_id(actual)
                .ok_or(GpuCrError::UnmappedGpu { gpu_id: actual })?;
            relocations.record(VmaRelocation {
                addr: slot.record.addr,
                old_offset: slot.record.offset,
                new_offset: slot.restored_offset,
                new_minor: node.gpu.drm_render_minor,
            })?;
        }

        let transferred = TransferEngine::new(&self.config.transfer, self.host, pid)
            .run(Direction::Restore, &mut slots, devices);
        for slot in &slots {
            if slot.dmabuf_fd >= 0 {
                self.kfd.release_dmabuf(slot.dmabuf_fd);
            }
        }
        transferred?;
        Ok(())
    }
}
