//! Dump side of the device protocol.
//!
//! Pauses the process's queues, pulls every object class out of the driver
//! in a fixed order, captures buffer contents and hands back one portable
//! [`KfdImage`]. The queues are restarted on every exit path.

use std::sync::Arc;

use crate::config::GpuCrConfig;
use crate::device::{KfdDevice, RenderDevice};
use crate::error::{GpuCrError, Result};
use crate::host::Host;
use crate::identity::GpuIdMap;
use crate::image::{ImageKind, encode_image};
use crate::protocol::{
    BoSlot, BucketArray, DeviceSlot, Phase, ProcessInfo, WireRecord, decode,
};
use crate::records::{
    BoRecord, DeviceRecord, EventRecord, KfdImage, ProcessRecord, QueueRecord,
};
use crate::topology::{Topology, TopologyNode};
use crate::transfer::{DeviceTable, Direction, TransferEngine};
use crate::types::ObjectClass;

/// Opens the render node backing a topology node.
pub type RenderOpener<'a> = &'a dyn Fn(&TopologyNode) -> Result<Arc<dyn RenderDevice>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpState {
    Idle,
    Paused,
    ReadProcess,
    ReadDevices,
    ReadBos,
    ReadQueues,
    ReadEvents,
    Unpaused,
    Serialized,
    Failed,
}

/// Restarts the queues if the dump bails out early.
struct PauseGuard<'a> {
    kfd: &'a dyn KfdDevice,
    armed: bool,
}

impl<'a> PauseGuard<'a> {
    fn pause(kfd: &'a dyn KfdDevice) -> Result<Self> {
        kfd.set_paused(true)?;
        Ok(Self { kfd, armed: true })
    }

    fn release(mut self) -> Result<()> {
        self.armed = false;
        self.kfd.set_paused(false)
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        if self.armed
            && let Err(e) = self.kfd.set_paused(false)
        {
            tracing::error!("failed to unpause after aborted dump: {e}");
        }
    }
}

pub struct DeviceStateCollector<'a> {
    kfd: &'a dyn KfdDevice,
    /// Local topology with host-local gpu ids.
    topology: &'a Topology,
    config: &'a GpuCrConfig,
    host: &'a dyn Host,
    open_render: RenderOpener<'a>,
    state: DumpState,
}

impl<'a> DeviceStateCollector<'a> {
    pub fn new(
        kfd: &'a dyn KfdDevice,
        topology: &'a Topology,
        config: &'a GpuCrConfig,
        host: &'a dyn Host,
        open_render: RenderOpener<'a>,
    ) -> Self {
        Self {
            kfd,
            topology,
            config,
            host,
            open_render,
            state: DumpState::Idle,
        }
    }

    pub fn state(&self) -> DumpState {
        self.state
    }

    fn enter(&mut self, state: DumpState) {
        tracing::debug!(from = ?self.state, to = ?state, "dump state");
        self.state = state;
    }

    /// Dump the device state and write it as image `id`. `checkpoint_map`
    /// receives the actual→user id pairs reported by the driver.
    pub fn dump(&mut self, id: u32, checkpoint_map: &mut GpuIdMap) -> Result<KfdImage> {
        let image = match self.collect(checkpoint_map) {
            Ok(image) => image,
            Err(e) => {
                self.enter(DumpState::Failed);
                tracing::error!(id, "dump failed: {e}");
                return Err(e);
            }
        };

        let written = encode_image(&image)
            .and_then(|bytes| self.host.write_image(&KfdImage::file_name(id), &bytes));
        if let Err(e) = written {
            self.enter(DumpState::Failed);
            return Err(e);
        }
        self.enter(DumpState::Serialized);
        tracing::info!(
            id,
            devices = image.devices.len(),
            bos = image.bos.len(),
            queues = image.queues.len(),
            events = image.events.len(),
            "dumped kfd state"
        );
        Ok(image)
    }

    fn collect(&mut self, checkpoint_map: &mut GpuIdMap) -> Result<KfdImage> {
        let guard = PauseGuard::pause(self.kfd)?;
        self.enter(DumpState::Paused);

        let outcome = self.read_all(checkpoint_map);
        // Unpause regardless; a read failure takes precedence.
        let unpaused = guard.release();
        self.enter(DumpState::Unpaused);
        let mut image = outcome?;
        unpaused?;

        image.shared_mem = self.host.shared_memory()?;
        Ok(image)
    }

    fn read_all(&mut self, checkpoint_map: &mut GpuIdMap) -> Result<KfdImage> {
        let info = self.kfd.process_info()?;
        tracing::info!(
            pid = info.task_pid,
            devices = info.total_devices,
            bos = info.total_bos,
            queues = info.total_queues,
            events = info.total_events,
            "process info"
        );

        self.enter(DumpState::ReadProcess);
        let mut process = self.exchange::<ProcessRecord>(&info, None)?;
        let mut process = match process.len() {
            1 => process.remove(0),
            n => {
                return Err(GpuCrError::MalformedBuckets {
                    class: ObjectClass::Process,
                    reason: format!("expected one process bucket, got {n}"),
                });
            }
        };
        process.pid = info.task_pid;

        self.enter(DumpState::ReadDevices);
        let devices = self.read_devices(&info, checkpoint_map)?;

        self.enter(DumpState::ReadBos);
        let bos = self.read_bos(&info, checkpoint_map)?;

        self.enter(DumpState::ReadQueues);
        let queues = self.exchange::<QueueRecord>(&info, Some(checkpoint_map))?;

        self.enter(DumpState::ReadEvents);
        let events = self.exchange::<EventRecord>(&info, Some(checkpoint_map))?;

        let num_of_gpus = devices.iter().filter(|d| d.is_gpu()).count() as u32;
        Ok(KfdImage {
            process,
            num_of_cpus: devices.len() as u32 - num_of_gpus,
            num_of_gpus,
            devices,
            bos,
            queues,
            events,
            shared_mem: Default::default(),
        })
    }

    /// One dump ioctl for class `R`. The scratch array is dropped on return.
    fn exchange<R: WireRecord>(
        &self,
        info: &ProcessInfo,
        ids: Option<&GpuIdMap>,
    ) -> Result<Vec<R>> {
        let (count, priv_bytes) = info.sizing(R::CLASS);
        let mut array = BucketArray::zeroed(R::CLASS, R::BUCKET_SIZE, count, priv_bytes)?;
        self.kfd.dump_objects(&mut array)?;
        let records = decode(&array, Phase::DUMP, ids)?;
        tracing::debug!(class = R::CLASS.name(), count = records.len(), "read objects");
        Ok(records)
    }

    fn read_devices(
        &self,
        info: &ProcessInfo,
        checkpoint_map: &mut GpuIdMap,
    ) -> Result<Vec<DeviceRecord>> {
        let slots = self.exchange::<DeviceSlot>(info, None)?;
        checkpoint_map.clear();
        for slot in &slots {
            checkpoint_map.insert(slot.actual_gpu_id, slot.user_gpu_id)?;
        }

        let mut records = Vec::with_capacity(self.topology.num_nodes());
        for node in self.topology.nodes() {
            let gpu_id = if node.is_gpu() {
                checkpoint_map.resolve(node.gpu_id)?
            } else {
                0
            };
            let mut record = DeviceRecord::from_node(node, gpu_id);
            let slot = slots.iter().find(|s| node.is_gpu() && s.actual_gpu_id == node.gpu_id);
            if let Some(slot) = slot {
                record.private = slot.private.clone();
            }
            records.push(record);
        }

        let gpus = records.iter().filter(|r| r.is_gpu()).count();
        if gpus != slots.len() {
            return Err(GpuCrError::mapping(format!(
                "driver reported {} devices, topology has {gpus} gpus",
                slots.len()
            )));
        }
        Ok(records)
    }

    fn read_bos(&self, info: &ProcessInfo, checkpoint_map: &GpuIdMap) -> Result<Vec<BoRecord>> {
        let (count, priv_bytes) = info.sizing(ObjectClass::Bo);
        let mut array =
            BucketArray::zeroed(ObjectClass::Bo, BoSlot::BUCKET_SIZE, count, priv_bytes)?;
        BoSlot::clear_dmabuf_fds(&mut array);
        self.kfd.dump_objects(&mut array)?;
        let mut slots: Vec<BoSlot> = match decode(&array, Phase::DUMP, Some(checkpoint_map)) {
            Ok(slots) => slots,
            Err(e) => {
                // The driver has already exported the buffers.
                for fd in BoSlot::exported_fds(&array) {
                    self.kfd.release_dmabuf(fd);
                }
                return Err(e);
            }
        };
        drop(array);
        tracing::debug!(class = ObjectClass::Bo.name(), count = slots.len(), "read objects");

        // Resolve every render device before any worker starts.
        let opened = self.render_devices(&slots, checkpoint_map);
        let transferred = opened.and_then(|devices| {
            TransferEngine::new(&self.config.transfer, self.host, info.task_pid)
                .run(Direction::Dump, &mut slots, &devices)
        });
        for slot in &slots {
            if slot.dmabuf_fd >= 0 {
                self.kfd.release_dmabuf(slot.dmabuf_fd);
            }
        }
        transferred?;

        Ok(slots.into_iter().map(|s| s.record).collect())
    }

    /// Render devices keyed by user id for every gpu owning a buffer.
    fn render_devices(&self, slots: &[BoSlot], checkpoint_map: &GpuIdMap) -> Result<DeviceTable> {
        let mut devices = DeviceTable::new();
        for slot in slots {
            let user = slot.gpu_id();
            if devices.contains_key(&user) {
                continue;
            }
            let actual = checkpoint_map.resolve_back(user)?;
            let node = self
                .topology
                .by_gpu_id(actual)
                .ok_or(GpuCrError::UnmappedGpu { gpu_id: actual })?;
            devices.insert(user, (self.open_render)(node)?);
        }
        Ok(devices)
    }
}
