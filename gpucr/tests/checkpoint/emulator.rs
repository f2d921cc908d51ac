//! In-memory compute driver, render nodes and host for end-to-end tests.
//!
//! A [`Machine`] owns the driver state of one host. Its KFD handles speak the
//! real bucket-array protocol through the crate's codec, render devices map
//! buffers by mmap offset, and the host's process memory resolves virtual
//! addresses to the buffer that backs them.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use gpucr::protocol::{BoSlot, DMABUF_FD_AT, DeviceSlot, Phase, decode, encode, encode_into};
use gpucr::{
    AllocFlags, BoHandle, BoRecord, BucketArray, Checkpointer, CopyEngine, DeviceFile,
    EventRecord, GpuCrConfig, GpuCrError, GpuId, GpuProperties, Host, KfdDevice, MapAccess,
    MappedRegion, NodeId, ObjectClass, Pid, Platform, ProcessInfo, ProcessMemory, ProcessRecord,
    QueueRecord, RenderDevice, Result, SharedMemDescriptor, Topology, TopologyNode,
};

pub const CPU_CORES: u32 = 16;
const DUMP_OFFSET_BASE: u64 = 0x1_0000_0000;
const RESTORE_OFFSET_BASE: u64 = 0x8_0000_0000;
const OFFSET_STRIDE: u64 = 0x100_0000;

pub fn props(minor: u32) -> GpuProperties {
    GpuProperties {
        simd_count: 240,
        mem_banks_count: 1,
        caches_count: 104,
        io_links_count: 1,
        max_waves_per_simd: 8,
        lds_size_in_kb: 64,
        num_gws: 64,
        wave_front_size: 64,
        array_count: 8,
        simd_arrays_per_engine: 1,
        cu_per_simd_array: 15,
        simd_per_cu: 4,
        max_slots_scratch_cu: 32,
        vendor_id: 0x1002,
        device_id: 0x738c,
        drm_render_minor: minor,
        num_sdma_engines: 2,
        num_sdma_xgmi_engines: 6,
        num_sdma_queues_per_engine: 8,
        num_cp_queues: 24,
        fw_version: 67,
        capability: 0x2_8a80,
        sdma_fw_version: 18,
        vram_public: 1,
        vram_size: 32 << 30,
        ..Default::default()
    }
}

/// Deterministic, seed-dependent fill so no two buffers look alike.
pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32 * 7) as u8 ^ seed)
        .collect()
}

#[derive(Debug, Clone)]
pub struct EmuBo {
    pub addr: u64,
    pub size: u64,
    pub offset: u64,
    /// Host-local id.
    pub gpu_id: GpuId,
    pub flags: AllocFlags,
    pub private: Vec<u8>,
    pub contents: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct EmuDevice {
    pub user_gpu_id: GpuId,
    pub actual_gpu_id: GpuId,
    pub drm_fd: i32,
    pub private: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct DriverState {
    pub gpu_ids: Vec<GpuId>,
    pub pid: Pid,
    pub process_private: Vec<u8>,
    pub devices: Vec<EmuDevice>,
    pub bos: Vec<EmuBo>,
    pub queues: Vec<QueueRecord>,
    pub events: Vec<EventRecord>,

    pub paused: bool,
    pub pause_calls: usize,
    pub restore_calls: usize,
    pub kfd_opens: usize,
    pub resumed: Vec<Pid>,

    /// Make the dump ioctl of this class fail.
    pub fail_dump: Option<ObjectClass>,
    /// Render devices expose a copy engine.
    pub hw_engine: bool,
    /// The copy engine rejects every submission.
    pub hw_fail: bool,

    /// Live dma-buf exports, fd → index into `bos`.
    pub dmabufs: HashMap<i32, usize>,
    /// Every fd handed to `release_dmabuf`, in order.
    pub released: Vec<i32>,
    /// `(worker thread name, gpu of the buffer)` for every buffer access.
    pub touches: Vec<(String, GpuId)>,

    next_dmabuf: i32,
    next_offset: u64,
    next_restored_offset: u64,
}

impl DriverState {
    fn touch(&mut self, gpu_id: GpuId) {
        let name = std::thread::current().name().unwrap_or("").to_string();
        self.touches.push((name, gpu_id));
    }

    /// Add a buffer with patterned contents on `gpu_id`.
    pub fn add_bo(&mut self, addr: u64, size: u64, gpu_id: GpuId, flags: AllocFlags, seed: u8) {
        let offset = self.next_offset;
        self.next_offset += OFFSET_STRIDE;
        let contents = if flags.is_device_backed() {
            pattern(seed, size as usize)
        } else {
            Vec::new()
        };
        self.bos.push(EmuBo {
            addr,
            size,
            offset,
            gpu_id,
            flags,
            private: vec![seed; 24],
            contents,
        });
    }

    pub fn bo_at(&self, addr: u64) -> Option<&EmuBo> {
        self.bos.iter().find(|b| b.addr == addr)
    }

    fn bo_containing(&mut self, addr: u64, len: usize) -> Result<&mut EmuBo> {
        self.bos
            .iter_mut()
            .find(|b| {
                b.flags.is_device_backed() && addr >= b.addr && addr + len as u64 <= b.addr + b.size
            })
            .ok_or_else(|| GpuCrError::device(format!("no buffer backs 0x{addr:x}+{len}")))
    }

    fn require_gpu(&self, gpu_id: GpuId, class: ObjectClass) -> Result<()> {
        if self.gpu_ids.contains(&gpu_id) {
            Ok(())
        } else {
            Err(GpuCrError::DeviceProtocol {
                op: "restore",
                class: Some(class),
                errno: 19,
            })
        }
    }
}

/// One emulated host.
pub struct Machine {
    gpus: Vec<(GpuId, GpuProperties)>,
    state: Arc<Mutex<DriverState>>,
}

impl Machine {
    /// One CPU node plus a GPU per id, render minors from 128.
    pub fn new(gpu_ids: &[GpuId]) -> Arc<Self> {
        let gpus = gpu_ids
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, props(128 + i as u32)))
            .collect();
        Self::with_gpus(gpus)
    }

    pub fn with_gpus(gpus: Vec<(GpuId, GpuProperties)>) -> Arc<Self> {
        let state = DriverState {
            gpu_ids: gpus.iter().map(|(id, _)| *id).collect(),
            hw_engine: true,
            next_dmabuf: 100,
            next_offset: DUMP_OFFSET_BASE,
            next_restored_offset: RESTORE_OFFSET_BASE,
            ..Default::default()
        };
        Arc::new(Self {
            gpus,
            state: Arc::new(Mutex::new(state)),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap()
    }

    pub fn topology(&self, label: &'static str) -> Topology {
        let mut t = Topology::new(label);
        t.add_node(TopologyNode::cpu(0, CPU_CORES)).unwrap();
        for (i, (gpu_id, props)) in self.gpus.iter().enumerate() {
            let id = i as NodeId + 1;
            t.add_node(TopologyNode::gpu(id, *gpu_id, props.clone()))
                .unwrap();
            t.add_io_link(id, 2, 0).unwrap();
            t.add_io_link(0, 2, id).unwrap();
        }
        t.validate_io_links();
        t.assign_numa_domains();
        t
    }

    /// Start a process that has opened every GPU. `user_ids` defaults to the
    /// actual ids.
    pub fn start_process(&self, pid: Pid, user_ids: Option<&[GpuId]>) {
        let mut s = self.state();
        s.pid = pid;
        s.process_private = vec![0x5a; 40];
        s.devices = self
            .gpus
            .iter()
            .enumerate()
            .map(|(i, (actual, _))| EmuDevice {
                user_gpu_id: user_ids.map_or(*actual, |u| u[i]),
                actual_gpu_id: *actual,
                drm_fd: -1,
                private: vec![0xd0 + i as u8; 16],
            })
            .collect();
    }

    pub fn platform(self: &Arc<Self>) -> EmuPlatform {
        EmuPlatform {
            machine: Arc::clone(self),
        }
    }

    pub fn host(self: &Arc<Self>, images: &ImageStore) -> EmuHost {
        EmuHost {
            state: Arc::clone(&self.state),
            images: images.clone(),
            shared_mem: SharedMemDescriptor::default(),
            recreated: Mutex::new(Vec::new()),
        }
    }

    pub fn checkpointer(
        self: &Arc<Self>,
        images: &ImageStore,
        config: GpuCrConfig,
    ) -> Checkpointer<EmuPlatform, EmuHost> {
        Checkpointer::new(self.platform(), self.host(images), config)
    }

    pub fn kfd(&self) -> EmuKfd {
        EmuKfd {
            state: Arc::clone(&self.state),
        }
    }

    /// Render-node opener for driving a collector or installer directly.
    pub fn opener(&self) -> impl Fn(&TopologyNode) -> Result<Arc<dyn RenderDevice>> + '_ {
        move |node| Ok(self.render(node))
    }

    pub fn render(&self, node: &TopologyNode) -> Arc<dyn RenderDevice> {
        let hw = self.state().hw_engine;
        Arc::new(EmuRender {
            gpu_id: node.gpu_id,
            minor: node.gpu.drm_render_minor,
            state: Arc::clone(&self.state),
            engine: hw.then(|| EmuCopyEngine {
                gpu_id: node.gpu_id,
                state: Arc::clone(&self.state),
            }),
        })
    }
}

/// Copy driver-filled buckets into the caller's array, as the ioctl would.
fn fill(array: &mut BucketArray, built: &BucketArray) -> Result<()> {
    if array.num_objects() != built.num_objects()
        || array.private_region().len() != built.private_region().len()
    {
        return Err(GpuCrError::DeviceProtocol {
            op: "dump",
            class: Some(array.class()),
            errno: 22,
        });
    }
    for i in 0..built.num_objects() {
        array.bucket_mut(i).copy_from_slice(built.bucket(i));
    }
    array
        .private_region_mut()
        .copy_from_slice(built.private_region());
    Ok(())
}

pub struct EmuKfd {
    state: Arc<Mutex<DriverState>>,
}

impl KfdDevice for EmuKfd {
    fn process_info(&self) -> Result<ProcessInfo> {
        let s = self.state.lock().unwrap();
        Ok(ProcessInfo {
            task_pid: s.pid,
            total_devices: s.devices.len() as u32,
            total_bos: s.bos.len() as u64,
            total_queues: s.queues.len() as u32,
            total_events: s.events.len() as u32,
            process_priv_data_size: s.process_private.len() as u64,
            devices_priv_data_size: s.devices.iter().map(|d| d.private.len() as u64).sum(),
            bos_priv_data_size: s.bos.iter().map(|b| b.private.len() as u64).sum(),
            queues_priv_data_size: s
                .queues
                .iter()
                .map(|q| (q.data.len() + q.private.len()) as u64)
                .sum(),
            events_priv_data_size: s.events.iter().map(|e| e.private.len() as u64).sum(),
        })
    }

    fn set_paused(&self, paused: bool) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.paused = paused;
        s.pause_calls += 1;
        Ok(())
    }

    fn dump_objects(&self, array: &mut BucketArray) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        let s = &mut *guard;
        if s.fail_dump == Some(array.class()) {
            return Err(GpuCrError::DeviceProtocol {
                op: "dump",
                class: Some(array.class()),
                errno: 5,
            });
        }

        let built = match array.class() {
            ObjectClass::Process => {
                let process = ProcessRecord {
                    pid: 0,
                    private: s.process_private.clone(),
                };
                encode(&[process], Phase::DUMP, None)?
            }
            ObjectClass::Device => {
                let slots: Vec<DeviceSlot> = s
                    .devices
                    .iter()
                    .map(|d| DeviceSlot {
                        user_gpu_id: d.user_gpu_id,
                        actual_gpu_id: d.actual_gpu_id,
                        drm_fd: -1,
                        private: d.private.clone(),
                    })
                    .collect();
                encode(&slots, Phase::DUMP, None)?
            }
            ObjectClass::Bo => {
                let mut slots = Vec::with_capacity(s.bos.len());
                for (i, bo) in s.bos.iter().enumerate() {
                    let mut slot = BoSlot::new(BoRecord {
                        addr: bo.addr,
                        size: bo.size,
                        offset: bo.offset,
                        gpu_id: bo.gpu_id,
                        alloc_flags: bo.flags.bits(),
                        rawdata: None,
                        private: bo.private.clone(),
                    });
                    if bo.flags.is_device_backed() {
                        slot.dmabuf_fd = s.next_dmabuf;
                        s.dmabufs.insert(s.next_dmabuf, i);
                        s.next_dmabuf += 1;
                    }
                    slots.push(slot);
                }
                encode(&slots, Phase::DUMP, None)?
            }
            ObjectClass::Queue => encode(&s.queues, Phase::DUMP, None)?,
            ObjectClass::Event => encode(&s.events, Phase::DUMP, None)?,
        };
        fill(array, &built)
    }

    fn restore_objects(&self, array: &mut BucketArray) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        let s = &mut *guard;
        s.restore_calls += 1;

        match array.class() {
            ObjectClass::Process => {
                let records: Vec<ProcessRecord> = decode(array, Phase::RESTORE_IN, None)?;
                if let Some(p) = records.into_iter().next() {
                    s.process_private = p.private;
                }
            }
            ObjectClass::Device => {
                let slots: Vec<DeviceSlot> = decode(array, Phase::RESTORE_IN, None)?;
                for slot in slots {
                    s.require_gpu(slot.actual_gpu_id, ObjectClass::Device)?;
                    if slot.drm_fd < 0 {
                        return Err(GpuCrError::DeviceProtocol {
                            op: "restore",
                            class: Some(ObjectClass::Device),
                            errno: 9,
                        });
                    }
                    s.devices.push(EmuDevice {
                        user_gpu_id: slot.user_gpu_id,
                        actual_gpu_id: slot.actual_gpu_id,
                        drm_fd: slot.drm_fd,
                        private: slot.private,
                    });
                }
            }
            ObjectClass::Bo => {
                let mut slots: Vec<BoSlot> = decode(array, Phase::RESTORE_IN, None)?;
                for slot in &mut slots {
                    s.require_gpu(slot.record.gpu_id, ObjectClass::Bo)?;
                    slot.restored_offset = s.next_restored_offset;
                    s.next_restored_offset += OFFSET_STRIDE;

                    let flags = slot.record.flags();
                    if flags.is_device_backed() {
                        slot.dmabuf_fd = s.next_dmabuf;
                        s.dmabufs.insert(s.next_dmabuf, s.bos.len());
                        s.next_dmabuf += 1;
                    }
                    let contents = if flags.is_device_backed() {
                        vec![0; slot.record.size as usize]
                    } else {
                        Vec::new()
                    };
                    s.bos.push(EmuBo {
                        addr: slot.record.addr,
                        size: slot.record.size,
                        offset: slot.restored_offset,
                        gpu_id: slot.record.gpu_id,
                        flags,
                        private: slot.record.private.clone(),
                        contents,
                    });
                }
                // Buffers without an export keep whatever the caller put there.
                let inbound: Vec<[u8; 4]> = (0..slots.len())
                    .map(|i| {
                        let mut raw = [0u8; 4];
                        raw.copy_from_slice(&array.bucket(i)[DMABUF_FD_AT..DMABUF_FD_AT + 4]);
                        raw
                    })
                    .collect();
                encode_into(array, &slots, Phase::RESTORE_OUT, None)?;
                for (i, slot) in slots.iter().enumerate() {
                    if !slot.record.flags().is_device_backed() {
                        array.bucket_mut(i)[DMABUF_FD_AT..DMABUF_FD_AT + 4]
                            .copy_from_slice(&inbound[i]);
                    }
                }
            }
            ObjectClass::Queue => {
                let queues: Vec<QueueRecord> = decode(array, Phase::RESTORE_IN, None)?;
                for q in &queues {
                    s.require_gpu(q.gpu_id, ObjectClass::Queue)?;
                }
                s.queues.extend(queues);
            }
            ObjectClass::Event => {
                let events: Vec<EventRecord> = decode(array, Phase::RESTORE_IN, None)?;
                s.events.extend(events);
            }
        }
        Ok(())
    }

    fn resume(&self, pid: Pid) -> Result<()> {
        self.state.lock().unwrap().resumed.push(pid);
        Ok(())
    }

    fn release_dmabuf(&self, fd: i32) {
        let mut s = self.state.lock().unwrap();
        s.released.push(fd);
        s.dmabufs.remove(&fd);
    }
}

pub struct EmuCopyEngine {
    gpu_id: GpuId,
    state: Arc<Mutex<DriverState>>,
}

impl EmuCopyEngine {
    fn with_bo<T>(&self, bo: &BoHandle, f: impl FnOnce(&mut EmuBo) -> T) -> Result<T> {
        let mut s = self.state.lock().unwrap();
        if s.hw_fail {
            return Err(GpuCrError::transfer(self.gpu_id, "sdma submission rejected"));
        }
        let idx = *s
            .dmabufs
            .get(&bo.dmabuf_fd)
            .ok_or_else(|| GpuCrError::device(format!("unknown dma-buf {}", bo.dmabuf_fd)))?;
        let gpu = s.bos[idx].gpu_id;
        s.touch(gpu);
        Ok(f(&mut s.bos[idx]))
    }
}

impl CopyEngine for EmuCopyEngine {
    fn read(&self, bo: &BoHandle, out: &mut [u8]) -> Result<()> {
        self.with_bo(bo, |b| out.copy_from_slice(&b.contents))
    }

    fn write(&self, bo: &BoHandle, data: &[u8]) -> Result<()> {
        self.with_bo(bo, |b| b.contents.copy_from_slice(data))
    }
}

pub struct EmuRender {
    gpu_id: GpuId,
    minor: u32,
    state: Arc<Mutex<DriverState>>,
    engine: Option<EmuCopyEngine>,
}

impl RenderDevice for EmuRender {
    fn gpu_id(&self) -> GpuId {
        self.gpu_id
    }

    fn render_minor(&self) -> u32 {
        self.minor
    }

    fn raw_handle(&self) -> i32 {
        1000 + self.minor as i32
    }

    fn copy_engine(&self) -> Option<&dyn CopyEngine> {
        self.engine.as_ref().map(|e| e as &dyn CopyEngine)
    }

    fn map(
        &self,
        offset: u64,
        size: usize,
        access: MapAccess,
    ) -> Result<Box<dyn MappedRegion + '_>> {
        let mut s = self.state.lock().unwrap();
        let idx = s
            .bos
            .iter()
            .position(|b| b.offset == offset)
            .ok_or_else(|| GpuCrError::device(format!("nothing mapped at 0x{offset:x}")))?;
        let bo = &s.bos[idx];
        if bo.size as usize != size {
            return Err(GpuCrError::device("mapping size mismatch"));
        }
        if access != MapAccess::None && !bo.flags.contains(AllocFlags::PUBLIC) {
            return Err(GpuCrError::device("buffer is not host visible"));
        }
        let addr = bo.addr;
        let gpu = bo.gpu_id;
        s.touch(gpu);
        Ok(Box::new(EmuRegion {
            state: Arc::clone(&self.state),
            index: idx,
            addr,
            len: size,
            access,
        }))
    }
}

struct EmuRegion {
    state: Arc<Mutex<DriverState>>,
    index: usize,
    addr: u64,
    len: usize,
    access: MapAccess,
}

impl MappedRegion for EmuRegion {
    fn addr(&self) -> u64 {
        self.addr
    }

    fn len(&self) -> usize {
        self.len
    }

    fn read(&self, out: &mut [u8]) -> Result<()> {
        if self.access != MapAccess::Read {
            return Err(GpuCrError::device("region not readable"));
        }
        let s = self.state.lock().unwrap();
        out.copy_from_slice(&s.bos[self.index].contents);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.access != MapAccess::Write {
            return Err(GpuCrError::device("region not writable"));
        }
        let mut s = self.state.lock().unwrap();
        s.bos[self.index].contents.copy_from_slice(data);
        Ok(())
    }
}

pub struct EmuProcessMemory {
    state: Arc<Mutex<DriverState>>,
    writable: bool,
}

impl ProcessMemory for EmuProcessMemory {
    fn read_at(&self, addr: u64, out: &mut [u8]) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        let bo = s.bo_containing(addr, out.len())?;
        let start = (addr - bo.addr) as usize;
        out.copy_from_slice(&bo.contents[start..start + out.len()]);
        let gpu = bo.gpu_id;
        s.touch(gpu);
        Ok(())
    }

    fn write_at(&self, addr: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(GpuCrError::device("process memory opened read-only"));
        }
        let mut s = self.state.lock().unwrap();
        let bo = s.bo_containing(addr, data.len())?;
        let start = (addr - bo.addr) as usize;
        bo.contents[start..start + data.len()].copy_from_slice(data);
        let gpu = bo.gpu_id;
        s.touch(gpu);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmuHandle {
    Kfd,
    Render { minor: u32 },
}

pub struct EmuPlatform {
    machine: Arc<Machine>,
}

impl Platform for EmuPlatform {
    type Handle = EmuHandle;
    type Kfd = EmuKfd;

    fn classify(&self, handle: &EmuHandle) -> Result<DeviceFile> {
        Ok(match *handle {
            EmuHandle::Kfd => DeviceFile::Kfd,
            EmuHandle::Render { minor } => DeviceFile::RenderNode { minor },
        })
    }

    fn attach_kfd(&self, _handle: &EmuHandle) -> Result<EmuKfd> {
        Ok(self.machine.kfd())
    }

    fn open_kfd(&self) -> Result<EmuKfd> {
        self.machine.state().kfd_opens += 1;
        Ok(self.machine.kfd())
    }

    fn into_handle(&self, _kfd: EmuKfd) -> EmuHandle {
        EmuHandle::Kfd
    }

    fn open_render_handle(&self, node: &TopologyNode) -> Result<EmuHandle> {
        Ok(EmuHandle::Render {
            minor: node.gpu.drm_render_minor,
        })
    }

    fn local_topology(&self, label: &'static str) -> Result<Topology> {
        Ok(self.machine.topology(label))
    }

    fn open_render_node(&self, node: &TopologyNode) -> Result<Arc<dyn RenderDevice>> {
        Ok(self.machine.render(node))
    }
}

/// Image files shared between the checkpoint and restore hosts.
#[derive(Clone, Default)]
pub struct ImageStore(Arc<Mutex<HashMap<String, Vec<u8>>>>);

impl ImageStore {
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.0.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(name).cloned()
    }
}

pub struct EmuHost {
    state: Arc<Mutex<DriverState>>,
    images: ImageStore,
    pub shared_mem: SharedMemDescriptor,
    recreated: Mutex<Vec<SharedMemDescriptor>>,
}

impl EmuHost {
    pub fn recreated(&self) -> Vec<SharedMemDescriptor> {
        self.recreated.lock().unwrap().clone()
    }
}

impl Host for EmuHost {
    fn open_process_memory(&self, _pid: Pid, writable: bool) -> Result<Box<dyn ProcessMemory>> {
        Ok(Box::new(EmuProcessMemory {
            state: Arc::clone(&self.state),
            writable,
        }))
    }

    fn write_image(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.images
            .0
            .lock()
            .unwrap()
            .insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read_image(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.images.get(name))
    }

    fn shared_memory(&self) -> Result<SharedMemDescriptor> {
        Ok(self.shared_mem)
    }

    fn recreate_shared_memory(&self, desc: &SharedMemDescriptor) -> Result<()> {
        self.recreated.lock().unwrap().push(*desc);
        Ok(())
    }
}

// ── Workloads ───────────────────────────────────────────────────────

pub const ADDR_BASE: u64 = 0x7f00_0000_0000;

pub fn queue(gpu_id: GpuId, q_id: u32, seed: u8) -> QueueRecord {
    let mut q = QueueRecord {
        gpu_id,
        kind: 2,
        format: 1,
        q_id,
        q_address: ADDR_BASE + 0x4000_0000 + q_id as u64 * 0x10_0000,
        q_size: 0x10_0000,
        priority: 7,
        q_percent: 100,
        read_ptr_addr: ADDR_BASE + 0x5000_0000 + q_id as u64 * 0x1000,
        write_ptr_addr: ADDR_BASE + 0x5000_0080 + q_id as u64 * 0x1000,
        doorbell_id: q_id,
        doorbell_off: 0x8_0000_0000 + q_id as u64 * 8,
        eop_ring_buffer_address: ADDR_BASE + 0x6000_0000,
        eop_ring_buffer_size: 4096,
        ctx_save_restore_area_address: ADDR_BASE + 0x7000_0000,
        ctx_save_restore_area_size: 0x2_c000,
        ctl_stack_size: 0x1000,
        cu_mask_size: 16,
        mqd_size: 0x200,
        private: vec![seed; 32],
        ..Default::default()
    };
    q.data = pattern(seed, q.blobs_len());
    q
}

pub fn memory_event(event_id: u32, gpu_id: GpuId, va: u64) -> EventRecord {
    EventRecord {
        event_id,
        auto_reset: 1,
        kind: gpucr::types::event_type::MEMORY,
        mem_exc_gpu_id: gpu_id,
        mem_exc_va: va,
        mem_exc_fail_not_present: true,
        mem_exc_fail_no_execute: true,
        private: vec![0xee; 8],
        ..Default::default()
    }
}

/// Per GPU: a public VRAM buffer, a private VRAM buffer, a GTT buffer and a
/// user-pinned one, plus one queue. One signal event and one memory event.
pub fn standard_workload(machine: &Machine, pid: Pid, user_ids: Option<&[GpuId]>) {
    machine.start_process(pid, user_ids);
    let mut s = machine.state();
    let gpus = s.gpu_ids.clone();
    let mut addr = ADDR_BASE;
    let mut seed = 1u8;
    for (i, &gpu) in gpus.iter().enumerate() {
        for (size, flags) in [
            (8192, AllocFlags::VRAM | AllocFlags::PUBLIC),
            (4096, AllocFlags::VRAM),
            (12288, AllocFlags::GTT),
            (4096, AllocFlags::USERPTR),
        ] {
            s.add_bo(addr, size, gpu, flags | AllocFlags::WRITABLE, seed);
            addr += 0x100_0000;
            seed += 1;
        }
        s.queues.push(queue(gpu, i as u32, 0x40 + i as u8));
    }
    s.events.push(EventRecord {
        event_id: 1,
        kind: gpucr::types::event_type::SIGNAL,
        signaled: 1,
        private: vec![0x11; 8],
        ..Default::default()
    });
    s.events.push(memory_event(2, gpus[0], ADDR_BASE + 0x1234_5000));
}

/// Dump image `id` from `machine` into `images`.
pub fn dump(machine: &Arc<Machine>, images: &ImageStore, id: u32) -> gpucr::KfdImage {
    let mut cp = machine.checkpointer(images, GpuCrConfig::default());
    gpucr::CheckpointPlugin::dump(&mut cp, &EmuHandle::Kfd, id).unwrap();
    gpucr::decode_image(&images.get(&format!("kfd.{id}.img")).unwrap()).unwrap()
}

/// Contents of every device-backed buffer, by address.
pub fn contents(machine: &Machine) -> Vec<(u64, Vec<u8>)> {
    let s = machine.state();
    let mut out: Vec<(u64, Vec<u8>)> = s
        .bos
        .iter()
        .filter(|b| b.flags.is_device_backed())
        .map(|b| (b.addr, b.contents.clone()))
        .collect();
    out.sort_by_key(|(addr, _)| *addr);
    out
}
