/// Driver-assigned GPU identifier. `0` is reserved and never a valid mapping.
pub type GpuId = u32;

/// Topology node identifier (position in the host's node enumeration).
pub type NodeId = u32;

/// Process id of the checkpointed task.
pub type Pid = u32;

/// Reserved gpu id value.
pub const INVALID_GPU_ID: GpuId = 0;

/// Object classes exchanged with the driver, in exchange order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum ObjectClass {
    Process = 0,
    Device = 1,
    Bo = 2,
    Queue = 3,
    Event = 4,
}

impl ObjectClass {
    /// Every class in the order dump and restore must visit them.
    pub const ORDERED: [ObjectClass; 5] = [
        ObjectClass::Process,
        ObjectClass::Device,
        ObjectClass::Bo,
        ObjectClass::Queue,
        ObjectClass::Event,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            ObjectClass::Process => "process",
            ObjectClass::Device => "device",
            ObjectClass::Bo => "bo",
            ObjectClass::Queue => "queue",
            ObjectClass::Event => "event",
        }
    }

    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(ObjectClass::Process),
            1 => Some(ObjectClass::Device),
            2 => Some(ObjectClass::Bo),
            3 => Some(ObjectClass::Queue),
            4 => Some(ObjectClass::Event),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

bitflags::bitflags! {
    /// Buffer-object allocation flags as reported by the compute driver.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocFlags: u32 {
        const VRAM = 1 << 0;
        const GTT = 1 << 1;
        const USERPTR = 1 << 2;
        const DOORBELL = 1 << 3;
        const MMIO_REMAP = 1 << 4;
        const COHERENT = 1 << 26;
        const AQL_QUEUE_MEM = 1 << 27;
        const NO_SUBSTITUTE = 1 << 28;
        /// CPU-visible through a large BAR; direct mmap is possible.
        const PUBLIC = 1 << 29;
        const EXECUTABLE = 1 << 30;
        const WRITABLE = 1 << 31;
    }
}

impl AllocFlags {
    /// Buffer contents live in device-managed memory and must be captured.
    pub fn is_device_backed(self) -> bool {
        self.intersects(AllocFlags::VRAM | AllocFlags::GTT)
    }

    /// Buffer is mapped through a device file, so its mapping must be
    /// relocated after restore.
    pub fn needs_relocation(self) -> bool {
        self.intersects(
            AllocFlags::VRAM | AllocFlags::GTT | AllocFlags::MMIO_REMAP | AllocFlags::DOORBELL,
        )
    }
}

/// Event types carried in event buckets.
pub mod event_type {
    pub const SIGNAL: u32 = 0;
    pub const NODECHANGE: u32 = 1;
    pub const DEVICESTATECHANGE: u32 = 2;
    pub const HW_EXCEPTION: u32 = 3;
    pub const SYSTEM_EVENT: u32 = 4;
    pub const DEBUG_EVENT: u32 = 5;
    pub const PROFILE_EVENT: u32 = 6;
    pub const QUEUE_EVENT: u32 = 7;
    pub const MEMORY: u32 = 8;
}
