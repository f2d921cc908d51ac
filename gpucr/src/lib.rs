pub mod collector;
pub mod config;
pub mod device;
pub mod error;
pub mod host;
pub mod identity;
pub mod image;
pub mod installer;
pub mod protocol;
pub mod records;
pub mod relocation;
pub mod session;
pub mod topology;
pub mod transfer;
pub mod types;

pub use collector::{DeviceStateCollector, DumpState};
pub use config::{GpuCrConfig, MatchChecks, TransferConfig};
pub use device::{
    BoHandle, CopyEngine, DeviceFile, KfdDevice, MapAccess, MappedRegion, Platform,
    ProcessMemory, RenderDevice,
};
pub use error::{GpuCrError, Result};
pub use host::Host;
pub use identity::GpuIdMap;
pub use image::{ImageKind, decode_image, encode_image};
pub use installer::{DeviceStateInstaller, RestoreState};
pub use protocol::{BucketArray, ProcessInfo};
pub use records::{
    BoRecord, DeviceRecord, EventRecord, KfdImage, ProcessRecord, QueueRecord, RenderNodeRecord,
    SharedMemDescriptor,
};
pub use relocation::{VmaRelocation, VmaRelocationTable};
pub use session::{CheckpointPlugin, Checkpointer, Session};
pub use topology::{GpuProperties, IoLink, Topology, TopologyNode, match_gpus};
pub use transfer::{Direction, TransferEngine, WorkerStats};
pub use types::{AllocFlags, GpuId, NodeId, ObjectClass, Pid};
