//! Linux backend for gpucr: the amdgpu compute driver and render nodes.
//!
//! This crate implements the device seams of the `gpucr` core against the
//! real kernel interfaces: bucket-array ioctls on `/dev/kfd`, topology from
//! sysfs, render-node mappings, `/proc/<pid>/mem`, and SDMA copies through
//! amdgpu command submission.
//!
//! # Usage
//!
//! ```ignore
//! use gpucr::{Checkpointer, CheckpointPlugin, GpuCrConfig};
//! use gpucr_kfd::{LinuxHost, LinuxPlatform};
//!
//! let config = GpuCrConfig::from_env();
//! let platform = LinuxPlatform::new(config.transfer.clone());
//! let mut plugin = Checkpointer::new(platform, LinuxHost::new("/var/lib/criu/images"), config);
//! plugin.dump(&kfd_fd, 7)?;
//! ```

pub mod amdgpu;
pub mod driver;
pub mod error;
pub mod host;
mod ioctl;
pub mod platform;
pub mod procmem;
pub mod render;
pub mod sys;
pub mod topology;

pub use amdgpu::SdmaEngine;
pub use driver::KfdDriver;
pub use error::{KfdError, Result};
pub use host::LinuxHost;
pub use platform::LinuxPlatform;
pub use procmem::ProcMem;
pub use render::DrmRenderDevice;
pub use topology::SysfsTopology;
