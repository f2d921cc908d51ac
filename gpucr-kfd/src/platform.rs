//! [`Platform`] for Linux hosts: descriptors are raw fds, the topology comes
//! from sysfs and devices from `/dev`.

use std::os::fd::{BorrowedFd, IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gpucr::{
    DeviceFile, GpuCrError, Platform, RenderDevice, Topology, TopologyNode, TransferConfig,
};

use crate::driver::{KFD_DEVICE_PATH, KfdDriver};
use crate::render::{DrmRenderDevice, open_render_fd};
use crate::topology::SysfsTopology;

/// Classify a device path as the compute driver or a render node.
pub fn classify_path(path: &Path) -> Option<DeviceFile> {
    if path == Path::new(KFD_DEVICE_PATH) {
        return Some(DeviceFile::Kfd);
    }
    let name = path.strip_prefix("/dev/dri").ok()?.to_str()?;
    let minor = name.strip_prefix("renderD")?.parse().ok()?;
    Some(DeviceFile::RenderNode { minor })
}

#[derive(Debug, Clone)]
pub struct LinuxPlatform {
    sysfs: SysfsTopology,
    kfd_path: PathBuf,
    transfer: TransferConfig,
}

impl LinuxPlatform {
    pub fn new(transfer: TransferConfig) -> Self {
        Self {
            sysfs: SysfsTopology::default(),
            kfd_path: KFD_DEVICE_PATH.into(),
            transfer,
        }
    }

    pub fn with_sysfs(mut self, sysfs: SysfsTopology) -> Self {
        self.sysfs = sysfs;
        self
    }

    pub fn with_kfd_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.kfd_path = path.into();
        self
    }
}

impl Platform for LinuxPlatform {
    type Handle = RawFd;
    type Kfd = KfdDriver;

    fn classify(&self, handle: &RawFd) -> gpucr::Result<DeviceFile> {
        let link = std::fs::read_link(format!("/proc/self/fd/{handle}"))?;
        classify_path(&link).ok_or_else(|| {
            GpuCrError::invalid(format!("fd {handle} is {}, not a GPU device", link.display()))
        })
    }

    fn attach_kfd(&self, handle: &RawFd) -> gpucr::Result<KfdDriver> {
        // SAFETY: the checkpoint tool keeps `handle` open while it is being
        // dumped.
        let fd = unsafe { BorrowedFd::borrow_raw(*handle) };
        Ok(KfdDriver::borrowed(fd))
    }

    fn open_kfd(&self) -> gpucr::Result<KfdDriver> {
        Ok(KfdDriver::open(&self.kfd_path)?)
    }

    fn into_handle(&self, kfd: KfdDriver) -> RawFd {
        kfd.into_raw_fd()
    }

    fn open_render_handle(&self, node: &TopologyNode) -> gpucr::Result<RawFd> {
        Ok(open_render_fd(node.gpu.drm_render_minor)?.into_raw_fd())
    }

    fn local_topology(&self, label: &'static str) -> gpucr::Result<Topology> {
        Ok(self.sysfs.read(label)?)
    }

    fn open_render_node(&self, node: &TopologyNode) -> gpucr::Result<Arc<dyn RenderDevice>> {
        Ok(Arc::new(DrmRenderDevice::open(node, &self.transfer)?))
    }
}
