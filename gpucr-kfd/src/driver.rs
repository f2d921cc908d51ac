//! [`KfdDevice`] over a `/dev/kfd` descriptor.

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use gpucr::protocol::{BucketArray, ProcessInfo};
use gpucr::{KfdDevice, Pid};

use crate::error::{KfdError, Result};
use crate::ioctl::ioctl;
use crate::sys;

pub const KFD_DEVICE_PATH: &str = "/dev/kfd";

enum Descriptor {
    Owned(OwnedFd),
    /// Held by the checkpoint tool; never closed here.
    Borrowed(RawFd),
}

pub struct KfdDriver {
    fd: Descriptor,
}

impl KfdDriver {
    /// Open a fresh driver handle.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .map_err(|source| KfdError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            fd: Descriptor::Owned(file.into()),
        })
    }

    /// Drive a descriptor owned by someone else.
    pub fn borrowed(fd: BorrowedFd<'_>) -> Self {
        Self {
            fd: Descriptor::Borrowed(fd.as_raw_fd()),
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        match &self.fd {
            Descriptor::Owned(fd) => fd.as_raw_fd(),
            Descriptor::Borrowed(fd) => *fd,
        }
    }

    /// Hand the descriptor to the caller. A borrowed descriptor is returned
    /// as-is.
    pub fn into_raw_fd(self) -> RawFd {
        match self.fd {
            Descriptor::Owned(fd) => fd.into_raw_fd(),
            Descriptor::Borrowed(fd) => fd,
        }
    }

    fn exchange(
        &self,
        op: &'static str,
        request: libc::c_ulong,
        array: &mut BucketArray,
    ) -> Result<()> {
        let class = array.class();
        let mut args = sys::kfd_criu_objects_args {
            type_: class as u32,
            index_start: 0,
            num_objects: array.num_objects() as u64,
            objects_size: array.len() as u64,
            objects: array.as_mut_ptr() as u64,
            ..Default::default()
        };
        tracing::debug!(
            class = %class,
            num_objects = args.num_objects,
            bytes = args.objects_size,
            "{op} ioctl"
        );
        // SAFETY: `objects` points at `objects_size` bytes owned by `array`,
        // which outlives the call.
        unsafe { ioctl(self.raw_fd(), request, &mut args) }.map_err(|source| KfdError::Ioctl {
            op,
            class: Some(class),
            source,
        })
    }
}

impl KfdDevice for KfdDriver {
    fn process_info(&self) -> gpucr::Result<ProcessInfo> {
        let mut args = sys::kfd_criu_process_info_args::default();
        // SAFETY: plain-data argument matching the request.
        unsafe { ioctl(self.raw_fd(), sys::AMDKFD_IOC_CRIU_PROCESS_INFO, &mut args) }
            .map_err(|e| KfdError::ioctl("process_info", e))?;
        Ok(ProcessInfo {
            task_pid: args.task_pid,
            total_devices: args.total_devices,
            total_bos: args.total_bos,
            total_queues: args.total_queues,
            total_events: args.total_events,
            process_priv_data_size: args.process_priv_data_size,
            devices_priv_data_size: args.devices_priv_data_size,
            bos_priv_data_size: args.bos_priv_data_size,
            queues_priv_data_size: args.queues_priv_data_size,
            events_priv_data_size: args.events_priv_data_size,
        })
    }

    fn set_paused(&self, paused: bool) -> gpucr::Result<()> {
        let mut args = sys::kfd_criu_pause_args {
            pause: paused as u32,
            pad: 0,
        };
        // SAFETY: plain-data argument matching the request.
        unsafe { ioctl(self.raw_fd(), sys::AMDKFD_IOC_CRIU_PAUSE, &mut args) }
            .map_err(|e| KfdError::ioctl(if paused { "pause" } else { "unpause" }, e))?;
        Ok(())
    }

    fn dump_objects(&self, array: &mut BucketArray) -> gpucr::Result<()> {
        Ok(self.exchange("dump", sys::AMDKFD_IOC_CRIU_DUMPER, array)?)
    }

    fn restore_objects(&self, array: &mut BucketArray) -> gpucr::Result<()> {
        Ok(self.exchange("restore", sys::AMDKFD_IOC_CRIU_RESTORER, array)?)
    }

    fn resume(&self, pid: Pid) -> gpucr::Result<()> {
        let mut args = sys::kfd_criu_resume_args { pid, pad: 0 };
        // SAFETY: plain-data argument matching the request.
        unsafe { ioctl(self.raw_fd(), sys::AMDKFD_IOC_CRIU_RESUME, &mut args) }
            .map_err(|e| KfdError::ioctl("resume", e))?;
        tracing::info!(pid, "queues resumed");
        Ok(())
    }

    fn release_dmabuf(&self, fd: i32) {
        if fd < 0 {
            return;
        }
        // SAFETY: the driver handed us ownership of `fd` in a bo bucket.
        drop(unsafe { OwnedFd::from_raw_fd(fd) });
    }
}

impl std::fmt::Debug for KfdDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KfdDriver")
            .field("fd", &self.raw_fd())
            .field("owned", &matches!(self.fd, Descriptor::Owned(_)))
            .finish()
    }
}
