//! Render-node access: CPU mappings of buffer objects plus the optional SDMA
//! copy engine.

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::ptr;

use gpucr::{
    CopyEngine, GpuCrError, GpuId, MapAccess, MappedRegion, RenderDevice, TopologyNode,
    TransferConfig,
};

use crate::amdgpu::SdmaEngine;
use crate::error::{KfdError, Result};

pub fn render_node_path(minor: u32) -> PathBuf {
    PathBuf::from(format!("/dev/dri/renderD{minor}"))
}

/// Open `/dev/dri/renderD<minor>` read-write.
pub fn open_render_fd(minor: u32) -> Result<OwnedFd> {
    let path = render_node_path(minor);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_CLOEXEC)
        .open(&path)
        .map_err(|source| KfdError::Open { path, source })?;
    Ok(file.into())
}

pub struct DrmRenderDevice {
    /// Uses `fd`; declared first so it is dropped first.
    engine: Option<SdmaEngine>,
    fd: OwnedFd,
    gpu_id: GpuId,
    minor: u32,
}

impl DrmRenderDevice {
    /// Open the render node of `node`. The copy engine is set up only when
    /// `config.hardware_copy` is on; failure to set it up leaves the device
    /// on the CPU paths.
    pub fn open(node: &TopologyNode, config: &TransferConfig) -> Result<Self> {
        let minor = node.gpu.drm_render_minor;
        let fd = open_render_fd(minor)?;
        let engine = if config.hardware_copy {
            match SdmaEngine::new(fd.as_raw_fd(), node.gpu_id, config) {
                Ok(engine) => Some(engine),
                Err(e) => {
                    tracing::warn!(
                        gpu_id = node.gpu_id,
                        minor,
                        error = %e,
                        "copy engine unavailable, using CPU copies"
                    );
                    None
                }
            }
        } else {
            None
        };
        Ok(Self {
            engine,
            fd,
            gpu_id: node.gpu_id,
            minor,
        })
    }
}

impl RenderDevice for DrmRenderDevice {
    fn gpu_id(&self) -> GpuId {
        self.gpu_id
    }

    fn render_minor(&self) -> u32 {
        self.minor
    }

    fn raw_handle(&self) -> i32 {
        self.fd.as_raw_fd()
    }

    fn copy_engine(&self) -> Option<&dyn CopyEngine> {
        self.engine.as_ref().map(|e| e as &dyn CopyEngine)
    }

    fn map(
        &self,
        offset: u64,
        size: usize,
        access: MapAccess,
    ) -> gpucr::Result<Box<dyn MappedRegion + '_>> {
        Ok(Box::new(Mapping::new(self.fd.as_raw_fd(), offset, size, access)?))
    }
}

/// A shared mapping of a device file. Unmapped on drop.
pub struct Mapping {
    ptr: *mut u8,
    len: usize,
    access: MapAccess,
}

// The mapping is plain memory owned by this value.
unsafe impl Send for Mapping {}

impl Mapping {
    pub fn new(fd: RawFd, offset: u64, len: usize, access: MapAccess) -> Result<Self> {
        let prot = match access {
            MapAccess::None => libc::PROT_NONE,
            MapAccess::Read => libc::PROT_READ,
            MapAccess::Write => libc::PROT_WRITE,
        };
        Self::with_prot(fd, offset, len, prot, access)
    }

    /// Readable and writable mapping for buffers this crate owns. Accessed
    /// through [`as_ptr`](Self::as_ptr).
    pub(crate) fn read_write(fd: RawFd, offset: u64, len: usize) -> Result<Self> {
        Self::with_prot(
            fd,
            offset,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            MapAccess::Write,
        )
    }

    fn with_prot(
        fd: RawFd,
        offset: u64,
        len: usize,
        prot: libc::c_int,
        access: MapAccess,
    ) -> Result<Self> {
        let mmap_err = |source| KfdError::Mmap {
            offset,
            len,
            source,
        };
        let off = libc::off_t::try_from(offset)
            .map_err(|_| mmap_err(std::io::Error::from_raw_os_error(libc::EOVERFLOW)))?;
        // SAFETY: a fresh shared mapping; the kernel picks the address.
        let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, libc::MAP_SHARED, fd, off) };
        if ptr == libc::MAP_FAILED {
            return Err(mmap_err(std::io::Error::last_os_error()));
        }
        Ok(Self {
            ptr: ptr.cast(),
            len,
            access,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Copies move the whole mapping or nothing.
    fn check_len(&self, len: usize) -> gpucr::Result<()> {
        if len != self.len {
            return Err(GpuCrError::device(format!(
                "buffer of {len} bytes does not match mapping of {} bytes",
                self.len
            )));
        }
        Ok(())
    }
}

impl MappedRegion for Mapping {
    fn addr(&self) -> u64 {
        self.ptr as u64
    }

    fn len(&self) -> usize {
        self.len
    }

    fn read(&self, out: &mut [u8]) -> gpucr::Result<()> {
        if self.access != MapAccess::Read {
            return Err(GpuCrError::device("mapping is not readable"));
        }
        self.check_len(out.len())?;
        // SAFETY: `ptr` is a live readable mapping of `len` bytes.
        unsafe { ptr::copy_nonoverlapping(self.ptr, out.as_mut_ptr(), self.len) };
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> gpucr::Result<()> {
        if self.access != MapAccess::Write {
            return Err(GpuCrError::device("mapping is not writable"));
        }
        self.check_len(data.len())?;
        // SAFETY: `ptr` is a live writable mapping of `len` bytes.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), self.ptr, self.len) };
        Ok(())
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` came from a successful mmap.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}
