//! [`Host`] backed by an image directory, `/proc/<pid>/mem` and the runtime's
//! POSIX shared-memory segment.

use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use gpucr::records::SharedMemDescriptor;
use gpucr::{GpuCrError, Host, Pid, ProcessMemory};

use crate::procmem::ProcMem;

pub const RUNTIME_SHM_PATH: &str = "/dev/shm/hsakmt_shared_mem";
pub const RUNTIME_SEMAPHORE: &str = "/hsakmt_semaphore";

#[derive(Debug, Clone)]
pub struct LinuxHost {
    image_dir: PathBuf,
    shm_path: PathBuf,
    semaphore: Option<String>,
}

impl LinuxHost {
    pub fn new(image_dir: impl Into<PathBuf>) -> Self {
        Self {
            image_dir: image_dir.into(),
            shm_path: RUNTIME_SHM_PATH.into(),
            semaphore: Some(RUNTIME_SEMAPHORE.to_string()),
        }
    }

    /// Use a different shared-memory file and semaphore name (`None` skips
    /// the semaphore).
    pub fn with_shared_memory(mut self, path: impl Into<PathBuf>, semaphore: Option<&str>) -> Self {
        self.shm_path = path.into();
        self.semaphore = semaphore.map(str::to_string);
        self
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    fn image_err(name: &str, source: std::io::Error) -> GpuCrError {
        GpuCrError::ImageIo {
            name: name.to_string(),
            source,
        }
    }

    fn ensure_semaphore(&self) -> gpucr::Result<()> {
        let Some(name) = &self.semaphore else {
            return Ok(());
        };
        let cname = CString::new(name.as_str())
            .map_err(|_| GpuCrError::invalid(format!("semaphore name {name:?}")))?;
        // SAFETY: valid NUL-terminated name; variadic mode and initial value
        // as required with O_CREAT.
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT,
                0o666 as libc::c_uint,
                1 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(GpuCrError::device_with_source(
                format!("cannot create semaphore {name}"),
                std::io::Error::last_os_error(),
            ));
        }
        // SAFETY: `sem` came from a successful sem_open.
        unsafe { libc::sem_close(sem) };
        Ok(())
    }
}

impl Host for LinuxHost {
    fn open_process_memory(&self, pid: Pid, writable: bool) -> gpucr::Result<Box<dyn ProcessMemory>> {
        Ok(Box::new(ProcMem::open(pid, writable)?))
    }

    fn write_image(&self, name: &str, bytes: &[u8]) -> gpucr::Result<()> {
        let path = self.image_dir.join(name);
        fs::write(&path, bytes).map_err(|e| Self::image_err(name, e))?;
        tracing::info!(path = %path.display(), bytes = bytes.len(), "image written");
        Ok(())
    }

    fn read_image(&self, name: &str) -> gpucr::Result<Option<Vec<u8>>> {
        let path = self.image_dir.join(name);
        match fs::read(&path) {
            Ok(bytes) => {
                tracing::info!(path = %path.display(), bytes = bytes.len(), "image read");
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::image_err(name, e)),
        }
    }

    fn shared_memory(&self) -> gpucr::Result<SharedMemDescriptor> {
        let mut file = match fs::File::open(&self.shm_path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(SharedMemDescriptor::default()),
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata()?.len();
        let mut magic = [0u8; 4];
        // A segment too short to hold the magic is still recorded by size.
        let magic = match file.read_exact(&mut magic) {
            Ok(()) => u32::from_ne_bytes(magic),
            Err(e) => {
                tracing::warn!(path = %self.shm_path.display(), error = %e, "cannot read shared memory magic");
                0
            }
        };
        tracing::debug!(size, magic = format_args!("0x{magic:x}"), "runtime shared memory");
        Ok(SharedMemDescriptor { size, magic })
    }

    fn recreate_shared_memory(&self, desc: &SharedMemDescriptor) -> gpucr::Result<()> {
        if desc.size == 0 {
            return Ok(());
        }
        if self.shm_path.exists() {
            tracing::debug!(path = %self.shm_path.display(), "shared memory already present");
        } else {
            tracing::warn!(
                path = %self.shm_path.display(),
                "shared memory missing, re-creating; runtime counters are lost"
            );
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.shm_path)?;
            file.set_len(desc.size)?;
            file.write_all(&desc.magic.to_ne_bytes())?;
        }
        self.ensure_semaphore()
    }
}
