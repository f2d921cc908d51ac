use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use gpucr::{GpuCrError, Pid, ProcessMemory};

use crate::error::{KfdError, Result};

/// A process address space through `/proc/<pid>/mem`.
#[derive(Debug)]
pub struct ProcMem {
    file: File,
    pid: Pid,
}

impl ProcMem {
    pub fn open(pid: Pid, writable: bool) -> Result<Self> {
        Self::open_path(format!("/proc/{pid}/mem").into(), pid, writable)
    }

    fn open_path(path: PathBuf, pid: Pid, writable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path)
            .map_err(|source| KfdError::Open { path, source })?;
        Ok(Self { file, pid })
    }
}

impl ProcessMemory for ProcMem {
    fn read_at(&self, addr: u64, out: &mut [u8]) -> gpucr::Result<()> {
        self.file.read_exact_at(out, addr).map_err(|e| {
            GpuCrError::device_with_source(
                format!("read {} bytes at 0x{addr:x} from pid {}", out.len(), self.pid),
                e,
            )
        })
    }

    fn write_at(&self, addr: u64, data: &[u8]) -> gpucr::Result<()> {
        self.file.write_all_at(data, addr).map_err(|e| {
            GpuCrError::device_with_source(
                format!("write {} bytes at 0x{addr:x} to pid {}", data.len(), self.pid),
                e,
            )
        })
    }
}
