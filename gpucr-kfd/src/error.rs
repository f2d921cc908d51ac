use std::path::PathBuf;

use gpucr::{GpuCrError, ObjectClass};

pub type Result<T> = std::result::Result<T, KfdError>;

#[derive(Debug, thiserror::Error)]
pub enum KfdError {
    #[error(transparent)]
    Core(#[from] GpuCrError),

    #[error("cannot open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{op} ioctl failed: {source}")]
    Ioctl {
        op: &'static str,
        class: Option<ObjectClass>,
        #[source]
        source: std::io::Error,
    },

    #[error("mmap of {len} bytes at offset 0x{offset:x} failed: {source}")]
    Mmap {
        offset: u64,
        len: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("sysfs {}: {reason}", .path.display())]
    Sysfs { path: PathBuf, reason: String },
}

impl KfdError {
    pub fn ioctl(op: &'static str, source: std::io::Error) -> Self {
        Self::Ioctl {
            op,
            class: None,
            source,
        }
    }

    pub fn sysfs(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Sysfs {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<KfdError> for GpuCrError {
    fn from(e: KfdError) -> Self {
        match e {
            KfdError::Core(e) => e,
            KfdError::Ioctl { op, class, source } => GpuCrError::DeviceProtocol {
                op,
                class,
                errno: source.raw_os_error().unwrap_or(0),
            },
            KfdError::Sysfs { .. } => GpuCrError::Topology {
                reason: e.to_string(),
            },
            KfdError::Mmap { offset, len, source } => GpuCrError::device_with_source(
                format!("mmap of {len} bytes at offset 0x{offset:x} failed"),
                source,
            ),
            KfdError::Open { .. } => GpuCrError::device_with_source("device open failed", e),
        }
    }
}
