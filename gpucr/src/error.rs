use crate::types::{GpuId, ObjectClass};

pub type Result<T> = std::result::Result<T, GpuCrError>;

/// Linux errno values used for host status codes. Kept local so the core
/// crate stays free of platform bindings.
mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EEXIST: i32 = 17;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const EBADFD: i32 = 77;
    pub const ETIMEDOUT: i32 = 110;
}

#[derive(Debug, thiserror::Error)]
pub enum GpuCrError {
    #[error("allocation of {bytes} bytes for {what} failed")]
    ResourceExhaustion { what: &'static str, bytes: usize },

    #[error("{op} ioctl failed for {class:?} objects (errno {errno})")]
    DeviceProtocol {
        op: &'static str,
        class: Option<ObjectClass>,
        errno: i32,
    },

    #[error("malformed {class} bucket array: {reason}")]
    MalformedBuckets { class: ObjectClass, reason: String },

    #[error("device mapping failed: {reason}")]
    DeviceMapping { reason: String },

    #[error("gpu_id 0x{gpu_id:04x} has no mapping")]
    UnmappedGpu { gpu_id: GpuId },

    #[error("transfer on gpu 0x{gpu_id:04x} failed: {message}")]
    Transfer {
        gpu_id: GpuId,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("hardware copy fence timed out after {timeout_ms}ms")]
    FenceTimeout { timeout_ms: u64 },

    #[error("buffer transfer failed on {} gpu(s): {gpus:04x?}", .gpus.len())]
    WorkersFailed { gpus: Vec<GpuId> },

    #[error("image {name}: {source}")]
    ImageIo {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("image decode failed: {0}")]
    DecodeFailed(String),

    #[error("image encode failed: {0}")]
    EncodeFailed(String),

    #[error("invalid record: {reason}")]
    InvalidRecord { reason: String },

    #[error("topology error: {reason}")]
    Topology { reason: String },

    #[error("relocation for addr 0x{addr:x} offset 0x{offset:x} already recorded")]
    DuplicateRelocation { addr: u64, offset: u64 },

    #[error("device error: {message}")]
    Device {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GpuCrError {
    /// Create a `Device` error with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Device` error with a message and a source error.
    pub fn device_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Device {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a `Transfer` error for `gpu_id` with just a message.
    pub fn transfer(gpu_id: GpuId, msg: impl Into<String>) -> Self {
        Self::Transfer {
            gpu_id,
            message: msg.into(),
            source: None,
        }
    }

    pub fn mapping(reason: impl Into<String>) -> Self {
        Self::DeviceMapping {
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            reason: reason.into(),
        }
    }

    /// True for failures the transfer engine may recover from by switching
    /// to the CPU fallback path.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transfer { .. } | Self::FenceTimeout { .. })
    }

    /// Negative errno-style status code reported to the host.
    pub fn errno(&self) -> i32 {
        let code = match self {
            Self::ResourceExhaustion { .. } => errno::ENOMEM,
            Self::DeviceProtocol { errno, .. } if *errno > 0 => *errno,
            Self::DeviceProtocol { .. } => errno::EIO,
            Self::MalformedBuckets { .. } => errno::EINVAL,
            Self::DeviceMapping { .. } | Self::UnmappedGpu { .. } => errno::ENODEV,
            Self::Transfer { .. } | Self::WorkersFailed { .. } => errno::EIO,
            Self::FenceTimeout { .. } => errno::ETIMEDOUT,
            Self::ImageIo { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound => errno::ENOENT,
                std::io::ErrorKind::PermissionDenied => errno::EPERM,
                _ => source.raw_os_error().unwrap_or(errno::EIO),
            },
            Self::DecodeFailed(_) | Self::EncodeFailed(_) => errno::EBADFD,
            Self::InvalidRecord { .. } | Self::Topology { .. } => errno::EINVAL,
            Self::DuplicateRelocation { .. } => errno::EEXIST,
            Self::Device { .. } => errno::EIO,
            Self::Io(e) => e.raw_os_error().unwrap_or(errno::EIO),
        };
        -code
    }
}
