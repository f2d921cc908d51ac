//! Checkpoint image framing and validation.
//!
//! ```text
//! [0..4] magic
//! [4..8] format version: u32 LE
//! [8..]  rkyv payload
//! ```

use crate::error::{GpuCrError, Result};
use crate::records::{KfdImage, RenderNodeRecord};
use crate::types::INVALID_GPU_ID;

pub const HEADER_SIZE: usize = 8;
pub const FORMAT_VERSION: u32 = 1;

/// A record type stored as one image file.
pub trait ImageKind: Sized {
    const MAGIC: [u8; 4];

    /// File name for the image of device file `id`.
    fn file_name(id: u32) -> String;

    /// Semantic checks beyond what the archive validator covers.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn to_payload(&self) -> Result<rkyv::util::AlignedVec>;

    fn from_payload(bytes: &[u8]) -> Result<Self>;
}

macro_rules! archived_payload {
    ($ty:ty) => {
        fn to_payload(&self) -> Result<rkyv::util::AlignedVec> {
            rkyv::to_bytes::<rkyv::rancor::Error>(self)
                .map_err(|e| GpuCrError::EncodeFailed(e.to_string()))
        }

        fn from_payload(bytes: &[u8]) -> Result<Self> {
            rkyv::from_bytes::<$ty, rkyv::rancor::Error>(bytes)
                .map_err(|e| GpuCrError::DecodeFailed(e.to_string()))
        }
    };
}

impl ImageKind for KfdImage {
    const MAGIC: [u8; 4] = *b"GKFD";

    archived_payload!(KfdImage);

    fn file_name(id: u32) -> String {
        format!("kfd.{id}.img")
    }

    fn validate(&self) -> Result<()> {
        let gpus = self.devices.iter().filter(|d| d.is_gpu()).count();
        let declared = u64::from(self.num_of_gpus) + u64::from(self.num_of_cpus);
        if gpus as u64 != u64::from(self.num_of_gpus) || self.devices.len() as u64 != declared {
            return Err(GpuCrError::invalid(format!(
                "device count mismatch: {} records, {} gpus, header says {} gpus + {} cpus",
                self.devices.len(),
                gpus,
                self.num_of_gpus,
                self.num_of_cpus
            )));
        }
        for (i, bo) in self.bos.iter().enumerate() {
            if bo.gpu_id == INVALID_GPU_ID {
                return Err(GpuCrError::invalid(format!("bo {i} has gpu_id 0")));
            }
            let backed = bo.flags().is_device_backed();
            match &bo.rawdata {
                Some(data) if backed && data.len() as u64 == bo.size => {}
                None if !backed => {}
                Some(data) => {
                    return Err(GpuCrError::invalid(format!(
                        "bo {i} (flags 0x{:x}, size {}) carries {} payload bytes",
                        bo.alloc_flags,
                        bo.size,
                        data.len()
                    )));
                }
                None => {
                    return Err(GpuCrError::invalid(format!(
                        "device-backed bo {i} has no payload"
                    )));
                }
            }
        }
        for q in &self.queues {
            if q.gpu_id == INVALID_GPU_ID || q.blobs_len() != q.data.len() {
                return Err(GpuCrError::invalid(format!(
                    "queue {} (gpu 0x{:04x}) has {} data bytes for {} declared",
                    q.q_id,
                    q.gpu_id,
                    q.data.len(),
                    q.blobs_len()
                )));
            }
        }
        Ok(())
    }
}

impl ImageKind for RenderNodeRecord {
    const MAGIC: [u8; 4] = *b"GRND";

    archived_payload!(RenderNodeRecord);

    fn file_name(id: u32) -> String {
        format!("renderDXXX.{id}.img")
    }

    fn validate(&self) -> Result<()> {
        if self.gpu_id == INVALID_GPU_ID {
            return Err(GpuCrError::invalid("render node record has gpu_id 0"));
        }
        Ok(())
    }
}

/// Validate and serialize `value` into a framed image.
pub fn encode_image<T: ImageKind>(value: &T) -> Result<Vec<u8>> {
    value.validate()?;
    let payload = value.to_payload()?;

    let mut buf = Vec::new();
    buf.try_reserve_exact(HEADER_SIZE + payload.len())
        .map_err(|_| GpuCrError::ResourceExhaustion {
            what: "image",
            bytes: HEADER_SIZE + payload.len(),
        })?;
    buf.extend_from_slice(&T::MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Check the frame, deserialize, then validate.
pub fn decode_image<T: ImageKind>(buf: &[u8]) -> Result<T> {
    if buf.len() < HEADER_SIZE {
        return Err(GpuCrError::DecodeFailed(format!(
            "image too short: {} < {HEADER_SIZE}",
            buf.len()
        )));
    }
    if buf[..4] != T::MAGIC {
        return Err(GpuCrError::DecodeFailed(format!(
            "bad magic {:02x?}, expected {:02x?}",
            &buf[..4],
            T::MAGIC
        )));
    }
    let version = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if version != FORMAT_VERSION {
        return Err(GpuCrError::DecodeFailed(format!(
            "unsupported image version {version}"
        )));
    }

    // The archive needs aligned storage; the header leaves the payload at an
    // arbitrary alignment.
    let mut aligned = rkyv::util::AlignedVec::<16>::new();
    aligned.extend_from_slice(&buf[HEADER_SIZE..]);
    let value = T::from_payload(&aligned)?;
    value.validate()?;
    Ok(value)
}
