//! Bucket-array exchange with the compute driver.
//!
//! One ioctl moves every object of one class. The buffer holds `num_objects`
//! fixed-size buckets followed by a private region; each bucket starts with
//! `(priv_data_offset, priv_data_size)` locating its payload in that region.
//!
//! ```text
//! [bucket 0][bucket 1]...[bucket n-1][priv 0][priv 1]...[priv n-1]
//! ```

mod buckets;
mod fields;

pub use buckets::{BoSlot, DMABUF_FD_AT, DeviceSlot};
pub use fields::{Field, IdKind, Phase, Width, WireRecord, decode, decode_into, encode, encode_into};

use crate::error::{GpuCrError, Result};
use crate::types::ObjectClass;

/// Byte offset of `priv_data_offset` in every bucket.
pub const PRIV_OFFSET_AT: usize = 0;
/// Byte offset of `priv_data_size` in every bucket.
pub const PRIV_SIZE_AT: usize = 8;

/// Per-class counts and private-payload totals reported by the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessInfo {
    pub task_pid: u32,
    pub total_devices: u32,
    pub total_bos: u64,
    pub total_queues: u32,
    pub total_events: u32,
    pub process_priv_data_size: u64,
    pub devices_priv_data_size: u64,
    pub bos_priv_data_size: u64,
    pub queues_priv_data_size: u64,
    pub events_priv_data_size: u64,
}

impl ProcessInfo {
    /// `(object count, private bytes)` for one class.
    pub fn sizing(&self, class: ObjectClass) -> (u64, u64) {
        match class {
            ObjectClass::Process => (1, self.process_priv_data_size),
            ObjectClass::Device => (self.total_devices as u64, self.devices_priv_data_size),
            ObjectClass::Bo => (self.total_bos, self.bos_priv_data_size),
            ObjectClass::Queue => (self.total_queues as u64, self.queues_priv_data_size),
            ObjectClass::Event => (self.total_events as u64, self.events_priv_data_size),
        }
    }
}

/// Contiguous bucket array plus trailing private region for one class.
#[derive(Debug)]
pub struct BucketArray {
    class: ObjectClass,
    num_objects: usize,
    bucket_size: usize,
    buf: Vec<u8>,
}

impl BucketArray {
    /// Zeroed array for `num_objects` buckets and `priv_bytes` of payload.
    pub fn zeroed(
        class: ObjectClass,
        bucket_size: usize,
        num_objects: u64,
        priv_bytes: u64,
    ) -> Result<Self> {
        let too_big = || GpuCrError::ResourceExhaustion {
            what: class.name(),
            bytes: usize::MAX,
        };
        let num_objects = usize::try_from(num_objects).map_err(|_| too_big())?;
        let priv_bytes = usize::try_from(priv_bytes).map_err(|_| too_big())?;
        let total = num_objects
            .checked_mul(bucket_size)
            .and_then(|b| b.checked_add(priv_bytes))
            .ok_or_else(too_big)?;

        let mut buf = Vec::new();
        buf.try_reserve_exact(total)
            .map_err(|_| GpuCrError::ResourceExhaustion {
                what: class.name(),
                bytes: total,
            })?;
        buf.resize(total, 0);
        Ok(Self {
            class,
            num_objects,
            bucket_size,
            buf,
        })
    }

    pub fn class(&self) -> ObjectClass {
        self.class
    }

    pub fn num_objects(&self) -> usize {
        self.num_objects
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// Total size of buckets plus private region.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Raw pointer handed to the driver.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.buf.as_mut_ptr()
    }

    fn buckets_end(&self) -> usize {
        self.num_objects * self.bucket_size
    }

    pub fn private_region(&self) -> &[u8] {
        &self.buf[self.buckets_end()..]
    }

    pub fn private_region_mut(&mut self) -> &mut [u8] {
        let start = self.buckets_end();
        &mut self.buf[start..]
    }

    pub fn bucket(&self, index: usize) -> &[u8] {
        let start = index * self.bucket_size;
        &self.buf[start..start + self.bucket_size]
    }

    pub fn bucket_mut(&mut self, index: usize) -> &mut [u8] {
        let start = index * self.bucket_size;
        &mut self.buf[start..start + self.bucket_size]
    }

    /// Private payload of bucket `index`, bounds-checked against the region.
    pub fn private(&self, index: usize) -> Result<&[u8]> {
        let bucket = self.bucket(index);
        let offset = read_u64(bucket, PRIV_OFFSET_AT);
        let size = read_u64(bucket, PRIV_SIZE_AT);
        let region = self.private_region();
        let end = offset.checked_add(size).filter(|&e| e <= region.len() as u64);
        match end {
            Some(end) => Ok(&region[offset as usize..end as usize]),
            None => Err(GpuCrError::MalformedBuckets {
                class: self.class,
                reason: format!(
                    "bucket {index} private data [{offset}, +{size}) exceeds region of {} bytes",
                    region.len()
                ),
            }),
        }
    }
}

pub(crate) fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_ne_bytes(raw)
}

pub(crate) fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_ne_bytes(raw)
}

pub(crate) fn write_u32(bytes: &mut [u8], at: usize, v: u32) {
    bytes[at..at + 4].copy_from_slice(&v.to_ne_bytes());
}

pub(crate) fn write_u64(bytes: &mut [u8], at: usize, v: u64) {
    bytes[at..at + 8].copy_from_slice(&v.to_ne_bytes());
}
