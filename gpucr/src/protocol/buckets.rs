//! Bucket layouts for the five object classes.

use super::fields::{Field, IdKind, Phase, Width, WireRecord};
use super::{BucketArray, read_u32, write_u32};
use crate::error::{GpuCrError, Result};
use crate::records::{BoRecord, EventRecord, ProcessRecord, QueueRecord};
use crate::types::{GpuId, ObjectClass};

macro_rules! field {
    ($name:literal @ $offset:literal, $width:ident, $phases:ident, $kind:ident, $($path:ident).+) => {
        Field {
            name: $name,
            offset: $offset,
            width: Width::$width,
            phases: Phase::$phases,
            kind: IdKind::$kind,
            get: |r| r.$($path).+ as u64,
            set: |r, v| r.$($path).+ = v as _,
        }
    };
}

// ── Process ─────────────────────────────────────────────────────────

impl WireRecord for ProcessRecord {
    const CLASS: ObjectClass = ObjectClass::Process;
    const BUCKET_SIZE: usize = 16;

    fn fields() -> &'static [Field<Self>] {
        &[]
    }

    fn private_len(&self) -> usize {
        self.private.len()
    }

    fn write_private(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.private);
    }

    fn read_private(&mut self, bytes: &[u8]) -> Result<()> {
        self.private = bytes.to_vec();
        Ok(())
    }
}

// ── Device ──────────────────────────────────────────────────────────

/// Device bucket contents. Both ids are exchanged raw: the dump pass is
/// what builds the id map, and restore fills `actual_gpu_id` itself.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSlot {
    pub user_gpu_id: GpuId,
    pub actual_gpu_id: GpuId,
    /// Render-node descriptor the driver should bind the device to.
    pub drm_fd: i32,
    pub private: Vec<u8>,
}

impl Default for DeviceSlot {
    fn default() -> Self {
        Self {
            user_gpu_id: 0,
            actual_gpu_id: 0,
            drm_fd: -1,
            private: Vec::new(),
        }
    }
}

static DEVICE_FIELDS: [Field<DeviceSlot>; 3] = [
    field!("user_gpu_id" @ 16, U32, BOTH, Scalar, user_gpu_id),
    field!("actual_gpu_id" @ 20, U32, BOTH, Scalar, actual_gpu_id),
    field!("drm_fd" @ 24, U32, RESTORE_IN, Scalar, drm_fd),
];

impl WireRecord for DeviceSlot {
    const CLASS: ObjectClass = ObjectClass::Device;
    const BUCKET_SIZE: usize = 32;

    fn fields() -> &'static [Field<Self>] {
        &DEVICE_FIELDS
    }

    fn private_len(&self) -> usize {
        self.private.len()
    }

    fn write_private(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.private);
    }

    fn read_private(&mut self, bytes: &[u8]) -> Result<()> {
        self.private = bytes.to_vec();
        Ok(())
    }
}

// ── Buffer object ───────────────────────────────────────────────────

/// A buffer record together with the per-exchange values the driver hands
/// back, which never reach the image.
#[derive(Debug, Clone, PartialEq)]
pub struct BoSlot {
    pub record: BoRecord,
    /// Mmap offset of the re-created buffer.
    pub restored_offset: u64,
    /// dma-buf export of the buffer, `-1` if none.
    pub dmabuf_fd: i32,
}

impl BoSlot {
    pub fn new(record: BoRecord) -> Self {
        Self {
            record,
            ..Self::default()
        }
    }

    pub fn gpu_id(&self) -> GpuId {
        self.record.gpu_id
    }

    /// Mark every bucket as holding no dma-buf. The driver only writes the
    /// column for buffers it exports.
    pub fn clear_dmabuf_fds(array: &mut BucketArray) {
        if !Self::is_bo_array(array) {
            return;
        }
        for i in 0..array.num_objects() {
            write_u32(array.bucket_mut(i), DMABUF_FD_AT, -1i32 as u32);
        }
    }

    /// dma-buf fds present in `array`, read from the raw buckets so they can
    /// be closed even when the buckets fail to decode.
    pub fn exported_fds(array: &BucketArray) -> Vec<i32> {
        if !Self::is_bo_array(array) {
            return Vec::new();
        }
        (0..array.num_objects())
            .map(|i| read_u32(array.bucket(i), DMABUF_FD_AT) as i32)
            .filter(|&fd| fd >= 0)
            .collect()
    }

    fn is_bo_array(array: &BucketArray) -> bool {
        array.class() == ObjectClass::Bo && array.bucket_size() == <Self as WireRecord>::BUCKET_SIZE
    }
}

impl Default for BoSlot {
    fn default() -> Self {
        Self {
            record: BoRecord::default(),
            restored_offset: 0,
            dmabuf_fd: -1,
        }
    }
}

/// Byte offset of `dmabuf_fd` in a bo bucket.
pub const DMABUF_FD_AT: usize = 56;

static BO_FIELDS: [Field<BoSlot>; 7] = [
    field!("addr" @ 16, U64, BOTH, Scalar, record.addr),
    field!("size" @ 24, U64, BOTH, Scalar, record.size),
    field!("offset" @ 32, U64, BOTH, Scalar, record.offset),
    field!("restored_offset" @ 40, U64, RESTORE_OUT, Scalar, restored_offset),
    field!("gpu_id" @ 48, U32, BOTH, GpuId, record.gpu_id),
    field!("alloc_flags" @ 52, U32, BOTH, Scalar, record.alloc_flags),
    Field {
        name: "dmabuf_fd",
        offset: DMABUF_FD_AT,
        width: Width::U32,
        phases: Phase::DUMP.union(Phase::RESTORE_IN).union(Phase::RESTORE_OUT),
        kind: IdKind::Scalar,
        get: |r| r.dmabuf_fd as u32 as u64,
        set: |r, v| r.dmabuf_fd = v as u32 as i32,
    },
];

impl WireRecord for BoSlot {
    const CLASS: ObjectClass = ObjectClass::Bo;
    const BUCKET_SIZE: usize = 64;

    fn fields() -> &'static [Field<Self>] {
        &BO_FIELDS
    }

    fn private_len(&self) -> usize {
        self.record.private.len()
    }

    fn write_private(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.record.private);
    }

    fn read_private(&mut self, bytes: &[u8]) -> Result<()> {
        self.record.private = bytes.to_vec();
        Ok(())
    }
}

// ── Queue ───────────────────────────────────────────────────────────

static QUEUE_FIELDS: [Field<QueueRecord>; 21] = [
    field!("q_address" @ 16, U64, BOTH, Scalar, q_address),
    field!("q_size" @ 24, U64, BOTH, Scalar, q_size),
    field!("read_ptr_addr" @ 32, U64, BOTH, Scalar, read_ptr_addr),
    field!("write_ptr_addr" @ 40, U64, BOTH, Scalar, write_ptr_addr),
    field!("doorbell_off" @ 48, U64, BOTH, Scalar, doorbell_off),
    field!("eop_ring_buffer_address" @ 56, U64, BOTH, Scalar, eop_ring_buffer_address),
    field!("ctx_save_restore_area_address" @ 64, U64, BOTH, Scalar, ctx_save_restore_area_address),
    field!("gpu_id" @ 72, U32, BOTH, GpuId, gpu_id),
    field!("type" @ 76, U32, BOTH, Scalar, kind),
    field!("format" @ 80, U32, BOTH, Scalar, format),
    field!("q_id" @ 84, U32, BOTH, Scalar, q_id),
    field!("priority" @ 88, U32, BOTH, Scalar, priority),
    field!("q_percent" @ 92, U32, BOTH, Scalar, q_percent),
    field!("doorbell_id" @ 96, U32, BOTH, Scalar, doorbell_id),
    field!("is_gws" @ 100, U32, BOTH, Scalar, is_gws),
    field!("sdma_id" @ 104, U32, BOTH, Scalar, sdma_id),
    field!("eop_ring_buffer_size" @ 108, U32, BOTH, Scalar, eop_ring_buffer_size),
    field!("ctx_save_restore_area_size" @ 112, U32, BOTH, Scalar, ctx_save_restore_area_size),
    field!("ctl_stack_size" @ 116, U32, BOTH, Scalar, ctl_stack_size),
    field!("cu_mask_size" @ 120, U32, BOTH, Scalar, cu_mask_size),
    field!("mqd_size" @ 124, U32, BOTH, Scalar, mqd_size),
];

impl WireRecord for QueueRecord {
    const CLASS: ObjectClass = ObjectClass::Queue;
    const BUCKET_SIZE: usize = 128;

    fn fields() -> &'static [Field<Self>] {
        &QUEUE_FIELDS
    }

    fn private_len(&self) -> usize {
        self.data.len() + self.private.len()
    }

    // CU mask, MQD and control stack come first, driver bytes last.
    fn write_private(&self, out: &mut [u8]) {
        let (blobs, rest) = out.split_at_mut(self.data.len());
        blobs.copy_from_slice(&self.data);
        rest.copy_from_slice(&self.private);
    }

    fn read_private(&mut self, bytes: &[u8]) -> Result<()> {
        let blobs = self.blobs_len();
        if blobs > bytes.len() {
            return Err(GpuCrError::MalformedBuckets {
                class: ObjectClass::Queue,
                reason: format!(
                    "queue {} declares {blobs} bytes of cu_mask/mqd/ctl_stack but has {} private bytes",
                    self.q_id,
                    bytes.len()
                ),
            });
        }
        let (data, private) = bytes.split_at(blobs);
        self.data = data.to_vec();
        self.private = private.to_vec();
        Ok(())
    }
}

// ── Event ───────────────────────────────────────────────────────────

const FAIL_NOT_PRESENT: u64 = 1 << 0;
const FAIL_READ_ONLY: u64 = 1 << 1;
const FAIL_NO_EXECUTE: u64 = 1 << 2;

static EVENT_FIELDS: [Field<EventRecord>; 11] = [
    field!("mem_exc_va" @ 16, U64, BOTH, Scalar, mem_exc_va),
    field!("event_id" @ 24, U32, BOTH, Scalar, event_id),
    field!("auto_reset" @ 28, U32, BOTH, Scalar, auto_reset),
    field!("type" @ 32, U32, BOTH, Scalar, kind),
    field!("signaled" @ 36, U32, BOTH, Scalar, signaled),
    field!("mem_exc_gpu_id" @ 40, U32, BOTH, OptionalGpuId, mem_exc_gpu_id),
    Field {
        name: "mem_exc_fail_flags",
        offset: 44,
        width: Width::U32,
        phases: Phase::BOTH,
        kind: IdKind::Scalar,
        get: |r| {
            let mut v = 0;
            if r.mem_exc_fail_not_present {
                v |= FAIL_NOT_PRESENT;
            }
            if r.mem_exc_fail_read_only {
                v |= FAIL_READ_ONLY;
            }
            if r.mem_exc_fail_no_execute {
                v |= FAIL_NO_EXECUTE;
            }
            v
        },
        set: |r, v| {
            r.mem_exc_fail_not_present = v & FAIL_NOT_PRESENT != 0;
            r.mem_exc_fail_read_only = v & FAIL_READ_ONLY != 0;
            r.mem_exc_fail_no_execute = v & FAIL_NO_EXECUTE != 0;
        },
    },
    field!("hw_exc_gpu_id" @ 48, U32, BOTH, OptionalGpuId, hw_exc_gpu_id),
    field!("hw_exc_reset_type" @ 52, U32, BOTH, Scalar, hw_exc_reset_type),
    field!("hw_exc_reset_cause" @ 56, U32, BOTH, Scalar, hw_exc_reset_cause),
    field!("hw_exc_memory_lost" @ 60, U32, BOTH, Scalar, hw_exc_memory_lost),
];

impl WireRecord for EventRecord {
    const CLASS: ObjectClass = ObjectClass::Event;
    const BUCKET_SIZE: usize = 64;

    fn fields() -> &'static [Field<Self>] {
        &EVENT_FIELDS
    }

    fn private_len(&self) -> usize {
        self.private.len()
    }

    fn write_private(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.private);
    }

    fn read_private(&mut self, bytes: &[u8]) -> Result<()> {
        self.private = bytes.to_vec();
        Ok(())
    }
}
