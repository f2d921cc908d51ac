//! Field-descriptor tables and the generic bucket codec.
//!
//! Each bucket class declares one table of [`Field`]s. The same table is
//! walked in every direction; a field's [`Phase`] set decides which passes
//! touch it:
//!
//! - dump: the driver fills `DUMP` fields, we decode them.
//! - restore: we encode `RESTORE_IN` fields, the driver consumes them.
//! - restore read-back: the driver fills `RESTORE_OUT` fields in place.

use super::{BucketArray, PRIV_OFFSET_AT, PRIV_SIZE_AT, read_u32, read_u64, write_u32, write_u64};
use crate::error::{GpuCrError, Result};
use crate::identity::GpuIdMap;
use crate::types::ObjectClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    U32,
    U64,
}

impl Width {
    fn read(self, bucket: &[u8], at: usize) -> u64 {
        match self {
            Width::U32 => read_u32(bucket, at) as u64,
            Width::U64 => read_u64(bucket, at),
        }
    }

    fn write(self, bucket: &mut [u8], at: usize, v: u64) {
        match self {
            Width::U32 => write_u32(bucket, at, v as u32),
            Width::U64 => write_u64(bucket, at, v),
        }
    }

    pub const fn bytes(self) -> usize {
        match self {
            Width::U32 => 4,
            Width::U64 => 8,
        }
    }
}

bitflags::bitflags! {
    /// Which exchange passes carry a field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Phase: u8 {
        const DUMP = 1 << 0;
        const RESTORE_IN = 1 << 1;
        const RESTORE_OUT = 1 << 2;
        const BOTH = Self::DUMP.bits() | Self::RESTORE_IN.bits();
    }
}

/// How a field's value relates to gpu identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Scalar,
    /// A gpu id that must be translated and must not be zero.
    GpuId,
    /// A gpu id where zero means "none" and is passed through.
    OptionalGpuId,
}

/// One scalar slot of a bucket.
pub struct Field<R> {
    pub name: &'static str,
    pub offset: usize,
    pub width: Width,
    pub phases: Phase,
    pub kind: IdKind,
    pub get: fn(&R) -> u64,
    pub set: fn(&mut R, u64),
}

/// A record type that maps onto one bucket class.
pub trait WireRecord: Default + 'static {
    const CLASS: ObjectClass;
    const BUCKET_SIZE: usize;

    fn fields() -> &'static [Field<Self>];

    /// Bytes this record contributes to the private region.
    fn private_len(&self) -> usize;

    /// Serialize the private payload into `out` (`out.len() == private_len()`).
    fn write_private(&self, out: &mut [u8]);

    /// Take the private payload. Scalar fields are already decoded.
    fn read_private(&mut self, bytes: &[u8]) -> Result<()>;
}

fn translate<R>(
    class: ObjectClass,
    index: usize,
    field: &Field<R>,
    raw: u64,
    ids: Option<&GpuIdMap>,
) -> Result<u64> {
    let Some(ids) = ids else {
        return Ok(raw);
    };
    match field.kind {
        IdKind::Scalar => Ok(raw),
        IdKind::OptionalGpuId if raw == 0 => Ok(0),
        IdKind::GpuId if raw == 0 => Err(GpuCrError::mapping(format!(
            "{class} bucket {index}: {} is the reserved id 0",
            field.name
        ))),
        IdKind::GpuId | IdKind::OptionalGpuId => {
            let id = u32::try_from(raw).map_err(|_| GpuCrError::MalformedBuckets {
                class,
                reason: format!("bucket {index}: {} 0x{raw:x} out of range", field.name),
            })?;
            Ok(ids.resolve(id)? as u64)
        }
    }
}

fn check_shape<R: WireRecord>(array: &BucketArray, count: usize) -> Result<()> {
    if array.class() != R::CLASS || array.bucket_size() != R::BUCKET_SIZE {
        return Err(GpuCrError::MalformedBuckets {
            class: array.class(),
            reason: format!(
                "expected {} buckets of {} bytes, got {} buckets of {} bytes",
                R::CLASS,
                R::BUCKET_SIZE,
                array.class(),
                array.bucket_size()
            ),
        });
    }
    if array.num_objects() != count {
        return Err(GpuCrError::MalformedBuckets {
            class: R::CLASS,
            reason: format!(
                "array holds {} buckets, {count} records given",
                array.num_objects()
            ),
        });
    }
    Ok(())
}

/// Write the `phase` fields of `records` into existing buckets. Private
/// payloads are left alone.
pub fn encode_into<R: WireRecord>(
    array: &mut BucketArray,
    records: &[R],
    phase: Phase,
    ids: Option<&GpuIdMap>,
) -> Result<()> {
    check_shape::<R>(array, records.len())?;
    for (i, record) in records.iter().enumerate() {
        for field in R::fields().iter().filter(|f| f.phases.intersects(phase)) {
            let v = translate(R::CLASS, i, field, (field.get)(record), ids)?;
            field.width.write(array.bucket_mut(i), field.offset, v);
        }
    }
    Ok(())
}

/// Read the `phase` fields of every bucket into `records`.
pub fn decode_into<R: WireRecord>(
    array: &BucketArray,
    records: &mut [R],
    phase: Phase,
    ids: Option<&GpuIdMap>,
) -> Result<()> {
    check_shape::<R>(array, records.len())?;
    for (i, record) in records.iter_mut().enumerate() {
        let bucket = array.bucket(i);
        for field in R::fields().iter().filter(|f| f.phases.intersects(phase)) {
            let raw = field.width.read(bucket, field.offset);
            let v = translate(R::CLASS, i, field, raw, ids)?;
            (field.set)(record, v);
        }
    }
    Ok(())
}

/// Build a fresh bucket array from `records`: `phase` fields plus private
/// payloads packed back to back.
pub fn encode<R: WireRecord>(
    records: &[R],
    phase: Phase,
    ids: Option<&GpuIdMap>,
) -> Result<BucketArray> {
    let priv_total: u64 = records.iter().map(|r| r.private_len() as u64).sum();
    let mut array = BucketArray::zeroed(R::CLASS, R::BUCKET_SIZE, records.len() as u64, priv_total)?;
    encode_into(&mut array, records, phase, ids)?;

    let mut cursor = 0usize;
    for (i, record) in records.iter().enumerate() {
        let len = record.private_len();
        record.write_private(&mut array.private_region_mut()[cursor..cursor + len]);
        let bucket = array.bucket_mut(i);
        write_u64(bucket, PRIV_OFFSET_AT, cursor as u64);
        write_u64(bucket, PRIV_SIZE_AT, len as u64);
        cursor += len;
    }
    Ok(array)
}

/// Decode every bucket of `array` into new records, private payloads
/// included.
pub fn decode<R: WireRecord>(
    array: &BucketArray,
    phase: Phase,
    ids: Option<&GpuIdMap>,
) -> Result<Vec<R>> {
    let n = array.num_objects();
    let mut records = Vec::new();
    records
        .try_reserve_exact(n)
        .map_err(|_| GpuCrError::ResourceExhaustion {
            what: R::CLASS.name(),
            bytes: n.saturating_mul(std::mem::size_of::<R>()),
        })?;
    records.resize_with(n, R::default);

    decode_into(array, &mut records, phase, ids)?;
    for (i, record) in records.iter_mut().enumerate() {
        record.read_private(array.private(i)?)?;
    }
    Ok(records)
}
