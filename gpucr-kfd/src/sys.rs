//! Raw kernel ABI: ioctl request numbers and `#[repr(C)]` argument structs for
//! the compute driver (`/dev/kfd`) and the amdgpu render node.

#![allow(non_camel_case_types)]

use std::mem::size_of;

use libc::c_ulong;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = 8;
const IOC_SIZESHIFT: u32 = 16;
const IOC_DIRSHIFT: u32 = 30;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

/// Linux `_IOC` encoding.
pub const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> c_ulong {
    ((dir << IOC_DIRSHIFT)
        | ((ty as u32) << IOC_TYPESHIFT)
        | ((nr as u32) << IOC_NRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)) as c_ulong
}

pub const fn iow<T>(ty: u8, nr: u8) -> c_ulong {
    ioc(IOC_WRITE, ty, nr, size_of::<T>())
}

pub const fn iowr<T>(ty: u8, nr: u8) -> c_ulong {
    ioc(IOC_READ | IOC_WRITE, ty, nr, size_of::<T>())
}

// ---------------------------------------------------------------------------
// KFD
// ---------------------------------------------------------------------------

pub const KFD_IOCTL_BASE: u8 = b'K';

/// Bucket-array request shared by the dumper and restorer ioctls.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct kfd_criu_objects_args {
    pub type_: u32,
    pub pad: u32,
    pub index_start: u64,
    pub num_objects: u64,
    pub objects_size: u64,
    pub objects: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct kfd_criu_process_info_args {
    pub total_devices: u32,
    pub total_queues: u32,
    pub total_events: u32,
    pub task_pid: u32,
    pub total_bos: u64,
    pub process_priv_data_size: u64,
    pub devices_priv_data_size: u64,
    pub bos_priv_data_size: u64,
    pub queues_priv_data_size: u64,
    pub events_priv_data_size: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct kfd_criu_pause_args {
    pub pause: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct kfd_criu_resume_args {
    pub pid: u32,
    pub pad: u32,
}

pub const AMDKFD_IOC_CRIU_DUMPER: c_ulong = iowr::<kfd_criu_objects_args>(KFD_IOCTL_BASE, 0x22);
pub const AMDKFD_IOC_CRIU_RESTORER: c_ulong = iowr::<kfd_criu_objects_args>(KFD_IOCTL_BASE, 0x23);
pub const AMDKFD_IOC_CRIU_PAUSE: c_ulong = iowr::<kfd_criu_pause_args>(KFD_IOCTL_BASE, 0x24);
pub const AMDKFD_IOC_CRIU_RESUME: c_ulong = iowr::<kfd_criu_resume_args>(KFD_IOCTL_BASE, 0x25);
pub const AMDKFD_IOC_CRIU_PROCESS_INFO: c_ulong =
    iowr::<kfd_criu_process_info_args>(KFD_IOCTL_BASE, 0x26);

// ---------------------------------------------------------------------------
// DRM core
// ---------------------------------------------------------------------------

pub const DRM_IOCTL_BASE: u8 = b'd';
pub const DRM_COMMAND_BASE: u8 = 0x40;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_gem_close {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_prime_handle {
    pub handle: u32,
    pub flags: u32,
    pub fd: i32,
}

pub const DRM_IOCTL_GEM_CLOSE: c_ulong = iow::<drm_gem_close>(DRM_IOCTL_BASE, 0x09);
pub const DRM_IOCTL_PRIME_FD_TO_HANDLE: c_ulong = iowr::<drm_prime_handle>(DRM_IOCTL_BASE, 0x2e);

// ---------------------------------------------------------------------------
// amdgpu
// ---------------------------------------------------------------------------

pub const AMDGPU_GEM_DOMAIN_GTT: u64 = 0x2;
pub const AMDGPU_GEM_CREATE_CPU_ACCESS_REQUIRED: u64 = 1 << 0;
pub const AMDGPU_GEM_CREATE_CPU_GTT_USWC: u64 = 1 << 2;

pub const AMDGPU_VA_OP_MAP: u32 = 1;
pub const AMDGPU_VA_OP_UNMAP: u32 = 2;
pub const AMDGPU_VM_PAGE_READABLE: u32 = 1 << 1;
pub const AMDGPU_VM_PAGE_WRITEABLE: u32 = 1 << 2;

pub const AMDGPU_CTX_OP_ALLOC_CTX: u32 = 1;
pub const AMDGPU_CTX_OP_FREE_CTX: u32 = 2;

pub const AMDGPU_HW_IP_DMA: u32 = 2;

pub const AMDGPU_CHUNK_ID_IB: u32 = 0x01;
pub const AMDGPU_CHUNK_ID_BO_HANDLES: u32 = 0x06;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_amdgpu_gem_create_in {
    pub bo_size: u64,
    pub alignment: u64,
    pub domains: u64,
    pub domain_flags: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_amdgpu_gem_create_out {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union drm_amdgpu_gem_create {
    pub in_: drm_amdgpu_gem_create_in,
    pub out: drm_amdgpu_gem_create_out,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_amdgpu_gem_mmap_in {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_amdgpu_gem_mmap_out {
    pub addr_ptr: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union drm_amdgpu_gem_mmap {
    pub in_: drm_amdgpu_gem_mmap_in,
    pub out: drm_amdgpu_gem_mmap_out,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_amdgpu_gem_va {
    pub handle: u32,
    pub pad: u32,
    pub operation: u32,
    pub flags: u32,
    pub va_address: u64,
    pub offset_in_bo: u64,
    pub map_size: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_amdgpu_ctx_in {
    pub op: u32,
    pub flags: u32,
    pub ctx_id: u32,
    pub priority: i32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_amdgpu_ctx_out_alloc {
    pub ctx_id: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union drm_amdgpu_ctx {
    pub in_: drm_amdgpu_ctx_in,
    pub out: drm_amdgpu_ctx_out_alloc,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_amdgpu_bo_list_entry {
    pub bo_handle: u32,
    pub bo_priority: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_amdgpu_bo_list_in {
    pub operation: u32,
    pub list_handle: u32,
    pub bo_number: u32,
    pub bo_info_size: u32,
    pub bo_info_ptr: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_amdgpu_cs_chunk {
    pub chunk_id: u32,
    pub length_dw: u32,
    pub chunk_data: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_amdgpu_cs_chunk_ib {
    pub pad: u32,
    pub flags: u32,
    pub va_start: u64,
    pub ib_bytes: u32,
    pub ip_type: u32,
    pub ip_instance: u32,
    pub ring: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_amdgpu_cs_in {
    pub ctx_id: u32,
    pub bo_list_handle: u32,
    pub num_chunks: u32,
    pub flags: u32,
    /// Pointer to an array of pointers to [`drm_amdgpu_cs_chunk`].
    pub chunks: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_amdgpu_cs_out {
    pub handle: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union drm_amdgpu_cs {
    pub in_: drm_amdgpu_cs_in,
    pub out: drm_amdgpu_cs_out,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_amdgpu_wait_cs_in {
    pub handle: u64,
    /// Absolute CLOCK_MONOTONIC deadline in nanoseconds.
    pub timeout: u64,
    pub ip_type: u32,
    pub ip_instance: u32,
    pub ring: u32,
    pub ctx_id: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_amdgpu_wait_cs_out {
    /// Non-zero while the submission is still busy.
    pub status: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union drm_amdgpu_wait_cs {
    pub in_: drm_amdgpu_wait_cs_in,
    pub out: drm_amdgpu_wait_cs_out,
}

const fn amdgpu_iowr<T>(nr: u8) -> c_ulong {
    iowr::<T>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + nr)
}

pub const DRM_IOCTL_AMDGPU_GEM_CREATE: c_ulong = amdgpu_iowr::<drm_amdgpu_gem_create>(0x00);
pub const DRM_IOCTL_AMDGPU_GEM_MMAP: c_ulong = amdgpu_iowr::<drm_amdgpu_gem_mmap>(0x01);
pub const DRM_IOCTL_AMDGPU_CTX: c_ulong = amdgpu_iowr::<drm_amdgpu_ctx>(0x02);
pub const DRM_IOCTL_AMDGPU_CS: c_ulong = amdgpu_iowr::<drm_amdgpu_cs>(0x04);
pub const DRM_IOCTL_AMDGPU_GEM_VA: c_ulong =
    iow::<drm_amdgpu_gem_va>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 0x08);
pub const DRM_IOCTL_AMDGPU_WAIT_CS: c_ulong = amdgpu_iowr::<drm_amdgpu_wait_cs>(0x09);
