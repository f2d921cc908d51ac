//! Hardware copy path: SDMA linear copies submitted through the amdgpu
//! render node.
//!
//! Each copy imports the buffer's dma-buf, maps it into this process's GPU
//! address space next to a GTT staging window, and moves at most
//! `staging_bytes` per submission. Buffers larger than the window take
//! several round trips.

use std::mem::size_of;
use std::os::fd::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use gpucr::{BoHandle, CopyEngine, GpuCrError, GpuId, TransferConfig};

use crate::error::{KfdError, Result};
use crate::ioctl::ioctl;
use crate::render::Mapping;
use crate::sys;

const SDMA_OP_NOP: u32 = 0;
const SDMA_OP_COPY: u32 = 1;
const SDMA_SUBOP_COPY_LINEAR: u32 = 0;

/// Dwords in one linear-copy packet.
pub const LINEAR_COPY_DWORDS: usize = 7;
/// IBs are padded with NOPs to this many dwords.
const IB_ALIGN_DWORDS: usize = 8;

/// Second wait on a copy whose fence missed the configured timeout.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

const PAGE: u64 = 4096;
/// GPU virtual addresses used by the engine in this process's VM.
const VA_BASE: u64 = 1 << 32;
const VA_ALIGN: u64 = 2 << 20;

fn align_up(v: u64, a: u64) -> u64 {
    v.div_ceil(a) * a
}

/// Append linear-copy packets moving `len` bytes from `src` to `dst`, each
/// spanning at most `max_span` bytes.
pub fn push_linear_copy(ib: &mut Vec<u32>, src: u64, dst: u64, len: u64, max_span: u64) {
    let mut done = 0;
    while done < len {
        let n = (len - done).min(max_span);
        let (s, d) = (src + done, dst + done);
        ib.extend_from_slice(&[
            SDMA_OP_COPY | (SDMA_SUBOP_COPY_LINEAR << 8),
            (n - 1) as u32,
            0,
            s as u32,
            (s >> 32) as u32,
            d as u32,
            (d >> 32) as u32,
        ]);
        done += n;
    }
}

pub fn pad_ib(ib: &mut Vec<u32>) {
    while ib.len() % IB_ALIGN_DWORDS != 0 {
        ib.push(SDMA_OP_NOP);
    }
}

/// Largest IB needed to move one staging window.
fn ib_capacity_bytes(staging: u64, max_span: u64) -> u64 {
    let packets = staging.div_ceil(max_span) as usize;
    let dwords = packets * LINEAR_COPY_DWORDS + IB_ALIGN_DWORDS;
    align_up((dwords * size_of::<u32>()) as u64, PAGE)
}

fn gem_close(fd: RawFd, handle: u32) {
    let mut args = sys::drm_gem_close { handle, pad: 0 };
    // SAFETY: plain-data argument matching the request.
    if let Err(e) = unsafe { ioctl(fd, sys::DRM_IOCTL_GEM_CLOSE, &mut args) } {
        tracing::debug!(handle, error = %e, "gem close failed");
    }
}

fn gem_va(fd: RawFd, handle: u32, operation: u32, va: u64, size: u64) -> Result<()> {
    let mut args = sys::drm_amdgpu_gem_va {
        handle,
        operation,
        flags: sys::AMDGPU_VM_PAGE_READABLE | sys::AMDGPU_VM_PAGE_WRITEABLE,
        va_address: va,
        offset_in_bo: 0,
        map_size: size,
        ..Default::default()
    };
    // SAFETY: plain-data argument matching the request.
    unsafe { ioctl(fd, sys::DRM_IOCTL_AMDGPU_GEM_VA, &mut args) }
        .map_err(|e| KfdError::ioctl("gem_va", e))
}

/// A buffer object mapped into the GPU VM at a fixed address.
struct GpuBuffer {
    fd: RawFd,
    handle: u32,
    va: u64,
    size: u64,
}

impl GpuBuffer {
    fn bind(fd: RawFd, handle: u32, va: u64, size: u64) -> Result<Self> {
        if let Err(e) = gem_va(fd, handle, sys::AMDGPU_VA_OP_MAP, va, size) {
            gem_close(fd, handle);
            return Err(e);
        }
        Ok(Self {
            fd,
            handle,
            va,
            size,
        })
    }

    /// Fresh GTT buffer, bound at `va`.
    fn create(fd: RawFd, size: u64, va: u64) -> Result<Self> {
        let mut args = sys::drm_amdgpu_gem_create {
            in_: sys::drm_amdgpu_gem_create_in {
                bo_size: size,
                alignment: PAGE,
                domains: sys::AMDGPU_GEM_DOMAIN_GTT,
                domain_flags: sys::AMDGPU_GEM_CREATE_CPU_ACCESS_REQUIRED
                    | sys::AMDGPU_GEM_CREATE_CPU_GTT_USWC,
            },
        };
        // SAFETY: plain-data argument matching the request.
        unsafe { ioctl(fd, sys::DRM_IOCTL_AMDGPU_GEM_CREATE, &mut args) }
            .map_err(|e| KfdError::ioctl("gem_create", e))?;
        // SAFETY: the kernel filled the `out` variant.
        let handle = unsafe { args.out.handle };
        Self::bind(fd, handle, va, size)
    }

    /// Import a dma-buf exported by the compute driver, bound at `va`.
    fn import(fd: RawFd, dmabuf_fd: i32, size: u64, va: u64) -> Result<Self> {
        let mut args = sys::drm_prime_handle {
            fd: dmabuf_fd,
            ..Default::default()
        };
        // SAFETY: plain-data argument matching the request.
        unsafe { ioctl(fd, sys::DRM_IOCTL_PRIME_FD_TO_HANDLE, &mut args) }
            .map_err(|e| KfdError::ioctl("prime_fd_to_handle", e))?;
        Self::bind(fd, args.handle, va, align_up(size, PAGE))
    }

    /// CPU mapping of the whole buffer.
    fn cpu_map(&self) -> Result<Mapping> {
        let mut args = sys::drm_amdgpu_gem_mmap {
            in_: sys::drm_amdgpu_gem_mmap_in {
                handle: self.handle,
                pad: 0,
            },
        };
        // SAFETY: plain-data argument matching the request.
        unsafe { ioctl(self.fd, sys::DRM_IOCTL_AMDGPU_GEM_MMAP, &mut args) }
            .map_err(|e| KfdError::ioctl("gem_mmap", e))?;
        // SAFETY: the kernel filled the `out` variant.
        let offset = unsafe { args.out.addr_ptr };
        Mapping::read_write(self.fd, offset, self.size as usize)
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let Err(e) = gem_va(self.fd, self.handle, sys::AMDGPU_VA_OP_UNMAP, self.va, self.size) {
            tracing::debug!(va = self.va, error = %e, "gem va unmap failed");
        }
        gem_close(self.fd, self.handle);
    }
}

/// Staging window plus command buffer. Only one copy runs at a time.
struct Staging {
    ib: GpuBuffer,
    ib_cpu: Mapping,
    window: GpuBuffer,
    window_cpu: Mapping,
    /// VA where imported buffers are bound for the duration of one copy.
    scratch_va: u64,
}

pub struct SdmaEngine {
    fd: RawFd,
    gpu_id: GpuId,
    ctx_id: u32,
    max_span: u64,
    fence_timeout: Duration,
    /// `None` once a copy was abandoned in flight; its memory is leaked.
    staging: Mutex<Option<Staging>>,
}

/// A copy that did not complete.
struct CopyFailure {
    error: GpuCrError,
    /// The engine may still be accessing the imported buffer and staging.
    in_flight: bool,
}

impl CopyFailure {
    fn not_started(error: GpuCrError) -> Self {
        Self {
            error,
            in_flight: false,
        }
    }

    /// Error to report. A copy still running cannot be replaced by a CPU
    /// copy of the same buffer, so it is not recoverable.
    fn into_error(self, gpu_id: GpuId) -> GpuCrError {
        if !self.in_flight {
            return self.error;
        }
        GpuCrError::device_with_source(
            format!("copy on gpu 0x{gpu_id:04x} still running after {DRAIN_TIMEOUT:?}"),
            self.error,
        )
    }
}

impl SdmaEngine {
    /// Set up a submission context and staging window on render node `fd`.
    /// `fd` must outlive the engine.
    pub fn new(fd: RawFd, gpu_id: GpuId, config: &TransferConfig) -> Result<Self> {
        let window_size = align_up(config.staging_bytes.max(PAGE), PAGE);
        let ib_size = ib_capacity_bytes(window_size, config.max_copy_span);

        let ib_va = VA_BASE;
        let window_va = align_up(ib_va + ib_size, VA_ALIGN);
        let scratch_va = align_up(window_va + window_size, VA_ALIGN);

        let ib = GpuBuffer::create(fd, ib_size, ib_va)?;
        let ib_cpu = ib.cpu_map()?;
        let window = GpuBuffer::create(fd, window_size, window_va)?;
        let window_cpu = window.cpu_map()?;

        let mut args = sys::drm_amdgpu_ctx {
            in_: sys::drm_amdgpu_ctx_in {
                op: sys::AMDGPU_CTX_OP_ALLOC_CTX,
                ..Default::default()
            },
        };
        // SAFETY: plain-data argument matching the request.
        unsafe { ioctl(fd, sys::DRM_IOCTL_AMDGPU_CTX, &mut args) }
            .map_err(|e| KfdError::ioctl("ctx_alloc", e))?;
        // SAFETY: the kernel filled the `out` variant.
        let ctx_id = unsafe { args.out.ctx_id };

        tracing::debug!(
            gpu_id,
            window = window_size,
            max_span = config.max_copy_span,
            "copy engine ready"
        );
        Ok(Self {
            fd,
            gpu_id,
            ctx_id,
            max_span: config.max_copy_span,
            fence_timeout: config.fence_timeout,
            staging: Mutex::new(Some(Staging {
                ib,
                ib_cpu,
                window,
                window_cpu,
                scratch_va,
            })),
        })
    }

    fn transfer_err(&self, what: &str, e: impl Into<GpuCrError>) -> GpuCrError {
        let e = e.into();
        match e {
            GpuCrError::FenceTimeout { .. } => e,
            other => GpuCrError::Transfer {
                gpu_id: self.gpu_id,
                message: what.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }

    /// Submit `packets` and wait for completion. A missed fence gets one
    /// longer wait before the copy is declared in flight.
    fn run(
        &self,
        staging: &Staging,
        bo: &GpuBuffer,
        packets: &[u32],
    ) -> std::result::Result<(), CopyFailure> {
        let seq = self.submit(staging, bo, packets).map_err(CopyFailure::not_started)?;
        let Err(error) = self.wait(seq, self.fence_timeout) else {
            return Ok(());
        };
        let drained = self.wait(seq, DRAIN_TIMEOUT);
        if drained.is_ok() {
            tracing::debug!(gpu_id = self.gpu_id, seq, "late copy fence signalled");
        }
        Err(CopyFailure {
            error,
            in_flight: drained.is_err(),
        })
    }

    fn submit(&self, staging: &Staging, bo: &GpuBuffer, packets: &[u32]) -> gpucr::Result<u64> {
        let bytes = packets.len() * size_of::<u32>();
        if bytes > staging.ib.size as usize {
            return Err(GpuCrError::transfer(self.gpu_id, "command buffer overflow"));
        }
        // SAFETY: the IB mapping is `ib.size` bytes and checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                packets.as_ptr().cast::<u8>(),
                staging.ib_cpu.as_ptr(),
                bytes,
            );
        }

        let mut ib_chunk = sys::drm_amdgpu_cs_chunk_ib {
            va_start: staging.ib.va,
            ib_bytes: bytes as u32,
            ip_type: sys::AMDGPU_HW_IP_DMA,
            ..Default::default()
        };
        let mut entries = [
            sys::drm_amdgpu_bo_list_entry {
                bo_handle: staging.ib.handle,
                bo_priority: 0,
            },
            sys::drm_amdgpu_bo_list_entry {
                bo_handle: staging.window.handle,
                bo_priority: 0,
            },
            sys::drm_amdgpu_bo_list_entry {
                bo_handle: bo.handle,
                bo_priority: 0,
            },
        ];
        let mut bo_list = sys::drm_amdgpu_bo_list_in {
            operation: u32::MAX,
            list_handle: 0,
            bo_number: entries.len() as u32,
            bo_info_size: size_of::<sys::drm_amdgpu_bo_list_entry>() as u32,
            bo_info_ptr: entries.as_mut_ptr() as u64,
        };
        let mut chunks = [
            sys::drm_amdgpu_cs_chunk {
                chunk_id: sys::AMDGPU_CHUNK_ID_IB,
                length_dw: (size_of::<sys::drm_amdgpu_cs_chunk_ib>() / 4) as u32,
                chunk_data: &mut ib_chunk as *mut _ as u64,
            },
            sys::drm_amdgpu_cs_chunk {
                chunk_id: sys::AMDGPU_CHUNK_ID_BO_HANDLES,
                length_dw: (size_of::<sys::drm_amdgpu_bo_list_in>() / 4) as u32,
                chunk_data: &mut bo_list as *mut _ as u64,
            },
        ];
        let mut chunk_ptrs = [
            &mut chunks[0] as *mut _ as u64,
            &mut chunks[1] as *mut _ as u64,
        ];
        let mut cs = sys::drm_amdgpu_cs {
            in_: sys::drm_amdgpu_cs_in {
                ctx_id: self.ctx_id,
                bo_list_handle: 0,
                num_chunks: chunk_ptrs.len() as u32,
                flags: 0,
                chunks: chunk_ptrs.as_mut_ptr() as u64,
            },
        };
        // SAFETY: every pointer in `cs` refers to a local that outlives the
        // call.
        unsafe { ioctl(self.fd, sys::DRM_IOCTL_AMDGPU_CS, &mut cs) }
            .map_err(|e| self.transfer_err("command submission", KfdError::ioctl("cs", e)))?;
        // SAFETY: the kernel filled the `out` variant.
        Ok(unsafe { cs.out.handle })
    }

    fn wait(&self, seq: u64, timeout: Duration) -> gpucr::Result<()> {
        let deadline = monotonic_ns().saturating_add(timeout.as_nanos() as u64);
        let mut args = sys::drm_amdgpu_wait_cs {
            in_: sys::drm_amdgpu_wait_cs_in {
                handle: seq,
                timeout: deadline,
                ip_type: sys::AMDGPU_HW_IP_DMA,
                ip_instance: 0,
                ring: 0,
                ctx_id: self.ctx_id,
            },
        };
        // SAFETY: plain-data argument matching the request.
        unsafe { ioctl(self.fd, sys::DRM_IOCTL_AMDGPU_WAIT_CS, &mut args) }
            .map_err(|e| self.transfer_err("fence wait", KfdError::ioctl("wait_cs", e)))?;
        // SAFETY: the kernel filled the `out` variant.
        if unsafe { args.out.status } != 0 {
            tracing::warn!(gpu_id = self.gpu_id, seq, "copy fence timed out");
            return Err(GpuCrError::FenceTimeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        Ok(())
    }

    fn copy(&self, bo: &BoHandle, host: HostBuf<'_>) -> gpucr::Result<()> {
        let mut guard = self
            .staging
            .lock()
            .map_err(|_| GpuCrError::transfer(self.gpu_id, "copy engine lock poisoned"))?;
        let Some(staging) = guard.as_ref() else {
            return Err(GpuCrError::transfer(
                self.gpu_id,
                "copy engine disabled after an abandoned copy",
            ));
        };
        let imported = GpuBuffer::import(self.fd, bo.dmabuf_fd, bo.size, staging.scratch_va)
            .map_err(|e| self.transfer_err("dma-buf import", e))?;

        match self.copy_windows(staging, &imported, bo.size, host) {
            Ok(()) => {
                tracing::trace!(gpu_id = self.gpu_id, bytes = bo.size, "sdma copy done");
                Ok(())
            }
            Err(failure) if failure.in_flight => {
                tracing::error!(
                    gpu_id = self.gpu_id,
                    "copy engine stuck, leaking its buffers and disabling it: {}",
                    failure.error
                );
                // The engine may still access these; unmapping them could
                // let it write into reused memory.
                std::mem::forget(imported);
                std::mem::forget(guard.take());
                Err(failure.into_error(self.gpu_id))
            }
            Err(failure) => Err(failure.into_error(self.gpu_id)),
        }
    }

    /// Move `size` bytes between `imported` and `host` one staging window at
    /// a time.
    fn copy_windows(
        &self,
        staging: &Staging,
        imported: &GpuBuffer,
        size: u64,
        mut host: HostBuf<'_>,
    ) -> std::result::Result<(), CopyFailure> {
        let window = staging.window.size;
        let window_ptr = staging.window_cpu.as_ptr();
        let mut done = 0u64;
        let mut ib = Vec::new();
        while done < size {
            let len = (size - done).min(window);
            let range = done as usize..(done + len) as usize;
            ib.clear();
            match &host {
                HostBuf::Out(_) => {
                    let src = imported.va + done;
                    push_linear_copy(&mut ib, src, staging.window.va, len, self.max_span);
                }
                HostBuf::In(data) => {
                    // SAFETY: the window mapping holds `window >= len` bytes.
                    let dst = unsafe { std::slice::from_raw_parts_mut(window_ptr, len as usize) };
                    dst.copy_from_slice(&data[range.clone()]);
                    let dst_va = imported.va + done;
                    push_linear_copy(&mut ib, staging.window.va, dst_va, len, self.max_span);
                }
            }
            pad_ib(&mut ib);
            self.run(staging, imported, &ib)?;

            if let HostBuf::Out(out) = &mut host {
                // SAFETY: as above; the copy has completed.
                let src = unsafe { std::slice::from_raw_parts(window_ptr, len as usize) };
                out[range].copy_from_slice(src);
            }
            done += len;
        }
        Ok(())
    }
}

enum HostBuf<'a> {
    Out(&'a mut [u8]),
    In(&'a [u8]),
}

impl CopyEngine for SdmaEngine {
    fn read(&self, bo: &BoHandle, out: &mut [u8]) -> gpucr::Result<()> {
        check_len(self.gpu_id, bo, out.len())?;
        self.copy(bo, HostBuf::Out(out))
    }

    fn write(&self, bo: &BoHandle, data: &[u8]) -> gpucr::Result<()> {
        check_len(self.gpu_id, bo, data.len())?;
        self.copy(bo, HostBuf::In(data))
    }
}

impl Drop for SdmaEngine {
    fn drop(&mut self) {
        let mut args = sys::drm_amdgpu_ctx {
            in_: sys::drm_amdgpu_ctx_in {
                op: sys::AMDGPU_CTX_OP_FREE_CTX,
                ctx_id: self.ctx_id,
                ..Default::default()
            },
        };
        // SAFETY: plain-data argument matching the request.
        if let Err(e) = unsafe { ioctl(self.fd, sys::DRM_IOCTL_AMDGPU_CTX, &mut args) } {
            tracing::debug!(gpu_id = self.gpu_id, error = %e, "ctx free failed");
        }
    }
}

fn check_len(gpu_id: GpuId, bo: &BoHandle, len: usize) -> gpucr::Result<()> {
    if bo.size != len as u64 {
        return Err(GpuCrError::transfer(
            gpu_id,
            format!("host buffer is {len} bytes, buffer object is {}", bo.size),
        ));
    }
    if bo.dmabuf_fd < 0 {
        return Err(GpuCrError::transfer(gpu_id, "buffer object was not exported"));
    }
    Ok(())
}

fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out-pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}
