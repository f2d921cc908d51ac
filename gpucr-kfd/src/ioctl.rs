use std::io;
use std::os::fd::RawFd;

use libc::c_ulong;

/// Issue `request` on `fd`, restarting while the kernel reports `EINTR` or
/// `EAGAIN`.
///
/// # Safety
///
/// `request` must encode an argument of type `T` (see [`crate::sys`]), and any
/// pointers embedded in `arg` must stay valid for the call.
pub(crate) unsafe fn ioctl<T>(fd: RawFd, request: c_ulong, arg: &mut T) -> io::Result<()> {
    loop {
        // SAFETY: upheld by the caller.
        let ret = unsafe { libc::ioctl(fd, request as _, arg as *mut T) };
        if ret != -1 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
            Some(libc::EBADF) => {
                tracing::error!(fd, "compute driver descriptor not valid in this process");
                return Err(err);
            }
            _ => return Err(err),
        }
    }
}
