use super::{MapFlags, Mmap, ProtFlags};
use crate::{Error, Result};
use core::ptr::NonNull;
use libc::{mmap, mprotect, munmap};

/// `libc`-backed implementation of the [`Mmap`] capability.
pub struct MmapImpl;

impl Mmap for MmapImpl {
    unsafe fn mmap(
        addr: Option<usize>,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        offset: usize,
        fd: Option<i32>,
        need_copy: &mut bool,
    ) -> Result<NonNull<core::ffi::c_void>> {
        let ptr = if let Some(fd) = fd {
            unsafe {
                mmap(
                    addr.unwrap_or(0) as _,
                    len,
                    prot.bits(),
                    flags.bits(),
                    fd,
                    offset as _,
                )
            }
        } else {
            // No backing file: hand out writable anonymous pages and let
            // the caller copy the contents and re-protect.
            *need_copy = true;
            unsafe {
                mmap(
                    addr.unwrap_or(0) as _,
                    len,
                    (ProtFlags::PROT_READ | ProtFlags::PROT_WRITE).bits(),
                    (flags | MapFlags::MAP_ANONYMOUS).bits(),
                    -1,
                    0,
                )
            }
        };
        if core::ptr::eq(ptr, libc::MAP_FAILED) {
            return Err(map_error("mmap failed"));
        }
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    unsafe fn mmap_anonymous(
        addr: usize,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> Result<NonNull<core::ffi::c_void>> {
        let ptr = unsafe {
            mmap(
                addr as _,
                len,
                prot.bits(),
                flags.union(MapFlags::MAP_ANONYMOUS).bits(),
                -1,
                0,
            )
        };
        if core::ptr::eq(ptr, libc::MAP_FAILED) {
            return Err(map_error("mmap anonymous failed"));
        }
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    unsafe fn mmap_reserve(len: usize) -> Result<NonNull<core::ffi::c_void>> {
        let ptr = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                ProtFlags::PROT_NONE.bits(),
                (MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS).bits(),
                -1,
                0,
            )
        };
        if core::ptr::eq(ptr, libc::MAP_FAILED) {
            return Err(map_error("mmap reserve failed"));
        }
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    unsafe fn munmap(addr: NonNull<core::ffi::c_void>, len: usize) -> Result<()> {
        let res = unsafe { munmap(addr.as_ptr(), len) };
        if res != 0 {
            return Err(map_error("munmap failed"));
        }
        Ok(())
    }

    unsafe fn mprotect(
        addr: NonNull<core::ffi::c_void>,
        len: usize,
        prot: ProtFlags,
    ) -> Result<()> {
        let res = unsafe { mprotect(addr.as_ptr(), len, prot.bits()) };
        if res != 0 {
            return Err(map_error("mprotect failed"));
        }
        Ok(())
    }
}

#[cold]
#[inline(never)]
fn map_error(msg: &'static str) -> Error {
    #[cfg(target_os = "linux")]
    let code = unsafe { *libc::__errno_location() };
    #[cfg(not(target_os = "linux"))]
    let code = 0;
    crate::error::system_error(code, msg)
}
