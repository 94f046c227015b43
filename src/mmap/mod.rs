//! The memory mapping capability.
//!
//! The load engine talks to the host address space exclusively through the
//! [`Mmap`] trait: reserve a region, commit segments into it, change
//! protection, release. Hosted builds get a `libc`-backed implementation;
//! embedders supply their own on other targets.

use crate::Result;
use bitflags::bitflags;
use core::{
    ffi::{c_int, c_void},
    ptr::NonNull,
};

#[cfg(all(feature = "std", unix))]
mod unix;

#[cfg(all(feature = "std", unix))]
pub use unix::MmapImpl;

bitflags! {
    /// Desired memory protection of a memory mapping.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ProtFlags: c_int {
        /// Pages cannot be accessed.
        const PROT_NONE = 0;
        /// Pages can be read.
        const PROT_READ = 1;
        /// Pages can be written.
        const PROT_WRITE = 2;
        /// Pages can be executed.
        const PROT_EXEC = 4;
    }
}

bitflags! {
    /// Additional parameters for [`Mmap::mmap`].
    #[derive(Clone, Copy, Debug)]
    pub struct MapFlags: c_int {
        /// Create a private copy-on-write mapping.
        const MAP_PRIVATE = 2;
        /// Place the mapping at exactly the given address.
        const MAP_FIXED = 16;
        /// The mapping is not backed by any file.
        const MAP_ANONYMOUS = 32;
    }
}

/// Low-level memory mapping operations.
///
/// All addresses and lengths handed to these methods are page aligned by
/// the callers in [`crate::segment`].
pub trait Mmap {
    /// Map a file region, or prepare an anonymous region for a manual copy.
    ///
    /// When `fd` is `None` the implementation maps anonymous writable pages
    /// and sets `need_copy`; the caller then copies the bytes itself and
    /// applies the final protection with [`Mmap::mprotect`].
    ///
    /// # Safety
    /// `addr`, if fixed, must lie inside a region previously obtained from
    /// [`Mmap::mmap_reserve`].
    unsafe fn mmap(
        addr: Option<usize>,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        offset: usize,
        fd: Option<i32>,
        need_copy: &mut bool,
    ) -> Result<NonNull<c_void>>;

    /// Create an anonymous mapping.
    ///
    /// # Safety
    /// Same constraints as [`Mmap::mmap`].
    unsafe fn mmap_anonymous(
        addr: usize,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> Result<NonNull<c_void>>;

    /// Reserve address space without committing accessible pages.
    ///
    /// # Safety
    /// This depends on the correctness of the trait implementation.
    unsafe fn mmap_reserve(len: usize) -> Result<NonNull<c_void>>;

    /// Release a previously mapped region.
    ///
    /// # Safety
    /// `addr..addr+len` must be a mapping created through this trait.
    unsafe fn munmap(addr: NonNull<c_void>, len: usize) -> Result<()>;

    /// Change the protection of a mapped region.
    ///
    /// # Safety
    /// `addr..addr+len` must be a mapping created through this trait.
    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()>;
}
