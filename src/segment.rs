//! Mapping `PT_LOAD` segments into memory.
//!
//! The engine reserves one contiguous span for the whole image, commits
//! each `PT_LOAD` into it (file-backed when the object has a descriptor,
//! anonymous-and-copy otherwise), zero-fills BSS tails and re-protects
//! `PT_GNU_RELRO` ranges after relocation.

use crate::{
    Result,
    arch::{ElfPhdr, Phdr},
    error::bad_segment,
    mmap::{MapFlags, Mmap, ProtFlags},
    object::ElfObject,
};
use alloc::format;
use core::{
    ffi::c_void,
    ptr::NonNull,
};
use elf::abi::{PF_R, PF_W, PF_X, PT_LOAD};

/// Page size assumed for all mapping math.
pub const PAGE_SIZE: usize = 0x1000;

/// Mask that rounds an address down to its page.
pub const MASK: usize = !(PAGE_SIZE - 1);

/// The largest number of `PT_LOAD` segments a module may carry.
pub(crate) const MAX_LOAD_SEGMENTS: usize = 8;

#[inline]
fn align_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & MASK
}

/// The mapped image of one module.
///
/// Owns the whole reserved span; dropping the value releases the mapping
/// through the same capability that created it.
pub struct ElfSegments {
    pub(crate) memory: NonNull<c_void>,
    /// Page-aligned virtual address of the lowest `PT_LOAD`.
    pub(crate) offset: usize,
    pub(crate) len: usize,
    pub(crate) munmap: unsafe fn(NonNull<c_void>, usize) -> Result<()>,
}

unsafe impl Send for ElfSegments {}
unsafe impl Sync for ElfSegments {}

impl Drop for ElfSegments {
    fn drop(&mut self) {
        unsafe {
            let _ = (self.munmap)(self.memory, self.len);
        }
    }
}

impl ElfSegments {
    pub(crate) fn map_prot(prot: u32) -> ProtFlags {
        let mut res = ProtFlags::empty();
        if prot & PF_X != 0 {
            res |= ProtFlags::PROT_EXEC;
        }
        if prot & PF_W != 0 {
            res |= ProtFlags::PROT_WRITE;
        }
        if prot & PF_R != 0 {
            res |= ProtFlags::PROT_READ;
        }
        res
    }

    /// Load bias: subtract this crate's view of the file's vaddr origin
    /// from the mapping address.
    #[inline]
    pub fn base(&self) -> usize {
        self.memory.as_ptr() as usize - self.offset
    }

    /// Page-aligned vaddr of the lowest segment.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Total length of the reserved span.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub(crate) fn get_ptr<T>(&self, offset: usize) -> *const T {
        (self.base() + offset) as *const T
    }

    #[inline]
    pub(crate) fn get_mut_ptr<T>(&self, offset: usize) -> *mut T {
        (self.base() + offset) as *mut T
    }

    /// Interpret `len` bytes at vaddr `offset` as a `T` slice.
    #[inline]
    pub(crate) fn get_slice<T>(&self, offset: usize, len: usize) -> &'static [T] {
        unsafe { core::slice::from_raw_parts(self.get_ptr(offset), len / size_of::<T>()) }
    }

    #[inline]
    pub(crate) fn get_slice_mut<T>(&self, offset: usize, len: usize) -> &'static mut [T] {
        unsafe { core::slice::from_raw_parts_mut(self.get_mut_ptr(offset), len / size_of::<T>()) }
    }

    /// Patch one word at vaddr `offset`.
    #[inline]
    pub(crate) fn write<T>(&self, offset: usize, val: T) {
        unsafe {
            self.get_mut_ptr::<T>(offset).write(val);
        }
    }
}

/// Validate the `PT_LOAD` layout before anything is mapped.
///
/// Rejects empty layouts, more than [`MAX_LOAD_SEGMENTS`] segments,
/// `p_filesz > p_memsz`, address overflow and page-span overlap between
/// consecutive segments (ascending vaddr order is required).
pub(crate) fn validate_load_segments(phdrs: &[ElfPhdr]) -> Result<()> {
    let mut count = 0;
    let mut last_end = 0usize;
    for phdr in phdrs.iter().filter(|phdr| phdr.p_type == PT_LOAD) {
        count += 1;
        if count > MAX_LOAD_SEGMENTS {
            return Err(crate::error::malformed_elf(format!(
                "more than {MAX_LOAD_SEGMENTS} PT_LOAD segments"
            )));
        }
        if phdr.p_filesz > phdr.p_memsz {
            return Err(bad_segment("p_filesz exceeds p_memsz"));
        }
        if (phdr.p_offset ^ phdr.p_vaddr) as usize & (PAGE_SIZE - 1) != 0 {
            return Err(bad_segment("p_offset and p_vaddr are not congruent"));
        }
        let start = phdr.p_vaddr as usize;
        let Some(end) = start.checked_add(phdr.p_memsz as usize) else {
            return Err(bad_segment("segment address range overflows"));
        };
        if (start & MASK) < last_end {
            return Err(bad_segment(
                "PT_LOAD segments overlap or are not sorted by vaddr",
            ));
        }
        last_end = align_up(end);
    }
    if count == 0 {
        return Err(bad_segment("no PT_LOAD segments"));
    }
    Ok(())
}

/// Reserve the span covering every `PT_LOAD` and return the owning
/// [`ElfSegments`]. Nothing is committed yet.
pub(crate) fn reserve_segments<M: Mmap>(phdrs: &[ElfPhdr]) -> Result<ElfSegments> {
    let mut min_vaddr = usize::MAX;
    let mut max_vaddr = 0;
    for phdr in phdrs.iter().filter(|phdr| phdr.p_type == PT_LOAD) {
        min_vaddr = min_vaddr.min(phdr.p_vaddr as usize);
        max_vaddr = max_vaddr.max(phdr.p_vaddr as usize + phdr.p_memsz as usize);
    }
    min_vaddr &= MASK;
    max_vaddr = align_up(max_vaddr);
    let len = max_vaddr - min_vaddr;
    let memory = unsafe { M::mmap_reserve(len) }?;
    log::trace!(
        "[mmap] reserved 0x{:x} bytes at 0x{:x}",
        len,
        memory.as_ptr() as usize
    );
    Ok(ElfSegments {
        memory,
        offset: min_vaddr,
        len,
        munmap: M::munmap,
    })
}

/// Commit one `PT_LOAD` into the reserved span.
pub(crate) fn load_segment<M: Mmap>(
    segments: &ElfSegments,
    phdr: &ElfPhdr,
    object: &mut dyn ElfObject,
) -> Result<()> {
    let base = segments.base();
    let prot = ElfSegments::map_prot(phdr.p_flags);
    let vaddr = phdr.p_vaddr as usize;
    let filesz = phdr.p_filesz as usize;
    let memsz = phdr.p_memsz as usize;

    let seg_start = vaddr & MASK;
    let seg_end = align_up(vaddr + memsz);
    let addr = base + seg_start;

    // File-backed portion, padded to page boundaries.
    let file_off = phdr.p_offset as usize & MASK;
    let file_len = align_up(phdr.p_offset as usize + filesz) - file_off;

    let mut need_copy = false;
    if file_len > 0 {
        unsafe {
            M::mmap(
                Some(addr),
                file_len,
                prot,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED,
                file_off,
                object.as_fd(),
                &mut need_copy,
            )?;
        }
    }
    if need_copy && filesz > 0 {
        let dest = unsafe {
            core::slice::from_raw_parts_mut((base + vaddr) as *mut u8, filesz)
        };
        object.read(dest, phdr.p_offset as usize)?;
    }

    if memsz > filesz {
        fill_bss::<M>(segments, phdr, prot, need_copy)?;
    }

    if need_copy && file_len > 0 {
        unsafe {
            M::mprotect(
                NonNull::new_unchecked(addr as *mut c_void),
                file_len,
                prot,
            )?;
        }
    }

    log::trace!(
        "[mmap] segment 0x{:x}..0x{:x} prot {:?} filesz 0x{:x} memsz 0x{:x}",
        addr,
        base + seg_end,
        prot,
        filesz,
        memsz
    );
    Ok(())
}

/// Zero the BSS tail of a segment and commit its fully-anonymous pages.
fn fill_bss<M: Mmap>(
    segments: &ElfSegments,
    phdr: &Phdr,
    prot: ProtFlags,
    already_zeroed: bool,
) -> Result<()> {
    let base = segments.base();
    let zero_start = (phdr.p_vaddr + phdr.p_filesz) as usize;
    let zero_end_page = align_up(zero_start);
    let seg_end = align_up((phdr.p_vaddr + phdr.p_memsz) as usize);

    if !already_zeroed && zero_start != zero_end_page {
        // Shared page between file bytes and BSS; it must be writable to
        // be cleared. Freshly copied anonymous pages are already zero.
        if !prot.contains(ProtFlags::PROT_WRITE) {
            return Err(bad_segment("BSS tail inside a non-writable segment"));
        }
        unsafe {
            core::slice::from_raw_parts_mut(
                (base + zero_start) as *mut u8,
                zero_end_page - zero_start,
            )
            .fill(0);
        }
    }

    if zero_end_page < seg_end {
        // Whole tail pages have no file backing at all.
        unsafe {
            M::mmap_anonymous(
                base + zero_end_page,
                seg_end - zero_end_page,
                prot,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED,
            )?;
        }
    }
    Ok(())
}

/// A pending `PT_GNU_RELRO` re-protection.
pub(crate) struct ElfRelro {
    addr: usize,
    len: usize,
    mprotect: unsafe fn(NonNull<c_void>, usize, ProtFlags) -> Result<()>,
}

impl ElfRelro {
    pub(crate) fn new<M: Mmap>(phdr: &Phdr, base: usize) -> ElfRelro {
        ElfRelro {
            addr: base + phdr.p_vaddr as usize,
            len: phdr.p_memsz as usize,
            mprotect: M::mprotect,
        }
    }

    /// Make the covered range read-only. Applied once every relocation of
    /// the module has been written.
    pub(crate) fn relro(&self) -> Result<()> {
        let end = align_up(self.addr + self.len);
        let start = self.addr & MASK;
        unsafe {
            (self.mprotect)(
                NonNull::new_unchecked(start as *mut c_void),
                end - start,
                ProtFlags::PROT_READ,
            )?;
        }
        log::trace!("[relro] re-protected 0x{:x}..0x{:x}", start, end);
        Ok(())
    }
}
