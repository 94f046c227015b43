//! The TLS engine.
//!
//! Every TLS-bearing module gets a process-wide, never-reused module id.
//! Each thread owns a dynamic thread vector (DTV) mapping module ids to
//! that thread's copy of the module's TLS block, plus one contiguous
//! static block holding the startup modules' images.
//!
//! The registry of TLS images lives behind its own lock and a published
//! generation counter; per-thread lookups never touch the loader lock.
//! The fast path of [`tls_get_addr`] is a generation compare and an
//! indexed load, the slow path re-syncs the DTV against the registry.

use crate::graph::{bump_generation, generation};
use crate::segment::ElfSegments;
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{
    alloc::Layout,
    cell::RefCell,
    ptr::null_mut,
    sync::atomic::{AtomicUsize, Ordering},
};
use elf::abi::PT_TLS;
use spin::{Lazy, RwLock};

static STATIC_SIZE: AtomicUsize = AtomicUsize::new(0);
static STATIC_ALIGN: AtomicUsize = AtomicUsize::new(16);

static REGISTRY: Lazy<RwLock<Vec<Option<Arc<TlsImage>>>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// Index passed by compiled code to [`__tls_get_addr`].
#[repr(C)]
pub struct TlsIndex {
    pub ti_module: usize,
    pub ti_offset: usize,
}

/// TLS identity of one module.
pub(crate) struct ModuleTls {
    /// Non-zero, unique for the lifetime of the module.
    pub modid: usize,
    /// Offset of this module's image inside the per-thread static block;
    /// `None` for dynamically loaded modules.
    pub static_offset: Option<usize>,
}

/// Whether a module's TLS block lives in the startup static area or is
/// allocated per thread on demand.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum TlsClass {
    Static,
    Dynamic,
}

struct TlsImage {
    /// Owned copy of the initialization image (`.tdata`).
    image: Box<[u8]>,
    memsz: usize,
    align: usize,
    static_offset: Option<usize>,
}

/// Register the `PT_TLS` image of a freshly mapped module and assign its
/// modid. Returns `None` when the segment is empty.
pub(crate) fn register_module(
    segments: &ElfSegments,
    phdr: &crate::arch::ElfPhdr,
    class: TlsClass,
) -> Option<ModuleTls> {
    debug_assert_eq!(phdr.p_type, PT_TLS);
    let memsz = phdr.p_memsz as usize;
    if memsz == 0 {
        return None;
    }
    let align = (phdr.p_align as usize).max(1);
    let image: Box<[u8]> = segments
        .get_slice::<u8>(phdr.p_vaddr as usize, phdr.p_filesz as usize)
        .into();

    let static_offset = match class {
        TlsClass::Dynamic => None,
        TlsClass::Static => {
            let cur = STATIC_SIZE.load(Ordering::Relaxed);
            let offset = (cur + align - 1) & !(align - 1);
            STATIC_SIZE.store(offset + memsz, Ordering::Relaxed);
            STATIC_ALIGN.fetch_max(align, Ordering::Relaxed);
            Some(offset)
        }
    };

    let mut registry = REGISTRY.write();
    registry.push(Some(Arc::new(TlsImage {
        image,
        memsz,
        align,
        static_offset,
    })));
    let modid = registry.len();
    drop(registry);
    bump_generation();
    log::debug!("assigned TLS modid {} ({} bytes)", modid, memsz);
    Some(ModuleTls {
        modid,
        static_offset,
    })
}

/// Revoke a modid. The slot is never reused; threads drop their copies
/// when they observe the generation bump.
pub(crate) fn release_module(modid: usize) {
    let mut registry = REGISTRY.write();
    if let Some(slot) = registry.get_mut(modid - 1) {
        *slot = None;
    }
    drop(registry);
    bump_generation();
    log::debug!("revoked TLS modid {}", modid);
}

/// One DTV entry.
enum DtvSlot {
    Uninitialized,
    /// Points into the thread's static block.
    Static(*mut u8),
    /// Owned per-thread copy of a dynamic module's block.
    Dynamic(*mut u8, Layout),
}

impl DtvSlot {
    fn addr(&self) -> Option<*mut u8> {
        match self {
            DtvSlot::Uninitialized => None,
            DtvSlot::Static(ptr) => Some(*ptr),
            DtvSlot::Dynamic(ptr, _) => Some(*ptr),
        }
    }
}

struct ThreadTls {
    generation: usize,
    /// Indexed by modid; slot 0 is reserved.
    dtv: Vec<DtvSlot>,
    static_block: *mut u8,
    static_layout: Option<Layout>,
}

impl ThreadTls {
    const fn new() -> Self {
        ThreadTls {
            generation: 0,
            dtv: Vec::new(),
            static_block: null_mut(),
            static_layout: None,
        }
    }

    fn free_slot(&mut self, modid: usize) {
        if let Some(slot) = self.dtv.get_mut(modid) {
            if let DtvSlot::Dynamic(ptr, layout) = *slot {
                unsafe { alloc::alloc::dealloc(ptr, layout) };
            }
            *slot = DtvSlot::Uninitialized;
        }
    }

    /// Lazily allocate this thread's static block, sized at the layout
    /// current when this thread first touches static TLS. Returns `None`
    /// for offsets past the block's capacity (a static image published
    /// after the block was carved; the caller falls back to a dynamic
    /// per-thread copy).
    fn static_slot(&mut self, offset: usize, memsz: usize) -> Option<*mut u8> {
        if self.static_block.is_null() {
            let size = STATIC_SIZE.load(Ordering::Acquire);
            let align = STATIC_ALIGN.load(Ordering::Acquire);
            debug_assert!(size > 0);
            let layout = Layout::from_size_align(size, align).unwrap();
            let block = unsafe { alloc::alloc::alloc_zeroed(layout) };
            if block.is_null() {
                alloc::alloc::handle_alloc_error(layout);
            }
            self.static_block = block;
            self.static_layout = Some(layout);
        }
        if offset + memsz > self.static_layout.unwrap().size() {
            return None;
        }
        Some(unsafe { self.static_block.add(offset) })
    }
}

impl Drop for ThreadTls {
    fn drop(&mut self) {
        for modid in 0..self.dtv.len() {
            self.free_slot(modid);
        }
        if let Some(layout) = self.static_layout {
            unsafe { alloc::alloc::dealloc(self.static_block, layout) };
        }
    }
}

std::thread_local! {
    static THREAD_TLS: RefCell<ThreadTls> = const { RefCell::new(ThreadTls::new()) };
}

/// Return the calling thread's address of `offset` inside the TLS block
/// of module `modid`, materializing the block if needed.
///
/// Returns null when the modid has been revoked.
pub fn tls_get_addr(modid: usize, offset: usize) -> *mut u8 {
    THREAD_TLS.with(|cell| {
        let mut tls = cell.borrow_mut();
        let generation = generation();
        if tls.generation == generation {
            if let Some(addr) = tls.dtv.get(modid).and_then(DtvSlot::addr) {
                return unsafe { addr.add(offset) };
            }
        }
        tls_get_addr_slow(&mut tls, generation, modid, offset)
    })
}

#[cold]
fn tls_get_addr_slow(
    tls: &mut ThreadTls,
    generation: usize,
    modid: usize,
    offset: usize,
) -> *mut u8 {
    let registry = REGISTRY.read();

    if tls.generation != generation {
        // Drop copies of revoked modules, then adopt the generation that
        // was current when the registry snapshot was taken.
        for idx in 0..tls.dtv.len() {
            if idx == 0 {
                continue;
            }
            let live = registry.get(idx - 1).map(Option::is_some).unwrap_or(false);
            if !live {
                tls.free_slot(idx);
            }
        }
        tls.generation = generation;
    }

    if tls.dtv.len() <= registry.len() {
        tls.dtv
            .resize_with(registry.len() + 1, || DtvSlot::Uninitialized);
    }

    if let Some(addr) = tls.dtv.get(modid).and_then(DtvSlot::addr) {
        return unsafe { addr.add(offset) };
    }

    let Some(Some(image)) = registry.get(modid.wrapping_sub(1)) else {
        // Revoked or never-assigned modid.
        return null_mut();
    };
    let image = image.clone();
    drop(registry);

    let static_dest = image
        .static_offset
        .and_then(|static_offset| tls.static_slot(static_offset, image.memsz));
    let addr = match static_dest {
        Some(dest) => {
            unsafe {
                core::slice::from_raw_parts_mut(dest, image.image.len())
                    .copy_from_slice(&image.image);
            }
            tls.dtv[modid] = DtvSlot::Static(dest);
            dest
        }
        None => {
            let layout = Layout::from_size_align(image.memsz, image.align).unwrap();
            let ptr = unsafe { alloc::alloc::alloc(layout) };
            if ptr.is_null() {
                alloc::alloc::handle_alloc_error(layout);
            }
            let block = unsafe { core::slice::from_raw_parts_mut(ptr, image.memsz) };
            let filesz = image.image.len();
            block[..filesz].copy_from_slice(&image.image);
            block[filesz..].fill(0);
            tls.dtv[modid] = DtvSlot::Dynamic(ptr, layout);
            ptr
        }
    };
    unsafe { addr.add(offset) }
}

/// `__tls_get_addr`, resolved for loaded modules through the runtime's
/// built-in host symbols rather than interposed on the host process.
///
/// # Safety
/// `tls_index` must point at a `{DTPMOD, DTPOFF}` pair written by this
/// crate's relocator.
pub unsafe extern "C" fn __tls_get_addr(tls_index: &TlsIndex) -> *mut u8 {
    tls_get_addr(
        tls_index.ti_module,
        tls_index
            .ti_offset
            .wrapping_add(crate::arch::TLS_DTV_OFFSET),
    )
}

/// Payload behind a TLSDESC descriptor written by the relocator.
pub struct TlsDescData {
    modid: usize,
    offset: usize,
}

impl TlsDescData {
    pub(crate) fn new(tls: &ModuleTls, offset: usize) -> TlsDescData {
        TlsDescData {
            modid: tls.modid,
            offset,
        }
    }
}

/// The in-memory layout of a relocated TLSDESC slot: the per-arch entry
/// stub followed by its data word.
#[repr(C)]
pub struct TlsDesc {
    pub resolver: unsafe extern "C" fn(&TlsDesc) -> *mut u8,
    pub value: usize,
}

/// Rust half of the TLSDESC entry stub: descriptor in, per-thread variable
/// address out. A zero data word is the missing-weak-symbol descriptor and
/// yields null.
pub(crate) unsafe extern "C" fn tlsdesc_resolve_slow(desc: *const TlsDesc) -> *mut u8 {
    let value = unsafe { (*desc).value };
    if value == 0 {
        return null_mut();
    }
    let data = unsafe { &*(value as *const TlsDescData) };
    tls_get_addr(data.modid, data.offset)
}
