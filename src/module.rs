//! The module record.
//!
//! One `Module` carries both the file-side artifacts (symbol table,
//! relocation tables, mapped segments) and the session-side bookkeeping
//! (state machine, reference count, scope ranks). Records are owned by the
//! graph and shared out as `Arc`s; the session-side fields are atomics so
//! a shared record can advance through its lifecycle under the loader lock
//! without exclusive borrows.

use crate::{
    arch::{Dyn, ElfPhdr},
    relocation::{LazyScope, ModuleRelocs},
    segment::{ElfRelro, ElfSegments},
    symbol::SymbolTable,
};
use alloc::{boxed::Box, ffi::CString, string::String};
use bitflags::bitflags;
use core::{
    ffi::CStr,
    fmt::{Debug, Formatter},
    ptr::NonNull,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};
use spin::Once;

/// Stable index of a module inside the graph arena. Never reused.
pub(crate) type ModuleId = usize;

/// Rank value meaning "not assigned yet".
pub(crate) const UNRANKED: usize = usize::MAX;

/// Lifecycle of a module. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[repr(u8)]
pub enum ModuleState {
    /// Metadata decoded, nothing mapped.
    Decoded = 0,
    /// Segments are mapped, relocations not yet applied.
    Mapped = 1,
    /// All relocations written, RELRO applied.
    Relocated = 2,
    /// DT_INIT/DT_INIT_ARRAY have run.
    ConstructorsRun = 3,
    /// Fully usable.
    Live = 4,
    /// Finalizers have run (or were skipped); the record is detached.
    TornDown = 5,
}

impl ModuleState {
    fn from_u8(val: u8) -> ModuleState {
        match val {
            0 => ModuleState::Decoded,
            1 => ModuleState::Mapped,
            2 => ModuleState::Relocated,
            3 => ModuleState::ConstructorsRun,
            4 => ModuleState::Live,
            _ => ModuleState::TornDown,
        }
    }
}

bitflags! {
    /// Session flags of a module.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ModuleFlags: u8 {
        /// Member of the global resolution scope.
        const GLOBAL = 1;
        /// Present at process entry; implies GLOBAL and NODELETE.
        const STARTUP = 2;
        /// Never unloaded, even at refcount zero.
        const NODELETE = 4;
    }
}

pub struct Module {
    // File side, immutable once mapped.
    pub(crate) name: CString,
    pub(crate) segments: ElfSegments,
    pub(crate) symbols: SymbolTable,
    pub(crate) dyn_ptr: *const Dyn,
    pub(crate) phdrs: Box<[ElfPhdr]>,
    pub(crate) relocation: ModuleRelocs,
    pub(crate) relro: Option<ElfRelro>,
    pub(crate) got: Option<NonNull<usize>>,
    pub(crate) init_fn: Option<extern "C" fn()>,
    pub(crate) init_array_fn: Option<&'static [extern "C" fn()]>,
    pub(crate) fini_fn: Option<extern "C" fn()>,
    pub(crate) fini_array_fn: Option<&'static [extern "C" fn()]>,
    /// Canonical names of the DT_NEEDED entries, in file order.
    pub(crate) needed: Box<[String]>,
    /// The raw `(d_tag, d_un)` pairs of the dynamic segment.
    pub(crate) raw_dynamic: Box<[(i64, usize)]>,
    pub(crate) runpath: Option<String>,
    pub(crate) lazy: bool,
    #[cfg(feature = "tls")]
    pub(crate) tls: Option<crate::tls::ModuleTls>,
    /// Backing storage of the TLSDESC descriptors written into this
    /// module's image; freed together with the module.
    #[cfg(feature = "tls")]
    pub(crate) tlsdesc_data: Once<alloc::boxed::Box<[alloc::boxed::Box<crate::tls::TlsDescData>]>>,

    // Session side, guarded by the loader lock; atomics only so the
    // shared record stays interior-mutable.
    state: AtomicU8,
    flags: AtomicU8,
    pub(crate) refcount: AtomicUsize,
    load_order_rank: AtomicUsize,
    global_order_rank: AtomicUsize,
    symbolizer_modid: AtomicUsize,
    /// Direct dependency edges (graph ids of `needed`).
    pub(crate) deps: Once<Box<[ModuleId]>>,
    /// BFS visit-once dependency set rooted at this module, self first.
    pub(crate) scope: Once<Box<[ModuleId]>>,
    /// Scope closure used by the lazy binding fixup.
    pub(crate) lazy_scope: Once<LazyScope>,
}

unsafe impl Send for Module {}
unsafe impl Sync for Module {}

impl Debug for Module {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("base", &self.base())
            .field("state", &self.state())
            .field("needed", &self.needed)
            .finish()
    }
}

pub(crate) struct ModuleParts {
    pub name: CString,
    pub segments: ElfSegments,
    pub symbols: SymbolTable,
    pub dyn_ptr: *const Dyn,
    pub phdrs: Box<[ElfPhdr]>,
    pub relocation: ModuleRelocs,
    pub relro: Option<ElfRelro>,
    pub got: Option<NonNull<usize>>,
    pub init_fn: Option<extern "C" fn()>,
    pub init_array_fn: Option<&'static [extern "C" fn()]>,
    pub fini_fn: Option<extern "C" fn()>,
    pub fini_array_fn: Option<&'static [extern "C" fn()]>,
    pub needed: Box<[String]>,
    pub raw_dynamic: Box<[(i64, usize)]>,
    pub runpath: Option<String>,
    pub lazy: bool,
    pub nodelete: bool,
    #[cfg(feature = "tls")]
    pub tls: Option<crate::tls::ModuleTls>,
}

impl Module {
    pub(crate) fn new(parts: ModuleParts) -> Module {
        let flags = if parts.nodelete {
            ModuleFlags::NODELETE
        } else {
            ModuleFlags::empty()
        };
        Module {
            name: parts.name,
            segments: parts.segments,
            symbols: parts.symbols,
            dyn_ptr: parts.dyn_ptr,
            phdrs: parts.phdrs,
            relocation: parts.relocation,
            relro: parts.relro,
            got: parts.got,
            init_fn: parts.init_fn,
            init_array_fn: parts.init_array_fn,
            fini_fn: parts.fini_fn,
            fini_array_fn: parts.fini_array_fn,
            needed: parts.needed,
            raw_dynamic: parts.raw_dynamic,
            runpath: parts.runpath,
            lazy: parts.lazy,
            #[cfg(feature = "tls")]
            tls: parts.tls,
            #[cfg(feature = "tls")]
            tlsdesc_data: Once::new(),
            state: AtomicU8::new(ModuleState::Mapped as u8),
            flags: AtomicU8::new(flags.bits()),
            refcount: AtomicUsize::new(0),
            load_order_rank: AtomicUsize::new(UNRANKED),
            global_order_rank: AtomicUsize::new(UNRANKED),
            symbolizer_modid: AtomicUsize::new(0),
            deps: Once::new(),
            scope: Once::new(),
            lazy_scope: Once::new(),
        }
    }

    /// Canonical name: `DT_SONAME` when present, otherwise the name the
    /// module was opened under.
    #[inline]
    pub fn name(&self) -> &str {
        self.name.to_str().unwrap()
    }

    #[inline]
    pub fn cname(&self) -> &CStr {
        &self.name
    }

    /// Load bias of the mapped image.
    #[inline]
    pub fn base(&self) -> usize {
        self.segments.base()
    }

    /// Length of the mapped span.
    #[inline]
    pub fn mapped_len(&self) -> usize {
        self.segments.len()
    }

    #[inline]
    pub fn phdrs(&self) -> &[ElfPhdr] {
        &self.phdrs
    }

    /// Canonical names of the direct dependencies.
    #[inline]
    pub fn needed(&self) -> &[String] {
        &self.needed
    }

    /// The `(d_tag, d_un)` pairs decoded from the dynamic segment.
    #[inline]
    pub fn dynamic_table(&self) -> &[(i64, usize)] {
        &self.raw_dynamic
    }

    /// `DT_RUNPATH` (or `DT_RPATH`) if the module carries one.
    #[inline]
    pub fn runpath(&self) -> Option<&str> {
        self.runpath.as_deref()
    }

    #[inline]
    pub fn state(&self) -> ModuleState {
        ModuleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance the lifecycle. States only move forward.
    pub(crate) fn set_state(&self, state: ModuleState) {
        debug_assert!(self.state() <= state);
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn flags(&self) -> ModuleFlags {
        ModuleFlags::from_bits_retain(self.flags.load(Ordering::Relaxed))
    }

    pub(crate) fn insert_flags(&self, flags: ModuleFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn is_global(&self) -> bool {
        self.flags().contains(ModuleFlags::GLOBAL)
    }

    #[inline]
    pub fn is_startup(&self) -> bool {
        self.flags().contains(ModuleFlags::STARTUP)
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.flags()
            .intersects(ModuleFlags::NODELETE | ModuleFlags::STARTUP)
    }

    /// Position in `load_order`, assigned once when the module enters the
    /// graph.
    #[inline]
    pub fn load_order_rank(&self) -> usize {
        self.load_order_rank.load(Ordering::Relaxed)
    }

    pub(crate) fn set_load_order_rank(&self, rank: usize) {
        debug_assert_eq!(self.load_order_rank(), UNRANKED);
        self.load_order_rank.store(rank, Ordering::Relaxed);
    }

    /// Position in `global_order`; assigned the first time the module is
    /// promoted and stable afterwards.
    #[inline]
    pub fn global_order_rank(&self) -> usize {
        self.global_order_rank.load(Ordering::Relaxed)
    }

    pub(crate) fn try_set_global_order_rank(&self, rank: usize) -> bool {
        self.global_order_rank
            .compare_exchange(UNRANKED, rank, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// Stable ordinal handed to symbolizers and diagnostics.
    #[inline]
    pub fn symbolizer_modid(&self) -> usize {
        self.symbolizer_modid.load(Ordering::Relaxed)
    }

    pub(crate) fn set_symbolizer_modid(&self, ordinal: usize) {
        self.symbolizer_modid.store(ordinal, Ordering::Relaxed);
    }

    /// TLS module id, non-zero for TLS-bearing modules.
    #[cfg(feature = "tls")]
    #[inline]
    pub fn tls_modid(&self) -> Option<usize> {
        self.tls.as_ref().map(|tls| tls.modid)
    }

    pub(crate) fn inc_refcount(&self) -> usize {
        self.refcount.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn dec_refcount(&self) -> usize {
        let old = self.refcount.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(old > 0);
        old - 1
    }

    #[inline]
    pub(crate) fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Relaxed)
    }
}

#[cfg(feature = "tls")]
impl Drop for Module {
    fn drop(&mut self) {
        if let Some(tls) = &self.tls {
            // Revoke the modid before the image goes away; threads free
            // their per-thread copies when they observe the generation
            // bump.
            crate::tls::release_module(tls.modid);
        }
    }
}
