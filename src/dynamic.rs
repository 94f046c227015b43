//! Parsing the `.dynamic` segment.

use crate::{
    Result,
    arch::{DT_RELR, DT_RELRSZ, Dyn, ElfRelType, ElfRelr},
    diagnostics::{DiagAction, Diagnostics},
    error::malformed_elf,
    segment::ElfSegments,
};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::{
    num::NonZeroUsize,
    ptr::{NonNull, null_mut},
};
use elf::abi::*;

/// Which hash table the module carries. GNU hash is preferred when both
/// are present.
pub enum ElfDynamicHashTab {
    /// .gnu.hash
    Gnu(usize),
    /// .hash
    Elf(usize),
}

/// Information decoded from the dynamic segment.
///
/// Offsets that address other tables are already rebased onto the mapped
/// image; `DT_NEEDED`, `DT_SONAME` and path entries stay as raw string
/// table offsets until [`crate::symbol::ElfStringTable`] reifies them.
pub struct ElfDynamic {
    /// Pointer to the mapped dynamic section.
    pub dyn_ptr: *const Dyn,
    /// Hash table address.
    pub hashtab: ElfDynamicHashTab,
    /// Symbol table address.
    pub symtab: usize,
    /// String table address.
    pub strtab: usize,
    /// String table size in bytes (`DT_STRSZ`).
    pub strsz: usize,
    /// Whether every relocation must be bound eagerly
    /// (`DF_BIND_NOW`/`DF_1_NOW`).
    pub bind_now: bool,
    /// Whether the module is pinned (`DF_1_NODELETE`).
    pub nodelete: bool,
    /// Global Offset Table address.
    pub got_plt: Option<NonNull<usize>>,
    /// `DT_INIT`.
    pub init_fn: Option<extern "C" fn()>,
    /// `DT_INIT_ARRAY`.
    pub init_array_fn: Option<&'static [extern "C" fn()]>,
    /// `DT_FINI`.
    pub fini_fn: Option<extern "C" fn()>,
    /// `DT_FINI_ARRAY`.
    pub fini_array_fn: Option<&'static [extern "C" fn()]>,
    /// PLT relocation entries (`DT_JMPREL`).
    pub pltrel: Option<&'static [ElfRelType]>,
    /// Dynamic relocation entries (`DT_RELA`/`DT_REL`).
    pub dynrel: Option<&'static [ElfRelType]>,
    /// Compact relative relocation entries (`DT_RELR`).
    pub relr: Option<&'static [ElfRelr]>,
    /// Count of leading relative relocations in `dynrel`.
    pub rel_count: Option<NonZeroUsize>,
    /// String table offsets of the `DT_NEEDED` entries, in file order.
    ///
    /// This is the needed-name observer output: names are not resolved
    /// until the string table has been validated.
    pub needed_offsets: Vec<NonZeroUsize>,
    /// String table offset of `DT_SONAME`.
    pub soname_off: Option<NonZeroUsize>,
    /// String table offset of `DT_RPATH`.
    pub rpath_off: Option<NonZeroUsize>,
    /// String table offset of `DT_RUNPATH`.
    pub runpath_off: Option<NonZeroUsize>,
    /// Every `(d_tag, d_un)` pair as it appeared in the file, up to and
    /// excluding `DT_NULL`. Kept for round-trip comparisons and debugging.
    pub raw_table: Box<[(i64, usize)]>,
}

impl ElfDynamic {
    /// Decode the dynamic segment at `dynamic_ptr`.
    ///
    /// Malformations are reported to `diag`; when it answers
    /// [`DiagAction::Continue`] the affected table is left empty and
    /// decoding proceeds.
    pub(crate) fn new(
        dynamic_ptr: *const Dyn,
        segments: &ElfSegments,
        name: &str,
        diag: &dyn Diagnostics,
    ) -> Result<Self> {
        let mut symtab_off = 0;
        let mut strtab_off = 0;
        let mut strsz = 0;
        let mut syment = None;
        let mut elf_hash_off = None;
        let mut gnu_hash_off = None;
        let mut got_off = None;
        let mut pltrel_size = None;
        let mut pltrel_off = None;
        let mut rel_off = None;
        let mut rel_size = None;
        let mut rel_ent = None;
        let mut rel_count = None;
        let mut relr_off = None;
        let mut relr_size = None;
        let mut init_off = None;
        let mut fini_off = None;
        let mut init_array_off = None;
        let mut init_array_size = None;
        let mut fini_array_off = None;
        let mut fini_array_size = None;
        let mut soname_off = None;
        let mut rpath_off = None;
        let mut runpath_off = None;
        let mut flags = 0;
        let mut flags_1 = 0;
        let mut is_rela = None;
        let mut needed_offsets = Vec::new();
        let mut raw_table = Vec::new();

        let base = segments.base();
        let mut cur_dyn_ptr = dynamic_ptr;
        let mut dynamic = unsafe { &*cur_dyn_ptr };

        unsafe {
            loop {
                if dynamic.d_tag == DT_NULL {
                    break;
                }
                raw_table.push((dynamic.d_tag as i64, dynamic.d_un as usize));
                match dynamic.d_tag as _ {
                    DT_FLAGS => flags = dynamic.d_un as usize,
                    DT_FLAGS_1 => flags_1 = dynamic.d_un as usize,
                    DT_PLTGOT => got_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_NEEDED => {
                        if let Some(val) = NonZeroUsize::new(dynamic.d_un as usize) {
                            needed_offsets.push(val);
                        }
                    }
                    DT_HASH => elf_hash_off = Some(dynamic.d_un as usize),
                    DT_GNU_HASH => gnu_hash_off = Some(dynamic.d_un as usize),
                    DT_SYMTAB => symtab_off = dynamic.d_un as usize,
                    DT_SYMENT => syment = Some(dynamic.d_un as usize),
                    DT_STRTAB => strtab_off = dynamic.d_un as usize,
                    DT_STRSZ => strsz = dynamic.d_un as usize,
                    DT_PLTRELSZ => pltrel_size = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_PLTREL => {
                        is_rela = Some(dynamic.d_un as i64 == DT_RELA);
                    }
                    DT_JMPREL => pltrel_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_RELR => relr_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_RELA | DT_REL => {
                        is_rela = Some(dynamic.d_tag as i64 == DT_RELA);
                        rel_off = NonZeroUsize::new(dynamic.d_un as usize)
                    }
                    DT_RELASZ | DT_RELSZ => rel_size = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_RELAENT | DT_RELENT => rel_ent = Some(dynamic.d_un as usize),
                    DT_RELRSZ => relr_size = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_RELACOUNT | DT_RELCOUNT => {
                        rel_count = NonZeroUsize::new(dynamic.d_un as usize)
                    }
                    DT_INIT => init_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_FINI => fini_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_INIT_ARRAY => init_array_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_INIT_ARRAYSZ => init_array_size = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_FINI_ARRAY => fini_array_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_FINI_ARRAYSZ => fini_array_size = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_SONAME => soname_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_RPATH => rpath_off = NonZeroUsize::new(dynamic.d_un as usize),
                    DT_RUNPATH => runpath_off = NonZeroUsize::new(dynamic.d_un as usize),
                    _ => {}
                }
                cur_dyn_ptr = cur_dyn_ptr.add(1);
                dynamic = &*cur_dyn_ptr;
            }
        }

        // Entry size mismatches are soft: the tables are simply dropped.
        if let Some(syment) = syment {
            if syment != size_of::<crate::arch::Sym>()
                && diag.format_error(name, format_args!("bad DT_SYMENT: {syment}"))
                    == DiagAction::Abort
            {
                return Err(malformed_elf("bad DT_SYMENT"));
            }
        }
        if let Some(ent) = rel_ent {
            if ent != size_of::<ElfRelType>() {
                if diag.format_error(name, format_args!("bad relocation entry size: {ent}"))
                    == DiagAction::Abort
                {
                    return Err(malformed_elf("bad relocation entry size"));
                }
                rel_off = None;
                rel_size = None;
            }
        }

        let hashtab = if let Some(off) = gnu_hash_off {
            ElfDynamicHashTab::Gnu(off + base)
        } else if let Some(off) = elf_hash_off {
            ElfDynamicHashTab::Elf(off + base)
        } else {
            if diag.format_error(
                name,
                format_args!("dynamic section has neither DT_GNU_HASH nor DT_HASH"),
            ) == DiagAction::Abort
            {
                return Err(malformed_elf(
                    "dynamic section has neither DT_GNU_HASH nor DT_HASH",
                ));
            }
            // A hash table is required for any symbol lookup; a module
            // decoded without one can only be inspected.
            ElfDynamicHashTab::Elf(0)
        };

        let pltrel = pltrel_off.map(|pltrel_off| {
            segments.get_slice(pltrel_off.get(), pltrel_size.map(|s| s.get()).unwrap_or(0))
        });
        let dynrel = rel_off.map(|rel_off| {
            segments.get_slice(rel_off.get(), rel_size.map(|s| s.get()).unwrap_or(0))
        });
        let relr = relr_off.map(|relr_off| {
            segments.get_slice(relr_off.get(), relr_size.map(|s| s.get()).unwrap_or(0))
        });

        let init_fn = init_off
            .map(|val| unsafe { core::mem::transmute(segments.get_ptr::<fn()>(val.get())) });
        let init_array_fn = init_array_off.map(|init_array_off| {
            segments.get_slice(
                init_array_off.get(),
                init_array_size.map(|s| s.get()).unwrap_or(0),
            )
        });
        let fini_fn = fini_off
            .map(|val| unsafe { core::mem::transmute(segments.get_ptr::<fn()>(val.get())) });
        let fini_array_fn = fini_array_off.map(|fini_array_off| {
            segments.get_slice(
                fini_array_off.get(),
                fini_array_size.map(|s| s.get()).unwrap_or(0),
            )
        });

        if let Some(is_rela) = is_rela {
            debug_assert!(is_rela == (size_of::<ElfRelType>() == size_of::<crate::arch::Rela>()));
        }

        Ok(ElfDynamic {
            dyn_ptr: dynamic_ptr,
            hashtab,
            symtab: symtab_off + base,
            strtab: strtab_off + base,
            strsz,
            bind_now: flags & DF_BIND_NOW as usize != 0 || flags_1 & DF_1_NOW as usize != 0,
            nodelete: flags_1 & DF_1_NODELETE as usize != 0,
            got_plt: NonNull::new(
                got_off
                    .map(|off| (base + off.get()) as *mut usize)
                    .unwrap_or(null_mut()),
            ),
            init_fn,
            init_array_fn,
            fini_fn,
            fini_array_fn,
            pltrel,
            dynrel,
            relr,
            rel_count,
            needed_offsets,
            soname_off,
            rpath_off,
            runpath_off,
            raw_table: raw_table.into_boxed_slice(),
        })
    }
}
