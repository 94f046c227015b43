//! Decoding and mapping one module.
//!
//! The pipeline runs an object through header validation, segment layout
//! checks, mapping, dynamic-section decode and needed-name reification,
//! producing a [`Module`] in state `Mapped`. Linking it into the graph,
//! relocating and running constructors are the caller's business.

use crate::{
    Result,
    arch::{EHDR_SIZE, ElfPhdr, PHDR_SIZE},
    diagnostics::{DiagAction, Diagnostics},
    dynamic::ElfDynamic,
    ehdr::ElfHeader,
    error::malformed_elf,
    mmap::Mmap,
    module::{Module, ModuleParts},
    object::ElfObject,
    relocation::ModuleRelocs,
    segment::{self, ElfRelro},
    symbol::SymbolTable,
};
use alloc::{
    ffi::CString,
    format,
    string::{String, ToString},
    vec::Vec,
};
use core::{marker::PhantomData, mem::MaybeUninit};
use elf::abi::{PT_DYNAMIC, PT_GNU_RELRO, PT_LOAD, PT_TLS};

/// Scratch buffer for the header and program header table. Small tables
/// stay on the stack, larger ones (up to the validated maximum) spill to
/// the heap.
struct ElfBuf {
    stack_buf: MaybeUninit<[u8; EHDR_SIZE + 12 * PHDR_SIZE]>,
    heap_buf: Vec<u8>,
}

impl ElfBuf {
    const MAX_STACK_SIZE: usize = EHDR_SIZE + 12 * PHDR_SIZE;

    const fn new() -> Self {
        ElfBuf {
            stack_buf: MaybeUninit::uninit(),
            heap_buf: Vec::new(),
        }
    }

    #[inline]
    fn stack_buf(&mut self) -> &mut [u8] {
        unsafe { &mut *self.stack_buf.as_mut_ptr() }
    }

    fn phdrs_from_stack(&self, phdr_start: usize, phdr_end: usize) -> &[ElfPhdr] {
        debug_assert!(Self::MAX_STACK_SIZE >= phdr_end);
        unsafe {
            core::slice::from_raw_parts(
                self.stack_buf
                    .as_ptr()
                    .cast::<u8>()
                    .add(phdr_start)
                    .cast::<ElfPhdr>(),
                (phdr_end - phdr_start) / PHDR_SIZE,
            )
        }
    }

    #[inline]
    fn heap_buf(&mut self, len: usize) -> &mut [u8] {
        self.heap_buf.resize(len, 0);
        &mut self.heap_buf
    }

    #[inline]
    fn phdrs_from_heap(&self) -> &[ElfPhdr] {
        unsafe {
            core::slice::from_raw_parts(
                self.heap_buf.as_ptr().cast::<ElfPhdr>(),
                self.heap_buf.len() / PHDR_SIZE,
            )
        }
    }
}

/// The module loader: decodes and maps objects through an [`Mmap`]
/// capability.
pub struct Loader<M>
where
    M: Mmap,
{
    _marker: PhantomData<M>,
}

impl<M: Mmap> Default for Loader<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Mmap> Loader<M> {
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    /// Decode and map `object` into a [`Module`] in state `Mapped`.
    ///
    /// `lazy_bind` overrides the object's own `DF_BIND_NOW`; by default
    /// the flag decides. TLS images are registered as dynamically
    /// allocated blocks.
    pub fn load_module(
        &self,
        object: &mut dyn ElfObject,
        lazy_bind: Option<bool>,
        diag: &dyn Diagnostics,
    ) -> Result<Module> {
        #[cfg(feature = "tls")]
        return self.load_with_class(object, lazy_bind, crate::tls::TlsClass::Dynamic, diag);
        #[cfg(not(feature = "tls"))]
        return self.load_inner(object, lazy_bind, diag);
    }

    #[cfg(feature = "tls")]
    pub(crate) fn load_with_class(
        &self,
        object: &mut dyn ElfObject,
        lazy_bind: Option<bool>,
        tls_class: crate::tls::TlsClass,
        diag: &dyn Diagnostics,
    ) -> Result<Module> {
        self.load_inner(object, lazy_bind, tls_class, diag)
    }

    fn load_inner(
        &self,
        object: &mut dyn ElfObject,
        lazy_bind: Option<bool>,
        #[cfg(feature = "tls")] tls_class: crate::tls::TlsClass,
        diag: &dyn Diagnostics,
    ) -> Result<Module> {
        let open_path = object.file_name().to_str().unwrap_or_default().to_string();
        let mut buf = ElfBuf::new();
        object.read(buf.stack_buf(), 0)?;
        let ehdr = ElfHeader::new(buf.stack_buf())?;
        ehdr.validate()?;
        let (phdr_start, phdr_end) = ehdr.phdr_range();
        let phdrs = if ElfBuf::MAX_STACK_SIZE >= phdr_end {
            buf.phdrs_from_stack(phdr_start, phdr_end)
        } else {
            object.read(buf.heap_buf(phdr_end - phdr_start), phdr_start)?;
            buf.phdrs_from_heap()
        };

        segment::validate_load_segments(phdrs)?;
        let segments = segment::reserve_segments::<M>(phdrs)?;

        let mut dynamic_vaddr = None;
        let mut relro = None;
        #[cfg(feature = "tls")]
        let mut tls_phdr = None;
        for phdr in phdrs.iter() {
            match phdr.p_type {
                PT_LOAD => segment::load_segment::<M>(&segments, phdr, object)?,
                PT_DYNAMIC => dynamic_vaddr = Some(phdr.p_vaddr as usize),
                PT_GNU_RELRO => relro = Some(ElfRelro::new::<M>(phdr, segments.base())),
                #[cfg(feature = "tls")]
                PT_TLS => tls_phdr = Some(phdr.clone()),
                _ => {}
            }
        }
        #[cfg(not(feature = "tls"))]
        let _ = PT_TLS;

        let Some(dynamic_vaddr) = dynamic_vaddr else {
            return Err(malformed_elf("object has no PT_DYNAMIC segment"));
        };
        let dyn_ptr = segments.get_ptr(dynamic_vaddr);
        let dynamic = ElfDynamic::new(dyn_ptr, &segments, &open_path, diag)?;
        let relocation = ModuleRelocs::new(
            dynamic.pltrel,
            dynamic.dynrel,
            dynamic.relr,
            dynamic.rel_count,
        );
        let symbols = SymbolTable::from_dynamic(&dynamic);

        let needed = reify_needed(&dynamic, &symbols, &open_path, diag)?;
        let canonical = dynamic
            .soname_off
            .and_then(|off| symbols.strtab().get_str_checked(off.get()))
            .map(String::from)
            .unwrap_or_else(|| open_path.clone());
        let runpath = dynamic
            .runpath_off
            .or(dynamic.rpath_off)
            .and_then(|off| symbols.strtab().get_str_checked(off.get()))
            .map(String::from);

        #[cfg(feature = "tls")]
        let tls = match &tls_phdr {
            Some(phdr) => crate::tls::register_module(&segments, phdr, tls_class),
            None => None,
        };

        let lazy = lazy_bind.unwrap_or(!dynamic.bind_now);
        log::info!(
            "loaded [{}] at 0x{:x} ({} needed, lazy: {})",
            canonical,
            segments.base(),
            needed.len(),
            lazy
        );

        Ok(Module::new(ModuleParts {
            name: CString::new(canonical).unwrap(),
            phdrs: phdrs.to_vec().into_boxed_slice(),
            segments,
            symbols,
            dyn_ptr,
            relocation,
            relro,
            got: dynamic.got_plt,
            init_fn: dynamic.init_fn,
            init_array_fn: dynamic.init_array_fn,
            fini_fn: dynamic.fini_fn,
            fini_array_fn: dynamic.fini_array_fn,
            needed: needed.into_boxed_slice(),
            raw_dynamic: dynamic.raw_table,
            runpath,
            lazy,
            nodelete: dynamic.nodelete,
            #[cfg(feature = "tls")]
            tls,
        }))
    }
}

/// Turn the observed `DT_NEEDED` string offsets into names. A bad offset
/// is reported to the diagnostics object; on `Continue` the entry is
/// dropped from the needed set.
fn reify_needed(
    dynamic: &ElfDynamic,
    symbols: &SymbolTable,
    name: &str,
    diag: &dyn Diagnostics,
) -> Result<Vec<String>> {
    let mut needed = Vec::with_capacity(dynamic.needed_offsets.len());
    for offset in &dynamic.needed_offsets {
        match symbols.strtab().get_str_checked(offset.get()) {
            Some(dep) => needed.push(String::from(dep)),
            None => {
                if diag.format_error(
                    name,
                    format_args!("bad DT_NEEDED string offset {}", offset.get()),
                ) == DiagAction::Abort
                {
                    return Err(malformed_elf(format!(
                        "bad DT_NEEDED string offset {}",
                        offset.get()
                    )));
                }
            }
        }
    }
    Ok(needed)
}
