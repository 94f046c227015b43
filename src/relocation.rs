//! Applying relocations.
//!
//! A module in state `Mapped` has its REL/RELA/RELR and JMPREL tables
//! walked here. Symbol references are resolved against the composite scope
//! assembled by the caller (global order first, then the root's BFS
//! dependency set), with the origin module's own non-weak definitions
//! taking precedence and embedder-supplied host symbols slotted in between.

use crate::{
    Result,
    arch::*,
    error::{undefined_symbol, unsupported_reloc},
    module::{Module, ModuleState},
};
use alloc::{string::ToString, sync::Arc, vec::Vec};
use core::{num::NonZeroUsize, ptr::null_mut};

/// Scope closure consulted by the lazy binding fixup.
pub(crate) type LazyScope = Arc<dyn Fn(&str) -> Option<*const ()> + Send + Sync>;

/// Host symbols supplied by the embedder, consulted before module scopes.
pub(crate) type PreFind<'a> = dyn Fn(&str) -> Option<*const ()> + Send + Sync + 'a;

/// Relative relocations come either as a REL/RELA prefix or as a compact
/// RELR table.
pub(crate) enum RelativeRel {
    Rel(&'static [ElfRelType]),
    Relr(&'static [ElfRelr]),
}

/// The split relocation tables of one module.
pub(crate) struct ModuleRelocs {
    relative: RelativeRel,
    pltrel: &'static [ElfRelType],
    dynrel: &'static [ElfRelType],
}

impl ModuleRelocs {
    /// Split the decoded tables: the `DT_RELACOUNT` prefix of `dynrel` is
    /// purely relative, and a `pltrel` table that sits contiguously at the
    /// end of `dynrel` is deduplicated away.
    pub(crate) fn new(
        pltrel: Option<&'static [ElfRelType]>,
        dynrel: Option<&'static [ElfRelType]>,
        relr: Option<&'static [ElfRelr]>,
        rela_count: Option<NonZeroUsize>,
    ) -> Self {
        if let Some(relr) = relr {
            return Self {
                relative: RelativeRel::Relr(relr),
                pltrel: pltrel.unwrap_or(&[]),
                dynrel: dynrel.unwrap_or(&[]),
            };
        }
        let nrelative = rela_count.map(|v| v.get()).unwrap_or(0);
        let old_dynrel = dynrel.unwrap_or(&[]);
        let relative = RelativeRel::Rel(&old_dynrel[..nrelative]);
        let temp_dynrel = &old_dynrel[nrelative..];
        let pltrel = pltrel.unwrap_or(&[]);
        let dynrel = if unsafe {
            core::ptr::eq(
                old_dynrel.as_ptr().add(old_dynrel.len()),
                pltrel.as_ptr().add(pltrel.len()),
            )
        } {
            &temp_dynrel[..temp_dynrel.len() - pltrel.len()]
        } else {
            temp_dynrel
        };
        Self {
            relative,
            pltrel,
            dynrel,
        }
    }
}

#[inline]
fn write_val(base: usize, offset: usize, val: usize) {
    unsafe {
        let rel_addr = (base + offset) as *mut usize;
        rel_addr.write(val)
    };
}

/// A resolved definition: the module that defines the symbol and the
/// symbol entry itself.
pub(crate) struct SymDef<'scope> {
    pub module: &'scope Arc<Module>,
    pub sym: &'scope ElfSymbol,
}

/// Find the defining module and symbol for `r_sym` of `origin`.
///
/// Order: the origin's own non-weak definition, then the composite scope
/// front to back. A weak definition in the origin is the fallback when
/// nothing else defines the name. `skip` removes one module from
/// consideration (COPY relocations must not resolve to themselves).
pub(crate) fn find_symdef<'scope>(
    origin: &'scope Arc<Module>,
    scope: &'scope [Arc<Module>],
    r_sym: usize,
    skip_origin: bool,
) -> Option<SymDef<'scope>> {
    let (origin_sym, syminfo) = origin.symbols.symbol_idx(r_sym);
    if !skip_origin && !origin_sym.is_undef() && !origin_sym.is_weak() {
        return Some(SymDef {
            module: origin,
            sym: origin_sym,
        });
    }
    let mut precompute = syminfo.precompute();
    for module in scope {
        if skip_origin && Arc::ptr_eq(module, origin) {
            continue;
        }
        if module.state() >= ModuleState::TornDown {
            continue;
        }
        if let Some(sym) = module.symbols.lookup_filter(&syminfo, &mut precompute) {
            return Some(SymDef { module, sym });
        }
    }
    if !skip_origin && !origin_sym.is_undef() {
        return Some(SymDef {
            module: origin,
            sym: origin_sym,
        });
    }
    None
}

/// Resolve `r_sym` of `origin` to an absolute address.
pub(crate) fn find_symbol_addr(
    pre_find: &PreFind<'_>,
    origin: &Arc<Module>,
    scope: &[Arc<Module>],
    r_sym: usize,
) -> Option<usize> {
    let (origin_sym, syminfo) = origin.symbols.symbol_idx(r_sym);
    if !origin_sym.is_undef() && !origin_sym.is_weak() {
        return Some(origin.base() + origin_sym.st_value());
    }
    if let Some(addr) = pre_find(syminfo.name()) {
        return Some(addr as usize);
    }
    let mut precompute = syminfo.precompute();
    for module in scope {
        if module.state() >= ModuleState::TornDown {
            continue;
        }
        if let Some(sym) = module.symbols.lookup_filter(&syminfo, &mut precompute) {
            return Some(module.base() + sym.st_value());
        }
    }
    if !origin_sym.is_undef() {
        return Some(origin.base() + origin_sym.st_value());
    }
    None
}

/// Relocate one mapped module against `scope` and apply RELRO.
///
/// `scope` is the composite resolution scope for the `dlopen` root this
/// module belongs to. `lazy_scope` must be provided when the module keeps
/// lazy PLT entries.
pub(crate) fn relocate_module(
    module: &Arc<Module>,
    scope: &[Arc<Module>],
    pre_find: &PreFind<'_>,
    lazy_scope: Option<LazyScope>,
) -> Result<()> {
    debug_assert_eq!(module.state(), ModuleState::Mapped);
    log::debug!("relocating [{}]", module.name());
    relocate_relative(module);
    relocate_dynrel(module, scope, pre_find)?;
    relocate_pltrel(module, scope, pre_find, lazy_scope)?;
    if let Some(relro) = &module.relro {
        relro.relro()?;
    }
    module.set_state(ModuleState::Relocated);
    Ok(())
}

/// Relative relocations: write `base + addend` at each offset.
fn relocate_relative(module: &Arc<Module>) {
    let base = module.base();
    match &module.relocation.relative {
        RelativeRel::Rel(rel) => rel.iter().for_each(|rel| {
            debug_assert!(rel.r_type() == REL_RELATIVE as usize);
            let r_addend = rel.r_addend(base);
            write_val(base, rel.r_offset(), base.wrapping_add_signed(r_addend));
        }),
        RelativeRel::Relr(relr) => {
            // RELR entries alternate between an even address word and odd
            // bitmap words covering the following 63 slots.
            let mut reloc_addr: *mut usize = null_mut();
            relr.iter().for_each(|relr| {
                let value = relr.value();
                unsafe {
                    if (value & 1) == 0 {
                        reloc_addr = module.segments.get_mut_ptr(value);
                        reloc_addr.write(base + reloc_addr.read());
                        reloc_addr = reloc_addr.add(1);
                    } else {
                        let mut bitmap = value;
                        let mut idx = 0;
                        while bitmap != 0 {
                            bitmap >>= 1;
                            if (bitmap & 1) != 0 {
                                let ptr = reloc_addr.add(idx);
                                ptr.write(base + ptr.read());
                            }
                            idx += 1;
                        }
                        reloc_addr = reloc_addr.add(usize::BITS as usize - 1);
                    }
                }
            });
        }
    }
}

/// Error or weak-zero fallback for an unresolved symbol reference.
fn unresolved(module: &Arc<Module>, r_sym: usize, offset: usize) -> Result<()> {
    let (sym, syminfo) = module.symbols.symbol_idx(r_sym);
    if sym.is_weak() {
        // Weak undefined references resolve to zero.
        write_val(module.base(), offset, 0);
        return Ok(());
    }
    Err(undefined_symbol(
        syminfo.name().to_string(),
        module.name().to_string(),
    ))
}

fn relocate_dynrel(
    module: &Arc<Module>,
    scope: &[Arc<Module>],
    pre_find: &PreFind<'_>,
) -> Result<()> {
    /*
        A = addend of the relocation entry
        B = base address of the mapped image
        S = value of the referenced symbol
    */
    let base = module.base();
    #[cfg(feature = "tls")]
    let mut tlsdesc_data: Vec<alloc::boxed::Box<crate::tls::TlsDescData>> = Vec::new();

    for rel in module.relocation.dynrel {
        let r_type = rel.r_type() as u32;
        let r_sym = rel.r_symbol();
        let r_addend = rel.r_addend(base);
        match r_type {
            REL_NONE => {}
            // Handled up front as a table prefix, but tolerated here.
            REL_RELATIVE => {
                write_val(base, rel.r_offset(), base.wrapping_add_signed(r_addend));
            }
            REL_GOT | REL_SYMBOLIC => {
                if let Some(addr) = find_symbol_addr(pre_find, module, scope, r_sym) {
                    write_val(base, rel.r_offset(), addr.wrapping_add_signed(r_addend));
                } else {
                    unresolved(module, r_sym, rel.r_offset())?;
                }
            }
            REL_IRELATIVE => {
                let ifunc: extern "C" fn() -> usize =
                    unsafe { core::mem::transmute(base.wrapping_add_signed(r_addend)) };
                write_val(base, rel.r_offset(), ifunc());
            }
            REL_COPY => {
                // Data import: the source definition must come from some
                // other module in scope.
                if let Some(symdef) = find_symdef(module, scope, r_sym, true) {
                    let len = symdef.sym.st_size();
                    let dest = module.segments.get_slice_mut::<u8>(rel.r_offset(), len);
                    let src = unsafe {
                        core::slice::from_raw_parts(
                            (symdef.module.base() + symdef.sym.st_value()) as *const u8,
                            len,
                        )
                    };
                    dest.copy_from_slice(src);
                } else {
                    unresolved(module, r_sym, rel.r_offset())?;
                }
            }
            #[cfg(feature = "tls")]
            REL_DTPMOD => {
                let modid = if r_sym == 0 {
                    module.tls.as_ref().map(|tls| tls.modid)
                } else {
                    find_symdef(module, scope, r_sym, false)
                        .and_then(|symdef| symdef.module.tls.as_ref().map(|tls| tls.modid))
                };
                match modid {
                    Some(modid) => write_val(base, rel.r_offset(), modid),
                    None => unresolved(module, r_sym, rel.r_offset())?,
                }
            }
            #[cfg(feature = "tls")]
            REL_DTPOFF => {
                if let Some(symdef) = find_symdef(module, scope, r_sym, false) {
                    let val = symdef
                        .sym
                        .st_value()
                        .wrapping_add_signed(r_addend)
                        .wrapping_sub(TLS_DTV_OFFSET);
                    write_val(base, rel.r_offset(), val);
                } else {
                    unresolved(module, r_sym, rel.r_offset())?;
                }
            }
            #[cfg(feature = "tls")]
            REL_TPOFF => {
                // Static TLS offsets exist only for modules placed in the
                // startup static block; the layout is sealed afterwards.
                let resolved = if r_sym == 0 {
                    module
                        .tls
                        .as_ref()
                        .and_then(|tls| tls.static_offset)
                        .map(|off| (off, 0))
                } else {
                    find_symdef(module, scope, r_sym, false).and_then(|symdef| {
                        symdef
                            .module
                            .tls
                            .as_ref()
                            .and_then(|tls| tls.static_offset)
                            .map(|off| (off, symdef.sym.st_value()))
                    })
                };
                match resolved {
                    Some((static_off, st_value)) => {
                        let val = static_off
                            .wrapping_add(st_value)
                            .wrapping_add_signed(r_addend);
                        write_val(base, rel.r_offset(), val);
                    }
                    None => {
                        return Err(unsupported_reloc(
                            r_type as usize,
                            module.name().to_string(),
                        ));
                    }
                }
            }
            #[cfg(feature = "tls")]
            REL_TLSDESC => {
                let target = if r_sym == 0 {
                    module.tls.as_ref().map(|tls| (tls, 0))
                } else {
                    match find_symdef(module, scope, r_sym, false) {
                        Some(symdef) => symdef
                            .module
                            .tls
                            .as_ref()
                            .map(|tls| (tls, symdef.sym.st_value())),
                        // A missing weak symbol gets a descriptor that
                        // resolves to null.
                        None if module.symbols.symbol_idx(r_sym).0.is_weak() => None,
                        None => {
                            let (_, syminfo) = module.symbols.symbol_idx(r_sym);
                            return Err(undefined_symbol(
                                syminfo.name().to_string(),
                                module.name().to_string(),
                            ));
                        }
                    }
                };
                let data = target.map(|(tls, st_value)| {
                    crate::tls::TlsDescData::new(tls, st_value.wrapping_add_signed(r_addend))
                });
                let value = match data {
                    Some(data) => {
                        let boxed = alloc::boxed::Box::new(data);
                        let ptr = &*boxed as *const crate::tls::TlsDescData as usize;
                        tlsdesc_data.push(boxed);
                        ptr
                    }
                    None => 0,
                };
                write_val(base, rel.r_offset(), tlsdesc_resolve as usize);
                write_val(base, rel.r_offset() + size_of::<usize>(), value);
            }
            _ => {
                log::error!(
                    "[{}] unsupported relocation {}",
                    module.name(),
                    rel_type_to_str(r_type as usize)
                );
                return Err(unsupported_reloc(r_type as usize, module.name().to_string()));
            }
        }
    }

    #[cfg(feature = "tls")]
    if !tlsdesc_data.is_empty() {
        module
            .tlsdesc_data
            .call_once(|| tlsdesc_data.into_boxed_slice());
    }
    Ok(())
}

fn relocate_pltrel(
    module: &Arc<Module>,
    scope: &[Arc<Module>],
    pre_find: &PreFind<'_>,
    lazy_scope: Option<LazyScope>,
) -> Result<()> {
    let base = module.base();
    let reloc = &module.relocation;

    if module.lazy {
        // Lazy binding: jump slots only get rebased; the first call goes
        // through `dl_runtime_resolve` into `dl_fixup`.
        for rel in reloc.pltrel {
            let r_type = rel.r_type() as u32;
            let r_addend = rel.r_addend(base);
            if r_type == REL_JUMP_SLOT {
                let ptr = (base + rel.r_offset()) as *mut usize;
                unsafe {
                    let origin_val = ptr.read();
                    ptr.write(origin_val + base);
                }
            } else if r_type == REL_IRELATIVE {
                let ifunc: extern "C" fn() -> usize =
                    unsafe { core::mem::transmute(base.wrapping_add_signed(r_addend)) };
                write_val(base, rel.r_offset(), ifunc());
            } else {
                return Err(unsupported_reloc(r_type as usize, module.name().to_string()));
            }
        }
        if !reloc.pltrel.is_empty() {
            let Some(got) = module.got else {
                return Err(crate::error::malformed_elf(
                    "lazily bound module lacks DT_PLTGOT",
                ));
            };
            assert!(
                lazy_scope.is_some(),
                "no lazy scope provided for a lazily bound module"
            );
            prepare_lazy_bind(got.as_ptr(), Arc::as_ptr(module) as usize);
        }
        if let Some(lazy_scope) = lazy_scope {
            module.lazy_scope.call_once(|| lazy_scope);
        }
    } else {
        for rel in reloc.pltrel {
            let r_type = rel.r_type() as u32;
            let r_sym = rel.r_symbol();
            let r_addend = rel.r_addend(base);
            if r_type == REL_JUMP_SLOT {
                if let Some(addr) = find_symbol_addr(pre_find, module, scope, r_sym) {
                    write_val(base, rel.r_offset(), addr);
                } else {
                    unresolved(module, r_sym, rel.r_offset())?;
                }
            } else if r_type == REL_IRELATIVE {
                let ifunc: extern "C" fn() -> usize =
                    unsafe { core::mem::transmute(base.wrapping_add_signed(r_addend)) };
                write_val(base, rel.r_offset(), ifunc());
            } else {
                return Err(unsupported_reloc(r_type as usize, module.name().to_string()));
            }
        }
    }
    Ok(())
}

/// Lazy binding fixup, reached through the per-arch PLT resolver stub.
///
/// Resolves the symbol behind `rela_idx`, patches the GOT slot and returns
/// the target address for the stub to jump to.
#[unsafe(no_mangle)]
pub(crate) unsafe extern "C" fn dl_fixup(module: &Module, rela_idx: usize) -> usize {
    let rela = &module.relocation.pltrel[rela_idx];
    let r_type = rela.r_type();
    let r_sym = rela.r_symbol();
    assert!(r_type == REL_JUMP_SLOT as usize && r_sym != 0);

    let (_, syminfo) = module.symbols.symbol_idx(r_sym);
    let symbol = module
        .lazy_scope
        .get()
        .expect("lazy binding without a scope")(syminfo.name())
    .expect("lazy binding failed") as usize;

    log::trace!(
        "lazy binding: [{}] resolved [{}] to 0x{:x}",
        module.name(),
        syminfo.name(),
        symbol
    );
    let ptr = (module.base() + rela.r_offset()) as *mut usize;
    unsafe { ptr.write(symbol) };
    symbol
}
