//! Architecture-specific pieces of the runtime: ELF structure layouts for
//! the native word size, relocation type ids, and the per-arch assembly
//! stubs (lazy PLT resolver, TLSDESC entry points).

use elf::abi::{
    SHN_UNDEF, STB_GLOBAL, STB_GNU_UNIQUE, STB_LOCAL, STB_WEAK, STT_COMMON, STT_FUNC,
    STT_GNU_IFUNC, STT_NOTYPE, STT_OBJECT, STT_TLS,
};
use core::ops::Deref;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::*;
    } else if #[cfg(target_arch = "riscv64")] {
        mod riscv64;
        pub use riscv64::*;
    }
}

pub(crate) const E_CLASS: u8 = elf::abi::ELFCLASS64;
pub(crate) type Phdr = elf::segment::Elf64_Phdr;
pub type Dyn = elf::dynamic::Elf64_Dyn;
pub(crate) type Ehdr = elf::file::Elf64_Ehdr;
pub(crate) type Rela = elf::relocation::Elf64_Rela;
pub(crate) type Rel = elf::relocation::Elf64_Rel;
pub(crate) type Relr = u64;
pub(crate) type Sym = elf::symbol::Elf64_Sym;
pub(crate) const REL_MASK: usize = 0xFFFFFFFF;
pub(crate) const REL_BIT: usize = 32;
pub(crate) const EHDR_SIZE: usize = size_of::<Ehdr>();
pub(crate) const PHDR_SIZE: usize = size_of::<Phdr>();

/// No relocation.
pub const REL_NONE: u32 = 0;

const OK_BINDS: usize = 1 << STB_GLOBAL | 1 << STB_WEAK | 1 << STB_GNU_UNIQUE;
const OK_TYPES: usize = 1 << STT_NOTYPE
    | 1 << STT_OBJECT
    | 1 << STT_FUNC
    | 1 << STT_COMMON
    | 1 << STT_TLS
    | 1 << STT_GNU_IFUNC;

/// This element holds the total size, in bytes, of the DT_RELR relocation table.
pub const DT_RELRSZ: i64 = 35;
/// Relative relocation table with implicit addends (Elf64_Relr entries).
pub const DT_RELR: i64 = 36;
/// Size, in bytes, of one DT_RELR relocation entry.
pub const DT_RELRENT: i64 = 37;

/// A relocation entry with an explicit addend.
#[repr(transparent)]
pub struct ElfRela {
    rela: Rela,
}

impl ElfRela {
    #[inline]
    pub fn r_type(&self) -> usize {
        self.rela.r_info as usize & REL_MASK
    }

    #[inline]
    pub fn r_symbol(&self) -> usize {
        self.rela.r_info as usize >> REL_BIT
    }

    #[inline]
    pub fn r_offset(&self) -> usize {
        self.rela.r_offset as usize
    }

    /// `base` is unused for RELA entries; the parameter exists so REL and
    /// RELA walks share one shape.
    #[inline]
    pub fn r_addend(&self, _base: usize) -> isize {
        self.rela.r_addend as isize
    }
}

/// A relocation entry whose addend lives in the relocated word.
#[repr(transparent)]
pub struct ElfRel {
    rel: Rel,
}

impl ElfRel {
    #[inline]
    pub fn r_type(&self) -> usize {
        self.rel.r_info as usize & REL_MASK
    }

    #[inline]
    pub fn r_symbol(&self) -> usize {
        self.rel.r_info as usize >> REL_BIT
    }

    #[inline]
    pub fn r_offset(&self) -> usize {
        self.rel.r_offset as usize
    }

    #[inline]
    pub fn r_addend(&self, base: usize) -> isize {
        let ptr = (self.r_offset() + base) as *mut usize;
        unsafe { ptr.read() as isize }
    }
}

#[cfg(not(feature = "rel"))]
pub type ElfRelType = ElfRela;
#[cfg(feature = "rel")]
pub type ElfRelType = ElfRel;

/// One entry of a compact DT_RELR relative-relocation table.
#[repr(transparent)]
pub struct ElfRelr {
    relr: Relr,
}

impl ElfRelr {
    #[inline]
    pub fn value(&self) -> usize {
        self.relr as usize
    }
}

/// A dynamic symbol table entry.
#[repr(transparent)]
pub struct ElfSymbol {
    sym: Sym,
}

impl ElfSymbol {
    #[inline]
    pub fn st_value(&self) -> usize {
        self.sym.st_value as usize
    }

    /// STB_* constant encoded in the upper nibble of `st_info`.
    #[inline]
    pub fn st_bind(&self) -> u8 {
        self.sym.st_info >> 4
    }

    /// STT_* constant encoded in the lower nibble of `st_info`.
    #[inline]
    pub fn st_type(&self) -> u8 {
        self.sym.st_info & 0xf
    }

    #[inline]
    pub fn st_shndx(&self) -> usize {
        self.sym.st_shndx as usize
    }

    #[inline]
    pub fn st_name(&self) -> usize {
        self.sym.st_name as usize
    }

    #[inline]
    pub fn st_size(&self) -> usize {
        self.sym.st_size as usize
    }

    #[inline]
    pub fn is_undef(&self) -> bool {
        self.st_shndx() == SHN_UNDEF as usize
    }

    #[inline]
    pub fn is_ok_bind(&self) -> bool {
        (1 << self.st_bind()) & OK_BINDS != 0
    }

    #[inline]
    pub fn is_ok_type(&self) -> bool {
        (1 << self.st_type()) & OK_TYPES != 0
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        self.st_bind() == STB_LOCAL
    }

    #[inline]
    pub fn is_weak(&self) -> bool {
        self.st_bind() == STB_WEAK
    }

    #[inline]
    pub fn is_tls(&self) -> bool {
        self.st_type() == STT_TLS
    }
}

/// A program header.
#[derive(Debug)]
#[repr(transparent)]
pub struct ElfPhdr {
    phdr: Phdr,
}

impl Deref for ElfPhdr {
    type Target = Phdr;

    fn deref(&self) -> &Self::Target {
        &self.phdr
    }
}

impl Clone for ElfPhdr {
    fn clone(&self) -> Self {
        Self {
            phdr: Phdr {
                p_type: self.phdr.p_type,
                p_flags: self.phdr.p_flags,
                p_align: self.phdr.p_align,
                p_offset: self.phdr.p_offset,
                p_vaddr: self.phdr.p_vaddr,
                p_paddr: self.phdr.p_paddr,
                p_filesz: self.phdr.p_filesz,
                p_memsz: self.phdr.p_memsz,
            },
        }
    }
}

/// Write the module back-pointer and the lazy resolver entry into the
/// reserved GOT slots. Only called while the module is being relocated, so
/// the GOT is live and writable.
#[inline]
pub(crate) fn prepare_lazy_bind(got: *mut usize, module: usize) {
    unsafe {
        got.add(MODULE_OFFSET).write(module);
        got.add(RESOLVE_FUNCTION_OFFSET)
            .write(dl_runtime_resolve as usize);
    }
}
