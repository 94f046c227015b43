//! ELF symbol and string tables.

use crate::{
    arch::ElfSymbol,
    dynamic::ElfDynamic,
    hash::HashTable,
};
use core::ffi::CStr;

pub use crate::hash::PreCompute;

/// The `.dynstr` table.
///
/// Offsets handed out by other tables are validated against `DT_STRSZ`
/// before being dereferenced; a bad offset surfaces as a decode error
/// instead of a wild read.
pub(crate) struct ElfStringTable {
    data: *const u8,
    len: usize,
}

impl ElfStringTable {
    pub(crate) const fn new(data: *const u8, len: usize) -> Self {
        ElfStringTable { data, len }
    }

    /// Get the string at `offset` with bounds validation.
    ///
    /// Returns `None` when the offset is outside the table, the string is
    /// empty, or no terminator exists inside the table.
    pub(crate) fn get_str_checked(&self, offset: usize) -> Option<&'static str> {
        if offset >= self.len {
            return None;
        }
        let mut end = offset;
        unsafe {
            while end < self.len && self.data.add(end).read() != 0 {
                end += 1;
            }
        }
        if end == offset || end == self.len {
            return None;
        }
        let bytes = unsafe { core::slice::from_raw_parts(self.data.add(offset), end - offset) };
        Some(unsafe { core::str::from_utf8_unchecked(bytes) })
    }

    /// Get the C string at `offset`. Callers use this only for offsets
    /// that came out of the module's own symbol table.
    #[inline]
    pub(crate) fn get_cstr(&self, offset: usize) -> &'static CStr {
        unsafe { CStr::from_ptr(self.data.add(offset).cast()) }
    }

    #[inline]
    fn convert_cstr(s: &CStr) -> &str {
        unsafe { core::str::from_utf8_unchecked(s.to_bytes()) }
    }

    #[inline]
    pub(crate) fn get_str(&self, offset: usize) -> &'static str {
        Self::convert_cstr(self.get_cstr(offset))
    }
}

/// Symbol table of a module: hash table, `.dynsym` and `.dynstr`.
pub struct SymbolTable {
    pub(crate) hashtab: HashTable,
    pub(crate) symtab: *const ElfSymbol,
    pub(crate) strtab: ElfStringTable,
}

unsafe impl Send for SymbolTable {}
unsafe impl Sync for SymbolTable {}

/// A symbol lookup request.
pub struct SymbolInfo<'symtab> {
    name: &'symtab str,
}

impl<'symtab> SymbolInfo<'symtab> {
    pub(crate) fn from_str(name: &'symtab str) -> Self {
        SymbolInfo { name }
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.name
    }
}

impl SymbolTable {
    pub(crate) fn from_dynamic(dynamic: &ElfDynamic) -> Self {
        let hashtab = HashTable::from_dynamic(dynamic);
        let symtab = dynamic.symtab as *const ElfSymbol;
        let strtab = ElfStringTable::new(dynamic.strtab as *const u8, dynamic.strsz);
        SymbolTable {
            hashtab,
            symtab,
            strtab,
        }
    }

    pub(crate) fn strtab(&self) -> &ElfStringTable {
        &self.strtab
    }

    /// Look up a symbol by name through the hash table.
    pub fn lookup(&self, symbol: &SymbolInfo, precompute: &mut PreCompute) -> Option<&ElfSymbol> {
        self.hashtab.lookup(self, symbol, precompute)
    }

    /// Look up a symbol and keep it only if it can satisfy a relocation:
    /// defined, with an acceptable binding and type.
    #[inline]
    pub fn lookup_filter(
        &self,
        symbol: &SymbolInfo,
        precompute: &mut PreCompute,
    ) -> Option<&ElfSymbol> {
        if let Some(sym) = self.lookup(symbol, precompute) {
            if !sym.is_undef() && sym.is_ok_bind() && sym.is_ok_type() {
                return Some(sym);
            }
        }
        None
    }

    /// Get the symbol at `idx` together with its name.
    pub fn symbol_idx<'symtab>(
        &'symtab self,
        idx: usize,
    ) -> (&'symtab ElfSymbol, SymbolInfo<'symtab>) {
        let symbol = unsafe { &*self.symtab.add(idx) };
        let name = self.strtab.get_str(symbol.st_name());
        (symbol, SymbolInfo { name })
    }

    /// Number of symbols reachable through the hash table.
    #[inline]
    pub fn count_syms(&self) -> usize {
        self.hashtab.count_syms()
    }
}
