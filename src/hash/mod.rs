use crate::{
    arch::ElfSymbol,
    dynamic::{ElfDynamic, ElfDynamicHashTab},
    hash::{gnu::ElfGnuHash, sysv::ElfHash},
    symbol::{SymbolInfo, SymbolTable},
};

mod gnu;
mod sysv;

pub(crate) trait ElfHashTable {
    fn hash(name: &[u8]) -> u64;
    fn count_syms(&self) -> usize;
    fn lookup<'sym>(
        table: &'sym SymbolTable,
        symbol: &SymbolInfo,
        precompute: &mut PreCompute,
    ) -> Option<&'sym ElfSymbol>;
}

pub(crate) enum HashTable {
    /// .gnu.hash
    Gnu(ElfGnuHash),
    /// .hash
    Elf(ElfHash),
}

/// Hash values computed once per name and reused across every module a
/// lookup visits.
pub struct PreCompute {
    gnuhash: u32,
    fofs: usize,
    fmask: usize,
    hash: Option<u32>,
}

impl HashTable {
    #[inline]
    pub(crate) fn count_syms(&self) -> usize {
        match &self {
            HashTable::Gnu(hashtab) => hashtab.count_syms(),
            HashTable::Elf(hashtab) => hashtab.count_syms(),
        }
    }

    pub(crate) fn lookup<'sym>(
        &self,
        table: &'sym SymbolTable,
        symbol: &SymbolInfo,
        precompute: &mut PreCompute,
    ) -> Option<&'sym ElfSymbol> {
        match self {
            HashTable::Gnu(_) => ElfGnuHash::lookup(table, symbol, precompute),
            HashTable::Elf(_) => ElfHash::lookup(table, symbol, precompute),
        }
    }

    pub(crate) fn from_dynamic(dynamic: &ElfDynamic) -> Self {
        match dynamic.hashtab {
            ElfDynamicHashTab::Gnu(addr) => HashTable::Gnu(ElfGnuHash::parse(addr as *const u8)),
            // Address zero marks a module decoded without a hash section.
            ElfDynamicHashTab::Elf(0) => HashTable::Elf(ElfHash::empty()),
            ElfDynamicHashTab::Elf(addr) => HashTable::Elf(ElfHash::parse(addr as *const u8)),
        }
    }

    fn into_gnuhash(&self) -> Option<&ElfGnuHash> {
        match self {
            HashTable::Gnu(hashtab) => Some(hashtab),
            _ => None,
        }
    }

    fn into_elfhash(&self) -> Option<&ElfHash> {
        match self {
            HashTable::Elf(hashtab) => Some(hashtab),
            _ => None,
        }
    }
}

impl SymbolInfo<'_> {
    #[inline]
    pub fn precompute(&self) -> PreCompute {
        let gnuhash = ElfGnuHash::hash(self.name().as_bytes()) as u32;
        PreCompute {
            gnuhash,
            fofs: gnuhash as usize / usize::BITS as usize,
            fmask: 1 << (gnuhash % (8 * size_of::<usize>() as u32)),
            hash: None,
        }
    }
}
