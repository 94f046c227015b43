//! ELF header parsing and validation.

use crate::{
    Result,
    arch::{E_CLASS, EHDR_SIZE, EM_ARCH, Ehdr, PHDR_SIZE},
    error::malformed_elf,
};
use alloc::format;
use elf::abi::{EI_CLASS, EI_DATA, EI_VERSION, ELFDATA2LSB, ELFMAGIC, ET_DYN, EV_CURRENT};

/// The largest program header count the decoder accepts. Anything larger
/// is treated as malformed input rather than mapped.
pub(crate) const MAX_PHNUM: usize = 32;

#[cfg(target_endian = "little")]
const E_DATA: u8 = ELFDATA2LSB;
#[cfg(target_endian = "big")]
const E_DATA: u8 = ELFDATA2MSB;

pub(crate) struct ElfHeader {
    ehdr: Ehdr,
}

impl ElfHeader {
    pub(crate) fn new(data: &[u8]) -> Result<ElfHeader> {
        if data.len() < EHDR_SIZE {
            return Err(malformed_elf("file too small for an ELF header"));
        }
        let ehdr = unsafe { core::ptr::read_unaligned(data.as_ptr() as *const Ehdr) };
        Ok(ElfHeader { ehdr })
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.ehdr.e_ident[0..4] != ELFMAGIC {
            return Err(malformed_elf("bad ELF magic"));
        }

        if self.ehdr.e_ident[EI_CLASS] != E_CLASS {
            return Err(malformed_elf("file class mismatch"));
        }

        if self.ehdr.e_ident[EI_DATA] != E_DATA {
            return Err(malformed_elf("file endianness mismatch"));
        }

        if self.ehdr.e_ident[EI_VERSION] != EV_CURRENT {
            return Err(malformed_elf("bad ELF version"));
        }

        if self.ehdr.e_type != ET_DYN {
            return Err(malformed_elf("file type mismatch"));
        }

        if self.ehdr.e_machine != EM_ARCH {
            return Err(malformed_elf("file arch mismatch"));
        }

        if self.e_phnum() > MAX_PHNUM {
            return Err(malformed_elf(format!(
                "too many program headers: {}",
                self.e_phnum()
            )));
        }

        if self.e_phnum() > 0 && self.e_phentsize() != PHDR_SIZE {
            return Err(malformed_elf("bad program header entry size"));
        }

        Ok(())
    }

    #[inline]
    pub(crate) fn e_phnum(&self) -> usize {
        self.ehdr.e_phnum as usize
    }

    #[inline]
    pub(crate) fn e_phentsize(&self) -> usize {
        self.ehdr.e_phentsize as usize
    }

    #[inline]
    pub(crate) fn e_phoff(&self) -> usize {
        self.ehdr.e_phoff as usize
    }

    /// Byte range of the program header table within the file.
    #[inline]
    pub(crate) fn phdr_range(&self) -> (usize, usize) {
        let phdrs_size = self.e_phentsize() * self.e_phnum();
        let phdr_start = self.e_phoff();
        (phdr_start, phdr_start + phdrs_size)
    }
}
