//! RISC-V 64 relocation ids and runtime stubs.

use elf::abi::*;

/// The ELF machine type for RISC-V.
pub const EM_ARCH: u16 = EM_RISCV;

/// Dynamic thread vector pointers point 0x800 past the start of each TLS
/// block on RISC-V.
pub const TLS_DTV_OFFSET: usize = 0x800;

/// Relative relocation type - add base address to relative offset.
pub const REL_RELATIVE: u32 = R_RISCV_RELATIVE;
/// RISC-V has no GLOB_DAT class; GOT entries use REL_SYMBOLIC.
pub const REL_GOT: u32 = u32::MAX;
/// TLS DTPMOD relocation type - set to TLS module ID.
pub const REL_DTPMOD: u32 = R_RISCV_TLS_DTPMOD64;
/// Symbolic relocation type - set to absolute symbol address.
pub const REL_SYMBOLIC: u32 = R_RISCV_64;
/// PLT jump slot relocation type - set PLT entry to symbol address.
pub const REL_JUMP_SLOT: u32 = R_RISCV_JUMP_SLOT;
/// TLS DTPOFF relocation type - set to TLS offset within the module block.
pub const REL_DTPOFF: u32 = R_RISCV_TLS_DTPREL64;
/// IRELATIVE relocation type - call function to get address.
pub const REL_IRELATIVE: u32 = R_RISCV_IRELATIVE;
/// COPY relocation type - copy data from shared object.
pub const REL_COPY: u32 = R_RISCV_COPY;
/// TLS TPOFF relocation type - set to static TLS offset.
pub const REL_TPOFF: u32 = R_RISCV_TLS_TPREL64;
/// TLSDESC relocation type - fill a two-word TLS descriptor.
/// Value of `R_RISCV_TLSDESC`.
pub const REL_TLSDESC: u32 = 12;

/// Offset in GOT for the module back-pointer.
pub(crate) const MODULE_OFFSET: usize = 1;
/// Offset in GOT for the lazy resolver entry point. RISC-V PLT0 reads the
/// resolver from GOT[0].
pub(crate) const RESOLVE_FUNCTION_OFFSET: usize = 0;

/// Lazy binding entry point for RISC-V PLT stubs.
///
/// PLT0 leaves the module back-pointer in `t0` and the relocation table
/// byte offset in `t1`. The integer argument registers are preserved around
/// the call into [`crate::relocation::dl_fixup`]; the fixup path never
/// touches the floating point argument registers.
#[unsafe(naked)]
pub(crate) extern "C" fn dl_runtime_resolve() {
    core::arch::naked_asm!(
        "
    addi sp, sp, -9*8
    sd ra, 8*0(sp)
    sd a0, 8*1(sp)
    sd a1, 8*2(sp)
    sd a2, 8*3(sp)
    sd a3, 8*4(sp)
    sd a4, 8*5(sp)
    sd a5, 8*6(sp)
    sd a6, 8*7(sp)
    sd a7, 8*8(sp)

    mv a0, t0
    srli a1, t1, 3

    call {0}

    mv t1, a0
    ld ra, 8*0(sp)
    ld a0, 8*1(sp)
    ld a1, 8*2(sp)
    ld a2, 8*3(sp)
    ld a3, 8*4(sp)
    ld a4, 8*5(sp)
    ld a5, 8*6(sp)
    ld a6, 8*7(sp)
    ld a7, 8*8(sp)
    addi sp, sp, 8*9

    jr t1
    ",
        sym crate::relocation::dl_fixup,
    )
}

/// TLSDESC entry point: the descriptor address arrives in `a0`, the
/// variable address for the calling thread is returned in `a0`. The
/// remaining argument registers are preserved.
#[cfg(feature = "tls")]
#[unsafe(naked)]
pub(crate) extern "C" fn tlsdesc_resolve() {
    core::arch::naked_asm!(
        "
    addi sp, sp, -8*8
    sd ra, 8*0(sp)
    sd a1, 8*1(sp)
    sd a2, 8*2(sp)
    sd a3, 8*3(sp)
    sd a4, 8*4(sp)
    sd a5, 8*5(sp)
    sd a6, 8*6(sp)
    sd a7, 8*7(sp)

    call {0}

    ld ra, 8*0(sp)
    ld a1, 8*1(sp)
    ld a2, 8*2(sp)
    ld a3, 8*3(sp)
    ld a4, 8*4(sp)
    ld a5, 8*5(sp)
    ld a6, 8*6(sp)
    ld a7, 8*7(sp)
    addi sp, sp, 8*8
    ret
    ",
        sym crate::tls::tlsdesc_resolve_slow,
    )
}

/// Map RISC-V relocation type value to a human readable name.
pub(crate) fn rel_type_to_str(r_type: usize) -> &'static str {
    match r_type as u32 {
        R_RISCV_NONE => "R_RISCV_NONE",
        R_RISCV_64 => "R_RISCV_64",
        R_RISCV_RELATIVE => "R_RISCV_RELATIVE",
        R_RISCV_COPY => "R_RISCV_COPY",
        R_RISCV_JUMP_SLOT => "R_RISCV_JUMP_SLOT",
        R_RISCV_TLS_DTPMOD64 => "R_RISCV_TLS_DTPMOD64",
        R_RISCV_TLS_DTPREL64 => "R_RISCV_TLS_DTPREL64",
        R_RISCV_TLS_TPREL64 => "R_RISCV_TLS_TPREL64",
        R_RISCV_IRELATIVE => "R_RISCV_IRELATIVE",
        REL_TLSDESC => "R_RISCV_TLSDESC",
        _ => "UNKNOWN",
    }
}
