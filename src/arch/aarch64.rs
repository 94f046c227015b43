//! AArch64 relocation ids and runtime stubs.

use elf::abi::*;

/// The ELF machine type for AArch64.
pub const EM_ARCH: u16 = EM_AARCH64;

/// Bias applied to DTV offsets. Zero on AArch64: the TCB sits before the
/// TLS blocks.
pub const TLS_DTV_OFFSET: usize = 0;

/// Relative relocation type - add base address to relative offset.
pub const REL_RELATIVE: u32 = R_AARCH64_RELATIVE;
/// GOT entry relocation type - set GOT entry to symbol address.
pub const REL_GOT: u32 = R_AARCH64_GLOB_DAT;
/// TLS DTPMOD relocation type - set to TLS module ID.
pub const REL_DTPMOD: u32 = R_AARCH64_TLS_DTPMOD;
/// Symbolic relocation type - set to absolute symbol address.
pub const REL_SYMBOLIC: u32 = R_AARCH64_ABS64;
/// PLT jump slot relocation type - set PLT entry to symbol address.
pub const REL_JUMP_SLOT: u32 = R_AARCH64_JUMP_SLOT;
/// TLS DTPOFF relocation type - set to TLS offset within the module block.
pub const REL_DTPOFF: u32 = R_AARCH64_TLS_DTPREL;
/// IRELATIVE relocation type - call function to get address.
pub const REL_IRELATIVE: u32 = R_AARCH64_IRELATIVE;
/// COPY relocation type - copy data from shared object.
pub const REL_COPY: u32 = R_AARCH64_COPY;
/// TLS TPOFF relocation type - set to static TLS offset.
pub const REL_TPOFF: u32 = R_AARCH64_TLS_TPREL;
/// TLSDESC relocation type - fill a two-word TLS descriptor.
/// Value of `R_AARCH64_TLSDESC`.
pub const REL_TLSDESC: u32 = 1031;

/// Offset in GOT for the module back-pointer.
pub(crate) const MODULE_OFFSET: usize = 1;
/// Offset in GOT for the lazy resolver entry point.
pub(crate) const RESOLVE_FUNCTION_OFFSET: usize = 2;

/// Lazy binding entry point for AArch64 PLT stubs.
///
/// PLT0 has pushed `x16`/`x30` and left `x16` pointing at GOT[2]. The
/// argument registers `x0`-`x8` and `q0`-`q7` are preserved around the call
/// into [`crate::relocation::dl_fixup`], then control transfers to the
/// resolved function.
#[unsafe(naked)]
pub(crate) extern "C" fn dl_runtime_resolve() {
    core::arch::naked_asm!(
        "
    // q0-q7: 128 bytes, x0-x8: 72 bytes, padded to 208.
    sub sp, sp, #208

    stp x0, x1, [sp, #0]
    stp x2, x3, [sp, #16]
    stp x4, x5, [sp, #32]
    stp x6, x7, [sp, #48]
    str x8,     [sp, #64]

    stp q0, q1, [sp, #80]
    stp q2, q3, [sp, #112]
    stp q4, q5, [sp, #144]
    stp q6, q7, [sp, #176]

    // Module back-pointer lives in GOT[1], one word below x16.
    ldr x0, [x16, #-8]

    // Relocation index = (&GOT[n] - &GOT[3]) / 8. PLT0 stored &GOT[n] at
    // the old stack top, which is now sp + 208.
    ldr x10, [sp, #208]
    add x11, x16, #8
    sub x1, x10, x11
    lsr x1, x1, #3

    bl {0}

    // x17 is scratch; park the resolved address there across the restore.
    mov x17, x0

    ldp q0, q1, [sp, #80]
    ldp q2, q3, [sp, #112]
    ldp q4, q5, [sp, #144]
    ldp q6, q7, [sp, #176]

    ldp x0, x1, [sp, #0]
    ldp x2, x3, [sp, #16]
    ldp x4, x5, [sp, #32]
    ldp x6, x7, [sp, #48]
    ldr x8,     [sp, #64]

    add sp, sp, #208

    // Pop the pair pushed by PLT0; x30 must be restored, x16 is dead.
    ldp x16, x30, [sp], #16

    br x17
    ",
        sym crate::relocation::dl_fixup,
    )
}

/// TLSDESC entry point: the descriptor address arrives in `x0`, the
/// variable address for the calling thread is returned in `x0`. All other
/// registers the slow path might clobber are preserved.
#[cfg(feature = "tls")]
#[unsafe(naked)]
pub(crate) extern "C" fn tlsdesc_resolve() {
    core::arch::naked_asm!(
        "
    sub sp, sp, #208

    stp x1, x2, [sp, #0]
    stp x3, x4, [sp, #16]
    stp x5, x6, [sp, #32]
    stp x7, x8, [sp, #48]
    str x30,    [sp, #64]

    stp q0, q1, [sp, #80]
    stp q2, q3, [sp, #112]
    stp q4, q5, [sp, #144]
    stp q6, q7, [sp, #176]

    bl {0}

    ldp q0, q1, [sp, #80]
    ldp q2, q3, [sp, #112]
    ldp q4, q5, [sp, #144]
    ldp q6, q7, [sp, #176]

    ldp x1, x2, [sp, #0]
    ldp x3, x4, [sp, #16]
    ldp x5, x6, [sp, #32]
    ldp x7, x8, [sp, #48]
    ldr x30,    [sp, #64]

    add sp, sp, #208
    ret
    ",
        sym crate::tls::tlsdesc_resolve_slow,
    )
}

/// Map AArch64 relocation type value to a human readable name.
pub(crate) fn rel_type_to_str(r_type: usize) -> &'static str {
    match r_type as u32 {
        R_AARCH64_NONE => "R_AARCH64_NONE",
        R_AARCH64_ABS64 => "R_AARCH64_ABS64",
        R_AARCH64_COPY => "R_AARCH64_COPY",
        R_AARCH64_GLOB_DAT => "R_AARCH64_GLOB_DAT",
        R_AARCH64_JUMP_SLOT => "R_AARCH64_JUMP_SLOT",
        R_AARCH64_RELATIVE => "R_AARCH64_RELATIVE",
        R_AARCH64_TLS_DTPMOD => "R_AARCH64_TLS_DTPMOD",
        R_AARCH64_TLS_DTPREL => "R_AARCH64_TLS_DTPREL",
        R_AARCH64_TLS_TPREL => "R_AARCH64_TLS_TPREL",
        R_AARCH64_IRELATIVE => "R_AARCH64_IRELATIVE",
        REL_TLSDESC => "R_AARCH64_TLSDESC",
        _ => "UNKNOWN",
    }
}
