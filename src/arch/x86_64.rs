//! x86-64 relocation ids and runtime stubs.

use elf::abi::*;

/// The ELF machine type for x86-64.
pub const EM_ARCH: u16 = EM_X86_64;

/// Bias applied to DTV offsets. Zero on x86-64: the TCB sits before the
/// TLS blocks.
pub const TLS_DTV_OFFSET: usize = 0;

/// Relative relocation type - add base address to relative offset.
pub const REL_RELATIVE: u32 = R_X86_64_RELATIVE;
/// GOT entry relocation type - set GOT entry to symbol address.
pub const REL_GOT: u32 = R_X86_64_GLOB_DAT;
/// TLS DTPMOD relocation type - set to TLS module ID.
pub const REL_DTPMOD: u32 = R_X86_64_DTPMOD64;
/// Symbolic relocation type - set to absolute symbol address.
pub const REL_SYMBOLIC: u32 = R_X86_64_64;
/// PLT jump slot relocation type - set PLT entry to symbol address.
pub const REL_JUMP_SLOT: u32 = R_X86_64_JUMP_SLOT;
/// TLS DTPOFF relocation type - set to TLS offset within the module block.
pub const REL_DTPOFF: u32 = R_X86_64_DTPOFF64;
/// IRELATIVE relocation type - call function to get address.
pub const REL_IRELATIVE: u32 = R_X86_64_IRELATIVE;
/// COPY relocation type - copy data from shared object.
pub const REL_COPY: u32 = R_X86_64_COPY;
/// TLS TPOFF relocation type - set to static TLS offset.
pub const REL_TPOFF: u32 = R_X86_64_TPOFF64;
/// TLSDESC relocation type - fill a two-word TLS descriptor.
/// Value of `R_X86_64_TLSDESC`.
pub const REL_TLSDESC: u32 = 36;

/// Offset in GOT for the module back-pointer.
pub(crate) const MODULE_OFFSET: usize = 1;
/// Offset in GOT for the lazy resolver entry point.
pub(crate) const RESOLVE_FUNCTION_OFFSET: usize = 2;

/// Lazy binding entry point for x86-64 PLT stubs.
///
/// PLT0 pushes the module back-pointer (GOT[1]) and the relocation index
/// before jumping here. All argument registers, including the SSE argument
/// registers, are preserved around the call into [`crate::relocation::dl_fixup`],
/// then control transfers to the resolved function.
#[unsafe(naked)]
pub(crate) extern "C" fn dl_runtime_resolve() {
    core::arch::naked_asm!(
        "
    push rdi
    push rsi
    push rdx
    push rcx
    push r8
    push r9
    push r10
    push r11

    // xmm0-xmm7 may carry arguments; 128 bytes plus 8 padding bytes keep
    // the stack 16-byte aligned.
    sub rsp, 136
    movdqu [rsp + 0], xmm0
    movdqu [rsp + 16], xmm1
    movdqu [rsp + 32], xmm2
    movdqu [rsp + 48], xmm3
    movdqu [rsp + 64], xmm4
    movdqu [rsp + 80], xmm5
    movdqu [rsp + 96], xmm6
    movdqu [rsp + 112], xmm7

    // Stack layout at this point:
    // [rsp + 0..127]  : xmm0-xmm7
    // [rsp + 128..135]: padding
    // [rsp + 136..199]: r11, r10, r9, r8, rcx, rdx, rsi, rdi
    // [rsp + 200]     : module back-pointer (pushed by PLT0)
    // [rsp + 208]     : relocation index (pushed by the PLT entry)
    // [rsp + 216]     : return address to the caller
    mov rdi, [rsp + 200]
    mov rsi, [rsp + 208]

    call {0}

    movdqu xmm0, [rsp + 0]
    movdqu xmm1, [rsp + 16]
    movdqu xmm2, [rsp + 32]
    movdqu xmm3, [rsp + 48]
    movdqu xmm4, [rsp + 64]
    movdqu xmm5, [rsp + 80]
    movdqu xmm6, [rsp + 96]
    movdqu xmm7, [rsp + 112]
    add rsp, 136

    pop r11
    pop r10
    pop r9
    pop r8
    pop rcx
    pop rdx
    pop rsi
    pop rdi

    // Drop the module pointer and relocation index pushed by the PLT.
    add rsp, 16

    jmp rax
    ",
        sym crate::relocation::dl_fixup,
    )
}

/// TLSDESC entry point: the descriptor address arrives in `rdi`, the
/// variable address for the calling thread is returned in `rax`. Every
/// other register the slow path might clobber is preserved, which is what
/// lets compiled TLSDESC call sites treat this as a leaf call.
#[cfg(feature = "tls")]
#[unsafe(naked)]
pub(crate) extern "C" fn tlsdesc_resolve() {
    core::arch::naked_asm!(
        "
    push rdi
    push rsi
    push rdx
    push rcx
    push r8
    push r9
    push r10
    push r11

    sub rsp, 136
    movdqu [rsp + 0], xmm0
    movdqu [rsp + 16], xmm1
    movdqu [rsp + 32], xmm2
    movdqu [rsp + 48], xmm3
    movdqu [rsp + 64], xmm4
    movdqu [rsp + 80], xmm5
    movdqu [rsp + 96], xmm6
    movdqu [rsp + 112], xmm7

    call {0}

    movdqu xmm0, [rsp + 0]
    movdqu xmm1, [rsp + 16]
    movdqu xmm2, [rsp + 32]
    movdqu xmm3, [rsp + 48]
    movdqu xmm4, [rsp + 64]
    movdqu xmm5, [rsp + 80]
    movdqu xmm6, [rsp + 96]
    movdqu xmm7, [rsp + 112]
    add rsp, 136

    pop r11
    pop r10
    pop r9
    pop r8
    pop rcx
    pop rdx
    pop rsi
    pop rdi
    ret
    ",
        sym crate::tls::tlsdesc_resolve_slow,
    )
}

/// Map x86-64 relocation type value to a human readable name.
pub(crate) fn rel_type_to_str(r_type: usize) -> &'static str {
    match r_type as u32 {
        R_X86_64_NONE => "R_X86_64_NONE",
        R_X86_64_64 => "R_X86_64_64",
        R_X86_64_COPY => "R_X86_64_COPY",
        R_X86_64_GLOB_DAT => "R_X86_64_GLOB_DAT",
        R_X86_64_JUMP_SLOT => "R_X86_64_JUMP_SLOT",
        R_X86_64_RELATIVE => "R_X86_64_RELATIVE",
        R_X86_64_DTPMOD64 => "R_X86_64_DTPMOD64",
        R_X86_64_DTPOFF64 => "R_X86_64_DTPOFF64",
        R_X86_64_TPOFF64 => "R_X86_64_TPOFF64",
        R_X86_64_IRELATIVE => "R_X86_64_IRELATIVE",
        REL_TLSDESC => "R_X86_64_TLSDESC",
        _ => "UNKNOWN",
    }
}
