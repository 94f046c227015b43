//! Decoder rejection paths and decode determinism, driven through the
//! loader without a runtime.

mod common;

use common::*;
use elf_dynld::diagnostics::{LenientDiagnostics, StrictDiagnostics};
use elf_dynld::mmap::MmapImpl;
use elf_dynld::object::ElfBinary;
use elf_dynld::{Error, Loader};
use rstest::rstest;

fn load(bytes: Vec<u8>) -> elf_dynld::Result<elf_dynld::Module> {
    let loader = Loader::<MmapImpl>::new();
    let mut object = ElfBinary::new("fixture", bytes);
    loader.load_module(&mut object, None, &StrictDiagnostics)
}

fn patch(bytes: &mut [u8], offset: usize, value: &[u8]) {
    bytes[offset..offset + value.len()].copy_from_slice(value);
}

#[rstest]
fn rejects_bad_magic() {
    init_logger();
    let mut bytes = build_dylib(&ret17_spec());
    bytes[0] = 0x7e;
    let err = load(bytes).unwrap_err();
    assert!(matches!(err, Error::MalformedElf { .. }), "{err}");
}

#[rstest]
fn rejects_wrong_class() {
    init_logger();
    let mut bytes = build_dylib(&ret17_spec());
    bytes[4] = 1; // ELFCLASS32
    assert!(matches!(
        load(bytes).unwrap_err(),
        Error::MalformedElf { .. }
    ));
}

#[rstest]
fn rejects_wrong_machine() {
    init_logger();
    let mut bytes = build_dylib(&ret17_spec());
    patch(&mut bytes, 18, &0xff3fu16.to_ne_bytes());
    assert!(matches!(
        load(bytes).unwrap_err(),
        Error::MalformedElf { .. }
    ));
}

#[rstest]
fn rejects_relocatable_objects() {
    init_logger();
    let mut bytes = build_dylib(&ret17_spec());
    patch(&mut bytes, 16, &1u16.to_ne_bytes()); // ET_REL
    assert!(matches!(
        load(bytes).unwrap_err(),
        Error::MalformedElf { .. }
    ));
}

#[rstest]
fn rejects_oversized_phdr_table() {
    init_logger();
    let mut bytes = build_dylib(&ret17_spec());
    patch(&mut bytes, 56, &33u16.to_ne_bytes()); // e_phnum
    assert!(matches!(
        load(bytes).unwrap_err(),
        Error::MalformedElf { .. }
    ));
}

#[rstest]
fn rejects_too_many_load_segments() {
    init_logger();
    // Hand-written header: nine disjoint PT_LOADs.
    let mut bytes = vec![0u8; 0x1000];
    let mut ehdr: Vec<u8> = Vec::new();
    ehdr.extend_from_slice(b"\x7fELF");
    ehdr.push(2);
    ehdr.push(if cfg!(target_endian = "little") { 1 } else { 2 });
    ehdr.push(1);
    ehdr.extend_from_slice(&[0; 9]);
    ehdr.extend_from_slice(&3u16.to_ne_bytes());
    ehdr.extend_from_slice(&elf_dynld::arch::EM_ARCH.to_ne_bytes());
    ehdr.extend_from_slice(&1u32.to_ne_bytes());
    ehdr.extend_from_slice(&0u64.to_ne_bytes());
    ehdr.extend_from_slice(&64u64.to_ne_bytes());
    ehdr.extend_from_slice(&0u64.to_ne_bytes());
    ehdr.extend_from_slice(&0u32.to_ne_bytes());
    ehdr.extend_from_slice(&64u16.to_ne_bytes());
    ehdr.extend_from_slice(&56u16.to_ne_bytes());
    ehdr.extend_from_slice(&9u16.to_ne_bytes());
    ehdr.extend_from_slice(&64u16.to_ne_bytes());
    ehdr.extend_from_slice(&0u16.to_ne_bytes());
    ehdr.extend_from_slice(&0u16.to_ne_bytes());
    patch(&mut bytes, 0, &ehdr);
    for i in 0..9usize {
        let mut phdr: Vec<u8> = Vec::new();
        phdr.extend_from_slice(&1u32.to_ne_bytes()); // PT_LOAD
        phdr.extend_from_slice(&4u32.to_ne_bytes()); // PF_R
        phdr.extend_from_slice(&((i * 0x1000) as u64).to_ne_bytes());
        phdr.extend_from_slice(&((i * 0x1000) as u64).to_ne_bytes());
        phdr.extend_from_slice(&((i * 0x1000) as u64).to_ne_bytes());
        phdr.extend_from_slice(&0u64.to_ne_bytes());
        phdr.extend_from_slice(&0x10u64.to_ne_bytes());
        phdr.extend_from_slice(&0x1000u64.to_ne_bytes());
        patch(&mut bytes, 64 + i * 56, &phdr);
    }
    let err = load(bytes).unwrap_err();
    assert!(matches!(err, Error::MalformedElf { .. }), "{err}");
}

#[rstest]
fn rejects_overlapping_segments() {
    init_logger();
    let mut bytes = build_dylib(&ret17_spec());
    // Pull the second PT_LOAD's vaddr down onto the first.
    patch(&mut bytes, 64 + 56 + 16, &0u64.to_ne_bytes());
    let err = load(bytes).unwrap_err();
    assert!(matches!(err, Error::BadSegment { .. }), "{err}");
}

#[rstest]
fn rejects_filesz_beyond_memsz() {
    init_logger();
    let mut bytes = build_dylib(&ret17_spec());
    patch(&mut bytes, 64 + 40, &1u64.to_ne_bytes()); // first PT_LOAD p_memsz
    let err = load(bytes).unwrap_err();
    assert!(matches!(err, Error::BadSegment { .. }), "{err}");
}

#[rstest]
fn rejects_missing_dynamic_segment() {
    init_logger();
    let mut bytes = build_dylib(&ret17_spec());
    // Turn PT_DYNAMIC (third header) into PT_NOTE.
    patch(&mut bytes, 64 + 2 * 56, &4u32.to_ne_bytes());
    let err = load(bytes).unwrap_err();
    assert!(matches!(err, Error::MalformedElf { .. }), "{err}");
}

#[rstest]
fn bad_needed_offset_aborts_or_continues() {
    init_logger();
    let spec = DylibSpec {
        soname: "libbadneeded",
        needed: vec!["libdep"],
        exports: vec![export("noop", Body::RetConst(0))],
        ..Default::default()
    };
    let good = build_dylib(&spec);

    // The first DT_NEEDED entry follows DT_SONAME; poison its string
    // offset to point past DT_STRSZ.
    let mut bad = good.clone();
    patch(&mut bad, PAGE + 16 + 8, &0xffff_u64.to_ne_bytes());

    let err = load(bad.clone()).unwrap_err();
    assert!(matches!(err, Error::MalformedElf { .. }), "{err}");

    // A lenient diagnostics sink turns it into a partial decode: the
    // entry is dropped.
    let loader = Loader::<MmapImpl>::new();
    let mut object = ElfBinary::new("fixture", bad);
    let module = loader
        .load_module(&mut object, None, &LenientDiagnostics)
        .unwrap();
    assert!(module.needed().is_empty());
}

#[rstest]
fn decode_round_trips() {
    init_logger();
    let spec = DylibSpec {
        soname: "libroundtrip",
        needed: vec!["libfoo-v1", "libfoo-v2"],
        exports: vec![export("noop", Body::RetConst(0))],
        init_array: vec!["noop"],
        ..Default::default()
    };
    let bytes = build_dylib(&spec);
    let first = load(bytes.clone()).unwrap();
    let second = load(bytes).unwrap();

    // Same DT_* table and needed set on every decode of the same image.
    assert_eq!(first.dynamic_table(), second.dynamic_table());
    assert_eq!(first.needed(), second.needed());
    let needed: Vec<&str> = first.needed().iter().map(|s| s.as_str()).collect();
    assert_eq!(needed, ["libfoo-v1", "libfoo-v2"]);
    assert!(!first.dynamic_table().is_empty());
    assert_eq!(first.name(), "libroundtrip");
}

#[rstest]
fn soname_becomes_the_canonical_name() {
    init_logger();
    let module = load(build_dylib(&ret17_spec())).unwrap();
    assert_eq!(module.name(), "ret17");
    assert_eq!(module.state(), elf_dynld::ModuleState::Mapped);
}

#[rstest]
fn bss_tail_pages_are_committed() {
    init_logger();
    // Three extra zero pages past the file-backed data.
    let mut spec = ret17_spec();
    spec.bss = 3 * PAGE;
    let module = load(build_dylib(&spec)).unwrap();
    let tail = (module.base() + module.mapped_len() - 8) as *const u64;
    assert_eq!(unsafe { tail.read() }, 0);
}
