//! Test support: an in-process ELF64 shared-object builder, an in-memory
//! module provider and a recording mmap wrapper.
//!
//! The builder emits minimal but fully valid dynamic objects: two load
//! segments (text / data), a RELRO-covered table page, SysV hash, RELA
//! relocations (absolute, relative, jump-slot, TLS) and optionally a lazy
//! PLT. Function bodies are tiny x86-64 sequences; tests that execute
//! them are gated on the host architecture, everything else works on any
//! supported target.

#![allow(dead_code)]

use elf_dynld::arch::{
    EM_ARCH, REL_DTPMOD, REL_DTPOFF, REL_JUMP_SLOT, REL_RELATIVE, REL_SYMBOLIC,
};
use elf_dynld::mmap::{MapFlags, Mmap, ProtFlags, MmapImpl};
use elf_dynld::object::{ElfBinary, ElfObject, ModuleProvider};
use elf_dynld::{Runtime, RuntimeBuilder};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;

pub const PAGE: usize = 0x1000;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_TLS: u32 = 7;
const PT_GNU_RELRO: u32 = 0x6474e552;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

const DT_NEEDED: i64 = 1;
const DT_PLTRELSZ: i64 = 2;
const DT_PLTGOT: i64 = 3;
const DT_HASH: i64 = 4;
const DT_STRTAB: i64 = 5;
const DT_SYMTAB: i64 = 6;
const DT_RELA: i64 = 7;
const DT_RELASZ: i64 = 8;
const DT_RELAENT: i64 = 9;
const DT_STRSZ: i64 = 10;
const DT_SYMENT: i64 = 11;
const DT_INIT: i64 = 12;
const DT_FINI: i64 = 13;
const DT_SONAME: i64 = 14;
const DT_PLTREL: i64 = 20;
const DT_JMPREL: i64 = 23;
const DT_INIT_ARRAY: i64 = 25;
const DT_FINI_ARRAY: i64 = 26;
const DT_INIT_ARRAYSZ: i64 = 27;
const DT_FINI_ARRAYSZ: i64 = 28;
const DT_FLAGS_1: i64 = 0x6ffffffb;
const DF_1_NODELETE: u64 = 0x8;

const STB_GLOBAL: u8 = 1;
const STB_WEAK: u8 = 2;
const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;
const STT_TLS: u8 = 6;

/// The TLSDESC relocation id of the host architecture.
pub const REL_TLSDESC: u32 = elf_dynld::arch::REL_TLSDESC;

/// Body of an exported function.
#[derive(Clone)]
pub enum Body {
    /// `name() -> value`
    RetConst(u32),
    /// Tail call through the import's pointer slot (or the PLT when the
    /// object is built with a lazy PLT).
    TailCallImport(&'static str),
    /// `*import += k`
    AddImport(&'static str, u8),
    /// `*import = *import * 10 + k`
    MulAddImport(&'static str, u8),
}

#[derive(Clone)]
pub struct Export {
    pub name: &'static str,
    pub body: Body,
}

pub fn export(name: &'static str, body: Body) -> Export {
    Export { name, body }
}

#[derive(Clone)]
pub struct DataExport {
    pub name: &'static str,
    pub bytes: Vec<u8>,
    /// Emit a COPY relocation pulling the named import's bytes into this
    /// slot.
    pub copy_from: Option<&'static str>,
}

#[derive(Clone)]
pub struct TlsVar {
    pub name: &'static str,
    pub offset: usize,
    pub size: usize,
}

#[derive(Clone, Default)]
pub struct TlsSpec {
    pub tdata: Vec<u8>,
    pub tbss: usize,
    pub vars: Vec<TlsVar>,
    /// Emit a TLSDESC slot for this variable, exported as `<name>_desc`.
    pub desc_for: Option<&'static str>,
    /// Emit a `{DTPMOD, DTPOFF}` pair for this variable, exported as
    /// `<name>_index`.
    pub index_for: Option<&'static str>,
    /// Emit a static-TLS-offset slot for this variable, exported as
    /// `<name>_tpoff`. Only relocatable when the module sits in the
    /// static TLS block.
    pub tpoff_for: Option<&'static str>,
}

#[derive(Clone, Default)]
pub struct DylibSpec {
    pub soname: &'static str,
    pub needed: Vec<&'static str>,
    pub exports: Vec<Export>,
    pub data: Vec<DataExport>,
    /// Imports resolved as weak; their slots read back as zero when the
    /// name is nowhere to be found.
    pub weak_imports: Vec<&'static str>,
    /// Exported function emitted as `DT_INIT` (runs before `init_array`).
    pub init_fn: Option<&'static str>,
    /// Exported function emitted as `DT_FINI` (runs after `fini_array`).
    pub fini_fn: Option<&'static str>,
    /// Names of exported functions run as constructors, in file order.
    pub init_array: Vec<&'static str>,
    pub fini_array: Vec<&'static str>,
    pub tls: Option<TlsSpec>,
    pub lazy_plt: bool,
    pub bss: usize,
    pub nodelete: bool,
}

struct SymbolEntry {
    name: String,
    value: usize,
    size: usize,
    info: u8,
    shndx: u16,
}

struct RelaEntry {
    offset: usize,
    sym: usize,
    r_type: u32,
    addend: i64,
}

impl RelaEntry {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.offset as u64).to_ne_bytes());
        let info = ((self.sym as u64) << 32) | self.r_type as u64;
        out.extend_from_slice(&info.to_ne_bytes());
        out.extend_from_slice(&self.addend.to_ne_bytes());
    }
}

struct StrTab {
    bytes: Vec<u8>,
    offsets: HashMap<String, usize>,
}

impl StrTab {
    fn new() -> StrTab {
        StrTab {
            bytes: vec![0],
            offsets: HashMap::new(),
        }
    }

    fn intern(&mut self, s: &str) -> usize {
        if let Some(&off) = self.offsets.get(s) {
            return off;
        }
        let off = self.bytes.len();
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(String::from(s), off);
        off
    }
}

fn put(image: &mut Vec<u8>, offset: usize, bytes: &[u8]) {
    if image.len() < offset + bytes.len() {
        image.resize(offset + bytes.len(), 0);
    }
    image[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// Build the image described by `spec`.
pub fn build_dylib(spec: &DylibSpec) -> Vec<u8> {
    let mut strtab = StrTab::new();
    let mut symbols: Vec<SymbolEntry> = vec![SymbolEntry {
        name: String::new(),
        value: 0,
        size: 0,
        info: 0,
        shndx: 0,
    }];
    let mut relas: Vec<RelaEntry> = Vec::new();
    let mut plt_relas: Vec<RelaEntry> = Vec::new();

    // Collect imports in first-use order.
    let mut imports: Vec<&'static str> = Vec::new();
    let mut weak: HashMap<&'static str, bool> = HashMap::new();
    let mut note_import = |imports: &mut Vec<&'static str>, name: &'static str| {
        if !imports.contains(&name) {
            imports.push(name);
        }
    };
    for export in &spec.exports {
        match export.body {
            Body::TailCallImport(name)
            | Body::AddImport(name, _)
            | Body::MulAddImport(name, _) => note_import(&mut imports, name),
            Body::RetConst(_) => {}
        }
    }
    for data in &spec.data {
        if let Some(src) = data.copy_from {
            note_import(&mut imports, src);
        }
    }
    for &name in &spec.weak_imports {
        note_import(&mut imports, name);
        weak.insert(name, true);
    }

    // Which imports go through the PLT?
    let plt_imports: Vec<&'static str> = if spec.lazy_plt {
        let mut plt = Vec::new();
        for export in &spec.exports {
            if let Body::TailCallImport(name) = export.body {
                if !plt.contains(&name) {
                    plt.push(name);
                }
            }
        }
        plt
    } else {
        Vec::new()
    };

    // ---- Layout ----
    // Page 0: headers + text (+ PLT), mapped R|X.
    // Page 1: dynamic, dynsym, dynstr, hash, rela tables; RELRO covered.
    // Page 2: GOT, import slots, data, init/fini arrays, TLS image; R|W.
    let text_base = 0x300usize;
    let body_len = |body: &Body| match body {
        Body::RetConst(_) => 6,
        Body::TailCallImport(name) => {
            if plt_imports.contains(name) {
                5
            } else {
                9
            }
        }
        Body::AddImport(..) => 12,
        Body::MulAddImport(..) => 25,
    };
    let mut code_addrs: HashMap<&'static str, (usize, usize)> = HashMap::new();
    let mut cursor = text_base;
    for export in &spec.exports {
        let len = body_len(&export.body);
        code_addrs.insert(export.name, (cursor, len));
        cursor += len;
    }
    let plt0_addr = (cursor + 15) & !15;
    let plt_entry_addr = |i: usize| plt0_addr + 16 + i * 16;
    let text_end = if plt_imports.is_empty() {
        cursor
    } else {
        plt_entry_addr(plt_imports.len())
    };
    assert!(text_end <= PAGE, "text overflows the first page");

    // Page 2 layout first; page 1 sizes depend only on entry counts.
    let data_base = 2 * PAGE;
    let mut dcur = data_base;
    let got_addr = dcur;
    let got_count = if plt_imports.is_empty() {
        0
    } else {
        3 + plt_imports.len()
    };
    dcur += got_count * 8;
    let mut slot_addrs: HashMap<&'static str, usize> = HashMap::new();
    for &import in &imports {
        if plt_imports.contains(&import) {
            continue;
        }
        slot_addrs.insert(import, dcur);
        dcur += 8;
    }
    let mut data_addrs: HashMap<&'static str, usize> = HashMap::new();
    for data in &spec.data {
        data_addrs.insert(data.name, dcur);
        dcur += data.bytes.len().max(8);
    }
    let init_array_addr = dcur;
    dcur += spec.init_array.len() * 8;
    let fini_array_addr = dcur;
    dcur += spec.fini_array.len() * 8;
    let tls_spec = spec.tls.clone().unwrap_or_default();
    let desc_addr = tls_spec.desc_for.map(|_| {
        let addr = dcur;
        dcur += 16;
        addr
    });
    let index_addr = tls_spec.index_for.map(|_| {
        let addr = dcur;
        dcur += 16;
        addr
    });
    let tpoff_addr = tls_spec.tpoff_for.map(|_| {
        let addr = dcur;
        dcur += 8;
        addr
    });
    let tdata_addr = (dcur + 7) & !7;
    dcur = tdata_addr + tls_spec.tdata.len();
    let data_end = dcur;

    // ---- Symbols ----
    for export in &spec.exports {
        let (addr, len) = code_addrs[export.name];
        symbols.push(SymbolEntry {
            name: String::from(export.name),
            value: addr,
            size: len,
            info: (STB_GLOBAL << 4) | STT_FUNC,
            shndx: 1,
        });
    }
    for data in &spec.data {
        symbols.push(SymbolEntry {
            name: String::from(data.name),
            value: data_addrs[data.name],
            size: data.bytes.len().max(8),
            info: (STB_GLOBAL << 4) | STT_OBJECT,
            shndx: 1,
        });
    }
    for var in &tls_spec.vars {
        symbols.push(SymbolEntry {
            name: String::from(var.name),
            value: var.offset,
            size: var.size,
            info: (STB_GLOBAL << 4) | STT_TLS,
            shndx: 1,
        });
    }
    // Import slots double as exported objects so tests can peek at the
    // relocated values.
    for &import in &imports {
        if let Some(&slot) = slot_addrs.get(import) {
            symbols.push(SymbolEntry {
                name: format!("{import}_slot"),
                value: slot,
                size: 8,
                info: (STB_GLOBAL << 4) | STT_OBJECT,
                shndx: 1,
            });
        }
    }
    if let Some(addr) = desc_addr {
        symbols.push(SymbolEntry {
            name: format!("{}_desc", tls_spec.desc_for.unwrap()),
            value: addr,
            size: 16,
            info: (STB_GLOBAL << 4) | STT_OBJECT,
            shndx: 1,
        });
    }
    if let Some(addr) = index_addr {
        symbols.push(SymbolEntry {
            name: format!("{}_index", tls_spec.index_for.unwrap()),
            value: addr,
            size: 16,
            info: (STB_GLOBAL << 4) | STT_OBJECT,
            shndx: 1,
        });
    }
    if let Some(addr) = tpoff_addr {
        symbols.push(SymbolEntry {
            name: format!("{}_tpoff", tls_spec.tpoff_for.unwrap()),
            value: addr,
            size: 8,
            info: (STB_GLOBAL << 4) | STT_OBJECT,
            shndx: 1,
        });
    }
    let mut import_syms: HashMap<&'static str, usize> = HashMap::new();
    for &import in &imports {
        let bind = if weak.contains_key(import) {
            STB_WEAK
        } else {
            STB_GLOBAL
        };
        import_syms.insert(import, symbols.len());
        symbols.push(SymbolEntry {
            name: String::from(import),
            value: 0,
            size: 0,
            info: bind << 4,
            shndx: 0,
        });
    }
    let sym_index = |name: &str| {
        symbols
            .iter()
            .position(|sym| sym.name == name)
            .expect("unknown symbol")
    };

    // ---- Relocations ----
    for &import in &imports {
        if let Some(&slot) = slot_addrs.get(import) {
            relas.push(RelaEntry {
                offset: slot,
                sym: import_syms[import],
                r_type: REL_SYMBOLIC,
                addend: 0,
            });
        }
    }
    for data in &spec.data {
        if let Some(src) = data.copy_from {
            relas.push(RelaEntry {
                offset: data_addrs[data.name],
                sym: import_syms[src],
                r_type: elf_dynld::arch::REL_COPY,
                addend: 0,
            });
        }
    }
    for (i, name) in spec.init_array.iter().enumerate() {
        relas.push(RelaEntry {
            offset: init_array_addr + i * 8,
            sym: 0,
            r_type: REL_RELATIVE,
            addend: code_addrs[name].0 as i64,
        });
    }
    for (i, name) in spec.fini_array.iter().enumerate() {
        relas.push(RelaEntry {
            offset: fini_array_addr + i * 8,
            sym: 0,
            r_type: REL_RELATIVE,
            addend: code_addrs[name].0 as i64,
        });
    }
    if let Some(addr) = desc_addr {
        relas.push(RelaEntry {
            offset: addr,
            sym: sym_index(tls_spec.desc_for.unwrap()),
            r_type: REL_TLSDESC,
            addend: 0,
        });
    }
    if let Some(addr) = index_addr {
        let sym = sym_index(tls_spec.index_for.unwrap());
        relas.push(RelaEntry {
            offset: addr,
            sym,
            r_type: REL_DTPMOD,
            addend: 0,
        });
        relas.push(RelaEntry {
            offset: addr + 8,
            sym,
            r_type: REL_DTPOFF,
            addend: 0,
        });
    }
    if let Some(addr) = tpoff_addr {
        relas.push(RelaEntry {
            offset: addr,
            sym: sym_index(tls_spec.tpoff_for.unwrap()),
            r_type: elf_dynld::arch::REL_TPOFF,
            addend: 0,
        });
    }
    for (i, &import) in plt_imports.iter().enumerate() {
        plt_relas.push(RelaEntry {
            offset: got_addr + (3 + i) * 8,
            sym: import_syms[import],
            r_type: REL_JUMP_SLOT,
            addend: 0,
        });
    }

    // ---- Page 1 tables ----
    let nsym = symbols.len();
    let soname_off = strtab.intern(spec.soname);
    let needed_offs: Vec<usize> = spec.needed.iter().map(|n| strtab.intern(n)).collect();
    for sym in &symbols {
        strtab.intern(&sym.name);
    }

    let mut dyn_entries: Vec<(i64, u64)> = Vec::new();
    let table_base = PAGE;

    // Sizes are fixed by entry counts, so addresses can be computed
    // before the bytes are written.
    let dyn_count = {
        let mut count = 1 /* soname */ + spec.needed.len() + 5 /* hash..syment */;
        if !relas.is_empty() {
            count += 3;
        }
        if !plt_relas.is_empty() {
            count += 4;
        }
        if !spec.init_array.is_empty() {
            count += 2;
        }
        if !spec.fini_array.is_empty() {
            count += 2;
        }
        if spec.init_fn.is_some() {
            count += 1;
        }
        if spec.fini_fn.is_some() {
            count += 1;
        }
        if spec.nodelete {
            count += 1;
        }
        count + 1 // DT_NULL
    };
    let dynamic_addr = table_base;
    let dynamic_size = dyn_count * 16;
    let symtab_addr = dynamic_addr + dynamic_size;
    let symtab_size = nsym * 24;
    let strtab_addr = symtab_addr + symtab_size;
    let strtab_size = strtab.bytes.len();
    let hash_addr = (strtab_addr + strtab_size + 3) & !3;
    let hash_size = (2 + 1 + nsym) * 4;
    let rela_addr = (hash_addr + hash_size + 7) & !7;
    let rela_size = relas.len() * 24;
    let jmprel_addr = rela_addr + rela_size;
    let jmprel_size = plt_relas.len() * 24;
    assert!(jmprel_addr + jmprel_size <= data_base, "tables overflow page 1");

    dyn_entries.push((DT_SONAME, soname_off as u64));
    for off in needed_offs {
        dyn_entries.push((DT_NEEDED, off as u64));
    }
    dyn_entries.push((DT_HASH, hash_addr as u64));
    dyn_entries.push((DT_STRTAB, strtab_addr as u64));
    dyn_entries.push((DT_STRSZ, strtab_size as u64));
    dyn_entries.push((DT_SYMTAB, symtab_addr as u64));
    dyn_entries.push((DT_SYMENT, 24));
    if !relas.is_empty() {
        dyn_entries.push((DT_RELA, rela_addr as u64));
        dyn_entries.push((DT_RELASZ, rela_size as u64));
        dyn_entries.push((DT_RELAENT, 24));
    }
    if !plt_relas.is_empty() {
        dyn_entries.push((DT_JMPREL, jmprel_addr as u64));
        dyn_entries.push((DT_PLTRELSZ, jmprel_size as u64));
        dyn_entries.push((DT_PLTREL, DT_RELA as u64));
        dyn_entries.push((DT_PLTGOT, got_addr as u64));
    }
    if !spec.init_array.is_empty() {
        dyn_entries.push((DT_INIT_ARRAY, init_array_addr as u64));
        dyn_entries.push((DT_INIT_ARRAYSZ, (spec.init_array.len() * 8) as u64));
    }
    if !spec.fini_array.is_empty() {
        dyn_entries.push((DT_FINI_ARRAY, fini_array_addr as u64));
        dyn_entries.push((DT_FINI_ARRAYSZ, (spec.fini_array.len() * 8) as u64));
    }
    if let Some(name) = spec.init_fn {
        dyn_entries.push((DT_INIT, code_addrs[name].0 as u64));
    }
    if let Some(name) = spec.fini_fn {
        dyn_entries.push((DT_FINI, code_addrs[name].0 as u64));
    }
    if spec.nodelete {
        dyn_entries.push((DT_FLAGS_1, DF_1_NODELETE));
    }
    dyn_entries.push((0, 0));
    assert_eq!(dyn_entries.len(), dyn_count);

    // ---- Emit ----
    let mut image = vec![0u8; data_end];

    // Program headers.
    struct Ph {
        p_type: u32,
        flags: u32,
        offset: usize,
        vaddr: usize,
        filesz: usize,
        memsz: usize,
        align: usize,
    }
    let mut phdrs = vec![
        Ph {
            p_type: PT_LOAD,
            flags: PF_R | PF_X,
            offset: 0,
            vaddr: 0,
            filesz: text_end,
            memsz: text_end,
            align: PAGE,
        },
        Ph {
            p_type: PT_LOAD,
            flags: PF_R | PF_W,
            offset: PAGE,
            vaddr: PAGE,
            filesz: data_end - PAGE,
            memsz: data_end - PAGE + spec.bss,
            align: PAGE,
        },
        Ph {
            p_type: PT_DYNAMIC,
            flags: PF_R | PF_W,
            offset: dynamic_addr,
            vaddr: dynamic_addr,
            filesz: dynamic_size,
            memsz: dynamic_size,
            align: 8,
        },
        Ph {
            p_type: PT_GNU_RELRO,
            flags: PF_R,
            offset: PAGE,
            vaddr: PAGE,
            filesz: PAGE,
            memsz: PAGE,
            align: 1,
        },
    ];
    if !tls_spec.tdata.is_empty() || tls_spec.tbss > 0 {
        phdrs.push(Ph {
            p_type: PT_TLS,
            flags: PF_R,
            offset: tdata_addr,
            vaddr: tdata_addr,
            filesz: tls_spec.tdata.len(),
            memsz: tls_spec.tdata.len() + tls_spec.tbss,
            align: 8,
        });
    }

    // ELF header.
    let mut ehdr = Vec::with_capacity(64);
    ehdr.extend_from_slice(b"\x7fELF");
    ehdr.push(2); // ELFCLASS64
    ehdr.push(if cfg!(target_endian = "little") { 1 } else { 2 });
    ehdr.push(1); // EV_CURRENT
    ehdr.extend_from_slice(&[0; 9]);
    ehdr.extend_from_slice(&3u16.to_ne_bytes()); // ET_DYN
    ehdr.extend_from_slice(&EM_ARCH.to_ne_bytes());
    ehdr.extend_from_slice(&1u32.to_ne_bytes());
    ehdr.extend_from_slice(&0u64.to_ne_bytes()); // e_entry
    ehdr.extend_from_slice(&64u64.to_ne_bytes()); // e_phoff
    ehdr.extend_from_slice(&0u64.to_ne_bytes()); // e_shoff
    ehdr.extend_from_slice(&0u32.to_ne_bytes());
    ehdr.extend_from_slice(&64u16.to_ne_bytes());
    ehdr.extend_from_slice(&56u16.to_ne_bytes());
    ehdr.extend_from_slice(&(phdrs.len() as u16).to_ne_bytes());
    ehdr.extend_from_slice(&64u16.to_ne_bytes());
    ehdr.extend_from_slice(&0u16.to_ne_bytes());
    ehdr.extend_from_slice(&0u16.to_ne_bytes());
    put(&mut image, 0, &ehdr);

    let mut phoff = 64;
    for ph in &phdrs {
        let mut bytes = Vec::with_capacity(56);
        bytes.extend_from_slice(&ph.p_type.to_ne_bytes());
        bytes.extend_from_slice(&ph.flags.to_ne_bytes());
        bytes.extend_from_slice(&(ph.offset as u64).to_ne_bytes());
        bytes.extend_from_slice(&(ph.vaddr as u64).to_ne_bytes());
        bytes.extend_from_slice(&(ph.vaddr as u64).to_ne_bytes()); // p_paddr
        bytes.extend_from_slice(&(ph.filesz as u64).to_ne_bytes());
        bytes.extend_from_slice(&(ph.memsz as u64).to_ne_bytes());
        bytes.extend_from_slice(&(ph.align as u64).to_ne_bytes());
        put(&mut image, phoff, &bytes);
        phoff += 56;
    }

    // Code.
    for export in &spec.exports {
        let (addr, _) = code_addrs[export.name];
        let code = emit_body(
            &export.body,
            addr,
            &slot_addrs,
            &plt_imports,
            plt_entry_addr,
        );
        put(&mut image, addr, &code);
    }
    if !plt_imports.is_empty() {
        // PLT0: push GOT[1]; jmp *GOT[2].
        let mut plt0 = Vec::new();
        plt0.extend_from_slice(&[0xff, 0x35]);
        plt0.extend_from_slice(
            &((got_addr + 8).wrapping_sub(plt0_addr + 6) as i32).to_ne_bytes(),
        );
        plt0.extend_from_slice(&[0xff, 0x25]);
        plt0.extend_from_slice(
            &((got_addr + 16).wrapping_sub(plt0_addr + 12) as i32).to_ne_bytes(),
        );
        plt0.extend_from_slice(&[0xcc; 4]);
        put(&mut image, plt0_addr, &plt0);
        for (i, _) in plt_imports.iter().enumerate() {
            let entry_addr = plt_entry_addr(i);
            let slot = got_addr + (3 + i) * 8;
            let mut entry = Vec::new();
            entry.extend_from_slice(&[0xff, 0x25]);
            entry.extend_from_slice(&(slot.wrapping_sub(entry_addr + 6) as i32).to_ne_bytes());
            entry.push(0x68);
            entry.extend_from_slice(&(i as u32).to_ne_bytes());
            entry.push(0xe9);
            entry
                .extend_from_slice(&(plt0_addr.wrapping_sub(entry_addr + 16) as i32).to_ne_bytes());
            put(&mut image, entry_addr, &entry);
            // Link-time GOT content: the push instruction of this entry.
            put(&mut image, slot, &((entry_addr + 6) as u64).to_ne_bytes());
        }
    }

    // Dynamic table.
    let mut dyn_bytes = Vec::with_capacity(dynamic_size);
    for (tag, val) in &dyn_entries {
        dyn_bytes.extend_from_slice(&tag.to_ne_bytes());
        dyn_bytes.extend_from_slice(&val.to_ne_bytes());
    }
    put(&mut image, dynamic_addr, &dyn_bytes);

    // Symbol table.
    let mut sym_bytes = Vec::with_capacity(symtab_size);
    for sym in &symbols {
        let name_off = if sym.name.is_empty() {
            0
        } else {
            strtab.offsets[&sym.name]
        };
        sym_bytes.extend_from_slice(&(name_off as u32).to_ne_bytes());
        sym_bytes.push(sym.info);
        sym_bytes.push(0);
        sym_bytes.extend_from_slice(&sym.shndx.to_ne_bytes());
        sym_bytes.extend_from_slice(&(sym.value as u64).to_ne_bytes());
        sym_bytes.extend_from_slice(&(sym.size as u64).to_ne_bytes());
    }
    put(&mut image, symtab_addr, &sym_bytes);
    put(&mut image, strtab_addr, &strtab.bytes);

    // SysV hash: one bucket, everything on one chain.
    let mut hash_bytes = Vec::with_capacity(hash_size);
    hash_bytes.extend_from_slice(&1u32.to_ne_bytes());
    hash_bytes.extend_from_slice(&(nsym as u32).to_ne_bytes());
    let first_chain: u32 = if nsym > 1 { 1 } else { 0 };
    hash_bytes.extend_from_slice(&first_chain.to_ne_bytes());
    for i in 0..nsym {
        let next = if i >= 1 && i + 1 < nsym { i + 1 } else { 0 };
        hash_bytes.extend_from_slice(&(next as u32).to_ne_bytes());
    }
    put(&mut image, hash_addr, &hash_bytes);

    let mut rela_bytes = Vec::with_capacity(rela_size);
    for rela in &relas {
        rela.encode(&mut rela_bytes);
    }
    put(&mut image, rela_addr, &rela_bytes);
    let mut jmprel_bytes = Vec::with_capacity(jmprel_size);
    for rela in &plt_relas {
        rela.encode(&mut jmprel_bytes);
    }
    put(&mut image, jmprel_addr, &jmprel_bytes);

    // Data exports and the TLS image.
    for data in &spec.data {
        put(&mut image, data_addrs[data.name], &data.bytes);
    }
    put(&mut image, tdata_addr, &tls_spec.tdata);

    image
}

fn emit_body(
    body: &Body,
    addr: usize,
    slot_addrs: &HashMap<&'static str, usize>,
    plt_imports: &[&'static str],
    plt_entry_addr: impl Fn(usize) -> usize,
) -> Vec<u8> {
    let mut code = Vec::new();
    let slot_disp = |code_len: usize, import: &str| {
        let slot = slot_addrs[import];
        (slot.wrapping_sub(addr + code_len + 7)) as i32
    };
    match body {
        Body::RetConst(value) => {
            code.push(0xb8);
            code.extend_from_slice(&value.to_ne_bytes());
            code.push(0xc3);
        }
        Body::TailCallImport(import) => {
            if let Some(idx) = plt_imports.iter().position(|cur| cur == import) {
                // jmp plt_entry
                let target = plt_entry_addr(idx);
                code.push(0xe9);
                code.extend_from_slice(&(target.wrapping_sub(addr + 5) as i32).to_ne_bytes());
            } else {
                // mov rax, [rip + slot]; jmp rax
                code.extend_from_slice(&[0x48, 0x8b, 0x05]);
                code.extend_from_slice(&slot_disp(0, import).to_ne_bytes());
                code.extend_from_slice(&[0xff, 0xe0]);
            }
        }
        Body::AddImport(import, k) => {
            // mov rax, [rip + slot]; add qword ptr [rax], k; ret
            code.extend_from_slice(&[0x48, 0x8b, 0x05]);
            code.extend_from_slice(&slot_disp(0, import).to_ne_bytes());
            code.extend_from_slice(&[0x48, 0x83, 0x00, *k]);
            code.push(0xc3);
        }
        Body::MulAddImport(import, k) => {
            // mov rax, [rip + slot]
            // mov rcx, [rax]; lea rcx, [rcx + rcx*4]; shl rcx, 1
            // add rcx, k; mov [rax], rcx; ret
            code.extend_from_slice(&[0x48, 0x8b, 0x05]);
            code.extend_from_slice(&slot_disp(0, import).to_ne_bytes());
            code.extend_from_slice(&[0x48, 0x8b, 0x08]);
            code.extend_from_slice(&[0x48, 0x8d, 0x0c, 0x89]);
            code.extend_from_slice(&[0x48, 0xd1, 0xe1]);
            code.extend_from_slice(&[0x48, 0x83, 0xc1, *k]);
            code.extend_from_slice(&[0x48, 0x89, 0x08]);
            code.push(0xc3);
        }
    }
    code
}

/// In-memory module provider for the fixtures of one test.
pub struct MemProvider {
    files: HashMap<String, Vec<u8>>,
}

impl MemProvider {
    pub fn new(files: impl IntoIterator<Item = (&'static str, Vec<u8>)>) -> MemProvider {
        MemProvider {
            files: files
                .into_iter()
                .map(|(name, bytes)| (String::from(name), bytes))
                .collect(),
        }
    }
}

impl ModuleProvider for MemProvider {
    fn open(&self, name: &str) -> elf_dynld::Result<Box<dyn ElfObject>> {
        match self.files.get(name) {
            Some(bytes) => Ok(Box::new(ElfBinary::new(name, bytes.clone()))),
            None => Err(elf_dynld::Error::NotFound {
                name: String::from(name),
            }),
        }
    }
}

/// Mmap wrapper that records every `mprotect`, for RELRO assertions.
pub struct RecordingMmap;

pub static PROTECT_LOG: Mutex<Vec<(usize, usize, i32)>> = Mutex::new(Vec::new());

impl Mmap for RecordingMmap {
    unsafe fn mmap(
        addr: Option<usize>,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        offset: usize,
        fd: Option<i32>,
        need_copy: &mut bool,
    ) -> elf_dynld::Result<NonNull<core::ffi::c_void>> {
        unsafe { MmapImpl::mmap(addr, len, prot, flags, offset, fd, need_copy) }
    }

    unsafe fn mmap_anonymous(
        addr: usize,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> elf_dynld::Result<NonNull<core::ffi::c_void>> {
        unsafe { MmapImpl::mmap_anonymous(addr, len, prot, flags) }
    }

    unsafe fn mmap_reserve(len: usize) -> elf_dynld::Result<NonNull<core::ffi::c_void>> {
        unsafe { MmapImpl::mmap_reserve(len) }
    }

    unsafe fn munmap(addr: NonNull<core::ffi::c_void>, len: usize) -> elf_dynld::Result<()> {
        unsafe { MmapImpl::munmap(addr, len) }
    }

    unsafe fn mprotect(
        addr: NonNull<core::ffi::c_void>,
        len: usize,
        prot: ProtFlags,
    ) -> elf_dynld::Result<()> {
        PROTECT_LOG
            .lock()
            .unwrap()
            .push((addr.as_ptr() as usize, len, prot.bits()));
        unsafe { MmapImpl::mprotect(addr, len, prot) }
    }
}

/// Build a runtime over in-memory fixtures.
pub fn runtime_with(
    fixtures: impl IntoIterator<Item = (&'static str, Vec<u8>)>,
) -> Runtime<MmapImpl> {
    RuntimeBuilder::new(MemProvider::new(fixtures)).build::<MmapImpl>()
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ---- Common fixture specs ----

pub fn ret17_spec() -> DylibSpec {
    DylibSpec {
        soname: "ret17",
        exports: vec![export("TestStart", Body::RetConst(17))],
        ..Default::default()
    }
}

pub fn libfoo_v1_spec() -> DylibSpec {
    DylibSpec {
        soname: "libfoo-v1",
        exports: vec![export("foo", Body::RetConst(2))],
        ..Default::default()
    }
}

pub fn libfoo_v2_spec() -> DylibSpec {
    DylibSpec {
        soname: "libfoo-v2",
        exports: vec![export("foo", Body::RetConst(7))],
        ..Default::default()
    }
}

/// A host-owned counter cell fixtures can import.
#[repr(transparent)]
pub struct Counter(core::cell::UnsafeCell<u64>);

unsafe impl Sync for Counter {}

impl Counter {
    pub const fn new() -> Counter {
        Counter(core::cell::UnsafeCell::new(0))
    }

    pub fn get(&self) -> u64 {
        unsafe { *self.0.get() }
    }

    pub fn set(&self, value: u64) {
        unsafe { *self.0.get() = value }
    }

    pub fn addr(&self) -> *const () {
        self.0.get() as *const ()
    }
}
