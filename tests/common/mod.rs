//! Shared helpers: a minimal ELF64 writer so tests can fabricate AArch64
//! shared objects at runtime instead of depending on prebuilt binaries.

#![allow(dead_code)]

use soloader::hash::gnu_hash;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const ET_DYN: u16 = 3;
pub const EM_AARCH64: u16 = 183;

pub const STB_GLOBAL: u8 = 1;
pub const STB_WEAK: u8 = 2;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_HASH: u32 = 5;
const SHT_DYNSYM: u32 = 11;
const SHT_GNU_HASH: u32 = 0x6fff_fff6;

const PT_LOAD: u32 = 1;
const PF_R: u32 = 4;

/// One symbol to place in `.dynsym` (and `.symtab`).
#[derive(Clone)]
pub struct TestSym {
    pub name: &'static str,
    pub value: u64,
    pub size: u64,
    pub bind: u8,
    pub stype: u8,
    /// 0 leaves the symbol undefined.
    pub shndx: u16,
}

impl TestSym {
    pub fn func(name: &'static str, value: u64, size: u64) -> TestSym {
        TestSym {
            name,
            value,
            size,
            bind: STB_GLOBAL,
            stype: STT_FUNC,
            shndx: 1,
        }
    }

    pub fn object(name: &'static str, value: u64, size: u64) -> TestSym {
        TestSym {
            name,
            value,
            size,
            bind: STB_GLOBAL,
            stype: STT_OBJECT,
            shndx: 1,
        }
    }

    pub fn weak(mut self) -> TestSym {
        self.bind = STB_WEAK;
        self
    }

    pub fn undefined(mut self) -> TestSym {
        self.shndx = 0;
        self.value = 0;
        self.size = 0;
        self
    }
}

struct Buf {
    bytes: Vec<u8>,
}

impl Buf {
    fn new() -> Buf {
        Buf { bytes: Vec::new() }
    }

    fn pos(&self) -> usize {
        self.bytes.len()
    }

    fn u16(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    fn raw(&mut self, v: &[u8]) {
        self.bytes.extend_from_slice(v);
    }

    fn align(&mut self, align: usize) {
        while self.bytes.len() % align != 0 {
            self.bytes.push(0);
        }
    }

    fn patch_u64(&mut self, pos: usize, v: u64) {
        self.bytes[pos..pos + 8].copy_from_slice(&v.to_le_bytes());
    }
}

struct Shdr {
    name: &'static str,
    sh_type: u32,
    sh_addr: u64,
    sh_offset: u64,
    sh_size: u64,
    sh_link: u32,
    sh_entsize: u64,
    sh_addralign: u64,
}

/// Build a minimal AArch64 ET_DYN file exporting `syms` through `.dynsym`
/// with both hash tables, and through `.symtab`.
///
/// `load_vaddr`/`load_offset` shape the single `PT_LOAD`: with
/// `load_offset == 0` the image's bias is `load_vaddr`; otherwise the
/// loader falls back to `vaddr - offset`.
pub fn build_dylib(syms: &[TestSym], load_vaddr: u64, load_offset: u64) -> Vec<u8> {
    let mut buf = Buf::new();
    let nsyms = syms.len() + 1;

    // .dynstr
    let mut dynstr: Vec<u8> = vec![0];
    let mut name_offs = Vec::with_capacity(syms.len());
    for sym in syms {
        name_offs.push(dynstr.len() as u32);
        dynstr.extend_from_slice(sym.name.as_bytes());
        dynstr.push(0);
    }

    // .dynsym / .symtab entries
    let mut symtab = Buf::new();
    symtab.u32(0);
    symtab.u8(0);
    symtab.u8(0);
    symtab.u16(0);
    symtab.u64(0);
    symtab.u64(0);
    for (i, sym) in syms.iter().enumerate() {
        symtab.u32(name_offs[i]);
        symtab.u8((sym.bind << 4) | sym.stype);
        symtab.u8(0);
        symtab.u16(sym.shndx);
        symtab.u64(sym.value);
        symtab.u64(sym.size);
    }

    // .hash: one bucket, every symbol on its chain.
    let mut hash = Buf::new();
    hash.u32(1);
    hash.u32(nsyms as u32);
    hash.u32(1); // bucket[0] -> first real symbol
    hash.u32(0); // chain[0]
    for i in 1..nsyms {
        let next = if i + 1 < nsyms { i as u32 + 1 } else { 0 };
        hash.u32(next);
    }

    // .gnu.hash: one bucket, one all-ones bloom word, chain of hashes.
    let mut gnu = Buf::new();
    gnu.u32(1); // nbucket
    gnu.u32(1); // symndx
    gnu.u32(1); // bloom words
    gnu.u32(6); // shift2
    gnu.u64(u64::MAX); // bloom filter passes everything
    gnu.u32(1); // bucket[0] -> first hashed symbol
    for (i, sym) in syms.iter().enumerate() {
        let mut h = gnu_hash(sym.name.as_bytes()) & !1;
        if i + 1 == syms.len() {
            h |= 1;
        }
        gnu.u32(h);
    }

    // File layout: ehdr, phdr, bodies, .shstrtab, shdrs.
    buf.raw(&[0u8; 64]); // ehdr, patched below
    let phoff = buf.pos();
    buf.raw(&[0u8; 56]); // phdr, patched below

    buf.align(8);
    let dynstr_off = buf.pos();
    buf.raw(&dynstr);

    buf.align(8);
    let dynsym_off = buf.pos();
    buf.raw(&symtab.bytes);

    buf.align(8);
    let hash_off = buf.pos();
    buf.raw(&hash.bytes);

    buf.align(8);
    let gnu_off = buf.pos();
    buf.raw(&gnu.bytes);

    buf.align(8);
    let symtab_off = buf.pos();
    buf.raw(&symtab.bytes);

    let shdrs = [
        Shdr {
            name: "",
            sh_type: 0,
            sh_addr: 0,
            sh_offset: 0,
            sh_size: 0,
            sh_link: 0,
            sh_entsize: 0,
            sh_addralign: 0,
        },
        Shdr {
            name: ".text",
            sh_type: SHT_PROGBITS,
            sh_addr: load_vaddr + 0x1000,
            sh_offset: 0x1000,
            sh_size: 0x1000,
            sh_link: 0,
            sh_entsize: 0,
            sh_addralign: 4,
        },
        Shdr {
            name: ".dynstr",
            sh_type: SHT_STRTAB,
            sh_addr: 0,
            sh_offset: dynstr_off as u64,
            sh_size: dynstr.len() as u64,
            sh_link: 0,
            sh_entsize: 0,
            sh_addralign: 1,
        },
        Shdr {
            name: ".dynsym",
            sh_type: SHT_DYNSYM,
            sh_addr: 0,
            sh_offset: dynsym_off as u64,
            sh_size: (nsyms * 24) as u64,
            sh_link: 2,
            sh_entsize: 24,
            sh_addralign: 8,
        },
        Shdr {
            name: ".hash",
            sh_type: SHT_HASH,
            sh_addr: 0,
            sh_offset: hash_off as u64,
            sh_size: hash.bytes.len() as u64,
            sh_link: 3,
            sh_entsize: 4,
            sh_addralign: 8,
        },
        Shdr {
            name: ".gnu.hash",
            sh_type: SHT_GNU_HASH,
            sh_addr: 0,
            sh_offset: gnu_off as u64,
            sh_size: gnu.bytes.len() as u64,
            sh_link: 3,
            sh_entsize: 0,
            sh_addralign: 8,
        },
        Shdr {
            name: ".symtab",
            sh_type: SHT_SYMTAB,
            sh_addr: 0,
            sh_offset: symtab_off as u64,
            sh_size: (nsyms * 24) as u64,
            sh_link: 2,
            sh_entsize: 24,
            sh_addralign: 8,
        },
        Shdr {
            name: ".shstrtab",
            sh_type: SHT_STRTAB,
            sh_addr: 0,
            sh_offset: 0, // patched below
            sh_size: 0,
            sh_link: 0,
            sh_entsize: 0,
            sh_addralign: 1,
        },
    ];

    // .shstrtab
    let mut shstrtab: Vec<u8> = vec![0];
    let mut shname_offs = Vec::with_capacity(shdrs.len());
    for sh in &shdrs {
        if sh.name.is_empty() {
            shname_offs.push(0u32);
            continue;
        }
        shname_offs.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(sh.name.as_bytes());
        shstrtab.push(0);
    }
    buf.align(8);
    let shstrtab_off = buf.pos();
    buf.raw(&shstrtab);

    buf.align(8);
    let shoff = buf.pos();
    for (i, sh) in shdrs.iter().enumerate() {
        buf.u32(shname_offs[i]);
        buf.u32(sh.sh_type);
        buf.u64(0); // sh_flags
        buf.u64(sh.sh_addr);
        if sh.sh_type == SHT_STRTAB && sh.name == ".shstrtab" {
            buf.u64(shstrtab_off as u64);
            buf.u64(shstrtab.len() as u64);
        } else {
            buf.u64(sh.sh_offset);
            buf.u64(sh.sh_size);
        }
        buf.u32(sh.sh_link);
        buf.u32(0); // sh_info
        buf.u64(sh.sh_addralign);
        buf.u64(sh.sh_entsize);
    }

    // ehdr
    let ident = [
        0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    ];
    buf.bytes[..16].copy_from_slice(&ident);
    let mut ehdr = Buf::new();
    ehdr.u16(ET_DYN);
    ehdr.u16(EM_AARCH64);
    ehdr.u32(1); // e_version
    ehdr.u64(0); // e_entry
    ehdr.u64(phoff as u64);
    ehdr.u64(shoff as u64);
    ehdr.u32(0); // e_flags
    ehdr.u16(64); // e_ehsize
    ehdr.u16(56); // e_phentsize
    ehdr.u16(1); // e_phnum
    ehdr.u16(64); // e_shentsize
    ehdr.u16(shdrs.len() as u16);
    ehdr.u16(7); // e_shstrndx
    buf.bytes[16..16 + ehdr.bytes.len()].copy_from_slice(&ehdr.bytes);

    // phdr: one PT_LOAD covering the file.
    let file_len = buf.pos() as u64;
    let mut phdr = Buf::new();
    phdr.u32(PT_LOAD);
    phdr.u32(PF_R);
    phdr.u64(load_offset);
    phdr.u64(load_vaddr);
    phdr.u64(load_vaddr);
    phdr.u64(file_len);
    phdr.u64(file_len);
    phdr.u64(0x1000);
    buf.bytes[phoff..phoff + 56].copy_from_slice(&phdr.bytes);

    buf.bytes
}

/// Write `bytes` to a unique file under the target temp dir and return its
/// path.
pub fn write_temp(tag: &str, bytes: &[u8]) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "soloader-test-{}-{tag}-{n}.so",
        std::process::id()
    ));
    std::fs::write(&path, bytes).unwrap();
    path
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
