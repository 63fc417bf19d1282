//! Parsed in-memory view of a single ELF file.
//!
//! An [`ElfImage`] owns a full copy of the file bytes and a set of derived
//! views. Fields fall on one of two sides and never cross: symbol tables,
//! hash tables, and section headers reference the owned file copy (file
//! offsets); dynamic-section products (init/fini arrays, eh_frame spans,
//! the dynamic section itself) reference the live mapping (runtime
//! addresses computed as `base + vaddr - bias`).

use crate::arch::{self, Dyn, Phdr, Shdr, Sym};
use crate::hash::{GnuHashTable, SysvHashTable, gnu_hash, read_u32, sysv_hash};
use crate::{Result, io_error, parse_ehdr_error};
use core::ffi::{CStr, c_char, c_int, c_void};
use core::ptr::NonNull;
use elf::abi::{
    EI_DATA, EI_NIDENT, ELFDATA2LSB, ET_DYN, ET_EXEC, PT_DYNAMIC, PT_GNU_EH_FRAME, PT_LOAD, PT_TLS,
    SHN_UNDEF, SHT_DYNSYM, SHT_GNU_HASH, SHT_HASH, SHT_SYMTAB, STT_FUNC, STT_GNU_IFUNC, STT_OBJECT,
};
use elf::endian::NativeEndian;
use elf::file::{Class, FileHeader, parse_ident};
use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};

/// A heap buffer holding the raw file bytes, aligned so ELF tables can be
/// referenced in place.
pub(crate) struct FileBuf {
    ptr: NonNull<u8>,
    len: usize,
}

const FILE_BUF_ALIGN: usize = 16;

impl FileBuf {
    fn with_len(len: usize) -> FileBuf {
        let layout = Layout::from_size_align(len.max(1), FILE_BUF_ALIGN).unwrap();
        let ptr = unsafe { alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };
        FileBuf { ptr, len }
    }
}

impl Drop for FileBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len.max(1), FILE_BUF_ALIGN).unwrap();
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

impl core::ops::Deref for FileBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl core::ops::DerefMut for FileBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

unsafe impl Send for FileBuf {}
unsafe impl Sync for FileBuf {}

/// An open file descriptor with teardown on drop.
pub(crate) struct RawFile {
    fd: c_int,
}

impl RawFile {
    pub(crate) fn open(path: &str) -> Result<RawFile> {
        let cpath = std::ffi::CString::new(path).map_err(io_error)?;
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(io_error(format!("open {path} failed")));
        }
        Ok(RawFile { fd })
    }

    pub(crate) fn fd(&self) -> c_int {
        self.fd
    }

    pub(crate) fn size(&self) -> Result<usize> {
        let mut st = unsafe { core::mem::zeroed::<libc::stat>() };
        if unsafe { libc::fstat(self.fd, &mut st) } != 0 {
            return Err(io_error("fstat failed"));
        }
        Ok(st.st_size as usize)
    }

    pub(crate) fn read_exact(&self, mut bytes: &mut [u8], offset: usize) -> Result<()> {
        let mut pos = offset;
        while !bytes.is_empty() {
            let n = unsafe {
                libc::pread(
                    self.fd,
                    bytes.as_mut_ptr() as *mut c_void,
                    bytes.len(),
                    pos as libc::off_t,
                )
            };
            if n < 0 {
                return Err(io_error("read error"));
            } else if n == 0 {
                return Err(io_error("failed to fill buffer"));
            }
            pos += n as usize;
            bytes = &mut bytes[n as usize..];
        }
        Ok(())
    }
}

impl Drop for RawFile {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// A symbol table view: file offsets of the entries and their linked
/// string table.
#[derive(Debug, Clone, Copy)]
struct SymtabView {
    off: usize,
    count: usize,
    strtab_off: usize,
}

/// Outcome of a symbol-table lookup: the symbol's `st_value` plus its type
/// and binding.
#[derive(Debug, Clone, Copy)]
pub struct SymOffset {
    pub value: usize,
    pub stype: u8,
    pub bind: u8,
}

/// A resolved absolute symbol address (IFUNCs already called).
#[derive(Debug, Clone, Copy)]
pub struct ResolvedSym {
    pub addr: usize,
    pub bind: u8,
}

/// One loaded library: the owned file copy plus everything parsed from it.
pub struct ElfImage {
    path: String,
    base: usize,
    /// Link-time vaddr of the lowest `PT_LOAD`; runtime addresses are
    /// `base + vaddr - bias`.
    bias: usize,
    ehdr: FileHeader<NativeEndian>,
    file: FileBuf,

    // File-offset side.
    shoff: usize,
    shnum: usize,
    dynsym: Option<SymtabView>,
    symtab: Option<SymtabView>,
    sysv_hash: Option<SysvHashTable>,
    gnu_hash: Option<GnuHashTable>,

    // Runtime-address side.
    tls_phdr: Option<Phdr>,
    tls_mod_id: usize,
    init_fn: Option<usize>,
    fini_fn: Option<usize>,
    init_array: Option<(usize, usize)>,
    fini_array: Option<(usize, usize)>,
    eh_frame: Option<(usize, usize)>,
    eh_frame_hdr: Option<(usize, usize)>,
}

impl ElfImage {
    /// Parse the library at `path`.
    ///
    /// When `base` is given it names the start of an existing mapping of
    /// this library. Without it, the host's loaded libraries are searched
    /// for one whose name contains `path`; failing that is an error.
    pub fn create(path: &str, base: Option<usize>) -> Result<ElfImage> {
        let (base, path) = match base {
            Some(base) => {
                log::debug!("using provided base {base:#x} for {path}");
                (base, path.to_string())
            }
            None => {
                let (base, name) = host_lookup(path)
                    .ok_or_else(|| io_error(format!("failed to find base for {path}")))?;
                if base == 0 {
                    return Err(io_error(format!("failed to find base for {path}")));
                }
                (base, name)
            }
        };

        let file = RawFile::open(&path)?;
        let file_size = file.size()?;
        if file_size <= arch::EHDR_SIZE {
            return Err(parse_ehdr_error(format!("file too small: {path}")));
        }
        let mut buf = FileBuf::with_len(file_size);
        file.read_exact(&mut buf, 0)?;
        drop(file);

        let ehdr = validate_header(&buf, &path)?;

        let mut image = ElfImage {
            path,
            base,
            bias: 0,
            ehdr,
            file: buf,
            shoff: 0,
            shnum: 0,
            dynsym: None,
            symtab: None,
            sysv_hash: None,
            gnu_hash: None,
            tls_phdr: None,
            tls_mod_id: 0,
            init_fn: None,
            fini_fn: None,
            init_array: None,
            fini_array: None,
            eh_frame: None,
            eh_frame_hdr: None,
        };
        image.parse_sections();
        image.parse_phdrs();
        // The dynamic walk dereferences the live mapping; it runs last so
        // bias is already known.
        image.parse_dynamic();
        Ok(image)
    }

    fn parse_sections(&mut self) {
        let shoff = self.ehdr.e_shoff as usize;
        let shnum = self.ehdr.e_shnum as usize;
        if shoff == 0 || shnum == 0 {
            return;
        }
        if shoff + shnum * size_of::<Shdr>() > self.file.len() {
            log::warn!("section header table out of bounds, ignoring sections");
            return;
        }
        self.shoff = shoff;
        self.shnum = shnum;

        for i in 0..self.shnum {
            let sh = &self.shdrs()[i];
            let (sh_type, sh_offset, sh_size, sh_link, sh_entsize) = (
                sh.sh_type,
                sh.sh_offset as usize,
                sh.sh_size as usize,
                sh.sh_link as usize,
                sh.sh_entsize as usize,
            );
            match sh_type {
                SHT_DYNSYM => {
                    let count = if sh_entsize != 0 { sh_size / sh_entsize } else { 0 };
                    let strtab_off = self.linked_strtab(sh_link).unwrap_or(0);
                    self.dynsym = Some(SymtabView {
                        off: sh_offset,
                        count,
                        strtab_off,
                    });
                }
                SHT_SYMTAB => {
                    if self.section_name(i) == Some(".symtab") {
                        let count = if sh_entsize != 0 { sh_size / sh_entsize } else { 0 };
                        if let Some(strtab_off) = self.linked_strtab(sh_link) {
                            self.symtab = Some(SymtabView {
                                off: sh_offset,
                                count,
                                strtab_off,
                            });
                        }
                    }
                }
                SHT_HASH => {
                    self.sysv_hash = SysvHashTable::parse(&self.file, sh_offset, sh_size);
                }
                SHT_GNU_HASH => {
                    self.gnu_hash = GnuHashTable::parse(&self.file, sh_offset, sh_size);
                }
                _ => {}
            }
        }
    }

    fn parse_phdrs(&mut self) {
        let mut bias = 0usize;
        let mut tls = None;
        let mut eh_frame_hdr = None;

        for phdr in self.phdrs() {
            if phdr.p_type == PT_LOAD && phdr.p_offset == 0 {
                bias = phdr.p_vaddr as usize;
            }
            match phdr.p_type {
                PT_TLS => tls = Some(arch::clone_phdr(phdr)),
                PT_GNU_EH_FRAME => {
                    eh_frame_hdr = Some((phdr.p_vaddr as usize, phdr.p_memsz as usize))
                }
                _ => {}
            }
        }
        if bias == 0 {
            if let Some(first_load) = self.phdrs().iter().find(|p| p.p_type == PT_LOAD) {
                bias = (first_load.p_vaddr - first_load.p_offset) as usize;
            }
        }
        self.bias = bias;
        self.tls_phdr = tls;
        self.eh_frame_hdr = eh_frame_hdr.map(|(vaddr, size)| (self.vaddr_to_runtime(vaddr), size));
    }

    fn parse_dynamic(&mut self) {
        let Some(dyn_vaddr) = self
            .phdrs()
            .iter()
            .find(|p| p.p_type == PT_DYNAMIC)
            .map(|p| p.p_vaddr as usize)
        else {
            self.locate_eh_frame_section();
            return;
        };
        let dyn_addr = self.vaddr_to_runtime(dyn_vaddr);
        let mut d = dyn_addr as *const Dyn;
        unsafe {
            while (*d).d_tag != elf::abi::DT_NULL {
                let entry = &*d;
                let ptr = self.vaddr_to_runtime(entry.d_un as usize);
                match entry.d_tag {
                    elf::abi::DT_INIT => self.init_fn = Some(ptr),
                    elf::abi::DT_FINI => self.fini_fn = Some(ptr),
                    elf::abi::DT_INIT_ARRAY => {
                        self.init_array = Some((ptr, self.init_array.map_or(0, |(_, n)| n)))
                    }
                    elf::abi::DT_INIT_ARRAYSZ => {
                        let count = entry.d_un as usize / size_of::<usize>();
                        self.init_array = Some((self.init_array.map_or(0, |(a, _)| a), count));
                    }
                    elf::abi::DT_FINI_ARRAY => {
                        self.fini_array = Some((ptr, self.fini_array.map_or(0, |(_, n)| n)))
                    }
                    elf::abi::DT_FINI_ARRAYSZ => {
                        let count = entry.d_un as usize / size_of::<usize>();
                        self.fini_array = Some((self.fini_array.map_or(0, |(a, _)| a), count));
                    }
                    _ => {}
                }
                d = d.add(1);
            }
        }
        self.locate_eh_frame_section();
    }

    fn locate_eh_frame_section(&mut self) {
        for i in 0..self.shnum {
            if self.section_name(i) == Some(".eh_frame") {
                let (sh_addr, sh_size) = {
                    let sh = &self.shdrs()[i];
                    (sh.sh_addr as usize, sh.sh_size as usize)
                };
                self.eh_frame = Some((self.vaddr_to_runtime(sh_addr), sh_size));
            }
        }
    }

    /// Program headers, referencing the owned file copy.
    pub fn phdrs(&self) -> &[Phdr] {
        let phoff = self.ehdr.e_phoff as usize;
        let phnum = self.ehdr.e_phnum as usize;
        debug_assert!((self.file.as_ptr() as usize + phoff) % align_of::<Phdr>() == 0);
        unsafe {
            core::slice::from_raw_parts(self.file.as_ptr().add(phoff) as *const Phdr, phnum)
        }
    }

    fn shdrs(&self) -> &[Shdr] {
        if self.shoff == 0 {
            return &[];
        }
        debug_assert!((self.file.as_ptr() as usize + self.shoff) % align_of::<Shdr>() == 0);
        unsafe {
            core::slice::from_raw_parts(
                self.file.as_ptr().add(self.shoff) as *const Shdr,
                self.shnum,
            )
        }
    }

    fn linked_strtab(&self, sh_link: usize) -> Option<usize> {
        if sh_link < self.shnum {
            Some(self.shdrs()[sh_link].sh_offset as usize)
        } else {
            None
        }
    }

    fn section_name(&self, idx: usize) -> Option<&str> {
        let shstrndx = self.ehdr.e_shstrndx as usize;
        if shstrndx >= self.shnum || idx >= self.shnum {
            return None;
        }
        let names_off = self.shdrs()[shstrndx].sh_offset as usize;
        let name_off = names_off + self.shdrs()[idx].sh_name as usize;
        self.cstr_at(name_off).to_str().ok()
    }

    fn cstr_at(&self, off: usize) -> &CStr {
        if off >= self.file.len() {
            return c"";
        }
        CStr::from_bytes_until_nul(&self.file[off..]).unwrap_or(c"")
    }

    fn sym_at(&self, view: &SymtabView, idx: usize) -> &Sym {
        debug_assert!(idx < view.count);
        unsafe { &*(self.file.as_ptr().add(view.off + idx * size_of::<Sym>()) as *const Sym) }
    }

    fn sym_name<'a>(&'a self, view: &SymtabView, sym: &Sym) -> &'a [u8] {
        self.cstr_at(view.strtab_off + sym.st_name as usize).to_bytes()
    }

    /// GNU-hash lookup of `name`, returning the symbol's `st_value`.
    pub fn gnu_hash_lookup(&self, name: &str) -> Option<SymOffset> {
        let table = self.gnu_hash.as_ref()?;
        let dynsym = self.dynsym.as_ref()?;
        if table.nbucket == 0 {
            return None;
        }
        let hash = gnu_hash(name.as_bytes());
        if !table.bloom_test(&self.file, hash) {
            return None;
        }
        let bucket_idx = (hash % table.nbucket) as usize;
        let mut sym_idx =
            read_u32(&self.file, table.bucket_off + bucket_idx * size_of::<u32>()) as usize;
        if sym_idx < table.symndx as usize {
            return None;
        }
        loop {
            if sym_idx >= dynsym.count {
                return None;
            }
            let chain_val = read_u32(
                &self.file,
                table.chain_off + (sym_idx - table.symndx as usize) * size_of::<u32>(),
            );
            let sym = self.sym_at(dynsym, sym_idx);
            if (chain_val ^ hash) >> 1 == 0
                && self.sym_name(dynsym, sym) == name.as_bytes()
                && sym.st_shndx != SHN_UNDEF
            {
                return Some(SymOffset {
                    value: sym.st_value as usize,
                    stype: arch::elf_st_type(sym.st_info),
                    bind: arch::elf_st_bind(sym.st_info),
                });
            }
            if chain_val & 1 != 0 {
                return None;
            }
            sym_idx += 1;
        }
    }

    /// SYSV-hash lookup of `name`, returning the symbol's `st_value`.
    pub fn sysv_hash_lookup(&self, name: &str) -> Option<SymOffset> {
        let table = self.sysv_hash.as_ref()?;
        let dynsym = self.dynsym.as_ref()?;
        if table.nbucket == 0 {
            return None;
        }
        let hash = sysv_hash(name.as_bytes());
        let bucket_idx = (hash % table.nbucket) as usize;
        let mut n = read_u32(&self.file, table.bucket_off + bucket_idx * size_of::<u32>()) as usize;
        while n != 0 {
            if n >= dynsym.count {
                return None;
            }
            let sym = self.sym_at(dynsym, n);
            if self.sym_name(dynsym, sym) == name.as_bytes() && sym.st_shndx != SHN_UNDEF {
                return Some(SymOffset {
                    value: sym.st_value as usize,
                    stype: arch::elf_st_type(sym.st_info),
                    bind: arch::elf_st_bind(sym.st_info),
                });
            }
            n = read_u32(&self.file, table.chain_off + n * size_of::<u32>()) as usize;
        }
        None
    }

    /// Linear `.symtab` scan: defined `STT_FUNC`/`STT_OBJECT` entries with
    /// nonzero size only.
    pub fn linear_lookup(&self, name: &str) -> Option<SymOffset> {
        let symtab = self.symtab.as_ref()?;
        for i in 0..symtab.count {
            let sym = self.sym_at(symtab, i);
            let st = arch::elf_st_type(sym.st_info);
            if (st == STT_FUNC || st == STT_OBJECT)
                && sym.st_size > 0
                && sym.st_shndx != SHN_UNDEF
                && self.sym_name(symtab, sym) == name.as_bytes()
            {
                return Some(SymOffset {
                    value: sym.st_value as usize,
                    stype: st,
                    bind: arch::elf_st_bind(sym.st_info),
                });
            }
        }
        None
    }

    /// Find the file-side offset (`st_value`) of `name`.
    ///
    /// Tries the GNU hash table, then the SYSV hash table, then a linear
    /// `.symtab` scan, returning the first hit.
    pub fn find_symbol_offset(&self, name: &str) -> Option<SymOffset> {
        self.gnu_hash_lookup(name)
            .or_else(|| self.sysv_hash_lookup(name))
            .or_else(|| self.linear_lookup(name))
    }

    /// Resolve `name` to an absolute address in the mapped image.
    ///
    /// `STT_GNU_IFUNC` symbols are resolved by calling the symbol as a
    /// resolver with the auxiliary-vector hardware capabilities.
    pub fn find_symbol_address(&self, name: &str) -> Option<ResolvedSym> {
        let sym = self.find_symbol_offset(name)?;
        if self.base == 0 {
            return None;
        }
        let addr = self.vaddr_to_runtime(sym.value);
        if sym.stype == STT_GNU_IFUNC {
            log::debug!("resolving ifunc: {name}");
            let resolved = unsafe { arch::call_ifunc_resolver(addr) };
            return Some(ResolvedSym {
                addr: resolved,
                bind: sym.bind,
            });
        }
        Some(ResolvedSym {
            addr,
            bind: sym.bind,
        })
    }

    /// Reverse lookup: the `.symtab` entry whose range contains `addr`.
    ///
    /// Returns the symbol's name (borrowed from the file copy) and its
    /// runtime start address.
    pub fn symbol_at(&self, addr: usize) -> Option<(&CStr, usize)> {
        let symtab = self.symtab.as_ref()?;
        for i in 0..symtab.count {
            let sym = self.sym_at(symtab, i);
            if sym.st_value == 0 || sym.st_size == 0 {
                continue;
            }
            let start = self.vaddr_to_runtime(sym.st_value as usize);
            let end = start + sym.st_size as usize;
            if addr >= start && addr < end {
                return Some((self.cstr_at(symtab.strtab_off + sym.st_name as usize), start));
            }
        }
        None
    }

    /// Translate a link-time vaddr into an address in the live mapping.
    #[inline]
    pub fn vaddr_to_runtime(&self, vaddr: usize) -> usize {
        self.base.wrapping_add(vaddr).wrapping_sub(self.bias)
    }

    /// The runtime load bias (`base - bias`): what relocations add to
    /// link-time values.
    #[inline]
    pub fn load_bias(&self) -> usize {
        self.base.wrapping_sub(self.bias)
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn bias(&self) -> usize {
        self.bias
    }

    #[inline]
    pub fn ehdr(&self) -> &FileHeader<NativeEndian> {
        &self.ehdr
    }

    #[inline]
    pub fn tls_phdr(&self) -> Option<&Phdr> {
        self.tls_phdr.as_ref()
    }

    #[inline]
    pub fn tls_module_id(&self) -> usize {
        self.tls_mod_id
    }

    #[inline]
    pub(crate) fn set_tls_module_id(&mut self, id: usize) {
        self.tls_mod_id = id;
    }

    #[inline]
    pub fn init_fn(&self) -> Option<usize> {
        self.init_fn
    }

    #[inline]
    pub fn fini_fn(&self) -> Option<usize> {
        self.fini_fn
    }

    /// `DT_INIT_ARRAY` as (runtime address, entry count).
    #[inline]
    pub fn init_array(&self) -> Option<(usize, usize)> {
        self.init_array.filter(|&(addr, count)| addr != 0 && count != 0)
    }

    /// `DT_FINI_ARRAY` as (runtime address, entry count).
    #[inline]
    pub fn fini_array(&self) -> Option<(usize, usize)> {
        self.fini_array.filter(|&(addr, count)| addr != 0 && count != 0)
    }

    /// `.eh_frame` as (runtime address, size).
    #[inline]
    pub fn eh_frame(&self) -> Option<(usize, usize)> {
        self.eh_frame
    }

    /// `PT_GNU_EH_FRAME` contents as (runtime address, size).
    #[inline]
    pub fn eh_frame_hdr(&self) -> Option<(usize, usize)> {
        self.eh_frame_hdr
    }

    /// File offset of the section-header string table linked to `.dynsym`,
    /// used as the `DT_NEEDED` fallback when `DT_STRTAB` is absent.
    pub(crate) fn dynstr_file_off(&self) -> Option<usize> {
        self.dynsym.map(|view| view.strtab_off)
    }

    pub(crate) fn cstr_at_file_off(&self, off: usize) -> &CStr {
        self.cstr_at(off)
    }
}

fn validate_header(data: &[u8], path: &str) -> Result<FileHeader<NativeEndian>> {
    let ident_buf = &data[..EI_NIDENT];
    let tail_buf = &data[EI_NIDENT..arch::EHDR_SIZE];
    let ident = parse_ident::<NativeEndian>(ident_buf).map_err(parse_ehdr_error)?;
    let ehdr = FileHeader::parse_tail(ident, tail_buf).map_err(parse_ehdr_error)?;

    if data[EI_DATA as usize] != ELFDATA2LSB {
        return Err(parse_ehdr_error(format!("not little-endian: {path}")));
    }
    if ehdr.class != Class::ELF64 {
        return Err(parse_ehdr_error(format!("not a 64-bit elf file: {path}")));
    }
    if ehdr.e_machine != arch::EM_ARCH {
        return Err(parse_ehdr_error(format!(
            "not an aarch64 elf file (machine={}): {path}",
            ehdr.e_machine
        )));
    }
    if ehdr.e_type != ET_DYN && ehdr.e_type != ET_EXEC {
        return Err(parse_ehdr_error(format!(
            "not a shared library or executable (type={}): {path}",
            ehdr.e_type
        )));
    }
    if ehdr.e_phoff == 0 || ehdr.e_phnum == 0 {
        return Err(parse_ehdr_error(format!("no program headers: {path}")));
    }
    if ehdr.e_phoff as usize + ehdr.e_phnum as usize * ehdr.e_phentsize as usize > data.len() {
        return Err(parse_ehdr_error(format!(
            "program header table out of bounds: {path}"
        )));
    }
    Ok(ehdr)
}

struct AdoptState<'a> {
    needle: &'a str,
    base: Option<usize>,
    name: Option<String>,
}

unsafe extern "C" fn adopt_cb(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    let state = unsafe { &mut *(data as *mut AdoptState<'_>) };
    let info = unsafe { &*info };
    if info.dlpi_name.is_null() {
        return 0;
    }
    let name = unsafe { CStr::from_ptr(info.dlpi_name as *const c_char) };
    let Ok(name) = name.to_str() else {
        return 0;
    };
    if !name.is_empty() && name.contains(state.needle) {
        state.base = Some(info.dlpi_addr as usize);
        state.name = Some(name.to_string());
        return 1;
    }
    0
}

/// Adopt an already-loaded copy of `path` from the host's link map.
fn host_lookup(path: &str) -> Option<(usize, String)> {
    let mut state = AdoptState {
        needle: path,
        base: None,
        name: None,
    };
    unsafe {
        libc::dl_iterate_phdr(Some(adopt_cb), &mut state as *mut AdoptState<'_> as *mut c_void)
    };
    match (state.base, state.name) {
        (Some(base), Some(name)) => Some((base, name)),
        _ => None,
    }
}
