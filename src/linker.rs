//! The linker: dependency discovery, relocation, and lifecycle.
//!
//! `link()` runs seven phases over the main image: load the `DT_NEEDED`
//! closure, register TLS segments, make pages writable, apply relocations,
//! restore final protections, publish into the backtrace registry, and run
//! constructors. `destroy()` is the inverse in reverse order; `abandon()`
//! is `destroy()` without destructors.

use crate::arch::{
    self, DT_ANDROID_REL, DT_ANDROID_RELA, DT_ANDROID_RELASZ, DT_ANDROID_RELR, DT_ANDROID_RELRENT,
    DT_ANDROID_RELRSZ, DT_ANDROID_RELSZ, DT_RELR, DT_RELRSZ, Dyn, Rel, Rela, Sym,
};
use crate::backtrace::{custom_dl_iterate_phdr, custom_dladdr};
use crate::image::ElfImage;
use crate::loader::Runtime;
use crate::mmap::{self, ProtFlags, page_end, page_size, page_start};
use crate::reloc::{PackedRelocReader, RelrIter};
use crate::segment::{self, LibraryMapping};
use crate::tls::{TlsIndex, tlsdesc_resolver};
use crate::{Result, relocate_error};
use core::ffi::{CStr, c_char, c_int};
use elf::abi::{
    DT_JMPREL, DT_NEEDED, DT_NULL, DT_PLTREL, DT_PLTRELSZ, DT_REL, DT_RELA, DT_RELAENT, DT_RELASZ,
    DT_RELENT, DT_RELSZ, DT_STRTAB, DT_SYMTAB, PF_W, PF_X, PT_DYNAMIC, PT_LOAD, STB_GLOBAL,
    STB_WEAK,
};
use hashbrown::{HashMap, HashSet};
use std::ffi::CString;
use std::sync::Mutex;

/// Fixed, ordered system library roots probed for non-absolute
/// `DT_NEEDED` names.
pub const SEARCH_PATHS: &[&str] = &[
    // APEX runtime libraries (Android 10+).
    "/apex/com.android.runtime/lib64/bionic/",
    "/apex/com.android.runtime/lib64/",
    "/apex/com.android.art/lib64/",
    // System libraries.
    "/system/lib64/",
    "/system/lib64/vndk/",
    "/system/lib64/vndk-sp/",
    // Vendor libraries.
    "/vendor/lib64/",
    "/vendor/lib64/vndk/",
    "/vendor/lib64/vndk-sp/",
    "/odm/lib64/",
    "/product/lib64/",
    "/system_ext/lib64/",
];

/// One loaded library: the parsed image plus the mapping backing it.
/// Adopted host libraries carry no mapping and are excluded from
/// relocation, constructors, and unmapping.
pub struct LoadedDep {
    pub image: Box<ElfImage>,
    mapping: Option<LibraryMapping>,
}

impl LoadedDep {
    #[inline]
    pub fn is_manual_load(&self) -> bool {
        self.mapping.is_some()
    }
}

/// Outcome of a scope-wide symbol search.
///
/// `image` is null when the symbol came from the host's dynamic linker;
/// TLS relocations against such symbols fail.
#[derive(Clone, Copy)]
pub struct SymbolLookup {
    pub address: usize,
    pub image: *const ElfImage,
    pub bind: u8,
}

impl SymbolLookup {
    const fn not_found() -> SymbolLookup {
        SymbolLookup {
            address: 0,
            image: core::ptr::null(),
            bind: 0,
        }
    }

    #[inline]
    pub fn valid(&self) -> bool {
        self.address != 0
    }

    #[inline]
    pub fn is_weak(&self) -> bool {
        self.bind == STB_WEAK
    }
}

struct SymbolCacheEntry {
    address: usize,
    image: *const ElfImage,
    found: bool,
}

/// Dynamic-section facts one relocation pass needs.
#[derive(Default)]
struct RelocTables {
    rela: usize,
    rela_sz: usize,
    rela_ent: usize,
    rel: usize,
    rel_sz: usize,
    rel_ent: usize,
    relr: usize,
    relr_sz: usize,
    jmprel: usize,
    jmprel_sz: usize,
    pltrel_type: i64,
    dynsym: usize,
    dynstr: usize,
    android_reloc: usize,
    android_reloc_sz: usize,
    is_android_rela: bool,
    android_relr_ent_bad: bool,
}

pub struct Linker {
    runtime: &'static Runtime,
    main: Option<Box<LoadedDep>>,
    deps: Vec<LoadedDep>,
    tls_indices: Vec<Box<TlsIndex>>,
    symbol_cache: Mutex<HashMap<String, SymbolCacheEntry>>,
    is_linked: bool,
}

impl Linker {
    pub fn new(runtime: &'static Runtime) -> Linker {
        Linker {
            runtime,
            main: None,
            deps: Vec::new(),
            tls_indices: Vec::new(),
            symbol_cache: Mutex::new(HashMap::new()),
            is_linked: false,
        }
    }

    /// Take ownership of the parsed, manually mapped main image.
    pub fn init(&mut self, image: Box<ElfImage>, mapping: LibraryMapping) {
        self.main = Some(Box::new(LoadedDep {
            image,
            mapping: Some(mapping),
        }));
        self.deps.clear();
        self.is_linked = false;
    }

    #[inline]
    pub fn main_image(&self) -> Option<&ElfImage> {
        self.main.as_ref().map(|dep| &*dep.image)
    }

    #[inline]
    pub fn is_linked(&self) -> bool {
        self.is_linked
    }

    #[inline]
    pub fn dependency_count(&self) -> usize {
        self.deps.len()
    }

    pub fn clear_symbol_cache(&self) {
        self.symbol_cache.lock().unwrap().clear();
    }

    /// Run the seven link phases over the main image.
    pub fn link(&mut self) -> Result<()> {
        let runtime = self.runtime;

        // 1. Dependencies.
        self.load_dependencies()?;

        // 2. TLS registration: main image first, then every dependency.
        if let Some(main) = self.main.as_mut() {
            runtime.tls.register_image(&mut main.image);
        }
        for dep in self.deps.iter_mut() {
            runtime.tls.register_image(&mut dep.image);
        }
        runtime.tls.bump_generation();

        // 3. Relocation needs writable GOT/data pages.
        for dep in self.manual_images() {
            make_writable(dep);
        }

        // 4. Relocations.
        let mut new_indices = Vec::new();
        for image in self.manual_images() {
            self.process_relocations(image, &mut new_indices);
        }
        self.tls_indices.append(&mut new_indices);

        // 5. Final protections.
        for image in self.manual_images() {
            restore_protections(image);
        }

        // 6. Backtrace publication.
        if let Some(main) = self.main.as_deref() {
            self.runtime.backtrace.register_library(&main.image);
            self.runtime.backtrace.register_eh_frame(&main.image);
        }
        for dep in self.deps.iter().filter(|d| d.is_manual_load()) {
            self.runtime.backtrace.register_library(&dep.image);
            self.runtime.backtrace.register_eh_frame(&dep.image);
        }

        // 7. Constructors: dependencies in load order, then the main image.
        let params = self.runtime.init_params();
        for dep in self.deps.iter().filter(|d| d.is_manual_load()) {
            call_constructors(&dep.image, params);
        }
        if let Some(main) = self.main.as_deref() {
            call_constructors(&main.image, params);
        }

        self.is_linked = true;
        Ok(())
    }

    /// Teardown: the inverse of `link()`, in reverse order.
    pub fn destroy(&mut self) {
        self.teardown(true);
    }

    /// Teardown without running destructors, for callers that cannot
    /// guarantee process liveness afterwards.
    pub fn abandon(&mut self) {
        self.teardown(false);
    }

    fn teardown(&mut self, run_destructors: bool) {
        // The main image depends on the others; it goes down first.
        if let Some(main) = self.main.as_deref() {
            if self.is_linked {
                self.runtime.backtrace.unregister_eh_frame(&main.image);
                self.runtime.backtrace.unregister_library(&main.image);
                if run_destructors {
                    call_destructors(&main.image);
                }
            }
        }
        for dep in self.deps.iter().rev().filter(|d| d.is_manual_load()) {
            self.runtime.backtrace.unregister_eh_frame(&dep.image);
            self.runtime.backtrace.unregister_library(&dep.image);
            if run_destructors && self.is_linked {
                call_destructors(&dep.image);
            }
        }

        self.tls_indices.clear();

        for dep in self.deps.iter().rev() {
            self.runtime.tls.unregister_image(&dep.image);
        }
        if let Some(main) = self.main.as_deref() {
            self.runtime.tls.unregister_image(&main.image);
        }

        self.clear_symbol_cache();
        // Dropping the deps and the main image unmaps every manual
        // mapping and frees the owned file copies.
        self.deps.clear();
        self.main = None;
        self.is_linked = false;
    }

    /// Every manually mapped image, the main image first.
    fn manual_images(&self) -> impl Iterator<Item = &ElfImage> {
        self.main
            .as_deref()
            .into_iter()
            .chain(self.deps.iter().filter(|d| d.is_manual_load()))
            .map(|dep| &*dep.image)
    }

    fn is_loaded_path(&self, path: &str) -> bool {
        if let Some(main) = self.main.as_deref() {
            if main.image.path() == path {
                return true;
            }
        }
        self.deps.iter().any(|dep| dep.image.path() == path)
    }

    // Phase 1: resolve and map the transitive DT_NEEDED closure of the
    // main image. Dependencies adopted from the host are not re-walked;
    // the host linker already bound theirs.
    fn load_dependencies(&mut self) -> Result<()> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut worklist: Vec<String> = Vec::new();

        if let Some(main) = self.main.as_deref() {
            collect_needed(&main.image, &mut seen, &mut worklist);
        }

        let mut i = 0;
        while i < worklist.len() {
            let name = worklist[i].clone();
            i += 1;

            let Some(full_path) = find_library_path(&name) else {
                log::warn!("skipping missing library: {name}");
                continue;
            };
            if self.is_loaded_path(&full_path) {
                continue;
            }

            // Prefer a copy the host already has.
            let dep = match ElfImage::create(&full_path, None) {
                Ok(image) => LoadedDep {
                    image: Box::new(image),
                    mapping: None,
                },
                Err(_) => {
                    let mapping = segment::map_library(&full_path).map_err(|err| {
                        relocate_error(format!("failed to load {full_path}: {err}"))
                    })?;
                    let image = ElfImage::create(&full_path, Some(mapping.base()))?;
                    LoadedDep {
                        image: Box::new(image),
                        mapping: Some(mapping),
                    }
                }
            };

            if dep.is_manual_load() {
                collect_needed(&dep.image, &mut seen, &mut worklist);
            }
            self.deps.push(dep);
        }
        Ok(())
    }

    /// Scope-wide symbol search with caching; negative results are cached
    /// too.
    fn find_symbol_cached(&self, name: &str) -> SymbolLookup {
        {
            let cache = self.symbol_cache.lock().unwrap();
            if let Some(entry) = cache.get(name) {
                if entry.found {
                    return SymbolLookup {
                        address: entry.address,
                        image: entry.image,
                        bind: STB_GLOBAL,
                    };
                }
                return SymbolLookup::not_found();
            }
        }

        let result = self.find_symbol(name);

        let mut cache = self.symbol_cache.lock().unwrap();
        cache.insert(
            name.to_string(),
            SymbolCacheEntry {
                address: result.address,
                image: result.image,
                found: result.valid(),
            },
        );
        result
    }

    /// Name resolution order: main image, then each dependency in load
    /// order. The first global hit wins immediately; the first weak hit is
    /// kept as a fallback. The host's `dlsym(RTLD_DEFAULT)` is the last
    /// resort and binds as global with no image.
    fn find_symbol(&self, name: &str) -> SymbolLookup {
        let mut weak_result = SymbolLookup::not_found();

        let scope = self.main.as_deref().into_iter().chain(self.deps.iter());
        for dep in scope {
            if let Some(sym) = dep.image.find_symbol_address(name) {
                let result = SymbolLookup {
                    address: sym.addr,
                    image: &*dep.image as *const ElfImage,
                    bind: sym.bind,
                };
                if sym.bind == STB_GLOBAL {
                    return result;
                }
                if sym.bind == STB_WEAK && !weak_result.valid() {
                    weak_result = result;
                }
            }
        }

        if weak_result.valid() {
            log::debug!("using weak symbol for '{name}'");
            return weak_result;
        }

        let Ok(cname) = CString::new(name) else {
            return SymbolLookup::not_found();
        };
        let sys_addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cname.as_ptr()) };
        if !sys_addr.is_null() {
            log::debug!("found symbol '{name}' in system libraries");
            return SymbolLookup {
                address: sys_addr as usize,
                image: core::ptr::null(),
                bind: STB_GLOBAL,
            };
        }

        log::error!("symbol not found: {name}");
        SymbolLookup::not_found()
    }

    // Phase 4: apply every relocation table the dynamic section names, in
    // the order RELR, RELA, REL, Android packed, PLT.
    fn process_relocations(&self, image: &ElfImage, tls_out: &mut Vec<Box<TlsIndex>>) {
        let Some(tables) = parse_reloc_tables(image) else {
            return;
        };
        if tables.android_relr_ent_bad {
            log::error!("unsupported DT_ANDROID_RELRENT size in {}", image.path());
            return;
        }
        if tables.dynsym == 0 || tables.dynstr == 0 {
            return;
        }
        let load_bias = image.load_bias();
        let dynsym = tables.dynsym as *const Sym;
        let dynstr = tables.dynstr as *const c_char;

        if tables.relr != 0 && tables.relr_sz != 0 {
            let entries = unsafe {
                core::slice::from_raw_parts(
                    tables.relr as *const usize,
                    tables.relr_sz / size_of::<usize>(),
                )
            };
            for offset in RelrIter::new(entries) {
                unsafe {
                    let target = (load_bias + offset) as *mut usize;
                    target.write(target.read().wrapping_add(load_bias));
                }
            }
        }

        if tables.rela != 0 && tables.rela_sz != 0 {
            let ent = if tables.rela_ent != 0 {
                tables.rela_ent
            } else {
                size_of::<Rela>()
            };
            for i in 0..tables.rela_sz / ent {
                let rela = unsafe { &*((tables.rela + i * ent) as *const Rela) };
                self.apply_relocation(
                    image,
                    arch::elf_r_sym(rela.r_info),
                    arch::elf_r_type(rela.r_info),
                    rela.r_offset as usize,
                    rela.r_addend as isize,
                    true,
                    dynsym,
                    dynstr,
                    tls_out,
                );
            }
        }

        if tables.rel != 0 && tables.rel_sz != 0 {
            let ent = if tables.rel_ent != 0 {
                tables.rel_ent
            } else {
                size_of::<Rel>()
            };
            for i in 0..tables.rel_sz / ent {
                let rel = unsafe { &*((tables.rel + i * ent) as *const Rel) };
                self.apply_relocation(
                    image,
                    arch::elf_r_sym(rel.r_info),
                    arch::elf_r_type(rel.r_info),
                    rel.r_offset as usize,
                    0,
                    false,
                    dynsym,
                    dynstr,
                    tls_out,
                );
            }
        }

        if tables.android_reloc != 0 && tables.android_reloc_sz > 4 {
            let bytes = unsafe {
                core::slice::from_raw_parts(
                    tables.android_reloc as *const u8,
                    tables.android_reloc_sz,
                )
            };
            match PackedRelocReader::new(bytes, tables.is_android_rela) {
                Ok(reader) => {
                    for packed in reader {
                        self.apply_relocation(
                            image,
                            packed.r_sym,
                            packed.r_type,
                            packed.r_offset,
                            packed.r_addend,
                            tables.is_android_rela,
                            dynsym,
                            dynstr,
                            tls_out,
                        );
                    }
                }
                Err(err) => log::error!("{err}"),
            }
        }

        if tables.jmprel != 0 && tables.jmprel_sz != 0 {
            if tables.pltrel_type == DT_RELA {
                for i in 0..tables.jmprel_sz / size_of::<Rela>() {
                    let rela =
                        unsafe { &*((tables.jmprel + i * size_of::<Rela>()) as *const Rela) };
                    self.apply_relocation(
                        image,
                        arch::elf_r_sym(rela.r_info),
                        arch::elf_r_type(rela.r_info),
                        rela.r_offset as usize,
                        rela.r_addend as isize,
                        true,
                        dynsym,
                        dynstr,
                        tls_out,
                    );
                }
            } else {
                for i in 0..tables.jmprel_sz / size_of::<Rel>() {
                    let rel = unsafe { &*((tables.jmprel + i * size_of::<Rel>()) as *const Rel) };
                    self.apply_relocation(
                        image,
                        arch::elf_r_sym(rel.r_info),
                        arch::elf_r_type(rel.r_info),
                        rel.r_offset as usize,
                        0,
                        false,
                        dynsym,
                        dynstr,
                        tls_out,
                    );
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_relocation(
        &self,
        image: &ElfImage,
        r_sym: u32,
        r_type: u32,
        r_offset: usize,
        addend: isize,
        is_rela: bool,
        dynsym: *const Sym,
        dynstr: *const c_char,
        tls_out: &mut Vec<Box<TlsIndex>>,
    ) {
        let load_bias = image.load_bias();
        let target = (load_bias + r_offset) as *mut usize;

        match r_type {
            arch::R_AARCH64_NONE => {}

            arch::R_AARCH64_COPY => {
                log::warn!("R_AARCH64_COPY relocation not supported");
            }

            arch::R_AARCH64_RELATIVE => unsafe {
                let value = if is_rela {
                    load_bias.wrapping_add_signed(addend)
                } else {
                    load_bias.wrapping_add(target.read())
                };
                target.write(value);
            },

            arch::R_AARCH64_IRELATIVE => unsafe {
                let resolver = if is_rela {
                    load_bias.wrapping_add_signed(addend)
                } else {
                    load_bias.wrapping_add(target.read())
                };
                target.write(arch::call_ifunc_resolver(resolver));
            },

            arch::R_AARCH64_GLOB_DAT
            | arch::R_AARCH64_ABS64
            | arch::R_AARCH64_JUMP_SLOT
            | arch::R_AARCH64_TLS_DTPMOD
            | arch::R_AARCH64_TLS_DTPREL
            | arch::R_AARCH64_TLS_TPREL
            | arch::R_AARCH64_TLSDESC => {
                let sym_entry = unsafe { &*dynsym.add(r_sym as usize) };
                let name = unsafe { CStr::from_ptr(dynstr.add(sym_entry.st_name as usize)) };
                let name = name.to_string_lossy();

                let sym = self.find_symbol_cached(&name);
                if !sym.valid() {
                    log::error!("undefined symbol: {name}");
                    return;
                }

                // Redirect the dl introspection entry points so unwinders
                // inside loaded libraries see manually loaded code.
                if name == "dl_iterate_phdr" {
                    unsafe { target.write(custom_dl_iterate_phdr as usize) };
                    return;
                }
                if name == "dladdr" {
                    unsafe { target.write(custom_dladdr as usize) };
                    return;
                }

                match r_type {
                    arch::R_AARCH64_GLOB_DAT | arch::R_AARCH64_JUMP_SLOT => unsafe {
                        target.write(sym.address);
                    },
                    arch::R_AARCH64_ABS64 => unsafe {
                        let value = if is_rela {
                            sym.address.wrapping_add_signed(addend)
                        } else {
                            sym.address.wrapping_add(target.read())
                        };
                        target.write(value);
                    },
                    arch::R_AARCH64_TLS_DTPMOD => unsafe {
                        if sym.image.is_null() {
                            log::error!("TLS_DTPMOD requires loaded image for symbol: {name}");
                            target.write(0);
                        } else {
                            let sym_image = &*sym.image;
                            let id = if sym_image.tls_phdr().is_some() {
                                sym_image.tls_module_id()
                            } else {
                                0
                            };
                            target.write(id);
                        }
                    },
                    arch::R_AARCH64_TLS_DTPREL => unsafe {
                        target.write((sym_entry.st_value as usize).wrapping_add_signed(addend));
                    },
                    arch::R_AARCH64_TLS_TPREL => unsafe {
                        if sym.image.is_null() {
                            log::error!("TLS_TPREL requires loaded image for symbol: {name}");
                            target.write(0);
                            return;
                        }
                        let ti = TlsIndex {
                            module: (*sym.image).tls_module_id(),
                            offset: (sym_entry.st_value as usize).wrapping_add_signed(addend),
                        };
                        let addr = self.runtime.tls.address_of(&ti);
                        if addr.is_null() {
                            log::error!("failed to get TLS address for symbol: {name}");
                            target.write(0);
                        } else {
                            let block = self.runtime.tls.thread_block();
                            target.write((addr as usize).wrapping_sub(block as usize));
                        }
                    },
                    arch::R_AARCH64_TLSDESC => unsafe {
                        if sym.image.is_null() {
                            log::error!("TLSDESC requires loaded image for symbol: {name}");
                            target.write(0);
                            target.add(1).write(0);
                            return;
                        }
                        let ti = Box::new(TlsIndex {
                            module: (*sym.image).tls_module_id(),
                            offset: (sym_entry.st_value as usize).wrapping_add_signed(addend),
                        });
                        target.write(tlsdesc_resolver as usize);
                        target.add(1).write(&*ti as *const TlsIndex as usize);
                        tls_out.push(ti);
                    },
                    _ => unreachable!(),
                }
            }

            other => {
                log::error!(
                    "unsupported relocation type: {} ({other})",
                    arch::rel_type_to_str(other)
                );
            }
        }
    }
}

impl Drop for Linker {
    fn drop(&mut self) {
        if self.is_linked {
            self.destroy();
        }
    }
}

/// Find the dynamic section of a mapped image.
fn dynamic_ptr(image: &ElfImage) -> Option<*const Dyn> {
    image
        .phdrs()
        .iter()
        .find(|p| p.p_type == PT_DYNAMIC)
        .map(|p| image.vaddr_to_runtime(p.p_vaddr as usize) as *const Dyn)
}

fn parse_reloc_tables(image: &ElfImage) -> Option<RelocTables> {
    let dyn_ptr = dynamic_ptr(image)?;
    let mut tables = RelocTables::default();

    let mut d = dyn_ptr;
    unsafe {
        while (*d).d_tag != DT_NULL {
            let entry = &*d;
            let ptr = image.vaddr_to_runtime(entry.d_un as usize);
            let val = entry.d_un as usize;
            match entry.d_tag {
                DT_RELA => tables.rela = ptr,
                DT_RELASZ => tables.rela_sz = val,
                DT_RELAENT => tables.rela_ent = val,
                DT_REL => tables.rel = ptr,
                DT_RELSZ => tables.rel_sz = val,
                DT_RELENT => tables.rel_ent = val,
                DT_RELR => tables.relr = ptr,
                DT_RELRSZ => tables.relr_sz = val,
                DT_JMPREL => tables.jmprel = ptr,
                DT_PLTRELSZ => tables.jmprel_sz = val,
                DT_PLTREL => tables.pltrel_type = entry.d_un as i64,
                DT_SYMTAB => tables.dynsym = ptr,
                DT_STRTAB => tables.dynstr = ptr,
                DT_ANDROID_RELA => {
                    tables.android_reloc = ptr;
                    tables.is_android_rela = true;
                }
                DT_ANDROID_RELASZ | DT_ANDROID_RELSZ => tables.android_reloc_sz = val,
                DT_ANDROID_REL => tables.android_reloc = ptr,
                DT_ANDROID_RELR => tables.relr = ptr,
                DT_ANDROID_RELRSZ => tables.relr_sz = val,
                DT_ANDROID_RELRENT => {
                    if val != size_of::<usize>() {
                        tables.android_relr_ent_bad = true;
                    }
                }
                _ => {}
            }
            d = d.add(1);
        }
    }
    Some(tables)
}

/// Collect the image's `DT_NEEDED` names, preferring the runtime
/// `DT_STRTAB` and falling back to the section-header string table.
fn collect_needed(image: &ElfImage, seen: &mut HashSet<String>, out: &mut Vec<String>) {
    let Some(dyn_ptr) = dynamic_ptr(image) else {
        return;
    };

    let mut strtab: Option<usize> = None;
    let mut needed_offsets: Vec<usize> = Vec::new();
    let mut d = dyn_ptr;
    unsafe {
        while (*d).d_tag != DT_NULL {
            let entry = &*d;
            match entry.d_tag {
                DT_STRTAB => strtab = Some(image.vaddr_to_runtime(entry.d_un as usize)),
                DT_NEEDED => needed_offsets.push(entry.d_un as usize),
                _ => {}
            }
            d = d.add(1);
        }
    }

    for off in needed_offsets {
        let name = match strtab {
            Some(strtab) => unsafe { CStr::from_ptr((strtab + off) as *const c_char) }
                .to_string_lossy()
                .into_owned(),
            None => match image.dynstr_file_off() {
                Some(base) => image
                    .cstr_at_file_off(base + off)
                    .to_string_lossy()
                    .into_owned(),
                None => continue,
            },
        };
        if seen.insert(name.clone()) {
            out.push(name);
        }
    }
}

fn file_exists(path: &str) -> bool {
    let Ok(cpath) = CString::new(path) else {
        return false;
    };
    unsafe { libc::access(cpath.as_ptr(), libc::F_OK) == 0 }
}

/// Resolve a `DT_NEEDED` name against the system library roots.
///
/// Absolute names bypass the search. `libc++.so` prefers the APEX copy
/// over the system one.
pub fn find_library_path(name: &str) -> Option<String> {
    if name.starts_with('/') {
        if file_exists(name) {
            return Some(name.to_string());
        }
        log::error!("library not found at absolute path: {name}");
        return None;
    }

    if name == "libc++.so" {
        for candidate in [
            "/apex/com.android.runtime/lib64/libc++.so",
            "/system/lib64/libc++.so",
        ] {
            if file_exists(candidate) {
                return Some(candidate.to_string());
            }
        }
    }

    for dir in SEARCH_PATHS {
        let candidate = format!("{dir}{name}");
        if file_exists(&candidate) {
            log::debug!("found library: {candidate}");
            return Some(candidate);
        }
    }

    log::error!("library not found: {name}");
    None
}

// Phase 3: non-writable PT_LOAD ranges become READ|WRITE (EXEC preserved)
// so relocation can patch them.
fn make_writable(image: &ElfImage) {
    for phdr in image.phdrs() {
        if phdr.p_type != PT_LOAD || phdr.p_flags & PF_W != 0 {
            continue;
        }
        let start = page_start(image.vaddr_to_runtime(phdr.p_vaddr as usize));
        let len =
            page_end(phdr.p_vaddr as usize + phdr.p_memsz as usize) - page_start(phdr.p_vaddr as usize);

        let mut prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
        if phdr.p_flags & PF_X != 0 {
            prot |= ProtFlags::PROT_EXEC;
        }
        if let Err(err) = unsafe { mmap::mprotect(start, len, prot) } {
            log::warn!("failed to make segment writable: {err}");
        }
    }
}

// Phase 5: per page, OR the protections of every segment covering it (a
// page spanned by RX and R becomes RX), apply one mprotect per page, and
// flush the instruction cache over executable pages.
fn restore_protections(image: &ElfImage) {
    let mut min_addr = usize::MAX;
    let mut max_addr = 0usize;
    for phdr in image.phdrs() {
        if phdr.p_type != PT_LOAD {
            continue;
        }
        let seg_start = image.vaddr_to_runtime(phdr.p_vaddr as usize);
        let seg_end = seg_start + phdr.p_memsz as usize;
        min_addr = min_addr.min(seg_start);
        max_addr = max_addr.max(seg_end);
    }
    if min_addr >= max_addr {
        return;
    }

    let start_page = page_start(min_addr);
    let end_page = page_end(max_addr);
    let pg_size = page_size();
    let num_pages = (end_page - start_page) / pg_size;
    if num_pages == 0 {
        return;
    }

    let mut page_prots = vec![ProtFlags::PROT_NONE; num_pages];
    for phdr in image.phdrs() {
        if phdr.p_type != PT_LOAD {
            continue;
        }
        let prot = segment::map_prot(phdr.p_flags);
        let seg_start = image.vaddr_to_runtime(phdr.p_vaddr as usize);
        let seg_end = seg_start + phdr.p_memsz as usize;

        let mut cur_page = page_start(seg_start);
        while cur_page < page_end(seg_end) {
            let idx = (cur_page - start_page) / pg_size;
            if idx < num_pages {
                page_prots[idx] |= prot;
            }
            cur_page += pg_size;
        }
    }

    for (i, prot) in page_prots.iter().enumerate() {
        if *prot == ProtFlags::PROT_NONE {
            continue;
        }
        let page_addr = start_page + i * pg_size;
        if let Err(err) = unsafe { mmap::mprotect(page_addr, pg_size, *prot) } {
            log::warn!("failed to restore protection at {page_addr:#x}: {err}");
        }
        if prot.contains(ProtFlags::PROT_EXEC) {
            arch::flush_instruction_cache(page_addr, pg_size);
        }
    }
}

type InitFunc = unsafe extern "C" fn();
type CtorFunc = unsafe extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char);
type DtorFunc = unsafe extern "C" fn();

/// Process-entry values handed to `DT_INIT_ARRAY` functions.
#[derive(Debug, Clone, Copy)]
pub struct InitParams {
    pub argc: c_int,
    pub argv: *mut *mut c_char,
    pub envp: *mut *mut c_char,
}

impl Default for InitParams {
    fn default() -> Self {
        InitParams {
            argc: 0,
            argv: core::ptr::null_mut(),
            envp: core::ptr::null_mut(),
        }
    }
}

unsafe impl Send for InitParams {}

// Phase 7 per image: DT_INIT, then each DT_INIT_ARRAY entry in order.
fn call_constructors(image: &ElfImage, params: InitParams) {
    if let Some(addr) = image.init_fn() {
        log::debug!("calling .init for {}", image.path());
        let init: InitFunc = unsafe { core::mem::transmute(addr) };
        unsafe { init() };
    }
    if let Some((array, count)) = image.init_array() {
        log::debug!("calling .init_array for {}", image.path());
        for i in 0..count {
            let addr = unsafe { (array as *const usize).add(i).read() };
            let ctor: CtorFunc = unsafe { core::mem::transmute(addr) };
            unsafe { ctor(params.argc, params.argv, params.envp) };
        }
    }
}

// Teardown per image: DT_FINI_ARRAY in reverse, then DT_FINI.
fn call_destructors(image: &ElfImage) {
    if let Some((array, count)) = image.fini_array() {
        for i in (0..count).rev() {
            let addr = unsafe { (array as *const usize).add(i).read() };
            let dtor: DtorFunc = unsafe { core::mem::transmute(addr) };
            unsafe { dtor() };
        }
    }
    if let Some(addr) = image.fini_fn() {
        let fini: InitFunc = unsafe { core::mem::transmute(addr) };
        unsafe { fini() };
    }
}
