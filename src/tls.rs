//! Thread-local storage for manually loaded libraries.
//!
//! A process-wide table assigns dense module ids to registered `PT_TLS`
//! segments and lays them out in one static block. Each thread lazily
//! allocates its own copy of that block on first TLS access; the block is
//! freed by a pthread key destructor when the thread exits.
//!
//! Registration happens on the loading thread before any code from the
//! library runs, so a secondary thread's first TLS access always observes a
//! fully registered table.

use crate::image::ElfImage;
use crate::loader::Runtime;
use crate::mmap::page_size;
use core::ffi::c_void;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub const MAX_TLS_MODULES: usize = 128;

/// A dynamic TLS reference: module id plus offset within the module.
///
/// Heap records of this type are pointed to from TLSDESC GOT slots.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsIndex {
    pub module: usize,
    pub offset: usize,
}

/// The `PT_TLS` facts a registration needs.
#[derive(Debug, Clone, Copy)]
pub struct TlsSegment {
    pub align: usize,
    pub memsz: usize,
    pub filesz: usize,
    /// Runtime address of the initialization image inside the mapped
    /// library.
    pub init_image: usize,
    /// Identity of the owning image (its base address); nulled on
    /// unregistration.
    pub owner: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct TlsModule {
    module_id: usize,
    align: usize,
    memsz: usize,
    filesz: usize,
    offset: usize,
    init_image: usize,
    owner: usize,
}

/// Module registry and static-block layout. Slot 0 is reserved: module id 0
/// means "no TLS".
pub struct TlsModuleTable {
    modules: [TlsModule; MAX_TLS_MODULES],
    generation: usize,
    static_size: usize,
    static_align_max: usize,
}

impl Default for TlsModuleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsModuleTable {
    pub fn new() -> TlsModuleTable {
        TlsModuleTable {
            modules: [TlsModule::default(); MAX_TLS_MODULES],
            generation: 0,
            static_size: 0,
            static_align_max: 1,
        }
    }

    /// Register a TLS segment, returning its assigned module id.
    ///
    /// Offsets are handed out sequentially, each aligned up to the
    /// module's alignment; `static_size` only ever grows. Returns `None`
    /// when all slots are taken.
    pub fn register(&mut self, seg: TlsSegment) -> Option<usize> {
        let mod_id = (1..MAX_TLS_MODULES).find(|&i| self.modules[i].module_id == 0)?;
        let align = seg.align.max(1);

        self.static_size = (self.static_size + align - 1) & !(align - 1);
        let module = &mut self.modules[mod_id];
        module.module_id = mod_id;
        module.align = align;
        module.memsz = seg.memsz;
        module.filesz = seg.filesz;
        module.init_image = seg.init_image;
        module.owner = seg.owner;
        module.offset = self.static_size;
        self.static_size += seg.memsz;

        self.static_align_max = self.static_align_max.max(align);
        Some(mod_id)
    }

    /// Release the slot owned by `owner`.
    pub fn unregister(&mut self, owner: usize) {
        for module in self.modules[1..].iter_mut() {
            if module.owner == owner && module.module_id != 0 {
                *module = TlsModule::default();
                break;
            }
        }
    }

    /// Validated offset of `(module, offset)` inside the static block.
    pub fn block_offset(&self, module: usize, offset: usize) -> Option<usize> {
        if module == 0 || module >= MAX_TLS_MODULES {
            log::error!("tls module id out of range: {module}");
            return None;
        }
        let m = &self.modules[module];
        if m.module_id == 0 {
            log::error!("tls module {module} not registered");
            return None;
        }
        let total = m.offset + offset;
        if total >= self.static_size {
            log::error!("tls offset out of bounds: {total} >= {}", self.static_size);
            return None;
        }
        Some(total)
    }

    pub fn bump_generation(&mut self) {
        self.generation += 1;
    }

    #[inline]
    pub fn generation(&self) -> usize {
        self.generation
    }

    #[inline]
    pub fn static_size(&self) -> usize {
        self.static_size
    }

    #[inline]
    pub fn static_align_max(&self) -> usize {
        self.static_align_max
    }
}

static TLS_BLOCK_COUNT: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn tls_block_destructor(block: *mut c_void) {
    if !block.is_null() {
        unsafe { libc::free(block) };
        TLS_BLOCK_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Process-wide TLS manager: the module table plus the per-thread block
/// allocator behind a pthread key.
pub struct TlsManager {
    table: Mutex<TlsModuleTable>,
    key: libc::pthread_key_t,
}

impl TlsManager {
    pub(crate) fn new() -> TlsManager {
        let mut key: libc::pthread_key_t = 0;
        let ret = unsafe { libc::pthread_key_create(&mut key, Some(tls_block_destructor)) };
        if ret != 0 {
            log::error!("failed to create tls key: {ret}");
        }
        TlsManager {
            table: Mutex::new(TlsModuleTable::new()),
            key,
        }
    }

    /// Register `image`'s `PT_TLS` segment (a no-op without one) and record
    /// the assigned module id on the image.
    pub fn register_image(&self, image: &mut ElfImage) -> bool {
        let Some(tls) = image.tls_phdr() else {
            return true;
        };
        let seg = TlsSegment {
            align: tls.p_align.max(1) as usize,
            memsz: tls.p_memsz as usize,
            filesz: tls.p_filesz as usize,
            init_image: image.vaddr_to_runtime(tls.p_vaddr as usize),
            owner: image.base(),
        };
        let mut table = self.table.lock().unwrap();
        match table.register(seg) {
            Some(mod_id) => {
                drop(table);
                image.set_tls_module_id(mod_id);
                log::debug!("registered tls module {mod_id} for {}", image.path());
                true
            }
            None => {
                log::error!("tls module overflow");
                false
            }
        }
    }

    pub fn unregister_image(&self, image: &ElfImage) {
        self.table.lock().unwrap().unregister(image.base());
    }

    pub fn bump_generation(&self) {
        self.table.lock().unwrap().bump_generation();
    }

    pub fn generation(&self) -> usize {
        self.table.lock().unwrap().generation()
    }

    /// The calling thread's TLS block base, allocating it on first use.
    /// Returns null only when allocation fails.
    pub fn thread_block(&self) -> *mut u8 {
        let table = self.table.lock().unwrap();
        self.block_for_thread(&table)
    }

    /// Address of `(module, offset)` in the calling thread's block.
    pub fn address_of(&self, ti: &TlsIndex) -> *mut u8 {
        let table = self.table.lock().unwrap();
        let block = self.block_for_thread(&table);
        if block.is_null() {
            return core::ptr::null_mut();
        }
        match table.block_offset(ti.module, ti.offset) {
            Some(off) => unsafe { block.add(off) },
            None => core::ptr::null_mut(),
        }
    }

    fn block_for_thread(&self, table: &TlsModuleTable) -> *mut u8 {
        let block = unsafe { libc::pthread_getspecific(self.key) };
        if !block.is_null() {
            return block as *mut u8;
        }
        self.allocate_block(table)
    }

    fn allocate_block(&self, table: &TlsModuleTable) -> *mut u8 {
        let mut align = table.static_align_max().max(size_of::<*mut c_void>());
        // Alignment above page size cannot be honored by posix_memalign.
        align = align.min(page_size());
        let mut total = table.static_size() + align;
        if total == 0 {
            total = size_of::<*mut c_void>();
        }

        let mut block: *mut c_void = core::ptr::null_mut();
        if unsafe { libc::posix_memalign(&mut block, align, total) } != 0 {
            log::error!("failed to allocate tls block of {total} bytes");
            return core::ptr::null_mut();
        }
        unsafe { (block as *mut u8).write_bytes(0, total) };

        for module in table.modules[1..].iter() {
            if module.module_id == 0 || module.init_image == 0 || module.filesz == 0 {
                continue;
            }
            if module.offset + module.filesz <= total {
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        module.init_image as *const u8,
                        (block as *mut u8).add(module.offset),
                        module.filesz,
                    );
                }
            } else {
                log::error!("tls module {} offset out of bounds", module.module_id);
            }
        }

        unsafe { libc::pthread_setspecific(self.key, block) };
        TLS_BLOCK_COUNT.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "allocated tls block {block:p}, size {total}, live blocks: {}",
            TLS_BLOCK_COUNT.load(Ordering::Relaxed)
        );
        block as *mut u8
    }
}

/// Dynamic TLS accessor for traditionally-compiled modules.
///
/// A null index returns the calling thread's block base.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __tls_get_addr(ti: *mut TlsIndex) -> *mut c_void {
    let tls = &Runtime::global().tls;
    if ti.is_null() {
        return tls.thread_block() as *mut c_void;
    }
    tls.address_of(unsafe { &*ti }) as *mut c_void
}

/// TLSDESC resolver installed into GOT descriptor pairs.
///
/// Entered with the address of the two-word descriptor; the second word
/// holds the `TlsIndex`. Returns the offset of the addressed datum from the
/// thread's TLS block base.
pub unsafe extern "C" fn tlsdesc_resolver(desc: *const usize) -> usize {
    let ti = unsafe { *desc.add(1) } as *const TlsIndex;
    if ti.is_null() {
        return 0;
    }
    let tls = &Runtime::global().tls;
    let addr = tls.address_of(unsafe { &*ti });
    let base = tls.thread_block();
    if addr.is_null() || base.is_null() {
        return 0;
    }
    (addr as usize).wrapping_sub(base as usize)
}
