//! Backtrace collaborator: publishes loaded images into a custom
//! `dl_iterate_phdr`/`dladdr` chain and hands unwind tables to the
//! language runtime.
//!
//! Host unwinders only know about libraries the system linker loaded. The
//! registry below keeps a copy of each manually loaded image's program
//! headers; the custom walkers first delegate to the host functions and
//! then append the registered entries, so stack unwinding and
//! symbolization see manually loaded code too. The linker rewrites GOT
//! references to `dl_iterate_phdr`/`dladdr` in loaded libraries to the two
//! functions at the bottom of this file.

use crate::arch::{Phdr, clone_phdr};
use crate::image::ElfImage;
use crate::loader::Runtime;
use core::ffi::{c_char, c_int, c_void};
use elf::abi::PT_LOAD;
use std::ffi::CString;
use std::sync::{Mutex, OnceLock};

pub const MAX_CUSTOM_LIBS: usize = 64;

struct LibEntry {
    image: *const ElfImage,
    /// `dlpi_addr` of the published record: the image's load bias.
    load_bias: usize,
    name: CString,
    phdrs: Box<[Phdr]>,
    tls_modid: usize,
    eh_frame_registered: Option<usize>,
}

unsafe impl Send for LibEntry {}

type DlIterateCb =
    unsafe extern "C" fn(*mut libc::dl_phdr_info, libc::size_t, *mut c_void) -> c_int;

/// Fixed-size table of published libraries, guarded by one mutex so
/// concurrent unwinds from arbitrary threads stay safe.
pub struct BacktraceRegistry {
    libs: Mutex<[Option<LibEntry>; MAX_CUSTOM_LIBS]>,
}

impl BacktraceRegistry {
    pub(crate) fn new() -> BacktraceRegistry {
        BacktraceRegistry {
            libs: Mutex::new(std::array::from_fn(|_| None)),
        }
    }

    /// Publish `image`'s program headers into the custom phdr walk.
    ///
    /// The caller must unregister before the image is dropped.
    pub fn register_library(&self, image: &ElfImage) -> bool {
        let mut libs = self.libs.lock().unwrap();
        let Some(slot) = libs.iter_mut().find(|slot| slot.is_none()) else {
            log::error!("no slots for library registration");
            return false;
        };
        let Ok(name) = CString::new(image.path()) else {
            return false;
        };
        *slot = Some(LibEntry {
            image: image as *const ElfImage,
            load_bias: image.load_bias(),
            name,
            phdrs: image.phdrs().iter().map(clone_phdr).collect(),
            tls_modid: image.tls_module_id(),
            eh_frame_registered: None,
        });
        log::debug!("registered library for backtrace: {}", image.path());
        true
    }

    pub fn unregister_library(&self, image: &ElfImage) -> bool {
        let mut libs = self.libs.lock().unwrap();
        for slot in libs.iter_mut() {
            let matches = slot
                .as_ref()
                .is_some_and(|entry| core::ptr::eq(entry.image, image));
            if matches {
                if let Some(entry) = slot.take() {
                    if let Some(eh_frame) = entry.eh_frame_registered {
                        if let Some(deregister) = frame_fns().1 {
                            unsafe { deregister(eh_frame as *mut c_void) };
                        }
                    }
                }
                log::debug!("unregistered library: {}", image.path());
                return true;
            }
        }
        false
    }

    /// Hand `image`'s unwind table to the runtime's `__register_frame`.
    ///
    /// Prefers the `.eh_frame` section; falls back to decoding the
    /// `PT_GNU_EH_FRAME` header. Images without either are skipped.
    pub fn register_eh_frame(&self, image: &ElfImage) {
        let Some(register) = frame_fns().0 else {
            return;
        };

        let eh_frame = image.eh_frame().map(|(addr, _)| addr).or_else(|| {
            image
                .eh_frame_hdr()
                .and_then(|(addr, size)| parse_eh_frame_hdr(addr, size, image.load_bias()))
        });
        let Some(eh_frame) = eh_frame else {
            log::debug!("no eh_frame found for {}", image.path());
            return;
        };

        unsafe { register(eh_frame as *mut c_void) };

        let mut libs = self.libs.lock().unwrap();
        for slot in libs.iter_mut().flatten() {
            if core::ptr::eq(slot.image, image) {
                slot.eh_frame_registered = Some(eh_frame);
                break;
            }
        }
        log::debug!("registered eh_frame for {} at {eh_frame:#x}", image.path());
    }

    pub fn unregister_eh_frame(&self, image: &ElfImage) {
        let Some(deregister) = frame_fns().1 else {
            return;
        };
        let mut libs = self.libs.lock().unwrap();
        for slot in libs.iter_mut().flatten() {
            if core::ptr::eq(slot.image, image) {
                if let Some(eh_frame) = slot.eh_frame_registered.take() {
                    unsafe { deregister(eh_frame as *mut c_void) };
                }
                break;
            }
        }
    }

    fn iterate(&self, callback: DlIterateCb, data: *mut c_void) -> c_int {
        let libs = self.libs.lock().unwrap();
        for entry in libs.iter().flatten() {
            let mut info: libc::dl_phdr_info = unsafe { core::mem::zeroed() };
            info.dlpi_addr = entry.load_bias as _;
            info.dlpi_name = entry.name.as_ptr();
            info.dlpi_phdr = entry.phdrs.as_ptr() as *const libc::Elf64_Phdr;
            info.dlpi_phnum = entry.phdrs.len() as u16;
            info.dlpi_adds = 1;
            info.dlpi_subs = 0;
            info.dlpi_tls_modid = entry.tls_modid as _;

            let result = unsafe { callback(&mut info, size_of::<libc::dl_phdr_info>(), data) };
            if result != 0 {
                return result;
            }
        }
        0
    }

    fn lookup_addr(&self, addr: usize, info: *mut libc::Dl_info) -> c_int {
        let libs = self.libs.lock().unwrap();
        for entry in libs.iter().flatten() {
            for phdr in entry.phdrs.iter() {
                if phdr.p_type != PT_LOAD {
                    continue;
                }
                let start = entry.load_bias + phdr.p_vaddr as usize;
                let end = start + phdr.p_memsz as usize;
                if addr < start || addr >= end {
                    continue;
                }

                let image = unsafe { &*entry.image };
                let info = unsafe { &mut *info };
                info.dli_fname = entry.name.as_ptr();
                info.dli_fbase = entry.load_bias as *mut c_void;
                match image.symbol_at(addr) {
                    Some((name, sym_addr)) => {
                        info.dli_sname = name.as_ptr() as *const c_char;
                        info.dli_saddr = sym_addr as *mut c_void;
                    }
                    None => {
                        info.dli_sname = core::ptr::null();
                        info.dli_saddr = core::ptr::null_mut();
                    }
                }
                return 1;
            }
        }
        0
    }
}

type FrameFn = unsafe extern "C" fn(*mut c_void);

/// `__register_frame`/`__deregister_frame`, discovered once at runtime.
/// Either may be absent (e.g. pure-C processes without an unwinder).
fn frame_fns() -> (Option<FrameFn>, Option<FrameFn>) {
    static FNS: OnceLock<(usize, usize)> = OnceLock::new();
    let (reg, dereg) = *FNS.get_or_init(|| unsafe {
        let reg = libc::dlsym(libc::RTLD_DEFAULT, c"__register_frame".as_ptr());
        let dereg = libc::dlsym(libc::RTLD_DEFAULT, c"__deregister_frame".as_ptr());
        (reg as usize, dereg as usize)
    });
    unsafe {
        (
            (reg != 0).then(|| core::mem::transmute::<usize, FrameFn>(reg)),
            (dereg != 0).then(|| core::mem::transmute::<usize, FrameFn>(dereg)),
        )
    }
}

// DWARF pointer encodings used by .eh_frame_hdr.
const DW_EH_PE_ABSPTR: u8 = 0x00;
const DW_EH_PE_UDATA2: u8 = 0x02;
const DW_EH_PE_UDATA4: u8 = 0x03;
const DW_EH_PE_UDATA8: u8 = 0x04;
const DW_EH_PE_SDATA2: u8 = 0x0a;
const DW_EH_PE_SDATA4: u8 = 0x0b;
const DW_EH_PE_SDATA8: u8 = 0x0c;
const DW_EH_PE_PCREL: u8 = 0x10;
const DW_EH_PE_DATAREL: u8 = 0x30;
const DW_EH_PE_OMIT: u8 = 0xff;

/// Decode one DWARF-encoded pointer at `p`.
unsafe fn decode_pointer(p: *const u8, encoding: u8, base: usize) -> Option<usize> {
    if encoding == DW_EH_PE_OMIT {
        return None;
    }
    let mut value = match encoding & 0x0f {
        DW_EH_PE_ABSPTR => unsafe { (p as *const usize).read_unaligned() },
        DW_EH_PE_UDATA2 => unsafe { (p as *const u16).read_unaligned() as usize },
        DW_EH_PE_UDATA4 => unsafe { (p as *const u32).read_unaligned() as usize },
        DW_EH_PE_UDATA8 => unsafe { (p as *const u64).read_unaligned() as usize },
        DW_EH_PE_SDATA2 => unsafe { (p as *const i16).read_unaligned() as usize },
        DW_EH_PE_SDATA4 => unsafe { (p as *const i32).read_unaligned() as usize },
        DW_EH_PE_SDATA8 => unsafe { (p as *const i64).read_unaligned() as usize },
        _ => {
            log::warn!("unsupported dwarf encoding: {encoding:#04x}");
            return None;
        }
    };
    if value != 0 {
        match encoding & 0x70 {
            DW_EH_PE_PCREL => value = value.wrapping_add(p as usize),
            DW_EH_PE_DATAREL => value = value.wrapping_add(base),
            _ => {}
        }
    }
    Some(value)
}

/// Extract the `.eh_frame` address from a version-1 `eh_frame_hdr`.
///
/// Layout: version, eh_frame_ptr encoding, fde_count encoding, table
/// encoding, then the encoded eh_frame pointer.
fn parse_eh_frame_hdr(hdr_addr: usize, hdr_size: usize, base: usize) -> Option<usize> {
    if hdr_addr == 0 || hdr_size < 4 {
        return None;
    }
    let hdr = hdr_addr as *const u8;
    let version = unsafe { hdr.read() };
    if version != 1 {
        log::warn!("unsupported eh_frame_hdr version: {version}");
        return None;
    }
    let eh_frame_ptr_enc = unsafe { hdr.add(1).read() };
    if eh_frame_ptr_enc == DW_EH_PE_OMIT {
        return None;
    }
    let value = unsafe { decode_pointer(hdr.add(4), eh_frame_ptr_enc, base) }?;
    (value != 0).then_some(value)
}

/// Replacement `dl_iterate_phdr`: the host walk first, then every
/// registered library. Installed into loaded libraries by GOT interception.
pub unsafe extern "C" fn custom_dl_iterate_phdr(
    callback: Option<DlIterateCb>,
    data: *mut c_void,
) -> c_int {
    let Some(callback) = callback else {
        return 0;
    };
    let result = unsafe { libc::dl_iterate_phdr(Some(callback), data) };
    if result != 0 {
        return result;
    }
    Runtime::global().backtrace.iterate(callback, data)
}

/// Replacement `dladdr`: the host lookup first, then the registered
/// libraries. Installed into loaded libraries by GOT interception.
pub unsafe extern "C" fn custom_dladdr(addr: *const c_void, info: *mut libc::Dl_info) -> c_int {
    if unsafe { libc::dladdr(addr, info) } != 0 {
        return 1;
    }
    if info.is_null() {
        return 0;
    }
    Runtime::global().backtrace.lookup_addr(addr as usize, info)
}
