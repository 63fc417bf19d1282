//! Mapping of `PT_LOAD` segments into reserved address space.

use crate::arch::{EHDR_SIZE, Ehdr, Phdr};
use crate::image::RawFile;
use crate::mmap::{self, MapFlags, ProtFlags, page_end, page_start};
use crate::{Result, map_error};
use core::ffi::c_void;
use core::mem::MaybeUninit;
use core::ptr::NonNull;
use elf::abi::{PF_R, PF_W, PF_X, PT_LOAD};

/// An owned mapping backing one manually loaded library.
///
/// Dropping the value unmaps the whole reservation, including every
/// per-segment mapping placed inside it.
pub struct LibraryMapping {
    memory: NonNull<c_void>,
    len: usize,
}

impl LibraryMapping {
    #[inline]
    pub fn base(&self) -> usize {
        self.memory.as_ptr() as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for LibraryMapping {
    fn drop(&mut self) {
        if let Err(err) = unsafe { mmap::munmap(self.memory, self.len) } {
            log::warn!("failed to unmap library at {:#x}: {err}", self.base());
        }
    }
}

unsafe impl Send for LibraryMapping {}

/// Protection flags requested by a program header.
pub(crate) fn map_prot(p_flags: u32) -> ProtFlags {
    let mut prot = ProtFlags::PROT_NONE;
    if p_flags & PF_R != 0 {
        prot |= ProtFlags::PROT_READ;
    }
    if p_flags & PF_W != 0 {
        prot |= ProtFlags::PROT_WRITE;
    }
    if p_flags & PF_X != 0 {
        prot |= ProtFlags::PROT_EXEC;
    }
    prot
}

/// Page-aligned span covering every `PT_LOAD`: `(lowest vaddr, total size)`.
pub fn load_size(phdrs: &[Phdr]) -> Option<(usize, usize)> {
    let mut lo = usize::MAX;
    let mut hi = 0usize;
    for phdr in phdrs {
        if phdr.p_type != PT_LOAD {
            continue;
        }
        lo = lo.min(phdr.p_vaddr as usize);
        hi = hi.max((phdr.p_vaddr + phdr.p_memsz) as usize);
    }
    if lo > hi {
        return None;
    }
    let lo = page_start(lo);
    let hi = page_end(hi);
    Some((lo, hi - lo))
}

/// Map the library at `path` into fresh address space.
///
/// Reserves one contiguous `PROT_NONE` region covering all `PT_LOAD`
/// segments, then maps each segment into it with its requested protection.
/// A segment asking for both `W` and `X` is first mapped without `X` so its
/// page tail can be zeroed, then reprotected.
pub fn map_library(path: &str) -> Result<LibraryMapping> {
    let file = RawFile::open(path)?;

    let mut ehdr = MaybeUninit::<Ehdr>::uninit();
    let ehdr_bytes = unsafe {
        core::slice::from_raw_parts_mut(ehdr.as_mut_ptr() as *mut u8, EHDR_SIZE)
    };
    file.read_exact(ehdr_bytes, 0)?;
    let ehdr = unsafe { ehdr.assume_init() };

    let phnum = ehdr.e_phnum as usize;
    let mut phdrs: Vec<Phdr> = Vec::with_capacity(phnum);
    let phdr_bytes = unsafe {
        core::slice::from_raw_parts_mut(
            phdrs.as_mut_ptr() as *mut u8,
            phnum * size_of::<Phdr>(),
        )
    };
    file.read_exact(phdr_bytes, ehdr.e_phoff as usize)?;
    unsafe { phdrs.set_len(phnum) };

    let Some((min_vaddr, map_size)) = load_size(&phdrs) else {
        return Err(map_error(format!("no loadable segments: {path}")));
    };

    let memory = mmap::mmap_reserve(map_size)?;
    let mapping = LibraryMapping {
        memory,
        len: map_size,
    };
    let bias = mapping.base().wrapping_sub(min_vaddr);

    for phdr in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
        map_segment(&file, phdr, bias)?;
    }

    Ok(mapping)
}

fn map_segment(file: &RawFile, phdr: &Phdr, bias: usize) -> Result<()> {
    let seg_start = phdr.p_vaddr as usize + bias;
    let seg_end = seg_start + phdr.p_memsz as usize;
    let file_end = seg_start + phdr.p_filesz as usize;

    let pg_start = page_start(seg_start);
    let pg_end = page_end(seg_end);
    let file_page = page_start(phdr.p_offset as usize);
    let file_len = page_end(phdr.p_offset as usize + phdr.p_filesz as usize) - file_page;

    let prot = map_prot(phdr.p_flags);
    // W+X pages are mapped without X until their tail has been zeroed.
    let needs_exec_restore =
        prot.contains(ProtFlags::PROT_WRITE) && prot.contains(ProtFlags::PROT_EXEC);
    let map_prot = if needs_exec_restore {
        prot.difference(ProtFlags::PROT_EXEC)
    } else {
        prot
    };

    if file_len > 0 {
        unsafe {
            mmap::mmap(
                Some(pg_start),
                file_len,
                map_prot,
                MapFlags::MAP_FIXED | MapFlags::MAP_PRIVATE,
                file.fd(),
                file_page,
            )?;
        }
    }

    // Pages past the file-backed portion hold BSS.
    if pg_end > pg_start + file_len {
        let bss_addr = pg_start + file_len;
        let bss_size = pg_end - bss_addr;
        unsafe {
            mmap::mmap_anonymous(
                bss_addr,
                bss_size,
                map_prot,
                MapFlags::MAP_FIXED | MapFlags::MAP_PRIVATE,
            )?;
        }
    }

    // A writable segment whose file content ends mid-page keeps stale file
    // bytes there; zero them.
    if phdr.p_flags & PF_W != 0 && file_end < seg_end {
        let zero_len = (page_end(file_end) - file_end).min(seg_end - file_end);
        unsafe { (file_end as *mut u8).write_bytes(0, zero_len) };
    }

    if needs_exec_restore {
        unsafe { mmap::mprotect(pg_start, pg_end - pg_start, prot)? };
    }

    Ok(())
}
