//! Thin memory-mapping layer over libc.

use crate::{Result, map_error};
use bitflags::bitflags;
use core::ffi::{c_int, c_void};
use core::ptr::NonNull;
use std::sync::OnceLock;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Desired memory protection of a memory mapping.
    pub struct ProtFlags: c_int {
        /// Pages cannot be accessed.
        const PROT_NONE = libc::PROT_NONE;
        /// Pages can be read.
        const PROT_READ = libc::PROT_READ;
        /// Pages can be written.
        const PROT_WRITE = libc::PROT_WRITE;
        /// Pages can be executed.
        const PROT_EXEC = libc::PROT_EXEC;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug)]
    /// Additional parameters for [`mmap`].
    pub struct MapFlags: c_int {
        /// Create a private copy-on-write mapping.
        const MAP_PRIVATE = libc::MAP_PRIVATE;
        /// Place the mapping at exactly the address specified in `addr`.
        const MAP_FIXED = libc::MAP_FIXED;
        /// The mapping is not backed by any file.
        const MAP_ANONYMOUS = libc::MAP_ANONYMOUS;
    }
}

/// Map `len` bytes of `fd` at file offset `offset`.
///
/// # Safety
/// With `MAP_FIXED` the caller must own the target address range.
pub unsafe fn mmap(
    addr: Option<usize>,
    len: usize,
    prot: ProtFlags,
    flags: MapFlags,
    fd: i32,
    offset: usize,
) -> Result<NonNull<c_void>> {
    let ptr = unsafe {
        libc::mmap(
            addr.unwrap_or(0) as _,
            len,
            prot.bits(),
            flags.bits(),
            fd,
            offset as _,
        )
    };
    if core::ptr::eq(ptr, libc::MAP_FAILED) {
        return Err(map_error("mmap failed"));
    }
    Ok(unsafe { NonNull::new_unchecked(ptr) })
}

/// Create an anonymous mapping at `addr`.
///
/// # Safety
/// With `MAP_FIXED` the caller must own the target address range.
pub unsafe fn mmap_anonymous(
    addr: usize,
    len: usize,
    prot: ProtFlags,
    flags: MapFlags,
) -> Result<NonNull<c_void>> {
    let ptr = unsafe {
        libc::mmap(
            addr as _,
            len,
            prot.bits(),
            (flags | MapFlags::MAP_ANONYMOUS).bits(),
            -1,
            0,
        )
    };
    if core::ptr::eq(ptr, libc::MAP_FAILED) {
        return Err(map_error("mmap anonymous failed"));
    }
    Ok(unsafe { NonNull::new_unchecked(ptr) })
}

/// Reserve `len` bytes of address space without committing storage.
///
/// The reservation is `PROT_NONE`; per-segment mappings later overwrite it
/// with `MAP_FIXED`.
pub fn mmap_reserve(len: usize) -> Result<NonNull<c_void>> {
    unsafe {
        mmap_anonymous(
            0,
            len,
            ProtFlags::PROT_NONE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
        )
    }
}

/// # Safety
/// `addr..addr+len` must be a mapping owned by the caller.
pub unsafe fn munmap(addr: NonNull<c_void>, len: usize) -> Result<()> {
    let res = unsafe { libc::munmap(addr.as_ptr(), len) };
    if res != 0 {
        return Err(map_error("munmap failed"));
    }
    Ok(())
}

/// # Safety
/// `addr..addr+len` must be a mapping owned by the caller.
pub unsafe fn mprotect(addr: usize, len: usize, prot: ProtFlags) -> Result<()> {
    let res = unsafe { libc::mprotect(addr as _, len, prot.bits()) };
    if res != 0 {
        return Err(map_error("mprotect failed"));
    }
    Ok(())
}

/// The system page size.
///
/// # Panics
/// Panics if the page size cannot be determined; nothing in the loader can
/// proceed without it.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if ps <= 0 {
            panic!("failed to get system page size");
        }
        ps as usize
    })
}

/// Round `addr` down to the containing page boundary.
#[inline]
pub fn page_start(addr: usize) -> usize {
    addr & !(page_size() - 1)
}

/// Round `addr` up to the next page boundary.
#[inline]
pub fn page_end(addr: usize) -> usize {
    page_start(addr + page_size() - 1)
}
