//! AArch64 definitions used by the relocation dispatcher.

use elf::abi::EM_AARCH64;

pub const EM_ARCH: u16 = EM_AARCH64;

pub type Ehdr = elf::file::Elf64_Ehdr;
pub type Phdr = elf::segment::Elf64_Phdr;
pub type Shdr = elf::section::Elf64_Shdr;
pub type Dyn = elf::dynamic::Elf64_Dyn;
pub type Sym = elf::symbol::Elf64_Sym;
pub type Rel = elf::relocation::Elf64_Rel;
pub type Rela = elf::relocation::Elf64_Rela;

pub const EHDR_SIZE: usize = size_of::<Ehdr>();
pub const PHDR_SIZE: usize = size_of::<Phdr>();

/// Field-wise copy of a program header (the raw type is not `Clone`).
pub fn clone_phdr(phdr: &Phdr) -> Phdr {
    Phdr {
        p_type: phdr.p_type,
        p_flags: phdr.p_flags,
        p_offset: phdr.p_offset,
        p_vaddr: phdr.p_vaddr,
        p_paddr: phdr.p_paddr,
        p_filesz: phdr.p_filesz,
        p_memsz: phdr.p_memsz,
        p_align: phdr.p_align,
    }
}

#[inline]
pub const fn elf_st_type(info: u8) -> u8 {
    info & 0xf
}

#[inline]
pub const fn elf_st_bind(info: u8) -> u8 {
    info >> 4
}

#[inline]
pub const fn elf_r_type(info: u64) -> u32 {
    info as u32
}

#[inline]
pub const fn elf_r_sym(info: u64) -> u32 {
    (info >> 32) as u32
}

// Dynamic relocation types for EM_AARCH64. Declared here because the
// dispatcher needs the full set in one place, including numbers missing
// from `elf::abi`.
pub const R_AARCH64_NONE: u32 = 0;
pub const R_AARCH64_ABS64: u32 = 257;
pub const R_AARCH64_COPY: u32 = 1024;
pub const R_AARCH64_GLOB_DAT: u32 = 1025;
pub const R_AARCH64_JUMP_SLOT: u32 = 1026;
pub const R_AARCH64_RELATIVE: u32 = 1027;
pub const R_AARCH64_TLS_DTPMOD: u32 = 1028;
pub const R_AARCH64_TLS_DTPREL: u32 = 1029;
pub const R_AARCH64_TLS_TPREL: u32 = 1030;
pub const R_AARCH64_TLSDESC: u32 = 1031;
pub const R_AARCH64_IRELATIVE: u32 = 1032;

// GNU RELR relocation table.
pub const DT_RELR: i64 = 36;
pub const DT_RELRSZ: i64 = 35;
pub const DT_RELRENT: i64 = 37;

// Android packed relocations (SLEB128 "APS2" streams).
pub const DT_ANDROID_REL: i64 = 0x6000000d;
pub const DT_ANDROID_RELA: i64 = 0x6000000f;
pub const DT_ANDROID_RELSZ: i64 = 0x60000010;
pub const DT_ANDROID_RELASZ: i64 = 0x60000011;

// Android RELR variant (pre-standardization tag numbers).
pub const DT_ANDROID_RELR: i64 = 0x6fffe000;
pub const DT_ANDROID_RELRSZ: i64 = 0x6fffe001;
pub const DT_ANDROID_RELRENT: i64 = 0x6fffe003;

/// Argument block passed to AArch64 IFUNC resolvers.
///
/// Resolvers receive `hwcap | (1 << 62)` in the first argument register and
/// a pointer to this block in the second; the high bit flags that the block
/// is present.
#[repr(C)]
pub struct IfuncArg {
    pub size: u64,
    pub hwcap: u64,
    pub hwcap2: u64,
}

pub const IFUNC_ARG_HWCAP: u64 = 1 << 62;

type IfuncResolver = unsafe extern "C" fn(u64, *const IfuncArg) -> usize;

/// Invoke the IFUNC resolver at `resolver_addr` and return the address it
/// selects.
///
/// # Safety
/// `resolver_addr` must be the entry point of a resolver function inside a
/// fully relocated, executable mapping.
pub unsafe fn call_ifunc_resolver(resolver_addr: usize) -> usize {
    let arg = IfuncArg {
        size: size_of::<IfuncArg>() as u64,
        hwcap: unsafe { libc::getauxval(libc::AT_HWCAP) as u64 },
        hwcap2: unsafe { libc::getauxval(libc::AT_HWCAP2) as u64 },
    };
    let resolver: IfuncResolver = unsafe { core::mem::transmute(resolver_addr) };
    unsafe { resolver(arg.hwcap | IFUNC_ARG_HWCAP, &arg) }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        unsafe extern "C" {
            // Provided by compiler-rt/libgcc on AArch64.
            fn __clear_cache(start: *mut core::ffi::c_char, end: *mut core::ffi::c_char);
        }

        /// Flush the instruction cache after writing executable pages.
        pub fn flush_instruction_cache(addr: usize, len: usize) {
            unsafe { __clear_cache(addr as _, (addr + len) as _) };
        }
    } else {
        /// Flush the instruction cache after writing executable pages.
        ///
        /// Coherent instruction fetch on non-AArch64 hosts makes this a
        /// no-op; it exists so format-level code paths stay testable
        /// off-target.
        pub fn flush_instruction_cache(_addr: usize, _len: usize) {}
    }
}

/// Human readable relocation type name, for diagnostics.
pub fn rel_type_to_str(r_type: u32) -> &'static str {
    match r_type {
        R_AARCH64_NONE => "R_AARCH64_NONE",
        R_AARCH64_ABS64 => "R_AARCH64_ABS64",
        R_AARCH64_COPY => "R_AARCH64_COPY",
        R_AARCH64_GLOB_DAT => "R_AARCH64_GLOB_DAT",
        R_AARCH64_JUMP_SLOT => "R_AARCH64_JUMP_SLOT",
        R_AARCH64_RELATIVE => "R_AARCH64_RELATIVE",
        R_AARCH64_TLS_DTPMOD => "R_AARCH64_TLS_DTPMOD",
        R_AARCH64_TLS_DTPREL => "R_AARCH64_TLS_DTPREL",
        R_AARCH64_TLS_TPREL => "R_AARCH64_TLS_TPREL",
        R_AARCH64_TLSDESC => "R_AARCH64_TLSDESC",
        R_AARCH64_IRELATIVE => "R_AARCH64_IRELATIVE",
        _ => "R_AARCH64_UNKNOWN",
    }
}
