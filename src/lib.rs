//! A standalone dynamic loader for AArch64 ELF shared objects.
//!
//! `soloader` maps a shared library into the current process without going
//! through the system's dynamic linker: it parses the ELF file, maps the
//! `PT_LOAD` segments, discovers and loads the `DT_NEEDED` closure (adopting
//! libraries the host process already has where possible), performs symbol
//! resolution and relocation, sets up thread-local storage, registers unwind
//! information, runs constructors, and exposes symbols to the caller.
//!
//! # Examples
//! ```no_run
//! use soloader::SoLoader;
//!
//! let mut loader = SoLoader::new();
//! loader.load("/data/local/tmp/libtest.so").unwrap();
//! let add = unsafe { loader.get::<fn(i32, i32) -> i32>("add_numbers").unwrap() };
//! assert_eq!((*add)(10, 20), 30);
//! loader.unload().unwrap();
//! ```
//!
//! The relocation dispatch, IFUNC convention, and TLSDESC layout target
//! AArch64 little-endian ELF64 only. Other architectures, 32-bit ELF, and
//! lazy binding are out of scope.

pub mod arch;
pub mod backtrace;
pub mod hash;
pub mod image;
pub mod leb128;
mod linker;
mod loader;
pub mod mmap;
pub mod reloc;
pub mod segment;
pub mod tls;

use std::fmt::Display;

pub use linker::{InitParams, Linker, LoadedDep, SEARCH_PATHS, SymbolLookup, find_library_path};
pub use loader::{Runtime, SoLoader, Symbol};

#[derive(Debug)]
pub enum Error {
    /// Returned when encountered an io error.
    IoError { msg: String },
    /// Returned when the file is not a loadable AArch64 ELF64 image.
    ParseEhdrError { msg: String },
    MmapError { msg: String },
    RelocateError { msg: String },
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError { msg } => write!(f, "{msg}"),
            Error::ParseEhdrError { msg } => write!(f, "{msg}"),
            Error::MmapError { msg } => write!(f, "{msg}"),
            Error::RelocateError { msg } => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(value: std::io::Error) -> Self {
        Error::IoError {
            msg: value.to_string(),
        }
    }
}

#[cold]
#[inline(never)]
pub(crate) fn io_error(msg: impl ToString) -> Error {
    Error::IoError {
        msg: msg.to_string(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn parse_ehdr_error(msg: impl ToString) -> Error {
    Error::ParseEhdrError {
        msg: msg.to_string(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn map_error(msg: impl ToString) -> Error {
    Error::MmapError {
        msg: msg.to_string(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn relocate_error(msg: impl ToString) -> Error {
    Error::RelocateError {
        msg: msg.to_string(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
