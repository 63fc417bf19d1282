//! The public loader handle and the process-level runtime.

use crate::image::ElfImage;
use crate::linker::{InitParams, Linker};
use crate::backtrace::BacktraceRegistry;
use crate::segment;
use crate::tls::TlsManager;
use crate::{Result, io_error};
use core::ffi::{c_char, c_int, c_void};
use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::NonNull;
use std::ffi::CString;
use std::sync::{Mutex, OnceLock};

/// Process-level loader state: the TLS manager and the backtrace registry.
///
/// Both are observed by code outside the loader's call graph (unwind
/// runtimes, TLSDESC resolvers), so one instance exists per process,
/// constructed on first use and synchronized internally.
pub struct Runtime {
    pub tls: TlsManager,
    pub backtrace: BacktraceRegistry,
    init_params: Mutex<InitParams>,
}

impl Runtime {
    pub fn global() -> &'static Runtime {
        static RUNTIME: OnceLock<Runtime> = OnceLock::new();
        RUNTIME.get_or_init(|| Runtime {
            tls: TlsManager::new(),
            backtrace: BacktraceRegistry::new(),
            init_params: Mutex::new(InitParams::default()),
        })
    }

    /// Supply the process entry values handed to `DT_INIT_ARRAY`
    /// constructors.
    ///
    /// When never called, constructors observe `(0, null, null)`.
    pub fn set_init_params(
        &self,
        argc: c_int,
        argv: *mut *mut c_char,
        envp: *mut *mut c_char,
    ) {
        *self.init_params.lock().unwrap() = InitParams { argc, argv, envp };
    }

    pub(crate) fn init_params(&self) -> InitParams {
        *self.init_params.lock().unwrap()
    }
}

/// A symbol borrowed from a loaded library.
///
/// Dereferences to `T`; for function types this makes the handle directly
/// callable. The borrow keeps the library mapped for as long as the symbol
/// is used.
pub struct Symbol<'lib, T: 'lib> {
    ptr: *mut (),
    pd: PhantomData<&'lib T>,
}

impl<T> Deref for Symbol<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*(&self.ptr as *const *mut () as *const T) }
    }
}

impl<T> Symbol<'_, T> {
    /// The raw symbol address.
    pub fn into_raw(self) -> *const () {
        self.ptr
    }
}

/// A handle owning one manually loaded library.
///
/// One handle owns at most one library at a time; `load` fails while a
/// library is held.
pub struct SoLoader {
    linker: Linker,
    lib_path: String,
}

impl Default for SoLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SoLoader {
    pub fn new() -> SoLoader {
        SoLoader {
            linker: Linker::new(Runtime::global()),
            lib_path: String::new(),
        }
    }

    /// Map, link, and initialize the library at `path`.
    ///
    /// On success the library's constructors have run. `DT_INIT_ARRAY`
    /// functions receive the values from [`Runtime::set_init_params`],
    /// or zero/null when unset.
    pub fn load(&mut self, path: &str) -> Result<()> {
        if self.is_loaded() {
            return Err(io_error(format!(
                "already loaded a library: {}",
                self.lib_path
            )));
        }

        let cpath = CString::new(path).map_err(io_error)?;
        let mut st = unsafe { core::mem::zeroed::<libc::stat>() };
        if unsafe { libc::stat(cpath.as_ptr(), &mut st) } != 0 {
            return Err(io_error(format!("library file not found: {path}")));
        }
        if st.st_mode & libc::S_IFMT != libc::S_IFREG {
            return Err(io_error(format!("not a regular file: {path}")));
        }
        if unsafe { libc::access(cpath.as_ptr(), libc::R_OK) } != 0 {
            return Err(io_error(format!("library file not readable: {path}")));
        }

        log::info!("loading library: {path} (size: {} bytes)", st.st_size);

        let mapping = segment::map_library(path)?;
        log::debug!(
            "library mapped at {:#x}, size: {}",
            mapping.base(),
            mapping.len()
        );
        let image = ElfImage::create(path, Some(mapping.base()))?;

        self.linker.init(Box::new(image), mapping);
        if let Err(err) = self.linker.link() {
            log::error!("failed to link library: {path}");
            self.linker.destroy();
            return Err(err);
        }

        self.lib_path = path.to_string();
        log::info!("successfully loaded: {path}");
        Ok(())
    }

    /// Run destructors and release the library.
    ///
    /// The caller must have quiesced every thread that ran code from the
    /// library: per-thread TLS blocks referencing it are only reclaimed at
    /// thread exit, and unmapping under a live thread's feet is undefined.
    pub fn unload(&mut self) -> Result<()> {
        if !self.is_loaded() {
            log::warn!("no library loaded");
            return Err(io_error("no library loaded"));
        }
        log::info!("unloading library: {}", self.lib_path);
        self.linker.destroy();
        self.lib_path.clear();
        Ok(())
    }

    /// Release the library without running destructors.
    ///
    /// For callers that cannot guarantee continued process liveness after
    /// teardown. The same thread-quiesce contract as [`SoLoader::unload`]
    /// applies.
    pub fn abandon(&mut self) -> Result<()> {
        if !self.is_loaded() {
            log::warn!("no library loaded");
            return Err(io_error("no library loaded"));
        }
        log::info!("abandoning library: {} (no destructors called)", self.lib_path);
        self.linker.abandon();
        self.lib_path.clear();
        Ok(())
    }

    /// Resolve an exported symbol of the loaded library.
    pub fn symbol(&self, name: &str) -> Option<NonNull<c_void>> {
        if !self.is_loaded() {
            return None;
        }
        let image = self.linker.main_image()?;
        let sym = image.find_symbol_address(name)?;
        NonNull::new(sym.addr as *mut c_void)
    }

    /// Resolve an exported symbol as a typed handle.
    ///
    /// # Safety
    /// `T` must match the symbol's actual type; for functions this means
    /// the exact ABI and signature.
    pub unsafe fn get<'lib, T>(&'lib self, name: &str) -> Option<Symbol<'lib, T>> {
        self.symbol(name).map(|ptr| Symbol {
            ptr: ptr.as_ptr() as *mut (),
            pd: PhantomData,
        })
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.lib_path
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.linker.is_linked()
    }

    /// Number of dependencies resolved for the loaded library.
    #[inline]
    pub fn dependency_count(&self) -> usize {
        self.linker.dependency_count()
    }
}

impl Drop for SoLoader {
    fn drop(&mut self) {
        if self.is_loaded() {
            let _ = self.unload();
        }
    }
}
