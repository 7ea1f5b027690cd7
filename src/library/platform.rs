// Platform loader
// Opens, resolves and closes native dynamic libraries through libloading,
// hiding the dlopen/LoadLibrary split behind one interface.

use libloading::Library;
use serde::{Deserialize, Serialize};
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::{LibraryError, Result};

/// Symbol binding mode used when opening a library
///
/// Only meaningful on POSIX platforms; Windows always binds eagerly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Resolve all undefined symbols at open time (RTLD_NOW)
    #[default]
    Now,
    /// Resolve function symbols on first call (RTLD_LAZY)
    Lazy,
}

/// Opens dynamic libraries by path
pub trait PlatformLoader {
    type Handle: LibraryHandle;

    /// Open the file at `path`. `basename` is only used for diagnostics.
    fn open(&self, basename: &str, path: &Path) -> Result<Self::Handle>;
}

/// An opened dynamic library
pub trait LibraryHandle {
    /// Address of an exported symbol
    ///
    /// Fails with `SymbolNotFound` if the library does not export it.
    fn resolve(&self, symbol: &str) -> Result<*const c_void>;

    /// Unload the library
    ///
    /// Takes the handle by value: nothing can be resolved through it afterwards.
    fn close(self) -> Result<()>;
}

/// Loader backed by the operating system's dynamic linker
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeLoader {
    mode: LoadMode,
}

impl NativeLoader {
    pub fn new(mode: LoadMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> LoadMode {
        self.mode
    }
}

impl PlatformLoader for NativeLoader {
    type Handle = NativeLibrary;

    fn open(&self, basename: &str, path: &Path) -> Result<NativeLibrary> {
        // Opening runs the library's static initializers
        let library = unsafe { open_native(path, self.mode) }.map_err(|e| {
            LibraryError::LoadFailed {
                basename: basename.to_string(),
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })?;

        debug!(basename, path = %path.display(), mode = ?self.mode, "Opened native library");

        Ok(NativeLibrary {
            basename: basename.to_string(),
            path: path.to_path_buf(),
            library,
        })
    }
}

#[cfg(unix)]
unsafe fn open_native(path: &Path, mode: LoadMode) -> std::result::Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_LAZY, RTLD_LOCAL, RTLD_NOW};

    let binding = match mode {
        LoadMode::Now => RTLD_NOW,
        LoadMode::Lazy => RTLD_LAZY,
    };
    UnixLibrary::open(Some(path), binding | RTLD_LOCAL).map(Library::from)
}

#[cfg(windows)]
unsafe fn open_native(path: &Path, _mode: LoadMode) -> std::result::Result<Library, libloading::Error> {
    Library::new(path)
}

/// Native library handle
pub struct NativeLibrary {
    basename: String,
    path: PathBuf,
    library: Library,
}

impl NativeLibrary {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LibraryHandle for NativeLibrary {
    fn resolve(&self, symbol: &str) -> Result<*const c_void> {
        let not_found = |message: String| LibraryError::SymbolNotFound {
            symbol: symbol.to_string(),
            message,
        };

        let address = unsafe { self.library.get::<*const c_void>(symbol.as_bytes()) }
            .map_err(|e| not_found(e.to_string()))?;
        let address = *address;
        if address.is_null() {
            return Err(not_found("symbol resolved to a null address".to_string()));
        }

        debug!(symbol, "Resolved symbol");
        Ok(address)
    }

    fn close(self) -> Result<()> {
        let basename = self.basename;
        self.library
            .close()
            .map_err(|e| LibraryError::UnloadFailed {
                basename: basename.clone(),
                message: e.to_string(),
            })?;
        debug!(basename = %basename, "Closed native library");
        Ok(())
    }
}

impl std::fmt::Debug for NativeLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeLibrary")
            .field("basename", &self.basename)
            .field("path", &self.path)
            .finish()
    }
}
