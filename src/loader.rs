//! Shared-object handles for compiled cell units
//!
//! Every artifact is opened with "resolve now, global visibility"
//! semantics so a later open of the main unit can see the hole symbols.
//! Executing a cell resolves the exported entry and calls it as a
//! zero-argument 64-bit function. Refreshing main closes the handle and
//! reopens the same on-disk path, which rebinds its hole references to
//! whatever hole shared objects are live at that point.

use std::path::{Path, PathBuf};

use crate::error::NbError;

/// Exported entry signature shared by every compiled unit.
pub type EntryFn = unsafe extern "C" fn() -> i64;

/// Open a shared object with RTLD_NOW | RTLD_GLOBAL semantics.
pub fn open_global(path: &Path) -> Result<libloading::Library, NbError> {
    #[cfg(unix)]
    {
        use libloading::os::unix::{Library, RTLD_GLOBAL, RTLD_NOW};
        let lib = unsafe { Library::open(Some(path), RTLD_NOW | RTLD_GLOBAL) }
            .map_err(|e| NbError::load(path.display().to_string(), e.to_string()))?;
        Ok(lib.into())
    }
    #[cfg(not(unix))]
    {
        // Windows resolves imports eagerly and per-module; global
        // visibility does not apply.
        let lib = unsafe { libloading::Library::new(path) }
            .map_err(|e| NbError::load(path.display().to_string(), e.to_string()))?;
        Ok(lib)
    }
}

/// A live handle to one compiled artifact.
///
/// The handle is `None` only transiently, between the close and reopen
/// halves of [`LoadedObject::refresh`], or after an explicit
/// [`LoadedObject::close`].
#[derive(Debug)]
pub struct LoadedObject {
    lib: Option<libloading::Library>,
    path: PathBuf,
}

impl LoadedObject {
    /// Open the shared object at `path`.
    pub fn open(path: &Path) -> Result<LoadedObject, NbError> {
        let lib = open_global(path)?;
        Ok(LoadedObject {
            lib: Some(lib),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lib(&self) -> Result<&libloading::Library, NbError> {
        self.lib.as_ref().ok_or_else(|| {
            NbError::load(
                self.path.display().to_string(),
                "handle is closed".to_string(),
            )
        })
    }

    /// Resolve the exported entry symbol.
    pub fn entry(&self, symbol: &str) -> Result<EntryFn, NbError> {
        let mut name = symbol.as_bytes().to_vec();
        name.push(0);
        let lib = self.lib()?;
        let f: libloading::Symbol<EntryFn> = unsafe { lib.get(&name) }
            .map_err(|e| NbError::load(self.path.display().to_string(), e.to_string()))?;
        Ok(*f)
    }

    /// True if the object exports `symbol`.
    pub fn has_symbol(&self, symbol: &str) -> bool {
        let mut name = symbol.as_bytes().to_vec();
        name.push(0);
        match self.lib() {
            Ok(lib) => unsafe { lib.get::<EntryFn>(&name) }.is_ok(),
            Err(_) => false,
        }
    }

    /// Close the handle, keeping the path. Idempotent.
    pub fn close(&mut self) {
        self.lib = None;
    }

    /// Close the handle and reopen the same path. Required after any hole
    /// shared object this image references has been replaced; the close
    /// must complete first so the reopen is not a reference-count bump on
    /// the stale image.
    pub fn refresh(&mut self) -> Result<(), NbError> {
        self.lib = None;
        self.lib = Some(open_global(&self.path)?);
        Ok(())
    }
}
