//! Runtime support library for emitted code
//!
//! Emitted shared objects call a fixed set of C-ABI thunks for boxed-value
//! operations: dictionary new/get/set, symbol interning, and boxing /
//! unboxing of primitives. The thunks live in a small C stub compiled once
//! per process into its own shared object; at initialization the stub
//! receives a table of function pointers into this crate (see
//! [`registry`]), so the host keeps ownership of every boxed value.
//!
//! The stub shared object is a process singleton. It is opened with global
//! symbol visibility so every later cell shared object resolves against
//! it, and it is linked into each cell artifact by path as well.

pub mod registry;

pub use registry::{live_count, Boxed};

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, OnceLock};

use crate::error::NbError;

const STUB_SOURCE: &str = include_str!("stub.c");

/// Names of the thunks the stub exports, as emitted code sees them.
pub const RT_DICT_NEW: &str = "nbjit_dict_new";
pub const RT_DICT_GET: &str = "nbjit_dict_get";
pub const RT_DICT_SET: &str = "nbjit_dict_set";
pub const RT_SYMBOL_FROM_CSTR: &str = "nbjit_symbol_from_cstr";
pub const RT_BOX_INT: &str = "nbjit_box_int";
pub const RT_BOX_FLOAT: &str = "nbjit_box_float";
pub const RT_UNBOX_INT: &str = "nbjit_unbox_int";
pub const RT_UNBOX_FLOAT: &str = "nbjit_unbox_float";

/// The loaded stub library. The handle is deliberately never closed; cell
/// artifacts resolve their runtime symbols through it for the whole
/// process lifetime.
pub struct RuntimeLib {
    so_path: PathBuf,
    _lib: libloading::Library,
}

impl RuntimeLib {
    /// On-disk path of the stub shared object, for link lines.
    pub fn so_path(&self) -> &Path {
        &self.so_path
    }
}

static RUNTIME: OnceLock<RuntimeLib> = OnceLock::new();

type InitFn = unsafe extern "C" fn(
    *const u8,
    *const u8,
    *const u8,
    *const u8,
    *const u8,
    *const u8,
    *const u8,
    *const u8,
);

/// Compile, load, and initialize the runtime stub. Idempotent: after the
/// first successful call every later call returns the same singleton.
pub fn ensure_runtime(temp_dir: &Path) -> Result<&'static RuntimeLib, NbError> {
    static BUILD_LOCK: Mutex<()> = Mutex::new(());

    if let Some(rt) = RUNTIME.get() {
        return Ok(rt);
    }
    // Sessions are single-threaded by contract, but the stub path is
    // keyed by process id, so two initializers must not race on it.
    let _guard = BUILD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(rt) = RUNTIME.get() {
        return Ok(rt);
    }
    let rt = build_runtime(temp_dir)?;
    let _ = RUNTIME.set(rt);
    Ok(RUNTIME.get().expect("runtime singleton just set"))
}

fn build_runtime(temp_dir: &Path) -> Result<RuntimeLib, NbError> {
    let pid = std::process::id();
    let c_path = temp_dir.join(format!("nbjit_runtime_{}.c", pid));
    let so_path = temp_dir.join(format!(
        "nbjit_runtime_{}.{}",
        pid,
        std::env::consts::DLL_EXTENSION
    ));

    std::fs::write(&c_path, STUB_SOURCE)
        .map_err(|e| NbError::backend(format!("write runtime stub source: {}", e)))?;

    let cc = std::env::var_os("CC").unwrap_or_else(|| "cc".into());
    let output = Command::new(cc)
        .arg("-shared")
        .arg("-fPIC")
        .arg("-O1")
        .arg(&c_path)
        .arg("-o")
        .arg(&so_path)
        .output()
        .map_err(|e| NbError::backend(format!("invoke C compiler for runtime stub: {}", e)))?;

    let _ = std::fs::remove_file(&c_path);

    if !output.status.success() {
        return Err(NbError::backend(format!(
            "runtime stub link failed: {}\n{}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let lib = crate::loader::open_global(&so_path)?;

    // Hand the stub its implementation table.
    let init: libloading::Symbol<InitFn> = unsafe { lib.get(b"nbjit_runtime_init\0") }
        .map_err(|e| NbError::load(so_path.display().to_string(), e.to_string()))?;
    unsafe {
        init(
            registry::rt_dict_new as *const u8,
            registry::rt_dict_get as *const u8,
            registry::rt_dict_set as *const u8,
            registry::rt_symbol_from_cstr as *const u8,
            registry::rt_box_int as *const u8,
            registry::rt_box_float as *const u8,
            registry::rt_unbox_int as *const u8,
            registry::rt_unbox_float as *const u8,
        );
    }

    Ok(RuntimeLib {
        so_path,
        _lib: lib,
    })
}
