//! Native backend: object emission and shared-object linking
//!
//! The IR builder hands this module finished object bytes; here they are
//! written to a unique temp path and linked into a position-independent
//! shared object by the system C compiler, together with the runtime
//! support library. The intermediate object file is removed after
//! linking.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::settings::{self, Configurable};

use crate::error::NbError;

/// Host-native ISA with position-independent relocation. Cranelift's
/// "speed" level runs its standard mid-end cleanup (GVN, constant
/// propagation, CFG simplification) before emission.
pub fn native_isa() -> Result<Arc<dyn TargetIsa>, NbError> {
    let mut flags = settings::builder();
    flags
        .set("is_pic", "true")
        .map_err(|e| NbError::backend(format!("set is_pic: {}", e)))?;
    flags
        .set("opt_level", "speed")
        .map_err(|e| NbError::backend(format!("set opt_level: {}", e)))?;

    let isa_builder =
        cranelift_native::builder().map_err(|e| NbError::backend(format!("native ISA: {}", e)))?;
    isa_builder
        .finish(settings::Flags::new(flags))
        .map_err(|e| NbError::backend(format!("finalize ISA: {}", e)))
}

static ARTIFACT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique artifact path: `nbjit_<role>_<funcname>_<random>.<ext>` in
/// `dir`, with the platform's dylib extension.
pub fn artifact_path(dir: &Path, role: &str, func_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    let unique = (nanos << 16)
        ^ (std::process::id() as u64)
        ^ ARTIFACT_COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_mul(0x9e37_79b9);
    PathBuf::from(dir).join(format!(
        "nbjit_{}_{}_{:012x}.{}",
        role,
        func_name,
        unique & 0xffff_ffff_ffff,
        std::env::consts::DLL_EXTENSION
    ))
}

/// Write `object_bytes` to a temporary object file and link it into a
/// position-independent shared object at `so_path`, against the runtime
/// support library. The object file is removed afterwards, success or
/// not.
pub fn link_shared_object(
    object_bytes: &[u8],
    so_path: &Path,
    runtime_so: &Path,
) -> Result<(), NbError> {
    let obj_path = so_path.with_extension("o");
    std::fs::write(&obj_path, object_bytes)
        .map_err(|e| NbError::backend(format!("write object file: {}", e)))?;

    let cc = std::env::var_os("CC").unwrap_or_else(|| "cc".into());
    let mut cmd = Command::new(cc);
    cmd.arg("-shared").arg("-fPIC").arg(&obj_path);
    cmd.arg(runtime_so);
    if cfg!(target_os = "macos") {
        // Hole symbols in main units resolve at dlopen time.
        cmd.arg("-Wl,-undefined,dynamic_lookup");
    }
    cmd.arg("-o").arg(so_path);

    let output = cmd
        .output()
        .map_err(|e| NbError::backend(format!("invoke system linker: {}", e)));

    // Best effort; the object is transient either way.
    let _ = std::fs::remove_file(&obj_path);

    let output = output?;
    if !output.status.success() {
        return Err(NbError::backend(format!(
            "link failed: {}\n{}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_paths_are_unique_and_prefixed() {
        let dir = std::env::temp_dir();
        let a = artifact_path(&dir, "hole", "f1");
        let b = artifact_path(&dir, "hole", "f1");
        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("nbjit_hole_f1_"));
        assert!(name.ends_with(std::env::consts::DLL_EXTENSION));
    }

    #[test]
    fn native_isa_is_position_independent() {
        let isa = native_isa().expect("host ISA");
        assert!(isa.flags().is_pic());
    }
}
