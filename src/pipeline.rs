//! Split-compile orchestration
//!
//! Composes the hole rewriter, partial evaluator, IR builder, native
//! backend, and loader into whole-cell compilation: one shared object per
//! hole, then one for the rewritten main that calls them. Hole units are
//! always compiled and loaded before main, because main's external
//! declarations must match each hole's emitted signature and its image
//! must resolve their symbols at load time.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use std::hash::Hasher;

use crate::ast::Expr;
use crate::backend;
use crate::codegen::{self, ExternDecl};
use crate::error::NbError;
use crate::holes::{self, HoleSplit};
use crate::loader::LoadedObject;
use crate::partial::partial_eval;

/// Process-wide counter woven into every generated function name, so
/// symbols from different cells never collide in the dynamic linker's
/// global namespace.
static FUNC_NAME_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) fn fresh_symbol(prefix: &str) -> String {
    let n = FUNC_NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("nbjit_{}_{}", prefix, n)
}

/// Everything unit compilation needs besides the AST.
pub struct CompileCtx<'a> {
    pub temp_dir: &'a Path,
    pub runtime_so: &'a Path,
}

/// One compiled unit: its shared object on disk, the live handle, and the
/// exported signature facts.
#[derive(Debug)]
pub struct CompiledArtifact {
    pub so_path: PathBuf,
    pub handle: LoadedObject,
    pub symbol: String,
    pub param_count: usize,
    pub returns_boxed: bool,
}

impl CompiledArtifact {
    /// Close the handle, then remove the on-disk object. Both halves
    /// tolerate already-dead state and log instead of failing.
    pub fn release(mut self) {
        self.handle.close();
        if let Err(e) = std::fs::remove_file(&self.so_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                eprintln!(
                    "nbjit: could not remove artifact {}: {}",
                    self.so_path.display(),
                    e
                );
            }
        }
    }
}

/// Cached state for one compiled cell.
#[derive(Debug)]
pub struct CellRecord {
    /// Normalized main block with `Hole` nodes.
    pub main_ast: Expr,
    /// Hole bodies, ordinal order.
    pub hole_asts: Vec<Expr>,
    pub guard_sets: Vec<Vec<String>>,
    /// Per hole: guard names actually bound before the hole, in bound
    /// order. Doubles as the hole function's parameter list.
    pub call_args: Vec<Vec<String>>,
    pub hole_targets: Vec<Option<String>>,
    pub main_fp: u64,
    pub guards_fp: u64,
    pub hole_fps: Vec<u64>,
    pub main_artifact: CompiledArtifact,
    pub hole_artifacts: Vec<CompiledArtifact>,
    /// True for hole artifacts whose exported symbol is shared with
    /// another record (clone-and-patch copies). Such holes cannot be
    /// swapped in place and force a full rebuild when edited.
    pub shared_symbols: Vec<bool>,
}

impl CellRecord {
    /// Release every artifact this record owns.
    pub fn release(self) {
        self.main_artifact.release();
        for artifact in self.hole_artifacts {
            artifact.release();
        }
    }

    /// The structural invariants every record must satisfy.
    pub fn check_invariants(&self) -> Result<(), NbError> {
        let n = self.hole_asts.len();
        if self.guard_sets.len() != n
            || self.call_args.len() != n
            || self.hole_artifacts.len() != n
            || self.hole_fps.len() != n
            || self.hole_targets.len() != n
            || self.shared_symbols.len() != n
        {
            return Err(NbError::cache_invariant(format!(
                "record shape mismatch: {} holes, {} guard sets, {} call args, {} artifacts",
                n,
                self.guard_sets.len(),
                self.call_args.len(),
                self.hole_artifacts.len()
            )));
        }
        for (i, (args, artifact)) in self.call_args.iter().zip(&self.hole_artifacts).enumerate() {
            if args.len() != artifact.param_count {
                return Err(NbError::cache_invariant(format!(
                    "hole {} call-argument list has {} names but artifact expects {}",
                    i + 1,
                    args.len(),
                    artifact.param_count
                )));
            }
        }
        Ok(())
    }
}

/// Fingerprint of the guard-set shape, part of the content-index key.
pub fn guards_fingerprint(guard_sets: &[Vec<String>]) -> u64 {
    let mut h = FxHasher::default();
    h.write_usize(guard_sets.len());
    for set in guard_sets {
        h.write_usize(set.len());
        for name in set {
            h.write_usize(name.len());
            h.write(name.as_bytes());
        }
    }
    h.finish()
}

/// Compute each hole's call-argument list: its guard set restricted to
/// names already bound when the hole site is reached, in bound order.
pub fn call_argument_lists(split: &HoleSplit, targets: &[Option<String>]) -> Vec<Vec<String>> {
    let stmts = match &split.main {
        Expr::Block(stmts) => stmts.as_slice(),
        other => std::slice::from_ref(other),
    };

    let mut bound: Vec<String> = Vec::new();
    let mut bound_set: FxHashSet<String> = FxHashSet::default();
    let mut out = Vec::with_capacity(split.holes.len());

    let bind = |name: &str, bound: &mut Vec<String>, set: &mut FxHashSet<String>| {
        if set.insert(name.to_string()) {
            bound.push(name.to_string());
        }
    };

    for stmt in stmts {
        match stmt {
            Expr::Hole { ordinal, .. } => {
                let idx = (*ordinal - 1) as usize;
                let guards: FxHashSet<&String> = split.guard_sets[idx].iter().collect();
                let args: Vec<String> = bound
                    .iter()
                    .filter(|name| guards.contains(name))
                    .cloned()
                    .collect();
                out.push(args);
                if let Some(target) = targets.get(idx).and_then(|t| t.as_ref()) {
                    bind(target, &mut bound, &mut bound_set);
                }
            }
            Expr::Assign { target, .. } => {
                if let Expr::Var(name) = target.as_ref() {
                    bind(name, &mut bound, &mut bound_set);
                }
            }
            Expr::Function { name, .. } => bind(name, &mut bound, &mut bound_set),
            _ => {}
        }
    }
    out
}

/// Replace each hole site in the normalized main with a call to its
/// compiled function: `target = hole_i(args…)` when the hole assigns a
/// name, a bare call otherwise. Immediate nested blocks are flattened.
pub fn rewrite_main(
    split: &HoleSplit,
    symbols: &[String],
    call_args: &[Vec<String>],
    targets: &[Option<String>],
) -> Expr {
    let stmts = match &split.main {
        Expr::Block(stmts) => stmts.clone(),
        other => vec![other.clone()],
    };

    let mut out = Vec::with_capacity(stmts.len());
    for stmt in stmts {
        match stmt {
            Expr::Hole { ordinal, .. } => {
                let idx = (ordinal - 1) as usize;
                let call = Expr::Call {
                    callee: Box::new(Expr::Var(symbols[idx].clone())),
                    args: call_args[idx].iter().map(Expr::var).collect(),
                };
                match &targets[idx] {
                    Some(target) => out.push(Expr::assign(target.clone(), call)),
                    None => out.push(call),
                }
            }
            Expr::Block(inner) => out.extend(inner),
            other => out.push(other),
        }
    }
    Expr::Block(out)
}

/// Compile one hole body into its shared object. The parameter list is
/// the call-argument list; those names form the dynamic set for partial
/// evaluation.
pub fn compile_hole_unit(
    ctx: &CompileCtx,
    body: &Expr,
    params: &[String],
    symbol: &str,
) -> Result<CompiledArtifact, NbError> {
    let dynamic: FxHashSet<String> = params.iter().cloned().collect();
    let evaled = partial_eval(body, &FxHashMap::default(), &dynamic);
    let func = Expr::Function {
        name: symbol.to_string(),
        params: params.to_vec(),
        body: Box::new(evaled),
    };
    build_and_load(ctx, &func, symbol, "hole", &[])
}

/// Compile the rewritten main into its shared object, with external
/// declarations for every hole symbol it calls.
pub fn compile_main_unit(
    ctx: &CompileCtx,
    rewritten: &Expr,
    symbol: &str,
    externs: &[ExternDecl],
) -> Result<CompiledArtifact, NbError> {
    let evaled = partial_eval(rewritten, &FxHashMap::default(), &FxHashSet::default());
    let func = Expr::Function {
        name: symbol.to_string(),
        params: Vec::new(),
        body: Box::new(evaled),
    };
    build_and_load(ctx, &func, symbol, "main", externs)
}

fn build_and_load(
    ctx: &CompileCtx,
    func: &Expr,
    symbol: &str,
    role: &str,
    externs: &[ExternDecl],
) -> Result<CompiledArtifact, NbError> {
    let built = codegen::compile_unit(func, symbol, externs)?;
    let so_path = backend::artifact_path(ctx.temp_dir, role, symbol);
    backend::link_shared_object(&built.object, &so_path, ctx.runtime_so)?;
    let handle = match LoadedObject::open(&so_path) {
        Ok(handle) => handle,
        Err(e) => {
            let _ = std::fs::remove_file(&so_path);
            return Err(e);
        }
    };
    Ok(CompiledArtifact {
        so_path,
        handle,
        symbol: symbol.to_string(),
        param_count: built.param_count,
        returns_boxed: built.returns_boxed,
    })
}

/// Run the full orchestration for a cell with holes, producing a fresh
/// record. On any failure every artifact produced so far is rolled back
/// (handles closed, files removed) before the error is returned.
pub fn compile_cell(ctx: &CompileCtx, ast: &Expr) -> Result<CellRecord, NbError> {
    let split = holes::rewrite_holes(ast, true)?;
    let targets: Vec<Option<String>> = split.holes.iter().map(holes::hole_target).collect();
    let call_args = call_argument_lists(&split, &targets);

    let mut staged: Vec<CompiledArtifact> = Vec::new();
    let result = (|| {
        let mut hole_symbols = Vec::with_capacity(split.holes.len());
        for (i, body) in split.holes.iter().enumerate() {
            let symbol = fresh_symbol(&format!("hole{}", i + 1));
            let artifact = compile_hole_unit(ctx, body, &call_args[i], &symbol)?;
            hole_symbols.push(symbol);
            staged.push(artifact);
        }

        let rewritten = rewrite_main(&split, &hole_symbols, &call_args, &targets);
        let externs: Vec<ExternDecl> = staged
            .iter()
            .map(|a| ExternDecl {
                symbol: a.symbol.clone(),
                param_count: a.param_count,
                returns_boxed: a.returns_boxed,
            })
            .collect();
        let main_symbol = fresh_symbol("cell");
        compile_main_unit(ctx, &rewritten, &main_symbol, &externs)
    })();

    let main_artifact = match result {
        Ok(artifact) => artifact,
        Err(e) => {
            for artifact in staged.drain(..) {
                artifact.release();
            }
            return Err(e);
        }
    };

    let hole_fps: Vec<u64> = split.holes.iter().map(|h| h.fingerprint()).collect();
    let shared_symbols = vec![false; staged.len()];
    let record = CellRecord {
        main_fp: split.main.fingerprint(),
        guards_fp: guards_fingerprint(&split.guard_sets),
        hole_fps,
        main_ast: split.main,
        hole_asts: split.holes,
        guard_sets: split.guard_sets,
        call_args,
        hole_targets: targets,
        main_artifact,
        hole_artifacts: staged,
        shared_symbols,
    };
    if let Err(e) = record.check_invariants() {
        record.release();
        return Err(e);
    }
    Ok(record)
}

/// Compile, load, invoke once, and discard a hole-free cell. Nothing is
/// cached on disk afterwards.
pub fn run_pure(ctx: &CompileCtx, main: &Expr) -> Result<i64, NbError> {
    let symbol = fresh_symbol("pure");
    let evaled = partial_eval(main, &FxHashMap::default(), &FxHashSet::default());
    let func = Expr::Function {
        name: symbol.clone(),
        params: Vec::new(),
        body: Box::new(evaled),
    };
    let built = codegen::compile_unit(&func, &symbol, &[])?;
    let so_path = backend::artifact_path(ctx.temp_dir, "pure", &symbol);
    backend::link_shared_object(&built.object, &so_path, ctx.runtime_so)?;

    let value = (|| -> Result<i64, NbError> {
        let handle = LoadedObject::open(&so_path)?;
        let entry = handle.entry(&symbol)?;
        // Safety: the entry was just emitted with the zero-argument
        // 64-bit signature this call assumes.
        Ok(unsafe { entry() })
    })();

    // Load, one invocation, unload, remove: nothing persists.
    let _ = std::fs::remove_file(&so_path);
    value
}
