//! Per-session cell cache and submission classification
//!
//! The session owns every compiled cell record, a content index keyed by
//! `(main fingerprint, guard-set fingerprint)` for alias detection across
//! cell renames, an alias map from duplicate ids to their canonical id,
//! and a fingerprint-only cache for hole-free cells.
//!
//! On submission the incoming code is classified against the stored
//! state, and only the stages that actually changed are rerun:
//!
//! | classification | work |
//! |----------------|------|
//! | alias hit      | invoke the cached entry |
//! | content hit    | record an alias, invoke |
//! | clone & patch  | copy unchanged hole objects, recompile the rest |
//! | hole update    | recompile changed holes, refresh main |
//! | full rebuild   | run the whole orchestrator |
//! | pure cell      | fingerprint compare, compile-run-discard on miss |
//!
//! A failed submission rolls back everything it staged and leaves the
//! previous record, content index, and alias map untouched.

use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;

use crate::ast::Expr;
use crate::backend;
use crate::error::NbError;
use crate::holes::{self, HoleSplit};
use crate::loader::LoadedObject;
use crate::pipeline::{
    self, call_argument_lists, fresh_symbol, guards_fingerprint, rewrite_main, CellRecord,
    CompileCtx, CompiledArtifact,
};
use crate::runtime;

/// How a submission was classified, per the cache decision table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellClass {
    AliasHit,
    ContentHit,
    CloneAndPatch,
    HoleUpdate,
    FullRebuild,
    PureCompiled,
    PureCached,
}

impl std::fmt::Display for CellClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CellClass::AliasHit => "alias-hit",
            CellClass::ContentHit => "content-hit",
            CellClass::CloneAndPatch => "clone-and-patch",
            CellClass::HoleUpdate => "hole-update",
            CellClass::FullRebuild => "full-rebuild",
            CellClass::PureCompiled => "pure-compiled",
            CellClass::PureCached => "pure-cached",
        };
        f.write_str(s)
    }
}

/// Outcome of one `run_cell` submission.
#[derive(Debug)]
pub struct CellResult {
    pub cell_id: String,
    pub class: CellClass,
    /// Ordinals of holes recompiled by this submission.
    pub recompiled_holes: Vec<u32>,
    pub main_rebuilt: bool,
    /// Native invocation result. Zero for a pure-cached submission.
    pub value: i64,
    pub main_object: Option<String>,
    pub hole_objects: Option<String>,
}

/// Outcome of the hole-free fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PureOutcome {
    /// Source fingerprint unchanged; nothing was executed.
    Cached,
    Value(i64),
}

/// Create an empty session.
pub fn new_session() -> Session {
    Session::new()
}

/// Interactive-session state: cell records and the caches that decide how
/// much of a submission must be recompiled.
pub struct Session {
    cells: FxHashMap<String, CellRecord>,
    /// `(main_fp, guards_fp)` → canonical cell id.
    content_index: FxHashMap<(u64, u64), String>,
    /// duplicate id → canonical id.
    aliases: FxHashMap<String, String>,
    /// Hole-free cells: id → source fingerprint.
    pure_cache: FxHashMap<String, u64>,
    exec_counts: FxHashMap<String, u64>,
    temp_dir: PathBuf,
}

impl Session {
    pub fn new() -> Session {
        Session {
            cells: FxHashMap::default(),
            content_index: FxHashMap::default(),
            aliases: FxHashMap::default(),
            pure_cache: FxHashMap::default(),
            exec_counts: FxHashMap::default(),
            temp_dir: std::env::temp_dir(),
        }
    }

    /// Number of compiled cell records currently cached.
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Times `cell_id` has been invoked. Informational only; never drives
    /// a cache decision.
    pub fn execution_count(&self, cell_id: &str) -> u64 {
        self.exec_counts.get(cell_id).copied().unwrap_or(0)
    }

    /// On-disk artifact paths for a cell (main, then holes in ordinal
    /// order), following aliases.
    pub fn artifact_paths(&self, cell_id: &str) -> Option<(PathBuf, Vec<PathBuf>)> {
        let canonical = self.peek_canonical(cell_id);
        let rec = self.cells.get(&canonical)?;
        Some((
            rec.main_artifact.so_path.clone(),
            rec.hole_artifacts
                .iter()
                .map(|a| a.so_path.clone())
                .collect(),
        ))
    }

    /// Follow the alias map without mutating it.
    fn peek_canonical(&self, cell_id: &str) -> String {
        let mut current = cell_id;
        let mut hops = 0;
        while let Some(next) = self.aliases.get(current) {
            current = next;
            hops += 1;
            if hops > self.aliases.len() {
                break;
            }
        }
        current.to_string()
    }

    /// Follow the alias map and compact the chain so the next dereference
    /// is a single step.
    fn resolve_alias(&mut self, cell_id: &str) -> String {
        let canonical = self.peek_canonical(cell_id);
        if self.aliases.contains_key(cell_id) {
            let mut current = cell_id.to_string();
            while let Some(next) = self.aliases.get(&current).cloned() {
                if next == canonical {
                    break;
                }
                self.aliases.insert(current.clone(), canonical.clone());
                current = next;
            }
        }
        canonical
    }

    /// Drop content-index entries and aliases that point at `cell_id`.
    fn forget_cell_indexes(&mut self, cell_id: &str) {
        self.content_index.retain(|_, v| v.as_str() != cell_id);
        self.aliases.retain(|_, v| v.as_str() != cell_id);
    }

    fn bump(&mut self, cell_id: &str) {
        *self.exec_counts.entry(cell_id.to_string()).or_insert(0) += 1;
    }

    fn runtime_so(&self) -> Result<PathBuf, NbError> {
        Ok(runtime::ensure_runtime(&self.temp_dir)?.so_path().to_path_buf())
    }

    // ── submission ──────────────────────────────────────────────

    /// Submit a cell. Classifies the code against the cached state and
    /// recompiles the minimum set of shared objects.
    pub fn run_cell(&mut self, ast: &Expr, cell_id: &str) -> Result<CellResult, NbError> {
        if !holes::has_hole_marker(ast) {
            return match self.run_pure_cell(ast, cell_id)? {
                PureOutcome::Cached => Ok(CellResult {
                    cell_id: cell_id.to_string(),
                    class: CellClass::PureCached,
                    recompiled_holes: Vec::new(),
                    main_rebuilt: false,
                    value: 0,
                    main_object: None,
                    hole_objects: None,
                }),
                PureOutcome::Value(value) => Ok(CellResult {
                    cell_id: cell_id.to_string(),
                    class: CellClass::PureCompiled,
                    recompiled_holes: Vec::new(),
                    main_rebuilt: true,
                    value,
                    main_object: None,
                    hole_objects: None,
                }),
            };
        }

        let split = holes::rewrite_holes(ast, true)?;
        let main_fp = split.main.fingerprint();
        let guards_fp = guards_fingerprint(&split.guard_sets);
        let hole_fps: Vec<u64> = split.holes.iter().map(|h| h.fingerprint()).collect();

        let canonical = self.resolve_alias(cell_id);
        if let Some(rec) = self.cells.get(&canonical) {
            let main_matches = rec.main_fp == main_fp && rec.guards_fp == guards_fp;
            if main_matches && rec.hole_fps == hole_fps {
                let value = self.invoke_record(&canonical)?;
                self.bump(cell_id);
                return Ok(self.result_for(cell_id, &canonical, CellClass::AliasHit, vec![], false, value));
            }
            if canonical == cell_id {
                if main_matches {
                    let differing: Vec<usize> = hole_fps
                        .iter()
                        .enumerate()
                        .filter(|(i, fp)| rec.hole_fps[*i] != **fp)
                        .map(|(i, _)| i)
                        .collect();
                    // A hole whose exported symbol is shared with another
                    // record cannot be swapped in place.
                    if differing.iter().any(|&i| rec.shared_symbols[i]) {
                        return self.full_rebuild(ast, cell_id);
                    }
                    return self.hole_update(cell_id, &split, &hole_fps, &differing);
                }
                return self.full_rebuild(ast, cell_id);
            }
            // An aliased id whose content diverged from its canonical
            // record: the alias is dead.
            self.aliases.remove(cell_id);
        }

        // No record under this id. Look for the same main structure
        // compiled under another id.
        if let Some(content_id) = self.content_index.get(&(main_fp, guards_fp)).cloned() {
            let content_canonical = self.resolve_alias(&content_id);
            if let Some(rec) = self.cells.get(&content_canonical) {
                if rec.main_fp == main_fp && rec.guards_fp == guards_fp {
                    if rec.hole_fps == hole_fps {
                        if content_canonical != cell_id {
                            self.aliases
                                .insert(cell_id.to_string(), content_canonical.clone());
                        }
                        let value = self.invoke_record(&content_canonical)?;
                        self.bump(cell_id);
                        return Ok(self.result_for(
                            cell_id,
                            &content_canonical,
                            CellClass::ContentHit,
                            vec![],
                            false,
                            value,
                        ));
                    }
                    return self.clone_and_patch(ast, cell_id, &content_canonical, &split, &hole_fps);
                }
            }
        }

        self.full_rebuild(ast, cell_id)
    }

    /// The hole-free fast path: fingerprint compare, then compile, load,
    /// invoke once, unload, and remove the object.
    pub fn run_pure_cell(&mut self, ast: &Expr, cell_id: &str) -> Result<PureOutcome, NbError> {
        if holes::has_hole_marker(ast) {
            return Err(NbError::invalid_ast("pure cell contains a hole annotation"));
        }
        let split = holes::rewrite_holes(ast, false)?;
        let fp = split.main.fingerprint();
        if self.pure_cache.get(cell_id) == Some(&fp) {
            return Ok(PureOutcome::Cached);
        }
        let runtime_so = self.runtime_so()?;
        let ctx = CompileCtx {
            temp_dir: &self.temp_dir,
            runtime_so: &runtime_so,
        };
        let value = pipeline::run_pure(&ctx, &split.main)?;
        self.pure_cache.insert(cell_id.to_string(), fp);
        self.bump(cell_id);
        Ok(PureOutcome::Value(value))
    }

    // ── actions ─────────────────────────────────────────────────

    fn full_rebuild(&mut self, ast: &Expr, cell_id: &str) -> Result<CellResult, NbError> {
        let runtime_so = self.runtime_so()?;
        let ctx = CompileCtx {
            temp_dir: &self.temp_dir,
            runtime_so: &runtime_so,
        };
        let record = pipeline::compile_cell(&ctx, ast)?;

        // Invoke before committing: a failed entry resolution must leave
        // the previous record in place.
        let entry = match record.main_artifact.handle.entry(&record.main_artifact.symbol) {
            Ok(entry) => entry,
            Err(e) => {
                record.release();
                return Err(e);
            }
        };
        // Safety: the entry symbol was emitted with the zero-argument
        // 64-bit signature.
        let value = unsafe { entry() };

        let recompiled: Vec<u32> = (1..=record.hole_artifacts.len() as u32).collect();
        let key = (record.main_fp, record.guards_fp);

        self.forget_cell_indexes(cell_id);
        self.aliases.remove(cell_id);
        if let Some(old) = self.cells.remove(cell_id) {
            old.release();
        }
        self.content_index.insert(key, cell_id.to_string());
        self.cells.insert(cell_id.to_string(), record);
        self.bump(cell_id);
        Ok(self.result_for(cell_id, cell_id, CellClass::FullRebuild, recompiled, true, value))
    }

    fn hole_update(
        &mut self,
        cell_id: &str,
        split: &HoleSplit,
        hole_fps: &[u64],
        differing: &[usize],
    ) -> Result<CellResult, NbError> {
        let runtime_so = self.runtime_so()?;
        let ctx = CompileCtx {
            temp_dir: &self.temp_dir,
            runtime_so: &runtime_so,
        };

        // Stage the new hole objects; the record is untouched until every
        // compile has succeeded.
        let mut staged: Vec<(usize, CompiledArtifact)> = Vec::new();
        {
            let rec = self
                .cells
                .get(cell_id)
                .ok_or_else(|| NbError::cache_invariant("hole update without a record"))?;
            for &i in differing {
                let symbol = rec.hole_artifacts[i].symbol.clone();
                match pipeline::compile_hole_unit(&ctx, &split.holes[i], &rec.call_args[i], &symbol)
                {
                    Ok(artifact) => staged.push((i, artifact)),
                    Err(e) => {
                        for (_, artifact) in staged {
                            artifact.release();
                        }
                        return Err(e);
                    }
                }
            }
        }

        // Swap: close each old handle so its symbol leaves the global
        // namespace, then install the replacement and refresh main.
        let rec = self
            .cells
            .get_mut(cell_id)
            .expect("record checked above");
        let mut replaced: Vec<(usize, Expr, u64, CompiledArtifact)> = Vec::new();
        for (i, new_artifact) in staged {
            let old = std::mem::replace(&mut rec.hole_artifacts[i], new_artifact);
            let old_ast = std::mem::replace(&mut rec.hole_asts[i], split.holes[i].clone());
            let old_fp = std::mem::replace(&mut rec.hole_fps[i], hole_fps[i]);
            replaced.push((i, old_ast, old_fp, old));
        }
        for (_, _, _, old) in replaced.iter_mut() {
            old.handle.close();
        }

        if let Err(e) = rec.main_artifact.handle.refresh() {
            // Put the old holes back; their files are still on disk.
            for (i, old_ast, old_fp, mut old) in replaced {
                let _ = old.handle.refresh();
                let new_artifact = std::mem::replace(&mut rec.hole_artifacts[i], old);
                rec.hole_asts[i] = old_ast;
                rec.hole_fps[i] = old_fp;
                new_artifact.release();
            }
            let _ = rec.main_artifact.handle.refresh();
            return Err(e);
        }

        let entry = rec.main_artifact.handle.entry(&rec.main_artifact.symbol)?;
        // Safety: zero-argument 64-bit entry, as emitted.
        let value = unsafe { entry() };

        // Commit: the old hole objects go away.
        for (_, _, _, old) in replaced {
            old.release();
        }

        let recompiled: Vec<u32> = differing.iter().map(|&i| i as u32 + 1).collect();
        self.bump(cell_id);
        Ok(self.result_for(cell_id, cell_id, CellClass::HoleUpdate, recompiled, false, value))
    }

    fn clone_and_patch(
        &mut self,
        ast: &Expr,
        cell_id: &str,
        canonical: &str,
        split: &HoleSplit,
        hole_fps: &[u64],
    ) -> Result<CellResult, NbError> {
        let runtime_so = self.runtime_so()?;

        let targets: Vec<Option<String>> = split.holes.iter().map(holes::hole_target).collect();
        let call_args = call_argument_lists(split, &targets);

        // Plan against the canonical record. If an unchanged hole's call
        // surface shifted (a differing hole changed its target), its
        // copied object would no longer match its call site; rebuild
        // everything instead.
        struct HolePlan {
            copy_from: Option<(PathBuf, String, usize, bool)>,
        }
        let mut plan: Vec<HolePlan> = Vec::new();
        {
            let src = self
                .cells
                .get(canonical)
                .ok_or_else(|| NbError::cache_invariant("clone source disappeared"))?;
            for i in 0..split.holes.len() {
                let unchanged = hole_fps[i] == src.hole_fps[i]
                    && call_args[i] == src.call_args[i]
                    && targets[i] == src.hole_targets[i];
                if unchanged {
                    let a = &src.hole_artifacts[i];
                    plan.push(HolePlan {
                        copy_from: Some((
                            a.so_path.clone(),
                            a.symbol.clone(),
                            a.param_count,
                            a.returns_boxed,
                        )),
                    });
                } else {
                    plan.push(HolePlan { copy_from: None });
                }
            }
            // An unchanged hole whose call surface moved under it.
            let surface_moved = (0..split.holes.len()).any(|i| {
                hole_fps[i] == src.hole_fps[i]
                    && (call_args[i] != src.call_args[i] || targets[i] != src.hole_targets[i])
            });
            if surface_moved {
                return self.full_rebuild(ast, cell_id);
            }
        }

        let ctx = CompileCtx {
            temp_dir: &self.temp_dir,
            runtime_so: &runtime_so,
        };

        let mut staged: Vec<CompiledArtifact> = Vec::new();
        let mut shared_symbols: Vec<bool> = Vec::new();
        let mut recompiled: Vec<u32> = Vec::new();
        let build = (|staged: &mut Vec<CompiledArtifact>| -> Result<CompiledArtifact, NbError> {
            for (i, hp) in plan.iter().enumerate() {
                match &hp.copy_from {
                    Some((src_path, symbol, param_count, returns_boxed)) => {
                        // Duplicate the on-disk object and load a fresh
                        // handle; no recompilation.
                        let new_path = backend::artifact_path(&self.temp_dir, "hole", symbol);
                        std::fs::copy(src_path, &new_path).map_err(|e| {
                            NbError::backend(format!(
                                "duplicate hole object {}: {}",
                                src_path.display(),
                                e
                            ))
                        })?;
                        let handle = match LoadedObject::open(&new_path) {
                            Ok(h) => h,
                            Err(e) => {
                                let _ = std::fs::remove_file(&new_path);
                                return Err(e);
                            }
                        };
                        staged.push(CompiledArtifact {
                            so_path: new_path,
                            handle,
                            symbol: symbol.clone(),
                            param_count: *param_count,
                            returns_boxed: *returns_boxed,
                        });
                        shared_symbols.push(true);
                    }
                    None => {
                        let symbol = fresh_symbol(&format!("hole{}", i + 1));
                        let artifact =
                            pipeline::compile_hole_unit(&ctx, &split.holes[i], &call_args[i], &symbol)?;
                        staged.push(artifact);
                        shared_symbols.push(false);
                        recompiled.push(i as u32 + 1);
                    }
                }
            }

            let symbols: Vec<String> = staged.iter().map(|a| a.symbol.clone()).collect();
            let rewritten = rewrite_main(split, &symbols, &call_args, &targets);
            let externs: Vec<crate::codegen::ExternDecl> = staged
                .iter()
                .map(|a| crate::codegen::ExternDecl {
                    symbol: a.symbol.clone(),
                    param_count: a.param_count,
                    returns_boxed: a.returns_boxed,
                })
                .collect();
            let main_symbol = fresh_symbol("cell");
            pipeline::compile_main_unit(&ctx, &rewritten, &main_symbol, &externs)
        })(&mut staged);

        let main_artifact = match build {
            Ok(artifact) => artifact,
            Err(e) => {
                for artifact in staged {
                    artifact.release();
                }
                return Err(e);
            }
        };

        let record = CellRecord {
            main_fp: split.main.fingerprint(),
            guards_fp: guards_fingerprint(&split.guard_sets),
            hole_fps: hole_fps.to_vec(),
            main_ast: split.main.clone(),
            hole_asts: split.holes.clone(),
            guard_sets: split.guard_sets.clone(),
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

        let entry = match record.main_artifact.handle.entry(&record.main_artifact.symbol) {
            Ok(entry) => entry,
            Err(e) => {
                record.release();
                return Err(e);
            }
        };
        // Safety: zero-argument 64-bit entry, as emitted.
        let value = unsafe { entry() };

        // The content key keeps pointing at the original canonical id.
        self.cells.insert(cell_id.to_string(), record);
        self.bump(cell_id);
        Ok(self.result_for(cell_id, cell_id, CellClass::CloneAndPatch, recompiled, true, value))
    }

    fn invoke_record(&self, canonical: &str) -> Result<i64, NbError> {
        let rec = self
            .cells
            .get(canonical)
            .ok_or_else(|| NbError::cache_invariant("invocation of a missing record"))?;
        let entry = rec.main_artifact.handle.entry(&rec.main_artifact.symbol)?;
        // Safety: zero-argument 64-bit entry, as emitted.
        Ok(unsafe { entry() })
    }

    fn result_for(
        &self,
        cell_id: &str,
        record_id: &str,
        class: CellClass,
        recompiled_holes: Vec<u32>,
        main_rebuilt: bool,
        value: i64,
    ) -> CellResult {
        let (main_object, hole_objects) = match self.cells.get(record_id) {
            Some(rec) => (
                Some(rec.main_artifact.so_path.display().to_string()),
                Some(
                    rec.hole_artifacts
                        .iter()
                        .map(|a| a.so_path.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", "),
                ),
            ),
            None => (None, None),
        };
        CellResult {
            cell_id: cell_id.to_string(),
            class,
            recompiled_holes,
            main_rebuilt,
            value,
            main_object,
            hole_objects,
        }
    }

    // ── lifecycle ───────────────────────────────────────────────

    /// Release one cell's resources: compiled artifacts, aliases in both
    /// directions, cached fingerprints.
    pub fn cleanup_cell(&mut self, cell_id: &str) {
        self.aliases.remove(cell_id);
        self.pure_cache.remove(cell_id);
        if let Some(rec) = self.cells.remove(cell_id) {
            self.forget_cell_indexes(cell_id);
            rec.release();
        }
    }

    /// Release everything the session owns. The runtime support library
    /// is a process singleton and survives.
    pub fn cleanup_session(&mut self) {
        let ids: Vec<String> = self.cells.keys().cloned().collect();
        for id in ids {
            if let Some(rec) = self.cells.remove(&id) {
                rec.release();
            }
        }
        self.content_index.clear();
        self.aliases.clear();
        self.pure_cache.clear();
        self.exec_counts.clear();
    }

    /// Temp directory used for this session's artifacts.
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cleanup_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_resolution_compacts_chains() {
        let mut s = Session::new();
        s.aliases.insert("c".into(), "b".into());
        s.aliases.insert("b".into(), "a".into());
        assert_eq!(s.resolve_alias("c"), "a");
        // After compaction, c points straight at a.
        assert_eq!(s.aliases.get("c"), Some(&"a".to_string()));
        // Dereferencing is idempotent.
        assert_eq!(s.resolve_alias("c"), "a");
        assert_eq!(s.resolve_alias("a"), "a");
    }

    #[test]
    fn execution_counts_start_at_zero() {
        let s = Session::new();
        assert_eq!(s.execution_count("nope"), 0);
    }
}
