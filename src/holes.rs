//! Hole extraction and guard-set computation
//!
//! The first pipeline stage. Recognizes `@hole` annotation statements in
//! the top-level cell block, replaces each with an explicit `Hole` node
//! carrying a fresh ordinal, extracts the hole body as its own block, and
//! computes the guard-symbol set: every name referenced in a statement
//! preceding the hole, extended by the names referenced inside the hole
//! body, ordered by first appearance.

use rustc_hash::FxHashSet;

use crate::ast::Expr;
use crate::error::NbError;

pub const HOLE_ANNOTATION: &str = "hole";

/// Result of rewriting a cell around its holes.
#[derive(Debug, Clone)]
pub struct HoleSplit {
    /// The normalized main block with `Hole` nodes at each hole site.
    pub main: Expr,
    /// One body block per hole, ordinal order.
    pub holes: Vec<Expr>,
    /// One ordered, deduplicated guard-symbol set per hole.
    pub guard_sets: Vec<Vec<String>>,
}

impl HoleSplit {
    pub fn hole_count(&self) -> usize {
        self.holes.len()
    }
}

/// True if the tree contains at least one hole annotation.
pub fn has_hole_marker(expr: &Expr) -> bool {
    match expr {
        Expr::Annotation { name, .. } if name == HOLE_ANNOTATION => true,
        Expr::Block(stmts) => stmts.iter().any(has_hole_marker),
        Expr::Annotation { args, .. } => args.iter().any(has_hole_marker),
        Expr::If { cond, then, else_ } => {
            has_hole_marker(cond)
                || has_hole_marker(then)
                || else_.as_deref().map_or(false, has_hole_marker)
        }
        Expr::For { start, end, body, .. } => {
            has_hole_marker(start) || has_hole_marker(end) || has_hole_marker(body)
        }
        Expr::While { cond, body } => has_hole_marker(cond) || has_hole_marker(body),
        Expr::Let { bindings, body } => {
            bindings.iter().any(|(_, v)| has_hole_marker(v)) || has_hole_marker(body)
        }
        Expr::Function { body, .. } => has_hole_marker(body),
        Expr::BinOp { lhs, rhs, .. } => has_hole_marker(lhs) || has_hole_marker(rhs),
        Expr::Call { callee, args } => {
            has_hole_marker(callee) || args.iter().any(has_hole_marker)
        }
        Expr::Assign { target, value } => has_hole_marker(target) || has_hole_marker(value),
        Expr::IndexGet { container, key } => has_hole_marker(container) || has_hole_marker(key),
        Expr::IndexSet {
            container,
            key,
            value,
        } => has_hole_marker(container) || has_hole_marker(key) || has_hole_marker(value),
        Expr::Return(v) => v.as_deref().map_or(false, has_hole_marker),
        Expr::Tuple(elems) | Expr::Vector(elems) => elems.iter().any(has_hole_marker),
        _ => false,
    }
}

/// Rewrite a cell around its holes.
///
/// The input is normalized to a statement block first (a bare expression
/// becomes a one-statement block, line markers are dropped). Fails when a
/// hole annotation appears anywhere but statement position, when a hole
/// body itself contains a hole, or (with `expect_holes`) when no hole is
/// present at all.
pub fn rewrite_holes(ast: &Expr, expect_holes: bool) -> Result<HoleSplit, NbError> {
    let stmts = match ast {
        Expr::Block(stmts) => stmts.clone(),
        other => vec![other.clone()],
    };

    let mut main_stmts = Vec::with_capacity(stmts.len());
    let mut holes = Vec::new();
    let mut ordinal: u32 = 0;

    for stmt in &stmts {
        if stmt.is_line_marker() {
            continue;
        }
        match stmt {
            Expr::Annotation { name, args } if name == HOLE_ANNOTATION => {
                let body = hole_body(args)?;
                if has_hole_marker(&body) {
                    return Err(NbError::invalid_ast(format!(
                        "hole {} contains a nested hole",
                        ordinal + 1
                    )));
                }
                ordinal += 1;
                holes.push(body);
                // Guards are filled in below, once preceding statements
                // are known in their normalized form.
                main_stmts.push(Expr::Hole {
                    guards: Vec::new(),
                    ordinal,
                });
            }
            other => {
                if has_hole_marker(other) {
                    return Err(NbError::invalid_ast(
                        "hole annotation outside statement position",
                    ));
                }
                main_stmts.push(other.clone());
            }
        }
    }

    if expect_holes && holes.is_empty() {
        return Err(NbError::invalid_ast("expected at least one hole"));
    }

    // Second pass: the guard set for each hole is every name appearing in
    // a preceding main statement, then every name the hole body reads.
    let mut guard_sets = Vec::with_capacity(holes.len());
    let mut hole_index = 0usize;
    for (i, stmt) in main_stmts.iter().enumerate() {
        if let Expr::Hole { .. } = stmt {
            let mut names = Vec::new();
            let mut seen = FxHashSet::default();
            for prior in &main_stmts[..i] {
                prior.collect_names(&mut names, &mut seen);
            }
            holes[hole_index].collect_names(&mut names, &mut seen);
            guard_sets.push(names);
            hole_index += 1;
        }
    }

    // Write the guards back into the hole nodes.
    let mut hole_index = 0usize;
    for stmt in &mut main_stmts {
        if let Expr::Hole { guards, .. } = stmt {
            *guards = guard_sets[hole_index].clone();
            hole_index += 1;
        }
    }

    Ok(HoleSplit {
        main: Expr::Block(main_stmts),
        holes,
        guard_sets,
    })
}

/// Normalize a hole annotation's arguments into a body block: line markers
/// dropped, a single expression promoted to a one-statement block.
fn hole_body(args: &[Expr]) -> Result<Expr, NbError> {
    let mut stmts = Vec::new();
    for arg in args {
        if arg.is_line_marker() {
            continue;
        }
        match arg {
            Expr::Block(inner) => {
                stmts.extend(inner.iter().filter(|s| !s.is_line_marker()).cloned())
            }
            other => stmts.push(other.clone()),
        }
    }
    if stmts.is_empty() {
        return Err(NbError::invalid_ast("hole annotation has an empty body"));
    }
    Ok(Expr::Block(stmts))
}

/// The hole's assignment target: the name assigned by the first meaningful
/// statement of the body, if that statement is an assignment to a name.
pub fn hole_target(body: &Expr) -> Option<String> {
    let stmts = match body {
        Expr::Block(stmts) => stmts,
        _ => return None,
    };
    let first = stmts.iter().find(|s| !s.is_line_marker())?;
    match first {
        Expr::Assign { target, .. } => match target.as_ref() {
            Expr::Var(name) => Some(name.clone()),
            _ => None,
        },
        _ => None,
    }
}
