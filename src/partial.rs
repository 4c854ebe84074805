//! Partial evaluation against known bindings
//!
//! Propagates literal bindings through a cell, folds arithmetic and
//! comparisons, short-circuits logic, prunes constant branches, unrolls
//! small integer-range loops, and preserves everything it cannot decide,
//! including every `Hole` node, verbatim.
//!
//! Names in the dynamic set never fold, no matter what the binding map
//! says; those are the hole guard names that must stay symbolic. A local
//! fold failure (division by zero, operand shapes with no literal result)
//! is not an error: the expression is emitted untouched.
//!
//! Evaluation never drops a store on its own. A separate dead-store sweep
//! runs over the top-level residual block afterwards and removes literal
//! assignments that nothing downstream reads, turning a final such
//! assignment into its value so block semantics survive.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ast::{BinOp, Expr, Literal};

/// Longest literal integer range that gets fully unrolled.
const MAX_UNROLL: i64 = 10;

/// Partially evaluate `expr` under `bindings`, keeping every name in
/// `dynamic` symbolic. The result is semantically equivalent to the input
/// under those bindings.
pub fn partial_eval(
    expr: &Expr,
    bindings: &FxHashMap<String, Literal>,
    dynamic: &FxHashSet<String>,
) -> Expr {
    let mut env = Env {
        bindings: bindings.clone(),
        dynamic,
    };
    let evaled = eval(expr, &mut env);
    match evaled {
        Expr::Block(stmts) => Expr::Block(sweep_dead_stores(stmts, dynamic)),
        other => other,
    }
}

struct Env<'a> {
    bindings: FxHashMap<String, Literal>,
    dynamic: &'a FxHashSet<String>,
}

impl Env<'_> {
    fn lookup(&self, name: &str) -> Option<&Literal> {
        if self.dynamic.contains(name) {
            return None;
        }
        self.bindings.get(name)
    }

    /// Forget every name assigned anywhere inside `expr`. Used around
    /// preserved loop bodies and symbolic branches.
    fn invalidate_assigned(&mut self, expr: &Expr) {
        let mut targets = Vec::new();
        collect_assigned(expr, &mut targets);
        for t in targets {
            self.bindings.remove(&t);
        }
    }
}

fn collect_assigned(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Assign { target, value } => {
            if let Expr::Var(name) = target.as_ref() {
                out.push(name.clone());
            }
            collect_assigned(value, out);
        }
        Expr::Block(stmts) => {
            for s in stmts {
                collect_assigned(s, out);
            }
        }
        Expr::If { cond, then, else_ } => {
            collect_assigned(cond, out);
            collect_assigned(then, out);
            if let Some(e) = else_ {
                collect_assigned(e, out);
            }
        }
        Expr::For { var, body, .. } => {
            out.push(var.clone());
            collect_assigned(body, out);
        }
        Expr::While { body, .. } => collect_assigned(body, out),
        Expr::Let { bindings, body } => {
            for (_, v) in bindings {
                collect_assigned(v, out);
            }
            collect_assigned(body, out);
        }
        Expr::Hole { guards, .. } => {
            // A hole site may bind any of its guards once rewritten.
            out.extend(guards.iter().cloned());
        }
        _ => {}
    }
}

fn eval(expr: &Expr, env: &mut Env) -> Expr {
    match expr {
        Expr::Literal(_) | Expr::Quoted(_) | Expr::Break | Expr::Continue => expr.clone(),

        Expr::Var(name) => match env.lookup(name) {
            Some(lit) => Expr::Literal(lit.clone()),
            None => expr.clone(),
        },

        Expr::BinOp { op, lhs, rhs } => eval_binop(*op, lhs, rhs, env),

        Expr::Call { callee, args } => Expr::Call {
            callee: callee.clone(),
            args: args.iter().map(|a| eval(a, env)).collect(),
        },

        Expr::Assign { target, value } => eval_assign(target, value, env),

        Expr::IndexGet { container, key } => Expr::IndexGet {
            container: Box::new(eval(container, env)),
            key: Box::new(eval(key, env)),
        },

        Expr::IndexSet {
            container,
            key,
            value,
        } => Expr::IndexSet {
            container: Box::new(eval(container, env)),
            key: Box::new(eval(key, env)),
            value: Box::new(eval(value, env)),
        },

        Expr::If { cond, then, else_ } => eval_if(cond, then, else_.as_deref(), env),

        Expr::For {
            var,
            start,
            end,
            body,
        } => eval_for(var, start, end, body, env),

        Expr::While { cond, body } => eval_while(cond, body, env),

        Expr::Let { bindings, body } => {
            // Let-bound literals fold inside the body; symbolic initializers
            // shadow any outer binding of the same name.
            let mut evaled = Vec::with_capacity(bindings.len());
            let saved = env.bindings.clone();
            for (name, init) in bindings {
                let v = eval(init, env);
                match literal_of(&v) {
                    Some(lit) if !env.dynamic.contains(name) => {
                        env.bindings.insert(name.clone(), lit.clone());
                    }
                    _ => {
                        env.bindings.remove(name);
                    }
                }
                evaled.push((name.clone(), v));
            }
            let body = eval(body, env);
            env.bindings = saved;
            Expr::Let {
                bindings: evaled,
                body: Box::new(body),
            }
        }

        Expr::Block(stmts) => {
            let out = stmts
                .iter()
                .filter(|s| !s.is_line_marker())
                .map(|s| eval(s, env))
                .collect();
            Expr::Block(out)
        }

        Expr::Function { name, params, body } => {
            // A nested function runs whenever it is called, which may be
            // after any of the current bindings have changed. Its body is
            // evaluated with no inherited bindings at all.
            let saved = std::mem::take(&mut env.bindings);
            let body = eval(body, env);
            env.bindings = saved;
            Expr::Function {
                name: name.clone(),
                params: params.clone(),
                body: Box::new(body),
            }
        }

        Expr::Return(value) => Expr::Return(value.as_ref().map(|v| Box::new(eval(v, env)))),

        Expr::Tuple(elems) => Expr::Tuple(elems.iter().map(|e| eval(e, env)).collect()),
        Expr::Vector(elems) => Expr::Vector(elems.iter().map(|e| eval(e, env)).collect()),

        // Holes are preserved verbatim; annotations pass through untouched.
        Expr::Hole { .. } | Expr::Annotation { .. } => expr.clone(),
    }
}

fn literal_of(expr: &Expr) -> Option<&Literal> {
    match expr {
        Expr::Literal(lit) => Some(lit),
        _ => None,
    }
}

fn eval_assign(target: &Expr, value: &Expr, env: &mut Env) -> Expr {
    let value = eval(value, env);
    let name = match target {
        Expr::Var(name) => name.clone(),
        // Compound targets (index assignments arrive as IndexSet, so this
        // is only reachable for malformed trees) are preserved as-is.
        _ => {
            return Expr::Assign {
                target: Box::new(target.clone()),
                value: Box::new(value),
            }
        }
    };

    match literal_of(&value) {
        Some(lit) if !env.dynamic.contains(&name) => {
            env.bindings.insert(name.clone(), lit.clone());
        }
        _ => {
            // Residual right-hand side, or a name that must stay symbolic:
            // later reads cannot fold. Calls in particular are evaluated
            // exactly once, at this statement.
            env.bindings.remove(&name);
        }
    }
    Expr::Assign {
        target: Box::new(Expr::Var(name)),
        value: Box::new(value),
    }
}

fn eval_if(cond: &Expr, then: &Expr, else_: Option<&Expr>, env: &mut Env) -> Expr {
    let cond = eval(cond, env);
    match literal_truth(&cond) {
        Some(true) => eval(then, env),
        Some(false) => match else_ {
            Some(e) => eval(e, env),
            None => Expr::Block(vec![]),
        },
        None => {
            // Symbolic condition: evaluate each arm under a branch-scoped
            // clone and refrain from propagating arm-local bindings.
            let saved = env.bindings.clone();
            let then_out = eval(then, env);
            env.bindings = saved.clone();
            let else_out = else_.map(|e| eval(e, env));
            env.bindings = saved;
            env.invalidate_assigned(then);
            if let Some(e) = else_ {
                env.invalidate_assigned(e);
            }
            Expr::If {
                cond: Box::new(cond),
                then: Box::new(then_out),
                else_: else_out.map(Box::new),
            }
        }
    }
}

fn eval_for(var: &str, start: &Expr, end: &Expr, body: &Expr, env: &mut Env) -> Expr {
    let start = eval(start, env);
    let end = eval(end, env);

    if let (Some(Literal::Int(lo)), Some(Literal::Int(hi))) = (literal_of(&start), literal_of(&end))
    {
        let (lo, hi) = (*lo, *hi);
        let len = hi.saturating_sub(lo).saturating_add(1);
        if len <= 0 {
            return Expr::Block(vec![]);
        }
        if len <= MAX_UNROLL && !env.dynamic.contains(var) {
            let saved_var = env.bindings.get(var).cloned();
            let mut unrolled = Vec::with_capacity(len as usize);
            for i in lo..=hi {
                env.bindings.insert(var.to_string(), Literal::Int(i));
                match eval(body, env) {
                    Expr::Block(stmts) => unrolled.extend(stmts),
                    other => unrolled.push(other),
                }
            }
            match saved_var {
                Some(v) => {
                    env.bindings.insert(var.to_string(), v);
                }
                None => {
                    env.bindings.remove(var);
                }
            }
            return Expr::Block(unrolled);
        }
    }

    // Preserved loop: the induction variable and anything the body assigns
    // are unknown before, during, and after the loop.
    env.bindings.remove(var);
    env.invalidate_assigned(body);
    let body_out = eval(body, env);
    env.invalidate_assigned(body);
    Expr::For {
        var: var.to_string(),
        start: Box::new(start),
        end: Box::new(end),
        body: Box::new(body_out),
    }
}

fn eval_while(cond: &Expr, body: &Expr, env: &mut Env) -> Expr {
    // The condition is re-evaluated every iteration, so names the body
    // assigns must not fold inside it. Invalidate first, then look.
    let mut probe = Env {
        bindings: env.bindings.clone(),
        dynamic: env.dynamic,
    };
    probe.invalidate_assigned(body);
    let cond_evaled = eval(cond, &mut probe);

    match literal_truth(&cond_evaled) {
        Some(false) => Expr::Block(vec![]),
        _ => {
            env.invalidate_assigned(body);
            let body_out = eval(body, env);
            env.invalidate_assigned(body);
            Expr::While {
                cond: Box::new(cond_evaled),
                body: Box::new(body_out),
            }
        }
    }
}

/// True when discarding the expression cannot discard an observable
/// effect: no calls, stores, or loops anywhere inside.
fn is_effect_free(expr: &Expr) -> bool {
    match expr {
        Expr::Literal(_) | Expr::Quoted(_) | Expr::Var(_) => true,
        Expr::BinOp { lhs, rhs, .. } => is_effect_free(lhs) && is_effect_free(rhs),
        Expr::IndexGet { container, key } => is_effect_free(container) && is_effect_free(key),
        Expr::Tuple(elems) | Expr::Vector(elems) => elems.iter().all(is_effect_free),
        _ => false,
    }
}

fn literal_truth(expr: &Expr) -> Option<bool> {
    match expr {
        Expr::Literal(Literal::Bool(b)) => Some(*b),
        Expr::Literal(Literal::Int(i)) => Some(*i != 0),
        _ => None,
    }
}

fn eval_binop(op: BinOp, lhs: &Expr, rhs: &Expr, env: &mut Env) -> Expr {
    let lhs = eval(lhs, env);

    // Logical operators short-circuit on a literal left side before the
    // right side is even visited.
    if op.is_logical() {
        if let Some(b) = literal_truth(&lhs) {
            return match (op, b) {
                (BinOp::And, false) => Expr::bool(false),
                (BinOp::Or, true) => Expr::bool(true),
                _ => {
                    let rhs = eval(rhs, env);
                    match literal_truth(&rhs) {
                        Some(rb) => Expr::bool(rb),
                        None => rhs,
                    }
                }
            };
        }
        let rhs = eval(rhs, env);
        // A literal on the right can still decide the result when it is
        // the absorbing element, as long as dropping the left side
        // cannot drop an effect.
        match (op, literal_truth(&rhs)) {
            (BinOp::And, Some(false)) if is_effect_free(&lhs) => return Expr::bool(false),
            (BinOp::Or, Some(true)) if is_effect_free(&lhs) => return Expr::bool(true),
            _ => {}
        }
        return Expr::BinOp {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        };
    }

    let rhs = eval(rhs, env);
    if let (Some(a), Some(b)) = (literal_of(&lhs), literal_of(&rhs)) {
        if let Some(folded) = fold(op, a, b) {
            return Expr::Literal(folded);
        }
    }
    Expr::BinOp {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

/// Fold a binary operation over two literals. `None` means the operation
/// has no literal result (mixed shapes, division by zero) and the caller
/// falls back to emitting the expression untouched.
fn fold(op: BinOp, a: &Literal, b: &Literal) -> Option<Literal> {
    use Literal::*;
    match (a, b) {
        (Int(x), Int(y)) => {
            let (x, y) = (*x, *y);
            Some(match op {
                BinOp::Add => Int(x.wrapping_add(y)),
                BinOp::Sub => Int(x.wrapping_sub(y)),
                BinOp::Mul => Int(x.wrapping_mul(y)),
                BinOp::Div => {
                    if y == 0 {
                        return None;
                    }
                    Int(x.wrapping_div(y))
                }
                BinOp::Rem => {
                    if y == 0 {
                        return None;
                    }
                    Int(x.wrapping_rem(y))
                }
                BinOp::Lt => Bool(x < y),
                BinOp::Gt => Bool(x > y),
                BinOp::Le => Bool(x <= y),
                BinOp::Ge => Bool(x >= y),
                BinOp::Eq => Bool(x == y),
                BinOp::Ne => Bool(x != y),
                BinOp::And | BinOp::Or => return None,
            })
        }
        (Int(_), Float(_)) | (Float(_), Int(_)) | (Float(_), Float(_)) => {
            let x = as_f64(a)?;
            let y = as_f64(b)?;
            Some(match op {
                BinOp::Add => Float(x + y),
                BinOp::Sub => Float(x - y),
                BinOp::Mul => Float(x * y),
                BinOp::Div => Float(x / y),
                BinOp::Rem => Float(x % y),
                BinOp::Lt => Bool(x < y),
                BinOp::Gt => Bool(x > y),
                BinOp::Le => Bool(x <= y),
                BinOp::Ge => Bool(x >= y),
                BinOp::Eq => Bool(x == y),
                BinOp::Ne => Bool(x != y),
                BinOp::And | BinOp::Or => return None,
            })
        }
        (Bool(x), Bool(y)) => Some(match op {
            BinOp::Eq => Bool(x == y),
            BinOp::Ne => Bool(x != y),
            BinOp::And => Bool(*x && *y),
            BinOp::Or => Bool(*x || *y),
            _ => return None,
        }),
        (Str(x), Str(y)) => Some(match op {
            BinOp::Eq => Bool(x == y),
            BinOp::Ne => Bool(x != y),
            _ => return None,
        }),
        _ => None,
    }
}

fn as_f64(lit: &Literal) -> Option<f64> {
    match lit {
        Literal::Int(v) => Some(*v as f64),
        Literal::Float(v) => Some(*v),
        _ => None,
    }
}

/// Remove top-level literal assignments no later statement reads. The final
/// statement's assignment becomes its value instead, so the block still
/// evaluates to the same thing.
fn sweep_dead_stores(mut stmts: Vec<Expr>, dynamic: &FxHashSet<String>) -> Vec<Expr> {
    let mut i = stmts.len();
    while i > 0 {
        i -= 1;
        let name = match &stmts[i] {
            Expr::Assign { target, value } => match (target.as_ref(), value.as_ref()) {
                (Expr::Var(name), Expr::Literal(_)) if !dynamic.contains(name) => name.clone(),
                _ => continue,
            },
            _ => continue,
        };
        let read_later = stmts[i + 1..].iter().any(|s| reads_name(s, &name));
        if read_later {
            continue;
        }
        if i == stmts.len() - 1 {
            // Keep the block's value.
            if let Expr::Assign { value, .. } = stmts.remove(i) {
                stmts.push(*value);
            }
        } else {
            stmts.remove(i);
        }
    }
    stmts
}

/// Does `expr` read `name`? Stores to `name` do not count as reads, but
/// anything that might observe the binding later (loops, holes, nested
/// functions) does.
fn reads_name(expr: &Expr, name: &str) -> bool {
    match expr {
        Expr::Var(n) => n == name,
        Expr::Literal(_) | Expr::Quoted(_) | Expr::Break | Expr::Continue => false,
        Expr::BinOp { lhs, rhs, .. } => reads_name(lhs, name) || reads_name(rhs, name),
        Expr::Call { callee, args } => {
            reads_name(callee, name) || args.iter().any(|a| reads_name(a, name))
        }
        Expr::Assign { target, value } => {
            // The target itself is a write; compound targets can read.
            let target_reads = !matches!(target.as_ref(), Expr::Var(_)) && reads_name(target, name);
            target_reads || reads_name(value, name)
        }
        Expr::IndexGet { container, key } => reads_name(container, name) || reads_name(key, name),
        Expr::IndexSet {
            container,
            key,
            value,
        } => reads_name(container, name) || reads_name(key, name) || reads_name(value, name),
        Expr::If { cond, then, else_ } => {
            reads_name(cond, name)
                || reads_name(then, name)
                || else_.as_deref().map_or(false, |e| reads_name(e, name))
        }
        Expr::For {
            var,
            start,
            end,
            body,
        } => {
            if reads_name(start, name) || reads_name(end, name) {
                return true;
            }
            // The induction variable shadows the name inside the body.
            var != name && reads_name(body, name)
        }
        Expr::While { cond, body } => reads_name(cond, name) || reads_name(body, name),
        Expr::Let { bindings, body } => {
            for (n, v) in bindings {
                if reads_name(v, name) {
                    return true;
                }
                if n == name {
                    // Shadowed from here on.
                    return false;
                }
            }
            reads_name(body, name)
        }
        Expr::Block(stmts) => stmts.iter().any(|s| reads_name(s, name)),
        Expr::Function { params, body, .. } => {
            !params.iter().any(|p| p == name) && reads_name(body, name)
        }
        Expr::Return(v) => v.as_deref().map_or(false, |e| reads_name(e, name)),
        Expr::Tuple(elems) | Expr::Vector(elems) => elems.iter().any(|e| reads_name(e, name)),
        Expr::Hole { guards, .. } => guards.iter().any(|g| g == name),
        Expr::Annotation { args, .. } => args.iter().any(|a| reads_name(a, name)),
    }
}
