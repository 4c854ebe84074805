//! Signature inference for compiled units
//!
//! Every unit function has the uniform ABI `(i64, …) -> i64`; what varies
//! is whether a parameter or the return carries a boxed pointer. A
//! parameter is boxed when the body ever assigns it a dictionary
//! construction; the return is boxed when the body's final expression is,
//! transitively through variable bindings, a dictionary construction.

use rustc_hash::FxHashSet;

use crate::ast::Expr;

/// Callee name recognized as dictionary construction.
pub const DICT_CONSTRUCTOR: &str = "Dict";

fn is_dict_call(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Call { callee, .. } if matches!(callee.as_ref(), Expr::Var(n) if n == DICT_CONSTRUCTOR)
    )
}

/// True when `param` is ever assigned a dictionary construction in `body`.
pub fn param_is_boxed(body: &Expr, param: &str) -> bool {
    let mut found = false;
    walk(body, &mut |e| {
        if let Expr::Assign { target, value } = e {
            if matches!(target.as_ref(), Expr::Var(n) if n == param) && is_dict_call(value) {
                found = true;
            }
        }
    });
    found
}

/// True when the final expression of `body` produces a dictionary,
/// following assignments of the form `name = Dict()` and `name = other`.
pub fn returns_boxed(body: &Expr) -> bool {
    let mut dicty: FxHashSet<String> = FxHashSet::default();
    let stmts = match body {
        Expr::Block(stmts) => stmts.as_slice(),
        other => std::slice::from_ref(other),
    };

    let mut last_is_dict = false;
    for stmt in stmts {
        if stmt.is_line_marker() {
            continue;
        }
        last_is_dict = match stmt {
            Expr::Assign { target, value } => {
                let v_dict = expr_is_dict(value, &dicty);
                if let Expr::Var(name) = target.as_ref() {
                    if v_dict {
                        dicty.insert(name.clone());
                    } else {
                        dicty.remove(name);
                    }
                }
                v_dict
            }
            Expr::Return(Some(v)) => return expr_is_dict(v, &dicty),
            Expr::Return(None) => return false,
            other => expr_is_dict(other, &dicty),
        };
    }
    last_is_dict
}

fn expr_is_dict(expr: &Expr, dicty: &FxHashSet<String>) -> bool {
    match expr {
        Expr::Var(name) => dicty.contains(name),
        Expr::Call { .. } => is_dict_call(expr),
        Expr::Block(stmts) => stmts
            .iter()
            .filter(|s| !s.is_line_marker())
            .last()
            .map_or(false, |s| expr_is_dict(s, dicty)),
        Expr::Assign { value, .. } => expr_is_dict(value, dicty),
        _ => false,
    }
}

fn walk(expr: &Expr, f: &mut impl FnMut(&Expr)) {
    f(expr);
    match expr {
        Expr::BinOp { lhs, rhs, .. } => {
            walk(lhs, f);
            walk(rhs, f);
        }
        Expr::Call { callee, args } => {
            walk(callee, f);
            for a in args {
                walk(a, f);
            }
        }
        Expr::Assign { target, value } => {
            walk(target, f);
            walk(value, f);
        }
        Expr::IndexGet { container, key } => {
            walk(container, f);
            walk(key, f);
        }
        Expr::IndexSet {
            container,
            key,
            value,
        } => {
            walk(container, f);
            walk(key, f);
            walk(value, f);
        }
        Expr::If { cond, then, else_ } => {
            walk(cond, f);
            walk(then, f);
            if let Some(e) = else_ {
                walk(e, f);
            }
        }
        Expr::For {
            start, end, body, ..
        } => {
            walk(start, f);
            walk(end, f);
            walk(body, f);
        }
        Expr::While { cond, body } => {
            walk(cond, f);
            walk(body, f);
        }
        Expr::Let { bindings, body } => {
            for (_, v) in bindings {
                walk(v, f);
            }
            walk(body, f);
        }
        Expr::Block(stmts) => {
            for s in stmts {
                walk(s, f);
            }
        }
        Expr::Function { body, .. } => walk(body, f),
        Expr::Return(Some(v)) => walk(v, f),
        Expr::Tuple(elems) | Expr::Vector(elems) => {
            for e in elems {
                walk(e, f);
            }
        }
        Expr::Annotation { args, .. } => {
            for a in args {
                walk(a, f);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dict_assignment_makes_param_boxed() {
        let body = Expr::Block(vec![Expr::assign("d", Expr::call(DICT_CONSTRUCTOR, vec![]))]);
        assert!(param_is_boxed(&body, "d"));
        assert!(!param_is_boxed(&body, "x"));
    }

    #[test]
    fn return_boxedness_follows_bindings() {
        // d = Dict(); d[1] = 2; d  →  boxed
        let body = Expr::Block(vec![
            Expr::assign("d", Expr::call(DICT_CONSTRUCTOR, vec![])),
            Expr::IndexSet {
                container: Box::new(Expr::var("d")),
                key: Box::new(Expr::int(1)),
                value: Box::new(Expr::int(2)),
            },
            Expr::var("d"),
        ]);
        assert!(returns_boxed(&body));

        // Rebinding to a non-dict clears it.
        let body = Expr::Block(vec![
            Expr::assign("d", Expr::call(DICT_CONSTRUCTOR, vec![])),
            Expr::assign("d", Expr::int(1)),
            Expr::var("d"),
        ]);
        assert!(!returns_boxed(&body));
    }

    #[test]
    fn explicit_return_is_inspected() {
        let body = Expr::Block(vec![
            Expr::assign("d", Expr::call(DICT_CONSTRUCTOR, vec![])),
            Expr::Return(Some(Box::new(Expr::var("d")))),
        ]);
        assert!(returns_boxed(&body));
    }

    #[test]
    fn plain_arithmetic_returns_integer() {
        let body = Expr::Block(vec![Expr::binop(
            crate::ast::BinOp::Add,
            Expr::int(1),
            Expr::int(2),
        )]);
        assert!(!returns_boxed(&body));
    }
}
