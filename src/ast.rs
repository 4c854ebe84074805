//! Expression tree for notebook cells
//!
//! A cell is a tagged-variant tree. Nodes are immutable after construction;
//! every transformation in the pipeline produces a new tree. `Clone` is the
//! deep copy; the tree is acyclic by construction.
//!
//! Identity for caching purposes is the 64-bit structural fingerprint, which
//! hashes the shape of the tree with source-position annotations stripped.

use rustc_hash::FxHasher;
use std::hash::Hasher;

/// Literal scalar values.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

/// Binary operators, arithmetic through logical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinOp {
    /// True for `< > <= >= == !=`.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge | BinOp::Eq | BinOp::Ne
        )
    }

    /// True for `&&` / `||`.
    pub fn is_logical(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }
}

/// Expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    /// A quoted name, interned as a symbol at runtime.
    Quoted(String),
    Var(String),
    BinOp {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
    },
    IndexGet {
        container: Box<Expr>,
        key: Box<Expr>,
    },
    IndexSet {
        container: Box<Expr>,
        key: Box<Expr>,
        value: Box<Expr>,
    },
    If {
        cond: Box<Expr>,
        then: Box<Expr>,
        else_: Option<Box<Expr>>,
    },
    /// Inclusive integer range loop: `for var in start:end`.
    For {
        var: String,
        start: Box<Expr>,
        end: Box<Expr>,
        body: Box<Expr>,
    },
    While {
        cond: Box<Expr>,
        body: Box<Expr>,
    },
    Let {
        bindings: Vec<(String, Expr)>,
        body: Box<Expr>,
    },
    Block(Vec<Expr>),
    Function {
        name: String,
        params: Vec<String>,
        body: Box<Expr>,
    },
    Return(Option<Box<Expr>>),
    Break,
    Continue,
    Tuple(Vec<Expr>),
    Vector(Vec<Expr>),
    /// An extracted hole site: the guard names it may read and its
    /// 1-based ordinal within the cell.
    Hole {
        guards: Vec<String>,
        ordinal: u32,
    },
    /// Surface annotation, e.g. the hole marker before rewriting or a
    /// line-position marker. Unrecognized annotations pass through the
    /// pipeline untouched.
    Annotation {
        name: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn int(v: i64) -> Expr {
        Expr::Literal(Literal::Int(v))
    }

    pub fn float(v: f64) -> Expr {
        Expr::Literal(Literal::Float(v))
    }

    pub fn bool(v: bool) -> Expr {
        Expr::Literal(Literal::Bool(v))
    }

    pub fn str(v: impl Into<String>) -> Expr {
        Expr::Literal(Literal::Str(v.into()))
    }

    pub fn var(name: impl Into<String>) -> Expr {
        Expr::Var(name.into())
    }

    pub fn assign(target: impl Into<String>, value: Expr) -> Expr {
        Expr::Assign {
            target: Box::new(Expr::Var(target.into())),
            value: Box::new(value),
        }
    }

    pub fn binop(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::BinOp {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn call(callee: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Call {
            callee: Box::new(Expr::Var(callee.into())),
            args,
        }
    }

    /// Source-position marker, dropped during normalization.
    pub fn line(n: i64) -> Expr {
        Expr::Annotation {
            name: "line".to_string(),
            args: vec![Expr::int(n)],
        }
    }

    /// True for line-position annotations.
    pub fn is_line_marker(&self) -> bool {
        matches!(self, Expr::Annotation { name, .. } if name == "line")
    }

    /// True for a literal node.
    pub fn is_literal(&self) -> bool {
        matches!(self, Expr::Literal(_))
    }

    /// Structural 64-bit fingerprint with source positions stripped.
    ///
    /// Equal fingerprints imply the trees compile to the same artifact:
    /// the hash covers every semantically meaningful field and skips
    /// line markers wherever they appear.
    pub fn fingerprint(&self) -> u64 {
        let mut h = FxHasher::default();
        hash_expr(self, &mut h);
        h.finish()
    }

    /// Collect every name referenced by this expression, in pre-order
    /// insertion order, into `out` (deduplicated by the caller's seen-set).
    pub fn collect_names(&self, out: &mut Vec<String>, seen: &mut rustc_hash::FxHashSet<String>) {
        let push = |name: &str, out: &mut Vec<String>, seen: &mut rustc_hash::FxHashSet<String>| {
            if seen.insert(name.to_string()) {
                out.push(name.to_string());
            }
        };
        match self {
            Expr::Literal(_) | Expr::Quoted(_) | Expr::Break | Expr::Continue => {}
            Expr::Var(name) => push(name, out, seen),
            Expr::BinOp { lhs, rhs, .. } => {
                lhs.collect_names(out, seen);
                rhs.collect_names(out, seen);
            }
            Expr::Call { callee, args } => {
                callee.collect_names(out, seen);
                for a in args {
                    a.collect_names(out, seen);
                }
            }
            Expr::Assign { target, value } => {
                target.collect_names(out, seen);
                value.collect_names(out, seen);
            }
            Expr::IndexGet { container, key } => {
                container.collect_names(out, seen);
                key.collect_names(out, seen);
            }
            Expr::IndexSet {
                container,
                key,
                value,
            } => {
                container.collect_names(out, seen);
                key.collect_names(out, seen);
                value.collect_names(out, seen);
            }
            Expr::If { cond, then, else_ } => {
                cond.collect_names(out, seen);
                then.collect_names(out, seen);
                if let Some(e) = else_ {
                    e.collect_names(out, seen);
                }
            }
            Expr::For {
                var,
                start,
                end,
                body,
            } => {
                push(var, out, seen);
                start.collect_names(out, seen);
                end.collect_names(out, seen);
                body.collect_names(out, seen);
            }
            Expr::While { cond, body } => {
                cond.collect_names(out, seen);
                body.collect_names(out, seen);
            }
            Expr::Let { bindings, body } => {
                for (name, value) in bindings {
                    push(name, out, seen);
                    value.collect_names(out, seen);
                }
                body.collect_names(out, seen);
            }
            Expr::Block(stmts) => {
                for s in stmts {
                    s.collect_names(out, seen);
                }
            }
            Expr::Function { params, body, .. } => {
                for p in params {
                    push(p, out, seen);
                }
                body.collect_names(out, seen);
            }
            Expr::Return(value) => {
                if let Some(v) = value {
                    v.collect_names(out, seen);
                }
            }
            Expr::Tuple(elems) | Expr::Vector(elems) => {
                for e in elems {
                    e.collect_names(out, seen);
                }
            }
            Expr::Hole { guards, .. } => {
                for g in guards {
                    push(g, out, seen);
                }
            }
            Expr::Annotation { args, .. } => {
                for a in args {
                    a.collect_names(out, seen);
                }
            }
        }
    }
}

fn hash_str(s: &str, h: &mut FxHasher) {
    h.write_usize(s.len());
    h.write(s.as_bytes());
}

fn hash_expr(e: &Expr, h: &mut FxHasher) {
    match e {
        Expr::Literal(lit) => {
            h.write_u8(1);
            match lit {
                Literal::Int(v) => {
                    h.write_u8(1);
                    h.write_i64(*v);
                }
                Literal::Float(v) => {
                    h.write_u8(2);
                    h.write_u64(v.to_bits());
                }
                Literal::Bool(v) => {
                    h.write_u8(3);
                    h.write_u8(*v as u8);
                }
                Literal::Str(v) => {
                    h.write_u8(4);
                    hash_str(v, h);
                }
            }
        }
        Expr::Quoted(name) => {
            h.write_u8(2);
            hash_str(name, h);
        }
        Expr::Var(name) => {
            h.write_u8(3);
            hash_str(name, h);
        }
        Expr::BinOp { op, lhs, rhs } => {
            h.write_u8(4);
            h.write_u8(*op as u8);
            hash_expr(lhs, h);
            hash_expr(rhs, h);
        }
        Expr::Call { callee, args } => {
            h.write_u8(5);
            hash_expr(callee, h);
            h.write_usize(args.len());
            for a in args {
                hash_expr(a, h);
            }
        }
        Expr::Assign { target, value } => {
            h.write_u8(6);
            hash_expr(target, h);
            hash_expr(value, h);
        }
        Expr::IndexGet { container, key } => {
            h.write_u8(7);
            hash_expr(container, h);
            hash_expr(key, h);
        }
        Expr::IndexSet {
            container,
            key,
            value,
        } => {
            h.write_u8(8);
            hash_expr(container, h);
            hash_expr(key, h);
            hash_expr(value, h);
        }
        Expr::If { cond, then, else_ } => {
            h.write_u8(9);
            hash_expr(cond, h);
            hash_expr(then, h);
            match else_ {
                Some(e) => {
                    h.write_u8(1);
                    hash_expr(e, h);
                }
                None => h.write_u8(0),
            }
        }
        Expr::For {
            var,
            start,
            end,
            body,
        } => {
            h.write_u8(10);
            hash_str(var, h);
            hash_expr(start, h);
            hash_expr(end, h);
            hash_expr(body, h);
        }
        Expr::While { cond, body } => {
            h.write_u8(11);
            hash_expr(cond, h);
            hash_expr(body, h);
        }
        Expr::Let { bindings, body } => {
            h.write_u8(12);
            h.write_usize(bindings.len());
            for (name, value) in bindings {
                hash_str(name, h);
                hash_expr(value, h);
            }
            hash_expr(body, h);
        }
        Expr::Block(stmts) => {
            h.write_u8(13);
            // Line markers carry no structure.
            let meaningful = stmts.iter().filter(|s| !s.is_line_marker());
            for s in meaningful {
                hash_expr(s, h);
            }
            h.write_u8(0xff);
        }
        Expr::Function { name, params, body } => {
            h.write_u8(14);
            hash_str(name, h);
            h.write_usize(params.len());
            for p in params {
                hash_str(p, h);
            }
            hash_expr(body, h);
        }
        Expr::Return(value) => {
            h.write_u8(15);
            match value {
                Some(v) => {
                    h.write_u8(1);
                    hash_expr(v, h);
                }
                None => h.write_u8(0),
            }
        }
        Expr::Break => h.write_u8(16),
        Expr::Continue => h.write_u8(17),
        Expr::Tuple(elems) => {
            h.write_u8(18);
            h.write_usize(elems.len());
            for e in elems {
                hash_expr(e, h);
            }
        }
        Expr::Vector(elems) => {
            h.write_u8(19);
            h.write_usize(elems.len());
            for e in elems {
                hash_expr(e, h);
            }
        }
        Expr::Hole { guards, ordinal } => {
            h.write_u8(20);
            h.write_u32(*ordinal);
            h.write_usize(guards.len());
            for g in guards {
                hash_str(g, h);
            }
        }
        Expr::Annotation { name, args } => {
            if name == "line" {
                // Source positions never contribute to identity.
                return;
            }
            h.write_u8(21);
            hash_str(name, h);
            h.write_usize(args.len());
            for a in args {
                hash_expr(a, h);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Expr {
        Expr::Block(vec![
            Expr::assign("x", Expr::int(10)),
            Expr::assign("y", Expr::binop(BinOp::Add, Expr::var("x"), Expr::int(5))),
            Expr::Return(Some(Box::new(Expr::var("y")))),
        ])
    }

    #[test]
    fn fingerprint_is_stable_across_deep_copy() {
        let a = sample_block();
        let b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_ignores_line_markers() {
        let plain = sample_block();
        let with_lines = Expr::Block(vec![
            Expr::line(1),
            Expr::assign("x", Expr::int(10)),
            Expr::line(2),
            Expr::assign("y", Expr::binop(BinOp::Add, Expr::var("x"), Expr::int(5))),
            Expr::line(3),
            Expr::Return(Some(Box::new(Expr::var("y")))),
        ]);
        assert_eq!(plain.fingerprint(), with_lines.fingerprint());
    }

    #[test]
    fn fingerprint_distinguishes_values_and_shapes() {
        let a = Expr::assign("x", Expr::int(10));
        let b = Expr::assign("x", Expr::int(11));
        let c = Expr::assign("y", Expr::int(10));
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());

        // An empty block and an empty tuple are different shapes.
        assert_ne!(
            Expr::Block(vec![]).fingerprint(),
            Expr::Tuple(vec![]).fingerprint()
        );
    }

    #[test]
    fn fingerprint_distinguishes_float_bits() {
        assert_ne!(
            Expr::float(0.0).fingerprint(),
            Expr::float(-0.0).fingerprint()
        );
    }

    #[test]
    fn collect_names_preorder_dedup() {
        let e = Expr::Block(vec![
            Expr::assign("x", Expr::int(1)),
            Expr::assign("y", Expr::binop(BinOp::Add, Expr::var("x"), Expr::var("x"))),
        ]);
        let mut out = Vec::new();
        let mut seen = rustc_hash::FxHashSet::default();
        e.collect_names(&mut out, &mut seen);
        assert_eq!(out, vec!["x".to_string(), "y".to_string()]);
    }
}
