//! Shared test support: a tree-walking reference interpreter.
//!
//! Integration and property tests check that compiled cells return the
//! same value as direct evaluation of the user's source. Hole
//! annotations are transparent here: their bodies evaluate inline, which
//! is exactly the semantics the split compiler must preserve.

#![allow(dead_code)]

use std::collections::HashMap;

use nbjit::{read_program, BinOp, Expr, Literal};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Symbol(String),
    Dict(HashMap<DictKey, Value>),
    Unit,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DictKey {
    Int(i64),
    FloatBits(u64),
    Symbol(String),
    Str(String),
}

impl Value {
    /// The 64-bit result a compiled cell entry would produce.
    pub fn as_entry_i64(&self) -> i64 {
        match self {
            Value::Int(v) => *v,
            Value::Float(v) => *v as i64,
            Value::Bool(v) => *v as i64,
            _ => 0,
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            _ => false,
        }
    }

    fn dict_key(&self) -> DictKey {
        match self {
            Value::Int(v) => DictKey::Int(*v),
            Value::Float(v) => DictKey::FloatBits(v.to_bits()),
            Value::Symbol(s) => DictKey::Symbol(s.clone()),
            Value::Str(s) => DictKey::Str(s.clone()),
            other => panic!("unusable dictionary key: {:?}", other),
        }
    }
}

enum Flow {
    Normal(Value),
    Return(Value),
    Break,
    Continue,
}

#[derive(Default)]
pub struct Interp {
    scopes: Vec<HashMap<String, Value>>,
    functions: HashMap<String, (Vec<String>, Expr)>,
}

impl Interp {
    pub fn new() -> Interp {
        Interp {
            scopes: vec![HashMap::new()],
            functions: HashMap::new(),
        }
    }

    pub fn eval_program(&mut self, ast: &Expr) -> Value {
        match self.eval(ast) {
            Flow::Normal(v) | Flow::Return(v) => v,
            Flow::Break | Flow::Continue => Value::Unit,
        }
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        for scope in self.scopes.iter().rev() {
            if let Some(v) = scope.get(name) {
                return Some(v.clone());
            }
        }
        None
    }

    fn assign(&mut self, name: &str, value: Value) {
        for scope in self.scopes.iter_mut().rev() {
            if scope.contains_key(name) {
                scope.insert(name.to_string(), value);
                return;
            }
        }
        self.scopes
            .last_mut()
            .unwrap()
            .insert(name.to_string(), value);
    }

    fn eval(&mut self, expr: &Expr) -> Flow {
        match expr {
            Expr::Literal(lit) => Flow::Normal(match lit {
                Literal::Int(v) => Value::Int(*v),
                Literal::Float(v) => Value::Float(*v),
                Literal::Bool(v) => Value::Bool(*v),
                Literal::Str(v) => Value::Str(v.clone()),
            }),
            Expr::Quoted(name) => Flow::Normal(Value::Symbol(name.clone())),
            Expr::Var(name) => Flow::Normal(
                self.lookup(name)
                    .unwrap_or_else(|| panic!("undefined variable '{}'", name)),
            ),
            Expr::BinOp { op, lhs, rhs } => self.eval_binop(*op, lhs, rhs),
            Expr::Call { callee, args } => self.eval_call(callee, args),
            Expr::Assign { target, value } => {
                let v = match self.eval(value) {
                    Flow::Normal(v) => v,
                    other => return other,
                };
                match target.as_ref() {
                    Expr::Var(name) => self.assign(name, v.clone()),
                    other => panic!("bad assignment target: {:?}", other),
                }
                Flow::Normal(v)
            }
            Expr::IndexGet { container, key } => {
                let c = match self.eval(container) {
                    Flow::Normal(v) => v,
                    other => return other,
                };
                let k = match self.eval(key) {
                    Flow::Normal(v) => v,
                    other => return other,
                };
                match c {
                    Value::Dict(map) => {
                        Flow::Normal(map.get(&k.dict_key()).cloned().unwrap_or(Value::Unit))
                    }
                    other => panic!("index into non-dictionary: {:?}", other),
                }
            }
            Expr::IndexSet {
                container,
                key,
                value,
            } => {
                let k = match self.eval(key) {
                    Flow::Normal(v) => v,
                    other => return other,
                };
                let v = match self.eval(value) {
                    Flow::Normal(v) => v,
                    other => return other,
                };
                // Containers live in variables; update through the name.
                match container.as_ref() {
                    Expr::Var(name) => {
                        let mut dict = match self.lookup(name) {
                            Some(Value::Dict(map)) => map,
                            other => panic!("index-set into {:?}", other),
                        };
                        dict.insert(k.dict_key(), v.clone());
                        self.assign(name, Value::Dict(dict));
                    }
                    other => panic!("unsupported index-set container: {:?}", other),
                }
                Flow::Normal(v)
            }
            Expr::If { cond, then, else_ } => {
                let c = match self.eval(cond) {
                    Flow::Normal(v) => v,
                    other => return other,
                };
                if c.truthy() {
                    self.scoped(then)
                } else if let Some(e) = else_ {
                    self.scoped(e)
                } else {
                    Flow::Normal(Value::Unit)
                }
            }
            Expr::For {
                var,
                start,
                end,
                body,
            } => {
                let lo = match self.eval(start) {
                    Flow::Normal(Value::Int(v)) => v,
                    Flow::Normal(other) => panic!("non-integer range start: {:?}", other),
                    other => return other,
                };
                let hi = match self.eval(end) {
                    Flow::Normal(Value::Int(v)) => v,
                    Flow::Normal(other) => panic!("non-integer range end: {:?}", other),
                    other => return other,
                };
                for i in lo..=hi {
                    self.scopes.push(HashMap::new());
                    self.scopes
                        .last_mut()
                        .unwrap()
                        .insert(var.clone(), Value::Int(i));
                    let flow = self.eval(body);
                    self.scopes.pop();
                    match flow {
                        Flow::Break => break,
                        Flow::Continue | Flow::Normal(_) => {}
                        Flow::Return(v) => return Flow::Return(v),
                    }
                }
                Flow::Normal(Value::Unit)
            }
            Expr::While { cond, body } => {
                loop {
                    let c = match self.eval(cond) {
                        Flow::Normal(v) => v,
                        other => return other,
                    };
                    if !c.truthy() {
                        break;
                    }
                    self.scopes.push(HashMap::new());
                    let flow = self.eval(body);
                    self.scopes.pop();
                    match flow {
                        Flow::Break => break,
                        Flow::Continue | Flow::Normal(_) => {}
                        Flow::Return(v) => return Flow::Return(v),
                    }
                }
                Flow::Normal(Value::Unit)
            }
            Expr::Let { bindings, body } => {
                self.scopes.push(HashMap::new());
                for (name, init) in bindings {
                    let v = match self.eval(init) {
                        Flow::Normal(v) => v,
                        other => {
                            self.scopes.pop();
                            return other;
                        }
                    };
                    self.scopes.last_mut().unwrap().insert(name.clone(), v);
                }
                let flow = self.eval(body);
                self.scopes.pop();
                flow
            }
            Expr::Block(stmts) => {
                let mut last = Value::Unit;
                for stmt in stmts.iter().filter(|s| !s.is_line_marker()) {
                    match self.eval(stmt) {
                        Flow::Normal(v) => last = v,
                        other => return other,
                    }
                }
                Flow::Normal(last)
            }
            Expr::Function { name, params, body } => {
                self.functions
                    .insert(name.clone(), (params.clone(), body.as_ref().clone()));
                Flow::Normal(Value::Unit)
            }
            Expr::Return(value) => {
                let v = match value {
                    Some(e) => match self.eval(e) {
                        Flow::Normal(v) => v,
                        other => return other,
                    },
                    None => Value::Unit,
                };
                Flow::Return(v)
            }
            Expr::Break => Flow::Break,
            Expr::Continue => Flow::Continue,
            Expr::Tuple(_) | Expr::Vector(_) => panic!("aggregate literals are not supported"),
            Expr::Hole { .. } => panic!("explicit hole nodes are not interpretable"),
            Expr::Annotation { name, args } => {
                if name == "line" {
                    return Flow::Normal(Value::Unit);
                }
                // Hole annotations evaluate their body inline; anything
                // else is inert.
                if name == "hole" {
                    let mut last = Value::Unit;
                    for a in args {
                        match self.eval(a) {
                            Flow::Normal(v) => last = v,
                            other => return other,
                        }
                    }
                    return Flow::Normal(last);
                }
                Flow::Normal(Value::Unit)
            }
        }
    }

    fn scoped(&mut self, expr: &Expr) -> Flow {
        self.scopes.push(HashMap::new());
        let flow = self.eval(expr);
        self.scopes.pop();
        flow
    }

    fn eval_call(&mut self, callee: &Expr, args: &[Expr]) -> Flow {
        let name = match callee {
            Expr::Var(name) => name.clone(),
            other => panic!("unsupported callee: {:?}", other),
        };
        let mut values = Vec::with_capacity(args.len());
        for a in args {
            match self.eval(a) {
                Flow::Normal(v) => values.push(v),
                other => return other,
            }
        }
        match name.as_str() {
            "Dict" => Flow::Normal(Value::Dict(HashMap::new())),
            "println" => Flow::Normal(Value::Unit),
            _ => {
                let (params, body) = self
                    .functions
                    .get(&name)
                    .cloned()
                    .unwrap_or_else(|| panic!("unknown function '{}'", name));
                assert_eq!(params.len(), values.len(), "arity mismatch calling {}", name);
                let saved = std::mem::take(&mut self.scopes);
                self.scopes = vec![HashMap::new()];
                for (p, v) in params.iter().zip(values) {
                    // Compiled units pass arguments through the i64 ABI.
                    self.scopes
                        .last_mut()
                        .unwrap()
                        .insert(p.clone(), abi_coerce(v));
                }
                let flow = self.eval(&body);
                self.scopes = saved;
                let v = match flow {
                    Flow::Return(v) | Flow::Normal(v) => v,
                    Flow::Break | Flow::Continue => Value::Unit,
                };
                // Returns cross the same boundary, except dictionaries,
                // which travel boxed.
                Flow::Normal(abi_coerce(v))
            }
        }
    }

    fn eval_binop(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Flow {
        use Value::*;
        if matches!(op, BinOp::And | BinOp::Or) {
            let l = match self.eval(lhs) {
                Flow::Normal(v) => v,
                other => return other,
            };
            return match (op, l.truthy()) {
                (BinOp::And, false) => Flow::Normal(Bool(false)),
                (BinOp::Or, true) => Flow::Normal(Bool(true)),
                _ => match self.eval(rhs) {
                    Flow::Normal(r) => Flow::Normal(Bool(r.truthy())),
                    other => other,
                },
            };
        }

        let l = match self.eval(lhs) {
            Flow::Normal(v) => v,
            other => return other,
        };
        let r = match self.eval(rhs) {
            Flow::Normal(v) => v,
            other => return other,
        };

        // Boxed-boundary parity: unbox-to-int semantics for dict values.
        let as_f = |v: &Value| -> Option<f64> {
            match v {
                Int(i) => Some(*i as f64),
                Float(f) => Some(*f),
                Bool(b) => Some(*b as i64 as f64),
                _ => None,
            }
        };
        let as_i = |v: &Value| -> Option<i64> {
            match v {
                Int(i) => Some(*i),
                Bool(b) => Some(*b as i64),
                _ => None,
            }
        };

        let float_math = matches!(l, Float(_)) || matches!(r, Float(_));
        let out = if float_math {
            let x = as_f(&l).unwrap_or_else(|| panic!("non-numeric operand {:?}", l));
            let y = as_f(&r).unwrap_or_else(|| panic!("non-numeric operand {:?}", r));
            match op {
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
                BinOp::And | BinOp::Or => unreachable!(),
            }
        } else {
            let x = as_i(&l).unwrap_or_else(|| panic!("non-integer operand {:?}", l));
            let y = as_i(&r).unwrap_or_else(|| panic!("non-integer operand {:?}", r));
            match op {
                BinOp::Add => Int(x.wrapping_add(y)),
                BinOp::Sub => Int(x.wrapping_sub(y)),
                BinOp::Mul => Int(x.wrapping_mul(y)),
                BinOp::Div => Int(x.wrapping_div(y)),
                BinOp::Rem => Int(x.wrapping_rem(y)),
                BinOp::Lt => Bool(x < y),
                BinOp::Gt => Bool(x > y),
                BinOp::Le => Bool(x <= y),
                BinOp::Ge => Bool(x >= y),
                BinOp::Eq => Bool(x == y),
                BinOp::Ne => Bool(x != y),
                BinOp::And | BinOp::Or => unreachable!(),
            }
        };
        Flow::Normal(out)
    }
}

/// Model the i64 ABI at compiled-function boundaries: floats truncate,
/// booleans widen, boxed values pass through.
fn abi_coerce(v: Value) -> Value {
    match v {
        Value::Float(f) => Value::Int(f as i64),
        Value::Bool(b) => Value::Int(b as i64),
        Value::Unit => Value::Int(0),
        other => other,
    }
}

/// Evaluate source with the reference interpreter and coerce the result
/// the way a compiled entry point does.
pub fn interp_i64(src: &str) -> i64 {
    let ast = read_program(src).expect("reference source parses");
    Interp::new().eval_program(&ast).as_entry_i64()
}

/// Evaluate an already-built AST.
pub fn interp_ast_i64(ast: &Expr) -> i64 {
    Interp::new().eval_program(ast).as_entry_i64()
}
