//! AST to Cranelift IR lowering for a single function
//!
//! `Lowerer` walks one function body and emits instructions through a
//! `FunctionBuilder`. Values carry a [`Carrier`] besides their IR type so
//! promotion (int/float), widening (bool), and boxing decisions happen at
//! the use site. Control flow follows the block skeletons described in the
//! module docs; every structured construct seals its blocks as soon as the
//! last predecessor is known.

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::types::{F64, I64, I8};
use cranelift_codegen::ir::{Block, InstBuilder, Value};
use cranelift_frontend::{FunctionBuilder, Variable};
use cranelift_module::{DataDescription, FuncId, Linkage, Module};
use cranelift_object::ObjectModule;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::ast::{BinOp, Expr, Literal};
use crate::codegen::infer::DICT_CONSTRUCTOR;
use crate::codegen::{carrier_type, Carrier, FuncInfo, LibcFuncs, PrintfShape, RuntimeHelpers};
use crate::error::NbError;

/// An SSA value tagged with its semantic carrier.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TypedVal {
    pub val: Value,
    pub carrier: Carrier,
}

/// Result of lowering one expression. `terminated` means the current block
/// already ends in a terminator (return, break, continue) and nothing more
/// may be emitted into it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Lowered {
    pub value: Option<TypedVal>,
    pub terminated: bool,
}

impl Lowered {
    fn value(val: Value, carrier: Carrier) -> Lowered {
        Lowered {
            value: Some(TypedVal { val, carrier }),
            terminated: false,
        }
    }

    fn none() -> Lowered {
        Lowered {
            value: None,
            terminated: false,
        }
    }

    fn terminated() -> Lowered {
        Lowered {
            value: None,
            terminated: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct VarSlot {
    var: Variable,
    carrier: Carrier,
}

struct LoopFrame {
    continue_block: Block,
    break_block: Block,
}

pub(crate) struct Lowerer<'a> {
    pub module: &'a mut ObjectModule,
    pub helpers: &'a RuntimeHelpers,
    pub libc: &'a mut LibcFuncs,
    pub local_funcs: &'a FxHashMap<String, FuncInfo>,
    pub extern_funcs: &'a FxHashMap<String, FuncInfo>,
    pub foreign_funcs: &'a mut FxHashMap<String, FuncInfo>,
    pub data_counter: &'a mut u32,
    pub unit_name: &'a str,
    scopes: Vec<FxHashMap<String, VarSlot>>,
    loops: Vec<LoopFrame>,
    var_counter: u32,
    returns_boxed: bool,
}

impl<'a> Lowerer<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        module: &'a mut ObjectModule,
        helpers: &'a RuntimeHelpers,
        libc: &'a mut LibcFuncs,
        local_funcs: &'a FxHashMap<String, FuncInfo>,
        extern_funcs: &'a FxHashMap<String, FuncInfo>,
        foreign_funcs: &'a mut FxHashMap<String, FuncInfo>,
        data_counter: &'a mut u32,
        unit_name: &'a str,
        returns_boxed: bool,
    ) -> Self {
        Lowerer {
            module,
            helpers,
            libc,
            local_funcs,
            extern_funcs,
            foreign_funcs,
            data_counter,
            unit_name,
            scopes: vec![FxHashMap::default()],
            loops: Vec::new(),
            var_counter: 0,
            returns_boxed,
        }
    }

    /// Declare the function's parameters in the root scope and store the
    /// incoming block-parameter values into them.
    pub(crate) fn bind_params(
        &mut self,
        b: &mut FunctionBuilder,
        entry: Block,
        params: &[(String, bool)],
    ) {
        let incoming: Vec<Value> = b.block_params(entry).to_vec();
        for (i, (name, boxed)) in params.iter().enumerate() {
            let carrier = if *boxed { Carrier::Boxed } else { Carrier::Int };
            let var = self.new_var(b, carrier);
            b.def_var(var, incoming[i]);
            self.declare_slot(name, var, carrier);
        }
    }

    /// Lower the function body and emit the final return if the body did
    /// not already terminate.
    pub(crate) fn lower_body(&mut self, b: &mut FunctionBuilder, body: &Expr) -> Result<(), NbError> {
        let lowered = self.lower_expr(b, body)?;
        if !lowered.terminated {
            self.emit_return(b, lowered.value)?;
        }
        Ok(())
    }

    // ── scopes and variables ────────────────────────────────────

    fn push_scope(&mut self) {
        self.scopes.push(FxHashMap::default());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn lookup(&self, name: &str) -> Option<VarSlot> {
        for scope in self.scopes.iter().rev() {
            if let Some(slot) = scope.get(name) {
                return Some(*slot);
            }
        }
        None
    }

    /// Declare into the innermost scope: induction variables, let
    /// bindings, parameters.
    fn declare_slot(&mut self, name: &str, var: Variable, carrier: Carrier) {
        self.scopes
            .last_mut()
            .expect("scope stack is never empty")
            .insert(name.to_string(), VarSlot { var, carrier });
    }

    /// Declare into the function scope. Assignment-created variables are
    /// function-local regardless of the block they first appear in, so a
    /// store inside a branch is visible after the merge.
    fn declare_root_slot(&mut self, name: &str, var: Variable, carrier: Carrier) {
        self.scopes
            .first_mut()
            .expect("scope stack is never empty")
            .insert(name.to_string(), VarSlot { var, carrier });
    }

    fn new_var(&mut self, b: &mut FunctionBuilder, carrier: Carrier) -> Variable {
        let var = Variable::from_u32(self.var_counter);
        self.var_counter += 1;
        b.declare_var(var, carrier_type(carrier));
        var
    }

    // ── expression dispatch ─────────────────────────────────────

    pub(crate) fn lower_expr(
        &mut self,
        b: &mut FunctionBuilder,
        expr: &Expr,
    ) -> Result<Lowered, NbError> {
        match expr {
            Expr::Literal(lit) => self.lower_literal(b, lit),

            Expr::Quoted(name) => {
                let text = name.clone();
                let ptr = self.cstr_data(b, &text)?;
                let sym = self
                    .call_helper(b, self.helpers.symbol_from_cstr, &[ptr])
                    .expect("symbol_from_cstr returns a value");
                Ok(Lowered::value(sym, Carrier::Boxed))
            }

            Expr::Var(name) => match self.lookup(name) {
                Some(slot) => {
                    let v = b.use_var(slot.var);
                    Ok(Lowered::value(v, slot.carrier))
                }
                None => Err(NbError::ir_build(format!("undefined variable '{}'", name))),
            },

            Expr::BinOp { op, lhs, rhs } => self.lower_binop(b, *op, lhs, rhs),

            Expr::Call { callee, args } => self.lower_call(b, callee, args),

            Expr::Assign { target, value } => self.lower_assign(b, target, value),

            Expr::IndexGet { container, key } => {
                let c = self.lower_operand(b, container)?;
                let k = self.lower_operand(b, key)?;
                let c = self.coerce(b, c, Carrier::Boxed)?;
                let k = self.coerce(b, k, Carrier::Boxed)?;
                let v = self
                    .call_helper(b, self.helpers.dict_get, &[c, k])
                    .expect("dict_get returns a value");
                Ok(Lowered::value(v, Carrier::Boxed))
            }

            Expr::IndexSet {
                container,
                key,
                value,
            } => {
                let c = self.lower_operand(b, container)?;
                let k = self.lower_operand(b, key)?;
                let v = self.lower_operand(b, value)?;
                let cb = self.coerce(b, c, Carrier::Boxed)?;
                let kb = self.coerce(b, k, Carrier::Boxed)?;
                let vb = self.coerce(b, v, Carrier::Boxed)?;
                // Runtime order: dict, value, key.
                self.call_helper(b, self.helpers.dict_set, &[cb, vb, kb]);
                Ok(Lowered::value(v.val, v.carrier))
            }

            Expr::If { cond, then, else_ } => self.lower_if(b, cond, then, else_.as_deref()),

            Expr::For {
                var,
                start,
                end,
                body,
            } => self.lower_for(b, var, start, end, body),

            Expr::While { cond, body } => self.lower_while(b, cond, body),

            Expr::Let { bindings, body } => {
                self.push_scope();
                for (name, init) in bindings {
                    let tv = match self.lower_expr(b, init)? {
                        l if l.terminated => {
                            self.pop_scope();
                            return Ok(l);
                        }
                        l => l.value.ok_or_else(|| {
                            NbError::ir_build(format!("let binding '{}' has no value", name))
                        })?,
                    };
                    let carrier = assign_carrier(tv.carrier);
                    let var = self.new_var(b, carrier);
                    let cv = self.coerce(b, tv, carrier)?;
                    b.def_var(var, cv);
                    self.declare_slot(name, var, carrier);
                }
                let out = self.lower_expr(b, body);
                self.pop_scope();
                out
            }

            Expr::Block(stmts) => self.lower_block(b, stmts),

            Expr::Function { name, .. } => Err(NbError::ir_build(format!(
                "nested function '{}' below unit top level",
                name
            ))),

            Expr::Return(value) => {
                let tv = match value {
                    Some(v) => {
                        let l = self.lower_expr(b, v)?;
                        if l.terminated {
                            return Ok(l);
                        }
                        l.value
                    }
                    None => None,
                };
                self.emit_return(b, tv)?;
                Ok(Lowered::terminated())
            }

            Expr::Break => {
                let frame = self
                    .loops
                    .last()
                    .ok_or_else(|| NbError::ir_build("break outside of a loop"))?;
                b.ins().jump(frame.break_block, &[]);
                Ok(Lowered::terminated())
            }

            Expr::Continue => {
                let frame = self
                    .loops
                    .last()
                    .ok_or_else(|| NbError::ir_build("continue outside of a loop"))?;
                b.ins().jump(frame.continue_block, &[]);
                Ok(Lowered::terminated())
            }

            Expr::Tuple(_) => Err(NbError::ir_build("tuple values are not compilable")),
            Expr::Vector(_) => Err(NbError::ir_build("vector values are not compilable")),

            Expr::Hole { ordinal, .. } => Err(NbError::ir_build(format!(
                "hole {} reached the IR builder unrewritten",
                ordinal
            ))),

            // Foreign annotations are inert at this stage.
            Expr::Annotation { .. } => Ok(Lowered::none()),
        }
    }

    /// Lower an expression that must produce a value.
    fn lower_operand(&mut self, b: &mut FunctionBuilder, expr: &Expr) -> Result<TypedVal, NbError> {
        let l = self.lower_expr(b, expr)?;
        if l.terminated {
            return Err(NbError::ir_build("operand terminates control flow"));
        }
        l.value
            .ok_or_else(|| NbError::ir_build("operand produced no value"))
    }

    fn lower_literal(&mut self, b: &mut FunctionBuilder, lit: &Literal) -> Result<Lowered, NbError> {
        Ok(match lit {
            Literal::Int(v) => Lowered::value(b.ins().iconst(I64, *v), Carrier::Int),
            Literal::Float(v) => Lowered::value(b.ins().f64const(*v), Carrier::Float),
            Literal::Bool(v) => Lowered::value(b.ins().iconst(I8, *v as i64), Carrier::Bool),
            Literal::Str(s) => {
                let text = s.clone();
                let ptr = self.cstr_data(b, &text)?;
                Lowered::value(ptr, Carrier::CStr)
            }
        })
    }

    fn lower_block(&mut self, b: &mut FunctionBuilder, stmts: &[Expr]) -> Result<Lowered, NbError> {
        self.push_scope();
        let mut last = None;
        for stmt in stmts.iter().filter(|s| !s.is_line_marker()) {
            let lowered = self.lower_expr(b, stmt)?;
            if lowered.terminated {
                self.pop_scope();
                // Anything after a terminator in the same block is
                // unreachable and is not emitted.
                return Ok(Lowered::terminated());
            }
            last = lowered.value;
        }
        self.pop_scope();
        Ok(Lowered {
            value: last,
            terminated: false,
        })
    }

    fn lower_assign(
        &mut self,
        b: &mut FunctionBuilder,
        target: &Expr,
        value: &Expr,
    ) -> Result<Lowered, NbError> {
        let name = match target {
            Expr::Var(name) => name.clone(),
            other => {
                return Err(NbError::ir_build(format!(
                    "unsupported assignment target: {:?}",
                    other
                )))
            }
        };
        let lowered = self.lower_expr(b, value)?;
        if lowered.terminated {
            return Ok(lowered);
        }
        let tv = lowered
            .value
            .ok_or_else(|| NbError::ir_build(format!("assignment to '{}' has no value", name)))?;

        match self.lookup(&name) {
            Some(slot) => {
                let cv = self.coerce(b, tv, slot.carrier)?;
                b.def_var(slot.var, cv);
            }
            None => {
                let carrier = assign_carrier(tv.carrier);
                let var = self.new_var(b, carrier);
                let cv = self.coerce(b, tv, carrier)?;
                b.def_var(var, cv);
                self.declare_root_slot(&name, var, carrier);
            }
        }
        // An assignment evaluates to its right-hand side.
        Ok(Lowered::value(tv.val, tv.carrier))
    }

    // ── control flow ────────────────────────────────────────────

    fn lower_if(
        &mut self,
        b: &mut FunctionBuilder,
        cond: &Expr,
        then: &Expr,
        else_: Option<&Expr>,
    ) -> Result<Lowered, NbError> {
        let c = self.lower_operand(b, cond)?;
        let cv = self.cond_val(b, c)?;

        let then_b = b.create_block();
        match else_ {
            None => {
                let merge_b = b.create_block();
                b.ins().brif(cv, then_b, &[], merge_b, &[]);
                b.seal_block(then_b);

                b.switch_to_block(then_b);
                self.push_scope();
                let t = self.lower_expr(b, then)?;
                self.pop_scope();
                if !t.terminated {
                    b.ins().jump(merge_b, &[]);
                }
                b.seal_block(merge_b);
                b.switch_to_block(merge_b);
                // Without an else branch the construct has no value.
                Ok(Lowered::none())
            }
            Some(else_expr) => {
                let else_b = b.create_block();
                b.ins().brif(cv, then_b, &[], else_b, &[]);
                b.seal_block(then_b);
                b.seal_block(else_b);

                // Then branch decides the merge shape; the else value is
                // coerced to it.
                b.switch_to_block(then_b);
                self.push_scope();
                let t = self.lower_expr(b, then)?;
                self.pop_scope();

                let mut merge: Option<Block> = None;
                let mut merge_carrier: Option<Carrier> = None;
                if !t.terminated {
                    let mb = b.create_block();
                    match t.value {
                        Some(tv) => {
                            b.append_block_param(mb, carrier_type(tv.carrier));
                            merge_carrier = Some(tv.carrier);
                            b.ins().jump(mb, &[tv.val]);
                        }
                        None => {
                            b.ins().jump(mb, &[]);
                        }
                    }
                    merge = Some(mb);
                }

                b.switch_to_block(else_b);
                self.push_scope();
                let e = self.lower_expr(b, else_expr)?;
                self.pop_scope();
                if !e.terminated {
                    let mb = *merge.get_or_insert_with(|| b.create_block());
                    match merge_carrier {
                        Some(carrier) => {
                            let v = match e.value {
                                Some(ev) => self.coerce(b, ev, carrier)?,
                                None => self.zero_of(b, carrier),
                            };
                            b.ins().jump(mb, &[v]);
                        }
                        None => {
                            b.ins().jump(mb, &[]);
                        }
                    }
                }

                match merge {
                    None => Ok(Lowered::terminated()),
                    Some(mb) => {
                        b.seal_block(mb);
                        b.switch_to_block(mb);
                        let value = merge_carrier.map(|carrier| TypedVal {
                            val: b.block_params(mb)[0],
                            carrier,
                        });
                        Ok(Lowered {
                            value,
                            terminated: false,
                        })
                    }
                }
            }
        }
    }

    fn lower_while(
        &mut self,
        b: &mut FunctionBuilder,
        cond: &Expr,
        body: &Expr,
    ) -> Result<Lowered, NbError> {
        let header = b.create_block();
        let body_b = b.create_block();
        let exit = b.create_block();

        b.ins().jump(header, &[]);
        b.switch_to_block(header);
        let c = self.lower_operand(b, cond)?;
        let cv = self.cond_val(b, c)?;
        b.ins().brif(cv, body_b, &[], exit, &[]);
        b.seal_block(body_b);

        b.switch_to_block(body_b);
        self.loops.push(LoopFrame {
            continue_block: header,
            break_block: exit,
        });
        self.push_scope();
        let lowered = self.lower_expr(b, body)?;
        self.pop_scope();
        self.loops.pop();
        if !lowered.terminated {
            b.ins().jump(header, &[]);
        }
        // All back edges are in; the header and exit are complete.
        b.seal_block(header);
        b.seal_block(exit);

        b.switch_to_block(exit);
        Ok(Lowered::none())
    }

    fn lower_for(
        &mut self,
        b: &mut FunctionBuilder,
        var: &str,
        start: &Expr,
        end: &Expr,
        body: &Expr,
    ) -> Result<Lowered, NbError> {
        let start_v = self.lower_operand(b, start)?;
        let end_v = self.lower_operand(b, end)?;
        if start_v.carrier == Carrier::Float || end_v.carrier == Carrier::Float {
            return Err(NbError::ir_build("loop range bounds must be integers"));
        }
        let start_i = self.coerce(b, start_v, Carrier::Int)?;
        let end_i = self.coerce(b, end_v, Carrier::Int)?;

        self.push_scope();
        let ivar = self.new_var(b, Carrier::Int);
        b.def_var(ivar, start_i);
        self.declare_slot(var, ivar, Carrier::Int);

        let header = b.create_block();
        let body_b = b.create_block();
        let inc = b.create_block();
        let exit = b.create_block();

        b.ins().jump(header, &[]);
        b.switch_to_block(header);
        let iv = b.use_var(ivar);
        let keep_going = b.ins().icmp(IntCC::SignedLessThanOrEqual, iv, end_i);
        b.ins().brif(keep_going, body_b, &[], exit, &[]);
        b.seal_block(body_b);

        b.switch_to_block(body_b);
        self.loops.push(LoopFrame {
            continue_block: inc,
            break_block: exit,
        });
        let lowered = self.lower_expr(b, body)?;
        self.loops.pop();
        if !lowered.terminated {
            b.ins().jump(inc, &[]);
        }
        b.seal_block(inc);

        b.switch_to_block(inc);
        let iv = b.use_var(ivar);
        let next = b.ins().iadd_imm(iv, 1);
        b.def_var(ivar, next);
        b.ins().jump(header, &[]);
        b.seal_block(header);
        b.seal_block(exit);

        b.switch_to_block(exit);
        self.pop_scope();
        Ok(Lowered::none())
    }

    // ── operators ───────────────────────────────────────────────

    fn lower_binop(
        &mut self,
        b: &mut FunctionBuilder,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<Lowered, NbError> {
        if op.is_logical() {
            return self.lower_logical(b, op, lhs, rhs);
        }

        let lv = self.lower_operand(b, lhs)?;
        let rv = self.lower_operand(b, rhs)?;

        // Mixed arithmetic promotes to float; booleans widen to integer
        // first; boxed operands are unboxed as integers.
        let float_math = lv.carrier == Carrier::Float || rv.carrier == Carrier::Float;
        if float_math {
            let x = self.coerce(b, lv, Carrier::Float)?;
            let y = self.coerce(b, rv, Carrier::Float)?;
            if op.is_comparison() {
                let cc = match op {
                    BinOp::Lt => FloatCC::LessThan,
                    BinOp::Gt => FloatCC::GreaterThan,
                    BinOp::Le => FloatCC::LessThanOrEqual,
                    BinOp::Ge => FloatCC::GreaterThanOrEqual,
                    BinOp::Eq => FloatCC::Equal,
                    BinOp::Ne => FloatCC::NotEqual,
                    _ => unreachable!(),
                };
                let v = b.ins().fcmp(cc, x, y);
                return Ok(Lowered::value(v, Carrier::Bool));
            }
            let v = match op {
                BinOp::Add => b.ins().fadd(x, y),
                BinOp::Sub => b.ins().fsub(x, y),
                BinOp::Mul => b.ins().fmul(x, y),
                BinOp::Div => b.ins().fdiv(x, y),
                BinOp::Rem => {
                    let fmod = self.libc.fmod_id(self.module)?;
                    self.call_helper(b, fmod, &[x, y])
                        .expect("fmod returns a value")
                }
                _ => unreachable!(),
            };
            return Ok(Lowered::value(v, Carrier::Float));
        }

        let x = self.coerce(b, lv, Carrier::Int)?;
        let y = self.coerce(b, rv, Carrier::Int)?;
        if op.is_comparison() {
            let cc = match op {
                BinOp::Lt => IntCC::SignedLessThan,
                BinOp::Gt => IntCC::SignedGreaterThan,
                BinOp::Le => IntCC::SignedLessThanOrEqual,
                BinOp::Ge => IntCC::SignedGreaterThanOrEqual,
                BinOp::Eq => IntCC::Equal,
                BinOp::Ne => IntCC::NotEqual,
                _ => unreachable!(),
            };
            let v = b.ins().icmp(cc, x, y);
            return Ok(Lowered::value(v, Carrier::Bool));
        }
        let v = match op {
            BinOp::Add => b.ins().iadd(x, y),
            BinOp::Sub => b.ins().isub(x, y),
            BinOp::Mul => b.ins().imul(x, y),
            BinOp::Div => b.ins().sdiv(x, y),
            BinOp::Rem => b.ins().srem(x, y),
            _ => unreachable!(),
        };
        Ok(Lowered::value(v, Carrier::Int))
    }

    /// Short-circuit `&&` / `||`: a two-block diamond whose merge phi
    /// selects the short-circuit constant or the evaluated right side.
    fn lower_logical(
        &mut self,
        b: &mut FunctionBuilder,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<Lowered, NbError> {
        let lv = self.lower_operand(b, lhs)?;
        let lc = self.cond_val(b, lv)?;

        let rhs_b = b.create_block();
        let merge = b.create_block();
        b.append_block_param(merge, I8);

        let short = match op {
            BinOp::And => b.ins().iconst(I8, 0),
            BinOp::Or => b.ins().iconst(I8, 1),
            _ => unreachable!(),
        };
        match op {
            BinOp::And => b.ins().brif(lc, rhs_b, &[], merge, &[short]),
            BinOp::Or => b.ins().brif(lc, merge, &[short], rhs_b, &[]),
            _ => unreachable!(),
        };
        b.seal_block(rhs_b);

        b.switch_to_block(rhs_b);
        let rv = self.lower_operand(b, rhs)?;
        let rc = self.cond_val(b, rv)?;
        b.ins().jump(merge, &[rc]);
        b.seal_block(merge);

        b.switch_to_block(merge);
        let out = b.block_params(merge)[0];
        Ok(Lowered::value(out, Carrier::Bool))
    }

    // ── calls ───────────────────────────────────────────────────

    fn lower_call(
        &mut self,
        b: &mut FunctionBuilder,
        callee: &Expr,
        args: &[Expr],
    ) -> Result<Lowered, NbError> {
        let name = match callee {
            Expr::Var(name) => name.clone(),
            other => {
                return Err(NbError::ir_build(format!(
                    "unsupported callee: {:?}",
                    other
                )))
            }
        };

        if name == "println" {
            return self.lower_println(b, args);
        }
        if name == DICT_CONSTRUCTOR {
            if !args.is_empty() {
                return Err(NbError::ir_build("Dict() takes no arguments"));
            }
            let v = self
                .call_helper(b, self.helpers.dict_new, &[])
                .expect("dict_new returns a value");
            return Ok(Lowered::value(v, Carrier::Boxed));
        }

        let mut lowered_args: SmallVec<[TypedVal; 4]> = SmallVec::new();
        for a in args {
            lowered_args.push(self.lower_operand(b, a)?);
        }

        if let Some(info) = self.local_funcs.get(&name).cloned() {
            if lowered_args.len() != info.param_count {
                return Err(NbError::ir_build(format!(
                    "call to '{}' passes {} arguments, expected {}",
                    name,
                    lowered_args.len(),
                    info.param_count
                )));
            }
            let mut vals: SmallVec<[Value; 4]> = SmallVec::new();
            for (i, tv) in lowered_args.iter().enumerate() {
                let want = if info.param_boxed.get(i).copied().unwrap_or(false) {
                    Carrier::Boxed
                } else {
                    Carrier::Int
                };
                vals.push(self.coerce(b, *tv, want)?);
            }
            let ret = self
                .call_helper(b, info.id, &vals)
                .expect("unit functions return a value");
            let carrier = if info.returns_boxed {
                Carrier::Boxed
            } else {
                Carrier::Int
            };
            return Ok(Lowered::value(ret, carrier));
        }

        if let Some(info) = self.extern_funcs.get(&name).cloned() {
            if lowered_args.len() != info.param_count {
                return Err(NbError::ir_build(format!(
                    "call to external '{}' passes {} arguments, expected {}",
                    name,
                    lowered_args.len(),
                    info.param_count
                )));
            }
            let mut vals: SmallVec<[Value; 4]> = SmallVec::new();
            for tv in &lowered_args {
                vals.push(self.coerce(b, *tv, Carrier::Int)?);
            }
            let ret = self
                .call_helper(b, info.id, &vals)
                .expect("external declarations return a value");
            let carrier = if info.returns_boxed {
                Carrier::Boxed
            } else {
                Carrier::Int
            };
            return Ok(Lowered::value(ret, carrier));
        }

        // Unknown name: forward as an external call whose parameter count
        // matches the actual arguments, everything coerced to i64.
        let info = match self.foreign_funcs.get(&name).cloned() {
            Some(info) => {
                if info.param_count != lowered_args.len() {
                    return Err(NbError::ir_build(format!(
                        "foreign '{}' used with {} and {} arguments in one unit",
                        name,
                        info.param_count,
                        lowered_args.len()
                    )));
                }
                info
            }
            None => {
                let mut sig = self.module.make_signature();
                for _ in 0..lowered_args.len() {
                    sig.params.push(cranelift_codegen::ir::AbiParam::new(I64));
                }
                sig.returns.push(cranelift_codegen::ir::AbiParam::new(I64));
                let id = self
                    .module
                    .declare_function(&name, Linkage::Import, &sig)
                    .map_err(|e| NbError::ir_build(format!("declare foreign '{}': {}", name, e)))?;
                let info = FuncInfo {
                    id,
                    param_count: lowered_args.len(),
                    param_boxed: vec![false; lowered_args.len()],
                    returns_boxed: false,
                };
                self.foreign_funcs.insert(name.clone(), info.clone());
                info
            }
        };
        let mut vals: SmallVec<[Value; 4]> = SmallVec::new();
        for tv in &lowered_args {
            vals.push(self.coerce(b, *tv, Carrier::Int)?);
        }
        let ret = self
            .call_helper(b, info.id, &vals)
            .expect("foreign declarations return a value");
        Ok(Lowered::value(ret, Carrier::Int))
    }

    /// `println(x)` lowers to C `printf` with a format string chosen from
    /// the argument's IR type.
    fn lower_println(&mut self, b: &mut FunctionBuilder, args: &[Expr]) -> Result<Lowered, NbError> {
        if args.len() != 1 {
            return Err(NbError::ir_build("println takes exactly one argument"));
        }
        let tv = self.lower_operand(b, &args[0])?;
        let (shape, fmt, val) = match tv.carrier {
            Carrier::Int => (PrintfShape::Int, "%lld\n", tv.val),
            Carrier::Bool => {
                let widened = self.coerce(b, tv, Carrier::Int)?;
                (PrintfShape::Int, "%lld\n", widened)
            }
            Carrier::Boxed => {
                let unboxed = self.coerce(b, tv, Carrier::Int)?;
                (PrintfShape::Int, "%lld\n", unboxed)
            }
            Carrier::CStr => (PrintfShape::Int, "%s\n", tv.val),
            Carrier::Float => (PrintfShape::Float, "%f\n", tv.val),
        };
        let fmt_ptr = self.cstr_data(b, fmt)?;
        let printf = self.libc.printf_id(self.module, shape)?;
        self.call_helper(b, printf, &[fmt_ptr, val]);
        Ok(Lowered::none())
    }

    // ── value plumbing ──────────────────────────────────────────

    fn call_helper(&mut self, b: &mut FunctionBuilder, id: FuncId, args: &[Value]) -> Option<Value> {
        let fref = self.module.declare_func_in_func(id, b.func);
        let call = b.ins().call(fref, args);
        b.inst_results(call).first().copied()
    }

    /// Null-terminated string constant in the module's data section;
    /// returns its address.
    fn cstr_data(&mut self, b: &mut FunctionBuilder, text: &str) -> Result<Value, NbError> {
        let name = format!("{}_str{}", self.unit_name, *self.data_counter);
        *self.data_counter += 1;
        let id = self
            .module
            .declare_data(&name, Linkage::Local, false, false)
            .map_err(|e| NbError::ir_build(format!("declare string data: {}", e)))?;
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        let mut desc = DataDescription::new();
        desc.define(bytes.into_boxed_slice());
        self.module
            .define_data(id, &desc)
            .map_err(|e| NbError::ir_build(format!("define string data: {}", e)))?;
        let gv = self.module.declare_data_in_func(id, b.func);
        Ok(b.ins().symbol_value(I64, gv))
    }

    /// Boolean condition (i8) from any carrier.
    fn cond_val(&mut self, b: &mut FunctionBuilder, tv: TypedVal) -> Result<Value, NbError> {
        Ok(match tv.carrier {
            Carrier::Bool => tv.val,
            Carrier::Int | Carrier::CStr => b.ins().icmp_imm(IntCC::NotEqual, tv.val, 0),
            Carrier::Boxed => {
                let unboxed = self.coerce(b, tv, Carrier::Int)?;
                b.ins().icmp_imm(IntCC::NotEqual, unboxed, 0)
            }
            Carrier::Float => {
                let zero = b.ins().f64const(0.0);
                b.ins().fcmp(FloatCC::NotEqual, tv.val, zero)
            }
        })
    }

    fn zero_of(&mut self, b: &mut FunctionBuilder, carrier: Carrier) -> Value {
        match carrier {
            Carrier::Float => b.ins().f64const(0.0),
            Carrier::Bool => b.ins().iconst(I8, 0),
            _ => b.ins().iconst(I64, 0),
        }
    }

    /// Convert a typed value to another carrier.
    fn coerce(
        &mut self,
        b: &mut FunctionBuilder,
        tv: TypedVal,
        to: Carrier,
    ) -> Result<Value, NbError> {
        use Carrier::*;
        if tv.carrier == to {
            return Ok(tv.val);
        }
        Ok(match (tv.carrier, to) {
            (Bool, Int) => b.ins().uextend(I64, tv.val),
            (Bool, Float) => {
                let widened = b.ins().uextend(I64, tv.val);
                b.ins().fcvt_from_sint(F64, widened)
            }
            (Int, Float) => b.ins().fcvt_from_sint(F64, tv.val),
            (Float, Int) => b.ins().fcvt_to_sint_sat(I64, tv.val),
            (Int, Bool) => b.ins().icmp_imm(IntCC::NotEqual, tv.val, 0),
            (Float, Bool) => {
                let zero = b.ins().f64const(0.0);
                b.ins().fcmp(FloatCC::NotEqual, tv.val, zero)
            }
            (Int, Boxed) => self
                .call_helper(b, self.helpers.box_int, &[tv.val])
                .expect("box_int returns a value"),
            (Float, Boxed) => self
                .call_helper(b, self.helpers.box_float, &[tv.val])
                .expect("box_float returns a value"),
            (Bool, Boxed) => {
                let widened = b.ins().uextend(I64, tv.val);
                self.call_helper(b, self.helpers.box_int, &[widened])
                    .expect("box_int returns a value")
            }
            (Boxed, Int) => self
                .call_helper(b, self.helpers.unbox_int, &[tv.val])
                .expect("unbox_int returns a value"),
            (Boxed, Float) => self
                .call_helper(b, self.helpers.unbox_float, &[tv.val])
                .expect("unbox_float returns a value"),
            (Boxed, Bool) => {
                let unboxed = self
                    .call_helper(b, self.helpers.unbox_int, &[tv.val])
                    .expect("unbox_int returns a value");
                b.ins().icmp_imm(IntCC::NotEqual, unboxed, 0)
            }
            // C strings are pointer-sized integers; the carriers only
            // differ in how println formats them.
            (CStr, Int) | (Int, CStr) => tv.val,
            (CStr, Boxed) => {
                let sym = self
                    .call_helper(b, self.helpers.symbol_from_cstr, &[tv.val])
                    .expect("symbol_from_cstr returns a value");
                sym
            }
            (from, to) => {
                return Err(NbError::ir_build(format!(
                    "cannot coerce {:?} to {:?}",
                    from, to
                )))
            }
        })
    }

    /// Coerce the final value to the unit ABI and emit the return.
    fn emit_return(&mut self, b: &mut FunctionBuilder, tv: Option<TypedVal>) -> Result<(), NbError> {
        let out = if self.returns_boxed {
            match tv {
                Some(tv) => self.coerce(b, tv, Carrier::Boxed)?,
                // A valueless body with a boxed return yields null.
                None => b.ins().iconst(I64, 0),
            }
        } else {
            match tv {
                Some(tv) => self.coerce(b, tv, Carrier::Int)?,
                None => b.ins().iconst(I64, 0),
            }
        };
        b.ins().return_(&[out]);
        Ok(())
    }
}

/// Variable carrier at assignment: booleans widen to integer, everything
/// else keeps its carrier.
fn assign_carrier(c: Carrier) -> Carrier {
    match c {
        Carrier::Bool => Carrier::Int,
        other => other,
    }
}
