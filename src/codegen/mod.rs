//! IR construction: partially evaluated ASTs to Cranelift object modules
//!
//! One compilation unit is one function AST (the rewritten main block or
//! a single hole body, wrapped in a `Function` node) lowered into an
//! object module with one exported function. Nested function definitions
//! at the top of the unit body become local functions in the same module.
//!
//! ## Type model
//!
//! Three primitive carriers (64-bit signed integer, 64-bit float, boolean)
//! plus one opaque boxed pointer for dictionaries, symbols, and anything
//! crossing a runtime call. Every function uses the uniform ABI
//! `(i64, …) -> i64`; boxedness of parameters and returns is inferred from
//! the body (see [`infer`]) and tracked alongside the declarations.
//!
//! ## Control flow
//!
//! `If` builds a then/else/merge diamond with a block-parameter phi typed
//! from the then branch. `For` over a static range is a
//! cond/body/inc/end loop with signed `<=` termination and a `+1`
//! increment. `While` is the same skeleton without the induction
//! variable. Short-circuit `&&`/`||` compile to two-block diamonds whose
//! phi selects the short-circuit constant or the evaluated right side.
//!
//! Every function is verified before definition; a verifier diagnostic is
//! a fatal [`NbError::Verification`].

pub mod infer;
mod lower;

use cranelift_codegen::ir::types::{F64, I32, I64, I8, Type};
use cranelift_codegen::ir::{AbiParam, UserFuncName};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_module::{default_libcall_names, FuncId, Linkage, Module};
use cranelift_object::{ObjectBuilder, ObjectModule};
use rustc_hash::FxHashMap;

use crate::ast::Expr;
use crate::error::NbError;
use crate::runtime;

/// Semantic carrier of an SSA value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Carrier {
    Int,
    Float,
    Bool,
    /// Opaque runtime pointer (dictionaries, symbols, boxed primitives).
    Boxed,
    /// Pointer to a null-terminated string constant.
    CStr,
}

pub(crate) fn carrier_type(c: Carrier) -> Type {
    match c {
        Carrier::Int | Carrier::Boxed | Carrier::CStr => I64,
        Carrier::Float => F64,
        Carrier::Bool => I8,
    }
}

/// External declaration injected into a unit, e.g. a hole function the
/// rewritten main calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternDecl {
    pub symbol: String,
    pub param_count: usize,
    pub returns_boxed: bool,
}

/// A compiled unit: the relocatable object plus the exported signature
/// facts the cache records.
pub struct BuiltUnit {
    pub object: Vec<u8>,
    pub param_count: usize,
    pub returns_boxed: bool,
}

/// A callable known to the module under construction.
#[derive(Debug, Clone)]
pub(crate) struct FuncInfo {
    pub id: FuncId,
    pub param_count: usize,
    pub param_boxed: Vec<bool>,
    pub returns_boxed: bool,
}

/// Pre-declared runtime-library thunks.
pub(crate) struct RuntimeHelpers {
    pub dict_new: FuncId,
    pub dict_get: FuncId,
    pub dict_set: FuncId,
    pub symbol_from_cstr: FuncId,
    pub box_int: FuncId,
    pub box_float: FuncId,
    pub unbox_int: FuncId,
    pub unbox_float: FuncId,
}

impl RuntimeHelpers {
    fn declare(module: &mut ObjectModule) -> Result<RuntimeHelpers, NbError> {
        let mut nullary_sig = module.make_signature();
        nullary_sig.returns.push(AbiParam::new(I64));

        let mut unary_sig = module.make_signature();
        unary_sig.params.push(AbiParam::new(I64));
        unary_sig.returns.push(AbiParam::new(I64));

        let mut binary_sig = module.make_signature();
        binary_sig.params.push(AbiParam::new(I64));
        binary_sig.params.push(AbiParam::new(I64));
        binary_sig.returns.push(AbiParam::new(I64));

        // dict_set returns nothing.
        let mut ternary_void_sig = module.make_signature();
        ternary_void_sig.params.push(AbiParam::new(I64));
        ternary_void_sig.params.push(AbiParam::new(I64));
        ternary_void_sig.params.push(AbiParam::new(I64));

        let mut box_float_sig = module.make_signature();
        box_float_sig.params.push(AbiParam::new(F64));
        box_float_sig.returns.push(AbiParam::new(I64));

        let mut unbox_float_sig = module.make_signature();
        unbox_float_sig.params.push(AbiParam::new(I64));
        unbox_float_sig.returns.push(AbiParam::new(F64));

        let declare = |module: &mut ObjectModule, name: &str, sig| -> Result<FuncId, NbError> {
            module
                .declare_function(name, Linkage::Import, sig)
                .map_err(|e| NbError::ir_build(format!("declare runtime '{}': {}", name, e)))
        };

        Ok(RuntimeHelpers {
            dict_new: declare(module, runtime::RT_DICT_NEW, &nullary_sig)?,
            dict_get: declare(module, runtime::RT_DICT_GET, &binary_sig)?,
            dict_set: declare(module, runtime::RT_DICT_SET, &ternary_void_sig)?,
            symbol_from_cstr: declare(module, runtime::RT_SYMBOL_FROM_CSTR, &unary_sig)?,
            box_int: declare(module, runtime::RT_BOX_INT, &unary_sig)?,
            box_float: declare(module, runtime::RT_BOX_FLOAT, &box_float_sig)?,
            unbox_int: declare(module, runtime::RT_UNBOX_INT, &unary_sig)?,
            unbox_float: declare(module, runtime::RT_UNBOX_FLOAT, &unbox_float_sig)?,
        })
    }
}

/// Format shape `printf` was declared with in this module. C varargs have
/// one symbol, so one unit gets one shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrintfShape {
    Int,
    Float,
}

/// Lazily declared libc imports.
#[derive(Default)]
pub(crate) struct LibcFuncs {
    printf: Option<(FuncId, PrintfShape)>,
    fmod: Option<FuncId>,
}

impl LibcFuncs {
    pub(crate) fn printf_id(
        &mut self,
        module: &mut ObjectModule,
        shape: PrintfShape,
    ) -> Result<FuncId, NbError> {
        if let Some((id, declared)) = self.printf {
            if declared != shape {
                return Err(NbError::ir_build(
                    "println argument types mix integer and float formats in one unit",
                ));
            }
            return Ok(id);
        }
        let mut sig = module.make_signature();
        sig.params.push(AbiParam::new(I64));
        match shape {
            PrintfShape::Int => sig.params.push(AbiParam::new(I64)),
            PrintfShape::Float => sig.params.push(AbiParam::new(F64)),
        }
        sig.returns.push(AbiParam::new(I32));
        let id = module
            .declare_function("printf", Linkage::Import, &sig)
            .map_err(|e| NbError::ir_build(format!("declare printf: {}", e)))?;
        self.printf = Some((id, shape));
        Ok(id)
    }

    pub(crate) fn fmod_id(&mut self, module: &mut ObjectModule) -> Result<FuncId, NbError> {
        if let Some(id) = self.fmod {
            return Ok(id);
        }
        let mut sig = module.make_signature();
        sig.params.push(AbiParam::new(F64));
        sig.params.push(AbiParam::new(F64));
        sig.returns.push(AbiParam::new(F64));
        let id = module
            .declare_function("fmod", Linkage::Import, &sig)
            .map_err(|e| NbError::ir_build(format!("declare fmod: {}", e)))?;
        self.fmod = Some(id);
        Ok(id)
    }
}

/// Lower one function AST into a finished object module and emit its
/// bytes. `externs` are injected as import declarations so the body can
/// call them (hole symbols, in the main unit's case).
pub fn compile_unit(
    func: &Expr,
    export_name: &str,
    externs: &[ExternDecl],
) -> Result<BuiltUnit, NbError> {
    let (params, body) = match func {
        Expr::Function { params, body, .. } => (params.clone(), body.as_ref().clone()),
        other => {
            return Err(NbError::ir_build(format!(
                "compilation unit must be a function, got {:?}",
                std::mem::discriminant(other)
            )))
        }
    };

    let isa = crate::backend::native_isa()?;
    let builder = ObjectBuilder::new(isa, export_name.to_string(), default_libcall_names())
        .map_err(|e| NbError::backend(format!("object builder: {}", e)))?;
    let mut module = ObjectModule::new(builder);

    let helpers = RuntimeHelpers::declare(&mut module)?;

    let mut extern_funcs: FxHashMap<String, FuncInfo> = FxHashMap::default();
    for decl in externs {
        let mut sig = module.make_signature();
        for _ in 0..decl.param_count {
            sig.params.push(AbiParam::new(I64));
        }
        sig.returns.push(AbiParam::new(I64));
        let id = module
            .declare_function(&decl.symbol, Linkage::Import, &sig)
            .map_err(|e| NbError::ir_build(format!("declare extern '{}': {}", decl.symbol, e)))?;
        extern_funcs.insert(
            decl.symbol.clone(),
            FuncInfo {
                id,
                param_count: decl.param_count,
                param_boxed: vec![false; decl.param_count],
                returns_boxed: decl.returns_boxed,
            },
        );
    }

    // Nested function definitions at the top of the body are peeled off
    // and become local functions; the rest forms the exported body.
    let body_stmts = match body {
        Expr::Block(stmts) => stmts,
        other => vec![other],
    };
    let mut nested: Vec<(String, Vec<String>, Expr)> = Vec::new();
    let mut main_stmts: Vec<Expr> = Vec::new();
    for stmt in body_stmts {
        match stmt {
            Expr::Function { name, params, body } => nested.push((name, params, *body)),
            other => main_stmts.push(other),
        }
    }

    let mut local_funcs: FxHashMap<String, FuncInfo> = FxHashMap::default();
    for (name, fn_params, fn_body) in &nested {
        let mut sig = module.make_signature();
        for _ in 0..fn_params.len() {
            sig.params.push(AbiParam::new(I64));
        }
        sig.returns.push(AbiParam::new(I64));
        let id = module
            .declare_function(name, Linkage::Local, &sig)
            .map_err(|e| NbError::ir_build(format!("declare function '{}': {}", name, e)))?;
        local_funcs.insert(
            name.clone(),
            FuncInfo {
                id,
                param_count: fn_params.len(),
                param_boxed: fn_params
                    .iter()
                    .map(|p| infer::param_is_boxed(fn_body, p))
                    .collect(),
                returns_boxed: infer::returns_boxed(fn_body),
            },
        );
    }

    let main_body = Expr::Block(main_stmts);
    let unit_returns_boxed = infer::returns_boxed(&main_body);
    let mut sig = module.make_signature();
    for _ in 0..params.len() {
        sig.params.push(AbiParam::new(I64));
    }
    sig.returns.push(AbiParam::new(I64));
    let export_id = module
        .declare_function(export_name, Linkage::Export, &sig)
        .map_err(|e| NbError::ir_build(format!("declare export '{}': {}", export_name, e)))?;

    let mut builder_ctx = FunctionBuilderContext::new();
    let mut libc = LibcFuncs::default();
    let mut foreign_funcs: FxHashMap<String, FuncInfo> = FxHashMap::default();
    let mut data_counter: u32 = 0;

    for (name, fn_params, fn_body) in &nested {
        let info = local_funcs[name].clone();
        let typed_params: Vec<(String, bool)> = fn_params
            .iter()
            .zip(&info.param_boxed)
            .map(|(p, boxed)| (p.clone(), *boxed))
            .collect();
        define_one(
            &mut module,
            &helpers,
            &mut libc,
            &local_funcs,
            &extern_funcs,
            &mut foreign_funcs,
            &mut data_counter,
            &mut builder_ctx,
            name,
            info.id,
            &typed_params,
            fn_body,
            info.returns_boxed,
        )?;
    }

    let typed_params: Vec<(String, bool)> = params
        .iter()
        .map(|p| (p.clone(), infer::param_is_boxed(&main_body, p)))
        .collect();
    define_one(
        &mut module,
        &helpers,
        &mut libc,
        &local_funcs,
        &extern_funcs,
        &mut foreign_funcs,
        &mut data_counter,
        &mut builder_ctx,
        export_name,
        export_id,
        &typed_params,
        &main_body,
        unit_returns_boxed,
    )?;

    let product = module.finish();
    let object = product
        .emit()
        .map_err(|e| NbError::backend(format!("emit object: {}", e)))?;

    Ok(BuiltUnit {
        object,
        param_count: params.len(),
        returns_boxed: unit_returns_boxed,
    })
}

#[allow(clippy::too_many_arguments)]
fn define_one(
    module: &mut ObjectModule,
    helpers: &RuntimeHelpers,
    libc: &mut LibcFuncs,
    local_funcs: &FxHashMap<String, FuncInfo>,
    extern_funcs: &FxHashMap<String, FuncInfo>,
    foreign_funcs: &mut FxHashMap<String, FuncInfo>,
    data_counter: &mut u32,
    builder_ctx: &mut FunctionBuilderContext,
    unit_name: &str,
    func_id: FuncId,
    params: &[(String, bool)],
    body: &Expr,
    returns_boxed: bool,
) -> Result<(), NbError> {
    let mut ctx = module.make_context();
    let mut sig = module.make_signature();
    for _ in 0..params.len() {
        sig.params.push(AbiParam::new(I64));
    }
    sig.returns.push(AbiParam::new(I64));
    ctx.func.signature = sig;
    ctx.func.name = UserFuncName::user(0, func_id.as_u32());

    {
        let mut b = FunctionBuilder::new(&mut ctx.func, builder_ctx);
        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        b.seal_block(entry);

        let mut lowerer = lower::Lowerer::new(
            module,
            helpers,
            libc,
            local_funcs,
            extern_funcs,
            foreign_funcs,
            data_counter,
            unit_name,
            returns_boxed,
        );
        lowerer.bind_params(&mut b, entry, params);
        lowerer.lower_body(&mut b, body)?;
        b.finalize();
    }

    cranelift_codegen::verifier::verify_function(&ctx.func, module.isa())
        .map_err(|e| NbError::verification(format!("function '{}': {}", unit_name, e)))?;

    module
        .define_function(func_id, &mut ctx)
        .map_err(|e| NbError::verification(format!("define '{}': {}", unit_name, e)))?;
    module.clear_context(&mut ctx);
    Ok(())
}
