//! AST to bytecode compiler.
//!
//! Lowers the analyzed AST to a linear instruction stream, tracking tail
//! position and a compile-time simulation of the runtime stack depth. The
//! depth drives local-variable addressing (the VM has no frame pointer, so
//! `LOCAL_REF` operands are distances from the stack top) and the
//! `TAIL_CALL` frame operand.
//!
//! # Frame layout
//!
//! A running procedure sees, from the bottom up: its arguments (first
//! argument closest to the top of the block), the argument count, the
//! saved return address, the saved captured-variables vector, then one box
//! per internal definition, then evaluation temporaries. Parameter `j` of a
//! frame holding `m` adapted arguments therefore sits `depth + j + 4` slots
//! below the top, and internal definition `i` sits `depth - i` below.

use super::{builder::CodeBuilder, Opcode};
use crate::{
    ast::{Ast, LambdaId, LambdaNode, Loc, RefNode},
    exception::CompileError,
    heap::{Heap, HeapData, HeapId, Procedure},
    primitive::{OpClass, Primitive, PrimitiveId, PRIMITIVES},
    resource::ResourceTracker,
    value::Value,
};

type CompileResult<T> = Result<T, Box<CompileError>>;

/// Per-bytecode-object compile state: one per lambda body plus one for the
/// top-level thunk.
struct FnCtx {
    builder: CodeBuilder,
    /// Simulated stack height above the frame's saved-cp slot.
    depth: isize,
    /// The lambda whose body is being compiled; `None` at top level.
    lambda: Option<LambdaId>,
}

impl FnCtx {
    fn new(lambda: Option<LambdaId>) -> Self {
        Self {
            builder: CodeBuilder::new(),
            depth: 0,
            lambda,
        }
    }

    fn emit(&mut self, op: Opcode) {
        self.builder.emit(op);
    }

    fn emit_word(&mut self, word: usize) {
        self.builder.emit_word(word);
    }

    fn push_value(&mut self, value: Value) {
        self.builder.emit_push(value);
        self.depth += 1;
    }
}

/// Compiles analyzed ASTs against a lambda arena, allocating bytecode and
/// procedure objects on the heap.
pub(crate) struct Compiler<'a, T: ResourceTracker> {
    heap: &'a mut Heap<T>,
    lambdas: &'a [LambdaNode],
}

impl<'a, T: ResourceTracker> Compiler<'a, T> {
    pub fn new(heap: &'a mut Heap<T>, lambdas: &'a [LambdaNode]) -> Self {
        Self { heap, lambdas }
    }

    /// Compiles a whole expression into a nullary thunk procedure.
    pub fn compile_thunk(&mut self, ast: &Ast) -> CompileResult<HeapId> {
        let mut ctx = FnCtx::new(None);
        self.compile_one(&mut ctx, ast, true)?;
        debug_assert_eq!(ctx.depth, 1, "expression must leave exactly one value");
        let code = ctx.builder.finalize();
        let bc = self.heap.allocate(HeapData::Bytecode(code))?;
        let vars = self.heap.allocate(HeapData::Vector(Vec::new()))?;
        let proc = self.heap.allocate(HeapData::Procedure(Procedure {
            flags: 0,
            num_args: 0,
            code: bc,
            vars,
        }))?;
        Ok(proc)
    }

    fn compile_one(&mut self, ctx: &mut FnCtx, x: &Ast, tail: bool) -> CompileResult<()> {
        match x {
            Ast::Lit(v) => {
                ctx.push_value(*v);
                Ok(())
            }
            Ast::Ref(r) => {
                self.compile_ref(ctx, *r, true);
                Ok(())
            }
            Ast::Set { target, value } => self.compile_set(ctx, *target, value),
            Ast::Cnd { test, pass, fail } => self.compile_cnd(ctx, test, pass, fail, tail),
            Ast::Seq(items) => self.compile_seq(ctx, items, tail),
            Ast::Lambda(id) => self.compile_lambda(ctx, *id),
            Ast::App(items) => self.compile_general_app(ctx, items, tail),
            Ast::PrimApp { prim, args } => self.compile_opcode_app(ctx, *prim, args),
        }
    }

    fn compile_seq(&mut self, ctx: &mut FnCtx, items: &[Ast], tail: bool) -> CompileResult<()> {
        let (last, init) = items.split_last().expect("sequences have at least one element");
        for item in init {
            self.compile_one(ctx, item, false)?;
            ctx.emit(Opcode::Drop);
            ctx.depth -= 1;
        }
        self.compile_one(ctx, last, tail)
    }

    fn compile_cnd(&mut self, ctx: &mut FnCtx, test: &Ast, pass: &Ast, fail: &Ast, tail: bool) -> CompileResult<()> {
        self.compile_one(ctx, test, false)?;
        ctx.emit(Opcode::JumpUnless);
        ctx.depth -= 1;
        let to_fail = ctx.builder.make_label();
        self.compile_one(ctx, pass, tail)?;
        ctx.emit(Opcode::Jump);
        ctx.depth -= 1;
        let to_end = ctx.builder.make_label();
        ctx.builder.patch_label(to_fail);
        self.compile_one(ctx, fail, tail)?;
        ctx.builder.patch_label(to_end);
        Ok(())
    }

    /// True when the owning lambda box-allocates this name.
    fn is_boxed(&self, r: RefNode) -> bool {
        match r.loc {
            Loc::Lambda(owner) => self.lambdas[owner.index()].set_vars.contains(&r.name),
            Loc::Global(_) => false,
        }
    }

    fn compile_ref(&mut self, ctx: &mut FnCtx, r: RefNode, unbox: bool) {
        match r.loc {
            Loc::Global(cell) => {
                // globals resolve through their cell so forward references
                // stay live
                ctx.push_value(Value::Ref(cell));
                if unbox {
                    ctx.emit(Opcode::Cdr);
                }
            }
            Loc::Lambda(_) => self.compile_non_global_ref(ctx, r, unbox),
        }
    }

    fn compile_non_global_ref(&mut self, ctx: &mut FnCtx, r: RefNode, unbox: bool) {
        let cur = ctx.lambda.expect("local reference outside a lambda body");
        let node = &self.lambdas[cur.index()];
        if r.loc == Loc::Lambda(cur) {
            if let Some(j) = node.params.iter().position(|&p| p == r.name) {
                ctx.emit(Opcode::LocalRef);
                ctx.emit_word(usize::try_from(ctx.depth + j as isize + 4).expect("negative local offset"));
            } else {
                let i = node
                    .locals
                    .iter()
                    .position(|&l| l == r.name)
                    .expect("reference resolved to neither parameter nor local");
                ctx.emit(Opcode::LocalRef);
                ctx.emit_word(usize::try_from(ctx.depth - i as isize).expect("negative local offset"));
            }
        } else {
            let index = node
                .free_vars
                .iter()
                .position(|fv| *fv == r)
                .expect("captured reference missing from free-variable set");
            ctx.emit(Opcode::ClosureRef);
            ctx.emit_word(index);
        }
        ctx.depth += 1;
        if unbox && self.is_boxed(r) {
            ctx.emit(Opcode::Cdr);
        }
    }

    fn compile_set(&mut self, ctx: &mut FnCtx, target: RefNode, value: &Ast) -> CompileResult<()> {
        self.compile_one(ctx, value, false)?;
        match target.loc {
            // global cells are written directly
            Loc::Global(cell) => ctx.push_value(Value::Ref(cell)),
            // assigned locals and captures are boxed; write the box
            Loc::Lambda(_) => self.compile_non_global_ref(ctx, target, false),
        }
        ctx.emit(Opcode::SetCdr);
        ctx.depth -= 1;
        Ok(())
    }

    fn compile_general_app(&mut self, ctx: &mut FnCtx, items: &[Ast], tail: bool) -> CompileResult<()> {
        let (operator, args) = items.split_first().expect("applications have an operator");
        for arg in args.iter().rev() {
            self.compile_one(ctx, arg, false)?;
        }
        self.compile_one(ctx, operator, false)?;
        let n = args.len();
        if tail {
            ctx.emit(Opcode::TailCall);
            ctx.emit_word(usize::try_from(ctx.depth + 3).expect("negative frame distance"));
            ctx.emit_word(n);
        } else {
            ctx.emit(Opcode::Call);
            ctx.emit_word(n);
        }
        ctx.depth -= n as isize;
        Ok(())
    }

    fn compile_opcode_app(&mut self, ctx: &mut FnCtx, prim_id: PrimitiveId, args: &[Ast]) -> CompileResult<()> {
        let prim = &PRIMITIVES[prim_id.index()];
        let start_depth = ctx.depth;
        let declared = prim.num_args as usize;
        let mut num_args = args.len();

        // variadic arithmetic identities: (+) and (*) fold to their unit,
        // a single argument passes through untouched
        if prim.class == OpClass::Arithmetic && prim.variadic {
            match args {
                [] => {
                    let identity = if prim.op == Opcode::Add { 0 } else { 1 };
                    ctx.push_value(Value::Int(identity));
                    return Ok(());
                }
                [only] => return self.compile_one(ctx, only, false),
                _ => {}
            }
        }

        // a default parameter fills the optional trailing argument
        if num_args < declared {
            if let Some(param) = prim.param {
                ctx.emit(Opcode::Parameter);
                ctx.emit_word(param as usize);
                if !prim.opt_param {
                    ctx.emit(Opcode::Call);
                    ctx.emit_word(0);
                }
                ctx.depth += 1;
                num_args += 1;
            }
        }
        if num_args < declared {
            return Err(CompileError::new(format!("not enough arguments to {}", prim.name), vec![]));
        }
        // the declared count is also the maximum unless the primitive folds
        // a true rest argument
        if num_args > declared && !prim.variadic {
            return Err(CompileError::new(format!("too many arguments to {}", prim.name), vec![]));
        }

        // swapped comparisons are order-sensitive: their arguments go on in
        // source order and the inverse opcode computes the flipped relation;
        // everything else pushes right-to-left so the first argument lands
        // on top
        if emits_in_source_order(prim) {
            for arg in args {
                self.compile_one(ctx, arg, false)?;
            }
        } else {
            for arg in args.iter().rev() {
                self.compile_one(ctx, arg, false)?;
            }
        }

        if prim.class == OpClass::Foreign {
            ctx.push_value(Value::Foreign(prim.foreign.expect("foreign primitive without function")));
        }
        emit_operator(&mut ctx.builder, prim, num_args);

        ctx.depth = start_depth + 1;
        Ok(())
    }

    fn compile_lambda(&mut self, ctx: &mut FnCtx, id: LambdaId) -> CompileResult<()> {
        let lambdas = self.lambdas;
        let node = &lambdas[id.index()];
        let mut inner = FnCtx::new(Some(id));

        // prologue: box assigned parameters in place
        for (j, &param) in node.params.iter().enumerate() {
            if node.set_vars.contains(&param) {
                inner.emit(Opcode::LocalRef);
                inner.emit_word(usize::try_from(inner.depth + j as isize + 4).expect("negative local offset"));
                inner.depth += 1;
                inner.push_value(Value::Symbol(param));
                inner.emit(Opcode::Cons);
                inner.depth -= 1;
                inner.emit(Opcode::LocalSet);
                inner.emit_word(usize::try_from(inner.depth + j as isize + 4).expect("negative local offset"));
                inner.emit(Opcode::Drop);
                inner.depth -= 1;
            }
        }
        // one fresh box per internal definition; these slots extend the frame
        for &local in &node.locals {
            inner.push_value(Value::Undefined);
            inner.push_value(Value::Symbol(local));
            inner.emit(Opcode::Cons);
            inner.depth -= 1;
        }

        let body = node.body.as_ref().expect("lambda body missing after analysis");
        self.compile_one(&mut inner, body, true)?;

        // epilogue: slide the result down over the definition slots
        let locals = node.locals.len();
        if locals > 0 {
            debug_assert_eq!(inner.depth, locals as isize + 1);
            inner.emit(Opcode::LocalSet);
            inner.emit_word(locals + 1);
            for _ in 0..locals {
                inner.emit(Opcode::Drop);
            }
        }

        let code = inner.builder.finalize();
        let bc = self.heap.allocate(HeapData::Bytecode(code))?;
        let flags = if node.variadic { Procedure::FLAG_VARIADIC } else { 0 };
        let num_args = u16::try_from(node.min_args())
            .map_err(|_| CompileError::new("lambda has too many parameters", vec![]))?;

        if node.free_vars.is_empty() {
            // closed lambda: the procedure is a compile-time constant
            let vars = self.heap.allocate(HeapData::Vector(Vec::new()))?;
            let proc = self.heap.allocate(HeapData::Procedure(Procedure {
                flags,
                num_args,
                code: bc,
                vars,
            }))?;
            ctx.push_value(Value::Ref(proc));
        } else {
            // open lambda: build the captured vector, then the procedure
            ctx.push_value(Value::Undefined);
            ctx.push_value(Value::Int(node.free_vars.len() as i64));
            ctx.emit(Opcode::MakeVector);
            ctx.depth -= 1;
            for (k, &fv) in node.free_vars.iter().enumerate() {
                // capture the binding itself; boxed variables stay shared
                self.compile_non_global_ref(ctx, fv, false);
                ctx.push_value(Value::Int(k as i64));
                ctx.emit(Opcode::LocalRef);
                ctx.emit_word(3);
                ctx.depth += 1;
                ctx.emit(Opcode::VectorSet);
                ctx.depth -= 2;
                ctx.emit(Opcode::Drop);
                ctx.depth -= 1;
            }
            ctx.push_value(Value::Ref(bc));
            ctx.push_value(Value::Int(i64::from(num_args)));
            ctx.push_value(Value::Int(i64::from(flags)));
            ctx.emit(Opcode::MakeProcedure);
            ctx.depth -= 3;
        }
        Ok(())
    }
}

/// Swapped comparisons (`>`, `>=`) carry an inverse but are not
/// inverse-class arithmetic; they are the order-sensitive case.
fn emits_in_source_order(prim: &Primitive) -> bool {
    prim.inverse.is_some() && prim.class != OpClass::ArithmeticInv
}

/// Emits the operator byte(s) for a primitive application: inverse
/// selection, left-associative folding for n-ary arithmetic, and the
/// trailing cell word for parameter reads.
fn emit_operator(builder: &mut CodeBuilder, prim: &Primitive, num_args: usize) {
    if prim.class == OpClass::ArithmeticInv {
        // unary `-` and `/` negate or reciprocate via the inverse opcode
        let op = if num_args == 1 {
            prim.inverse.expect("inverse-class primitive without inverse")
        } else {
            prim.op
        };
        builder.emit(op);
    } else {
        builder.emit(prim.inverse.unwrap_or(prim.op));
    }
    if num_args > 2 && matches!(prim.class, OpClass::Arithmetic | OpClass::ArithmeticInv) {
        for _ in 0..num_args - 2 {
            builder.emit(prim.op);
        }
    }
    if prim.class == OpClass::Parameter {
        builder.emit_word(prim.param.expect("parameter primitive without cell") as usize);
    }
}

/// Synthesizes a thin procedure wrapping a primitive, for when an opcode is
/// called as a first-class value: the body re-pushes its parameters in the
/// order the opcode expects and emits the opcode.
pub(crate) fn make_opcode_procedure<T: ResourceTracker>(
    heap: &mut Heap<T>,
    prim_id: PrimitiveId,
    num_args: usize,
) -> CompileResult<HeapId> {
    let prim = &PRIMITIVES[prim_id.index()];
    let declared = prim.num_args as usize;
    let mut ctx = FnCtx::new(None);
    let mut count = num_args;

    if prim.class == OpClass::Arithmetic && prim.variadic && num_args <= 1 {
        if num_args == 0 {
            let identity = if prim.op == Opcode::Add { 0 } else { 1 };
            ctx.push_value(Value::Int(identity));
        } else {
            ctx.emit(Opcode::LocalRef);
            ctx.emit_word(4);
            ctx.depth += 1;
        }
        return finish_opcode_procedure(heap, ctx, num_args);
    }

    if count < declared {
        if let Some(param) = prim.param {
            // the default fills the final argument position, deepest on the
            // stack
            ctx.emit(Opcode::Parameter);
            ctx.emit_word(param as usize);
            if !prim.opt_param {
                ctx.emit(Opcode::Call);
                ctx.emit_word(0);
            }
            ctx.depth += 1;
            count += 1;
        }
    }
    if count < declared {
        return Err(CompileError::new(format!("not enough arguments to {}", prim.name), vec![]));
    }
    if count > declared && !prim.variadic {
        return Err(CompileError::new(format!("too many arguments to {}", prim.name), vec![]));
    }

    let indices: Vec<usize> = if emits_in_source_order(prim) {
        (0..num_args).collect()
    } else {
        (0..num_args).rev().collect()
    };
    for j in indices {
        ctx.emit(Opcode::LocalRef);
        ctx.emit_word(usize::try_from(ctx.depth + j as isize + 4).expect("negative local offset"));
        ctx.depth += 1;
    }
    if prim.class == OpClass::Foreign {
        ctx.push_value(Value::Foreign(prim.foreign.expect("foreign primitive without function")));
    }
    emit_operator(&mut ctx.builder, prim, count);
    finish_opcode_procedure(heap, ctx, num_args)
}

fn finish_opcode_procedure<T: ResourceTracker>(
    heap: &mut Heap<T>,
    ctx: FnCtx,
    num_args: usize,
) -> CompileResult<HeapId> {
    let code = ctx.builder.finalize();
    let bc = heap.allocate(HeapData::Bytecode(code))?;
    let vars = heap.allocate(HeapData::Vector(Vec::new()))?;
    let num_args = u16::try_from(num_args)
        .map_err(|_| CompileError::new("too many arguments for a primitive wrapper", vec![]))?;
    let proc = heap.allocate(HeapData::Procedure(Procedure {
        flags: 0,
        num_args,
        code: bc,
        vars,
    }))?;
    Ok(proc)
}
