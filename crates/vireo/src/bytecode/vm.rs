//! The virtual machine.
//!
//! A stack machine whose entire state is the instruction pointer, the
//! current bytecode object, the current captured-variables vector, the value
//! stack, and the stack top. There is no frame pointer: local references are
//! compiled as distances from the top, and `TAIL_CALL` finds the frame
//! through its argument-count slot.
//!
//! # Call frames
//!
//! `CALL n` finds the procedure on top of the stack with `n` arguments
//! below it (first argument nearest the top). It replaces the procedure
//! slot with the adapted argument count, pushes the saved return address
//! and captured vector, and installs the callee. `RET` collapses the frame,
//! writing the result where the deepest argument was. Tail calls copy the
//! new argument block down over the caller's frame, so any chain of proper
//! tail calls runs in constant stack space.
//!
//! # Errors
//!
//! Opcodes that detect failure return a pending raise; the dispatch loop
//! materializes it as an exception object and transfers to the procedure in
//! the `*error-handler*` cell through the normal call convention. A
//! headroom reserve at the top of the stack keeps that dispatch itself from
//! overflowing, which is what makes stack exhaustion a catchable
//! `resource-error`.

use smallvec::SmallVec;

use crate::{
    bytecode::{Code, Opcode, WORD},
    env,
    exception::{Exc, ExcKind, Exception, RunError, RunResult},
    heap::{HeapData, HeapId, Procedure},
    parse::ReadOutcome,
    resource::ResourceTracker,
    runtime::Runtime,
    tracer::VmTracer,
    value::{display_value, write_value, ReturnAddr, Value},
};

/// Value stack capacity in slots.
pub(crate) const STACK_SIZE: usize = 8192;

/// Slots reserved at call boundaries so a raise and its handler frame can
/// always be installed after an overflow is detected.
const STACK_HEADROOM: usize = 64;

/// Hard reserve for plain pushes; smaller than [`STACK_HEADROOM`] so the
/// error handler can still push inside the headroom region.
const RAISE_RESERVE: usize = 8;

/// A value stack for compilation and execution. Create one per top-level
/// invocation; a `load` or other host re-entry uses a fresh context rather
/// than sharing the running stack.
pub struct Context {
    pub(crate) stack: Vec<Value>,
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stack: vec![Value::Undefined; STACK_SIZE],
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

enum Flow {
    Continue,
    Done(Value),
}

enum Nums {
    Ints(i64, i64),
    Floats(f64, f64),
}

/// Numeric dispatch: (int, int) stays exact, anything else promotes to
/// floats, non-numbers are the caller's type error.
fn numeric_pair(a: Value, b: Value) -> Option<Nums> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(Nums::Ints(x, y)),
        (Value::Float(x), Value::Float(y)) => Some(Nums::Floats(x, y)),
        (Value::Int(x), Value::Float(y)) => Some(Nums::Floats(x as f64, y)),
        (Value::Float(x), Value::Int(y)) => Some(Nums::Floats(x, y as f64)),
        _ => None,
    }
}

/// Floored modulo: the result carries the sign of the divisor, unlike `%`.
fn floored_mod(x: i64, y: i64) -> i64 {
    let r = x.wrapping_rem(y);
    if r != 0 && (r < 0) != (y < 0) {
        r + y
    } else {
        r
    }
}

pub(crate) struct Vm<'a, T: ResourceTracker, Tr: VmTracer> {
    rt: &'a mut Runtime<T>,
    stack: &'a mut [Value],
    tracer: &'a mut Tr,
    top: usize,
    bc: HeapId,
    ip: usize,
    cp: Value,
}

impl<'a, T: ResourceTracker, Tr: VmTracer> Vm<'a, T, Tr> {
    /// Primes a call frame terminating in the final resumer and runs `proc`
    /// to completion. The returned value may be an exception object if the
    /// installed error handler chose to unwind.
    pub fn apply(
        rt: &'a mut Runtime<T>,
        ctx: &'a mut Context,
        proc: HeapId,
        args: &[Value],
        tracer: &'a mut Tr,
    ) -> Result<Value, Exception> {
        let n = args.len();
        assert!(n + 3 < STACK_SIZE - STACK_HEADROOM, "too many arguments to apply");
        let stack = ctx.stack.as_mut_slice();
        // right-to-left, so the first argument lands nearest the top
        for (i, &arg) in args.iter().rev().enumerate() {
            stack[i] = arg;
        }
        stack[n] = Value::Int(n as i64);
        stack[n + 1] = Value::ReturnAddr(ReturnAddr {
            bc: rt.final_resumer,
            ip: 0,
        });
        stack[n + 2] = Value::Undefined;
        let p = match rt.heap.get(proc) {
            HeapData::Procedure(p) => *p,
            other => panic!("apply of a non-procedure: {other:?}"),
        };
        let mut vm = Vm {
            rt,
            stack,
            tracer,
            top: n + 3,
            bc: p.code,
            ip: 0,
            cp: Value::Ref(p.vars),
        };
        vm.run()
    }

    fn run(&mut self) -> Result<Value, Exception> {
        loop {
            if let Err(budget) = self.rt.heap.tracker_mut().on_operation() {
                self.raise(budget.into())?;
                continue;
            }
            let ip_before = self.ip;
            let byte = self.fetch_byte();
            let Some(op) = Opcode::from_repr(byte) else {
                self.raise(RunError::value_error(format!("unknown opcode: {byte}"), vec![]))?;
                continue;
            };
            self.tracer.on_instruction(ip_before, op, self.top);
            match self.step(op) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Done(value)) => return Ok(value),
                Err(err) => self.raise(err)?,
            }
        }
    }

    fn code(&self) -> &Code {
        match self.rt.heap.get(self.bc) {
            HeapData::Bytecode(code) => code,
            other => panic!("executing a non-bytecode object: {other:?}"),
        }
    }

    #[inline]
    fn fetch_byte(&mut self) -> u8 {
        let byte = self.code().bytes()[self.ip];
        self.ip += 1;
        byte
    }

    #[inline]
    fn fetch_word(&mut self) -> usize {
        let (word, next) = self.code().read_word(self.ip);
        self.ip = next;
        word
    }

    #[inline]
    fn push(&mut self, v: Value) -> RunResult<()> {
        if self.top >= STACK_SIZE - RAISE_RESERVE {
            return Err(RunError::resource_error("out of stack space"));
        }
        self.stack[self.top] = v;
        self.top += 1;
        Ok(())
    }

    #[inline]
    fn pop(&mut self) -> Value {
        self.top -= 1;
        self.stack[self.top]
    }

    /// `arg(1)` is the top of stack.
    #[inline]
    fn arg(&self, i: usize) -> Value {
        self.stack[self.top - i]
    }

    #[inline]
    fn set_arg(&mut self, i: usize, v: Value) {
        self.stack[self.top - i] = v;
    }

    fn step(&mut self, op: Opcode) -> RunResult<Flow> {
        match op {
            Opcode::Noop => {}

            Opcode::LocalRef => {
                let k = self.fetch_word();
                self.push(self.stack[self.top - k])?;
            }
            Opcode::LocalSet => {
                let k = self.fetch_word();
                self.stack[self.top - k] = self.arg(1);
                self.set_arg(1, Value::Undefined);
            }
            Opcode::ClosureRef => {
                let k = self.fetch_word();
                let v = self.closure_var(k);
                self.push(v)?;
            }
            Opcode::Push => {
                let index = self.fetch_word();
                let v = self.code().constant(index);
                self.push(v)?;
            }
            Opcode::Drop => {
                self.top -= 1;
            }
            Opcode::Parameter => {
                let word = self.fetch_word();
                let param = crate::primitive::RuntimeParam::from_repr(word)
                    .unwrap_or_else(|| panic!("bad parameter operand: {word}"));
                self.push(self.rt.param_value(param))?;
            }

            Opcode::Car => {
                let v = self.arg(1);
                let (car, _) = self.as_pair(v, "car")?;
                self.set_arg(1, car);
            }
            Opcode::Cdr => {
                let v = self.arg(1);
                let (_, cdr) = self.as_pair(v, "cdr")?;
                self.set_arg(1, cdr);
            }
            Opcode::SetCar => {
                let v = self.arg(1);
                let value = self.arg(2);
                self.set_pair_slot(v, value, "set-car!", true)?;
                self.set_arg(2, Value::Undefined);
                self.top -= 1;
            }
            Opcode::SetCdr => {
                let v = self.arg(1);
                let value = self.arg(2);
                self.set_pair_slot(v, value, "set-cdr!", false)?;
                self.set_arg(2, Value::Undefined);
                self.top -= 1;
            }
            Opcode::Cons => {
                let id = self.rt.heap.allocate(HeapData::Pair(self.arg(1), self.arg(2)))?;
                self.set_arg(2, Value::Ref(id));
                self.top -= 1;
            }
            Opcode::VectorRef => {
                let (v, k) = (self.arg(1), self.arg(2));
                let index = self.index_arg(k, "vector-ref")?;
                let items = self.as_vector(v, "vector-ref")?;
                let Some(&item) = items.get(index) else {
                    return Err(RunError::bounds_error("vector-ref: index out of range", vec![v, k]));
                };
                self.set_arg(2, item);
                self.top -= 1;
            }
            Opcode::VectorSet => {
                let (v, k, value) = (self.arg(1), self.arg(2), self.arg(3));
                let index = self.index_arg(k, "vector-set!")?;
                let items = self.as_vector_mut(v, "vector-set!")?;
                let Some(slot) = items.get_mut(index) else {
                    return Err(RunError::bounds_error("vector-set!: index out of range", vec![v, k]));
                };
                *slot = value;
                self.set_arg(3, Value::Undefined);
                self.top -= 2;
            }
            Opcode::MakeVector => {
                let (len, fill) = (self.arg(1), self.arg(2));
                let Value::Int(len) = len else {
                    return Err(RunError::type_error("make-vector: not an integer", vec![len]));
                };
                let len = usize::try_from(len)
                    .map_err(|_| RunError::value_error("make-vector: negative length", vec![Value::Int(len)]))?;
                let id = self.rt.heap.allocate(HeapData::Vector(vec![fill; len]))?;
                self.set_arg(2, Value::Ref(id));
                self.top -= 1;
            }
            Opcode::StringRef => {
                let (v, k) = (self.arg(1), self.arg(2));
                let index = self.index_arg(k, "string-ref")?;
                let bytes = self.as_string(v, "string-ref")?;
                let Some(&byte) = bytes.get(index) else {
                    return Err(RunError::bounds_error("string-ref: index out of range", vec![v, k]));
                };
                self.set_arg(2, Value::Char(byte as char));
                self.top -= 1;
            }
            Opcode::StringSet => {
                let (v, k, ch) = (self.arg(1), self.arg(2), self.arg(3));
                let index = self.index_arg(k, "string-set!")?;
                let Value::Char(c) = ch else {
                    return Err(RunError::type_error("string-set!: not a character", vec![ch]));
                };
                if !c.is_ascii() {
                    return Err(RunError::value_error("string-set!: not an ascii character", vec![ch]));
                }
                let bytes = self.as_string_mut(v, "string-set!")?;
                let Some(slot) = bytes.get_mut(index) else {
                    return Err(RunError::bounds_error("string-set!: index out of range", vec![v, k]));
                };
                *slot = c as u8;
                self.set_arg(3, Value::Undefined);
                self.top -= 2;
            }
            Opcode::MakeProcedure => {
                let (flags, num_args, bc, vars) = (self.arg(1), self.arg(2), self.arg(3), self.arg(4));
                let proc = self.make_procedure_value(flags, num_args, bc, vars)?;
                self.set_arg(4, proc);
                self.top -= 3;
            }

            Opcode::IsPair => self.type_check(|vm, v| matches!(vm.heap_data(v), Some(HeapData::Pair(..)))),
            Opcode::IsNull => self.type_check(|_, v| matches!(v, Value::Nil)),
            Opcode::IsChar => self.type_check(|_, v| matches!(v, Value::Char(_))),
            Opcode::IsInteger => self.type_check(|_, v| matches!(v, Value::Int(_))),
            Opcode::IsSymbol => self.type_check(|_, v| matches!(v, Value::Symbol(_))),
            Opcode::IsString => self.type_check(|vm, v| matches!(vm.heap_data(v), Some(HeapData::Str(_)))),
            Opcode::IsVector => self.type_check(|vm, v| matches!(vm.heap_data(v), Some(HeapData::Vector(_)))),
            Opcode::IsProcedure => {
                self.type_check(|vm, v| matches!(vm.heap_data(v), Some(HeapData::Procedure(_))));
            }
            Opcode::IsInputPort => {
                self.type_check(|vm, v| {
                    matches!(vm.heap_data(v), Some(HeapData::Port(crate::port::Port::Input(_))))
                });
            }
            Opcode::IsOutputPort => {
                self.type_check(|vm, v| {
                    matches!(vm.heap_data(v), Some(HeapData::Port(crate::port::Port::Output(_))))
                });
            }
            Opcode::IsEof => self.type_check(|_, v| matches!(v, Value::Eof)),

            Opcode::Add => self.binary_arith("+", i64::wrapping_add, |x, y| x + y)?,
            Opcode::Sub => self.binary_arith("-", i64::wrapping_sub, |x, y| x - y)?,
            Opcode::Mul => self.binary_arith("*", i64::wrapping_mul, |x, y| x * y)?,
            Opcode::Div => {
                let (a, b) = (self.arg(1), self.arg(2));
                let result = match numeric_pair(a, b) {
                    Some(Nums::Ints(x, y)) => {
                        if y == 0 {
                            return Err(RunError::value_error("/: division by zero", vec![a, b]));
                        }
                        // exact when it divides evenly, float otherwise
                        if x % y == 0 {
                            Value::Int(x.wrapping_div(y))
                        } else {
                            Value::Float(x as f64 / y as f64)
                        }
                    }
                    Some(Nums::Floats(x, y)) => Value::Float(x / y),
                    None => return Err(RunError::type_error("/: not a number", vec![a, b])),
                };
                self.set_arg(2, result);
                self.top -= 1;
            }
            Opcode::Quot => self.integer_arith("quotient", i64::wrapping_div)?,
            Opcode::Mod => self.integer_arith("modulo", floored_mod)?,
            Opcode::Neg => {
                let v = self.arg(1);
                let result = match v {
                    Value::Int(x) => Value::Int(x.wrapping_neg()),
                    Value::Float(x) => Value::Float(-x),
                    _ => return Err(RunError::type_error("-: not a number", vec![v])),
                };
                self.set_arg(1, result);
            }
            Opcode::Inv => {
                let v = self.arg(1);
                let result = match v {
                    Value::Int(0) => return Err(RunError::value_error("/: division by zero", vec![v])),
                    Value::Int(1) => Value::Int(1),
                    Value::Int(-1) => Value::Int(-1),
                    Value::Int(x) => Value::Float(1.0 / x as f64),
                    Value::Float(x) => Value::Float(1.0 / x),
                    _ => return Err(RunError::type_error("/: not a number", vec![v])),
                };
                self.set_arg(1, result);
            }
            Opcode::Lt => self.compare("<", |o| o.is_lt())?,
            Opcode::Le => self.compare("<=", |o| o.is_le())?,
            Opcode::Gt => self.compare(">", |o| o.is_gt())?,
            Opcode::Ge => self.compare(">=", |o| o.is_ge())?,
            Opcode::Eqn => self.compare("=", |o| o.is_eq())?,
            Opcode::Eq => {
                let result = self.arg(1) == self.arg(2);
                self.set_arg(2, Value::Bool(result));
                self.top -= 1;
            }

            Opcode::Call => {
                let n = self.fetch_word();
                if self.top + STACK_HEADROOM >= STACK_SIZE {
                    return Err(RunError::resource_error("out of stack space"));
                }
                let proc = self.arg(1);
                let ret = Value::ReturnAddr(ReturnAddr {
                    bc: self.bc,
                    ip: self.ip as u32,
                });
                let cp = self.cp;
                self.tracer.on_call(n, false);
                self.make_call(proc, n, ret, cp)?;
            }
            Opcode::TailCall => {
                let d = self.fetch_word();
                let n = self.fetch_word();
                let argc_slot = self.top - d;
                let Value::Int(m) = self.stack[argc_slot] else {
                    panic!("corrupt frame: argument count slot");
                };
                let ret = self.stack[argc_slot + 1];
                let ret_cp = self.stack[argc_slot + 2];
                let proc = self.arg(1);
                let base = argc_slot - m as usize;
                // overwrite the dying frame with the new argument block
                self.stack.copy_within(self.top - 1 - n..self.top - 1, base);
                self.top = base + n + 1;
                self.tracer.on_call(n, true);
                self.make_call(proc, n, ret, ret_cp)?;
            }
            Opcode::Apply1 => {
                let proc = self.arg(1);
                let lst = self.arg(2);
                let mut items: SmallVec<[Value; 8]> = SmallVec::new();
                let mut cursor = lst;
                loop {
                    match cursor {
                        Value::Nil => break,
                        Value::Ref(id) => match self.rt.heap.get(id) {
                            HeapData::Pair(car, cdr) => {
                                items.push(*car);
                                cursor = *cdr;
                            }
                            _ => return Err(RunError::type_error("apply1: not a list", vec![lst])),
                        },
                        _ => return Err(RunError::type_error("apply1: not a list", vec![lst])),
                    }
                }
                let count = items.len();
                self.top -= 2;
                if self.top + count + 1 + STACK_HEADROOM >= STACK_SIZE {
                    return Err(RunError::resource_error("out of stack space"));
                }
                for &item in items.iter().rev() {
                    self.stack[self.top] = item;
                    self.top += 1;
                }
                self.stack[self.top] = proc;
                self.top += 1;
                let ret = Value::ReturnAddr(ReturnAddr {
                    bc: self.bc,
                    ip: self.ip as u32,
                });
                let cp = self.cp;
                self.tracer.on_call(count, false);
                self.make_call(proc, count, ret, cp)?;
            }
            Opcode::CallCc => {
                if self.top + STACK_HEADROOM >= STACK_SIZE {
                    return Err(RunError::resource_error("out of stack space"));
                }
                let receiver = self.arg(1);
                let ret = ReturnAddr {
                    bc: self.bc,
                    ip: self.ip as u32,
                };
                // snapshot the stack as if the receiver had just returned
                // normally: resuming drops the result into the receiver slot
                let mut snapshot = Vec::with_capacity(self.top + 3);
                snapshot.extend_from_slice(&self.stack[..self.top]);
                snapshot.push(Value::Int(1));
                snapshot.push(Value::ReturnAddr(ret));
                snapshot.push(self.cp);
                let snap = self.rt.heap.allocate(HeapData::Vector(snapshot))?;
                let vars = self.rt.heap.allocate(HeapData::Vector(vec![Value::Ref(snap)]))?;
                let cont = self.rt.heap.allocate(HeapData::Procedure(Procedure {
                    flags: 0,
                    num_args: 1,
                    code: self.rt.continuation_resumer,
                    vars,
                }))?;
                // the continuation becomes the receiver's sole argument
                self.set_arg(1, Value::Ref(cont));
                self.stack[self.top] = receiver;
                self.top += 1;
                let cp = self.cp;
                self.tracer.on_call(1, false);
                self.make_call(receiver, 1, Value::ReturnAddr(ret), cp)?;
            }
            Opcode::ResumeCc => {
                // frame: value, argc, return address, saved cp; the captured
                // vector's single slot holds the stack snapshot
                let value = self.arg(4);
                let snapshot_ref = self.closure_var(0);
                let Value::Ref(snap_id) = snapshot_ref else {
                    panic!("corrupt continuation: snapshot missing");
                };
                let HeapData::Vector(snapshot) = self.rt.heap.get(snap_id) else {
                    panic!("corrupt continuation: snapshot not a vector");
                };
                let len = snapshot.len();
                self.stack[..len].copy_from_slice(snapshot);
                self.top = len;
                let ret_cp = self.arg(1);
                let Value::ReturnAddr(addr) = self.arg(2) else {
                    panic!("corrupt continuation: return address");
                };
                self.top -= 3;
                self.set_arg(1, value);
                self.bc = addr.bc;
                self.ip = addr.ip as usize;
                self.cp = ret_cp;
            }
            Opcode::Error => {
                let msg = self.pop();
                let text = match self.heap_data(msg) {
                    Some(HeapData::Str(bytes)) => String::from_utf8_lossy(bytes).into_owned(),
                    _ => write_value(msg, &self.rt.heap, &self.rt.interns),
                };
                return Err(RunError::new(ExcKind::UserError, text, vec![]));
            }
            Opcode::Jump => {
                let operand = self.ip.next_multiple_of(WORD);
                let (distance, _) = self.code().read_word(self.ip);
                self.ip = operand + distance;
            }
            Opcode::JumpUnless => {
                let operand = self.ip.next_multiple_of(WORD);
                let (distance, next) = self.code().read_word(self.ip);
                let test = self.pop();
                self.ip = if test.is_truthy() { next } else { operand + distance };
            }
            Opcode::Ret => {
                if self.top < 4 {
                    return Ok(Flow::Done(self.arg(1)));
                }
                let result = self.arg(1);
                let ret_cp = self.arg(2);
                let Value::ReturnAddr(addr) = self.arg(3) else {
                    panic!("corrupt frame: return address");
                };
                let Value::Int(argc) = self.arg(4) else {
                    panic!("corrupt frame: argument count");
                };
                let dest = self.top - argc as usize - 4;
                self.stack[dest] = result;
                self.top = dest + 1;
                self.bc = addr.bc;
                self.ip = addr.ip as usize;
                self.cp = ret_cp;
            }
            Opcode::Done => return Ok(Flow::Done(self.arg(1))),

            Opcode::Fcall0 => self.foreign_call(0)?,
            Opcode::Fcall1 => self.foreign_call(1)?,
            Opcode::Fcall2 => self.foreign_call(2)?,
            Opcode::Fcall3 => self.foreign_call(3)?,

            Opcode::Write => self.write_top("write", true)?,
            Opcode::Display => self.write_top("display", false)?,
            Opcode::WriteChar => {
                let (ch, port) = (self.arg(1), self.arg(2));
                let Value::Char(c) = ch else {
                    return Err(RunError::type_error("write-char: not a character", vec![ch]));
                };
                self.write_port_text(port, &c.to_string(), "write-char")?;
                self.set_arg(2, Value::Undefined);
                self.top -= 1;
            }
            Opcode::Newline => {
                let port = self.arg(1);
                self.write_port_text(port, "\n", "newline")?;
                self.set_arg(1, Value::Undefined);
            }
            Opcode::FlushOutput => {
                let port = self.arg(1);
                self.rt.flush_port(port, "flush-output")?;
                self.set_arg(1, Value::Undefined);
            }
            Opcode::Read => {
                let port = self.arg(1);
                let outcome = self.rt.read_port_datum(port, "read")?;
                let v = match outcome {
                    ReadOutcome::Datum(v) => v,
                    ReadOutcome::Eof => Value::Eof,
                };
                self.set_arg(1, v);
            }
            Opcode::ReadChar => {
                let port = self.arg(1);
                let c = self.rt.read_port_char(port, "read-char")?;
                self.set_arg(1, c.map_or(Value::Eof, Value::Char));
            }
        }
        Ok(Flow::Continue)
    }

    // ------------------------------------------------------------------
    // calls
    // ------------------------------------------------------------------

    /// Shared tail of `CALL`, `TAIL_CALL`, `APPLY1`, and `CALLCC`. Expects
    /// `n` arguments below a procedure slot on top of the stack; performs
    /// arity adaptation and installs the callee.
    fn make_call(&mut self, proc: Value, n: usize, ret: Value, ret_cp: Value) -> RunResult<()> {
        let mut n = n;
        // opcodes called as first-class values compile to thin wrappers on
        // the fly
        let proc = match proc {
            Value::Primitive(prim) => {
                let wrapper = self
                    .rt
                    .opcode_procedure(prim, n)
                    .map_err(|err| RunError::new(ExcKind::CompileError, err.message.clone(), vec![]))?;
                self.set_arg(1, Value::Ref(wrapper));
                Value::Ref(wrapper)
            }
            other => other,
        };
        let callee = match proc {
            Value::Ref(id) => match self.rt.heap.get(id) {
                HeapData::Procedure(p) => *p,
                _ => return Err(RunError::type_error("non procedure application", vec![proc])),
            },
            _ => return Err(RunError::type_error("non procedure application", vec![proc])),
        };
        let declared = callee.num_args as usize;
        if n < declared {
            return Err(RunError::arity_error("not enough args", vec![proc, Value::Int(n as i64)]));
        }
        if n > declared {
            if !callee.variadic() {
                return Err(RunError::arity_error("too many args", vec![proc, Value::Int(n as i64)]));
            }
            // gather the surplus into the rest list
            let surplus = n - declared;
            let base = self.top - 1 - n;
            let mut rest = Value::Nil;
            for i in (declared..n).rev() {
                let item = self.stack[self.top - 2 - i];
                rest = Value::Ref(self.rt.heap.allocate(HeapData::Pair(item, rest))?);
            }
            self.stack.copy_within(base + surplus..base + n + 1, base + 1);
            self.stack[base] = rest;
            self.top -= surplus - 1;
            n = declared + 1;
        } else if callee.variadic() {
            // exactly at the minimum: the rest argument is the empty list
            let base = self.top - 1 - n;
            self.stack.copy_within(base..self.top, base + 1);
            self.stack[base] = Value::Nil;
            self.top += 1;
            n += 1;
        }
        self.stack[self.top - 1] = Value::Int(n as i64);
        self.stack[self.top] = ret;
        self.stack[self.top + 1] = ret_cp;
        self.top += 2;
        self.bc = callee.code;
        self.ip = 0;
        self.cp = Value::Ref(callee.vars);
        Ok(())
    }

    /// Materializes a pending raise and transfers to the `*error-handler*`
    /// procedure. Only unrecoverable conditions (allocation failure during
    /// the raise, exhausted headroom, a clobbered handler cell) escape as a
    /// host exception.
    fn raise(&mut self, err: Box<RunError>) -> Result<(), Exception> {
        let fallback = |e: &RunError| Exception::new(e.kind, e.message.clone(), vec![]);
        let message = self
            .rt
            .heap
            .allocate(HeapData::Str(err.message.clone().into_bytes()))
            .map_err(|_| fallback(&err))?;
        let mut irritants = Value::Nil;
        for &v in err.irritants.iter().rev() {
            let id = self
                .rt
                .heap
                .allocate(HeapData::Pair(v, irritants))
                .map_err(|_| fallback(&err))?;
            irritants = Value::Ref(id);
        }
        let exc = self
            .rt
            .heap
            .allocate(HeapData::Exception(Exc {
                kind: err.kind,
                message: Value::Ref(message),
                irritants,
                source: Value::Bool(false),
                continuation: Value::Bool(false),
            }))
            .map_err(|_| fallback(&err))?;

        if self.top + 4 > STACK_SIZE {
            return Err(Exception::new(
                ExcKind::ResourceError,
                "stack exhausted while raising",
                vec![err.message.clone()],
            ));
        }
        let handler = env::cell_value(&self.rt.heap, self.rt.handler_cell);
        let callee = match handler {
            Value::Ref(id) => match self.rt.heap.get(id) {
                HeapData::Procedure(p) => *p,
                _ => return Err(fallback(&err)),
            },
            _ => return Err(fallback(&err)),
        };
        self.stack[self.top] = Value::Ref(exc);
        self.stack[self.top + 1] = Value::Int(1);
        self.stack[self.top + 2] = Value::ReturnAddr(ReturnAddr {
            bc: self.bc,
            ip: self.ip as u32,
        });
        self.stack[self.top + 3] = self.cp;
        self.top += 4;
        self.bc = callee.code;
        self.ip = 0;
        self.cp = Value::Ref(callee.vars);
        Ok(())
    }

    // ------------------------------------------------------------------
    // helpers
    // ------------------------------------------------------------------

    fn closure_var(&self, k: usize) -> Value {
        let Value::Ref(id) = self.cp else {
            panic!("closure reference without a captured vector");
        };
        match self.rt.heap.get(id) {
            HeapData::Vector(items) => items[k],
            other => panic!("captured variables not a vector: {other:?}"),
        }
    }

    fn heap_data(&self, v: Value) -> Option<&HeapData> {
        match v {
            Value::Ref(id) => Some(self.rt.heap.get(id)),
            _ => None,
        }
    }

    fn type_check(&mut self, pred: impl Fn(&Self, Value) -> bool) {
        let v = self.arg(1);
        let result = pred(self, v);
        self.set_arg(1, Value::Bool(result));
    }

    fn as_pair(&self, v: Value, who: &str) -> RunResult<(Value, Value)> {
        match self.heap_data(v) {
            Some(HeapData::Pair(car, cdr)) => Ok((*car, *cdr)),
            _ => Err(RunError::type_error(format!("{who}: not a pair"), vec![v])),
        }
    }

    fn set_pair_slot(&mut self, v: Value, value: Value, who: &str, car: bool) -> RunResult<()> {
        let Value::Ref(id) = v else {
            return Err(RunError::type_error(format!("{who}: not a pair"), vec![v]));
        };
        match self.rt.heap.get_mut(id) {
            HeapData::Pair(slot_car, slot_cdr) => {
                if car {
                    *slot_car = value;
                } else {
                    *slot_cdr = value;
                }
                Ok(())
            }
            _ => Err(RunError::type_error(format!("{who}: not a pair"), vec![v])),
        }
    }

    fn as_vector(&self, v: Value, who: &str) -> RunResult<&[Value]> {
        match self.heap_data(v) {
            Some(HeapData::Vector(items)) => Ok(items),
            _ => Err(RunError::type_error(format!("{who}: not a vector"), vec![v])),
        }
    }

    fn as_vector_mut(&mut self, v: Value, who: &str) -> RunResult<&mut Vec<Value>> {
        let Value::Ref(id) = v else {
            return Err(RunError::type_error(format!("{who}: not a vector"), vec![v]));
        };
        match self.rt.heap.get_mut(id) {
            HeapData::Vector(items) => Ok(items),
            _ => Err(RunError::type_error(format!("{who}: not a vector"), vec![v])),
        }
    }

    fn as_string(&self, v: Value, who: &str) -> RunResult<&[u8]> {
        match self.heap_data(v) {
            Some(HeapData::Str(bytes)) => Ok(bytes),
            _ => Err(RunError::type_error(format!("{who}: not a string"), vec![v])),
        }
    }

    fn as_string_mut(&mut self, v: Value, who: &str) -> RunResult<&mut Vec<u8>> {
        let Value::Ref(id) = v else {
            return Err(RunError::type_error(format!("{who}: not a string"), vec![v]));
        };
        match self.rt.heap.get_mut(id) {
            HeapData::Str(bytes) => Ok(bytes),
            _ => Err(RunError::type_error(format!("{who}: not a string"), vec![v])),
        }
    }

    fn index_arg(&self, v: Value, who: &str) -> RunResult<usize> {
        let Value::Int(k) = v else {
            return Err(RunError::type_error(format!("{who}: not an integer"), vec![v]));
        };
        usize::try_from(k).map_err(|_| RunError::bounds_error(format!("{who}: index out of range"), vec![v]))
    }

    fn make_procedure_value(&mut self, flags: Value, num_args: Value, bc: Value, vars: Value) -> RunResult<Value> {
        let Value::Int(flags) = flags else {
            return Err(RunError::type_error("make-procedure: not an integer", vec![flags]));
        };
        let Value::Int(num_args) = num_args else {
            return Err(RunError::type_error("make-procedure: not an integer", vec![num_args]));
        };
        let Value::Ref(bc_id) = bc else {
            return Err(RunError::type_error("make-procedure: not bytecode", vec![bc]));
        };
        if !matches!(self.rt.heap.get(bc_id), HeapData::Bytecode(_)) {
            return Err(RunError::type_error("make-procedure: not bytecode", vec![bc]));
        }
        let Value::Ref(vars_id) = vars else {
            return Err(RunError::type_error("make-procedure: not a vector", vec![vars]));
        };
        if !matches!(self.rt.heap.get(vars_id), HeapData::Vector(_)) {
            return Err(RunError::type_error("make-procedure: not a vector", vec![vars]));
        }
        let num_args = u16::try_from(num_args)
            .map_err(|_| RunError::value_error("make-procedure: bad argument count", vec![Value::Int(num_args)]))?;
        let id = self.rt.heap.allocate(HeapData::Procedure(Procedure {
            flags: flags as u8,
            num_args,
            code: bc_id,
            vars: vars_id,
        }))?;
        Ok(Value::Ref(id))
    }

    fn binary_arith(&mut self, name: &str, ints: fn(i64, i64) -> i64, floats: fn(f64, f64) -> f64) -> RunResult<()> {
        let (a, b) = (self.arg(1), self.arg(2));
        let result = match numeric_pair(a, b) {
            Some(Nums::Ints(x, y)) => Value::Int(ints(x, y)),
            Some(Nums::Floats(x, y)) => Value::Float(floats(x, y)),
            None => return Err(RunError::type_error(format!("{name}: not a number"), vec![a, b])),
        };
        self.set_arg(2, result);
        self.top -= 1;
        Ok(())
    }

    fn integer_arith(&mut self, name: &str, ints: fn(i64, i64) -> i64) -> RunResult<()> {
        let (a, b) = (self.arg(1), self.arg(2));
        let (Value::Int(x), Value::Int(y)) = (a, b) else {
            return Err(RunError::type_error(format!("{name}: not an integer"), vec![a, b]));
        };
        if y == 0 {
            return Err(RunError::value_error(format!("{name}: division by zero"), vec![a, b]));
        }
        self.set_arg(2, Value::Int(ints(x, y)));
        self.top -= 1;
        Ok(())
    }

    fn compare(&mut self, name: &str, accept: fn(std::cmp::Ordering) -> bool) -> RunResult<()> {
        let (a, b) = (self.arg(1), self.arg(2));
        let ordering = match numeric_pair(a, b) {
            Some(Nums::Ints(x, y)) => Some(x.cmp(&y)),
            Some(Nums::Floats(x, y)) => x.partial_cmp(&y),
            None => return Err(RunError::type_error(format!("{name}: not a number"), vec![a, b])),
        };
        self.set_arg(2, Value::Bool(ordering.is_some_and(accept)));
        self.top -= 1;
        Ok(())
    }

    fn foreign_call(&mut self, argc: usize) -> RunResult<()> {
        let f = self.arg(1);
        let Value::Foreign(id) = f else {
            return Err(RunError::type_error("foreign call: not a host function", vec![f]));
        };
        let mut args: SmallVec<[Value; 4]> = SmallVec::new();
        for i in 0..argc {
            args.push(self.arg(2 + i));
        }
        let func = self.rt.foreign[id.index()];
        let result = func(self.rt, &args)?;
        self.top -= argc;
        self.set_arg(1, result);
        Ok(())
    }

    fn write_top(&mut self, who: &str, readable: bool) -> RunResult<()> {
        let (obj, port) = (self.arg(1), self.arg(2));
        let text = if readable {
            write_value(obj, &self.rt.heap, &self.rt.interns)
        } else {
            display_value(obj, &self.rt.heap, &self.rt.interns)
        };
        self.write_port_text(port, &text, who)?;
        self.set_arg(2, Value::Undefined);
        self.top -= 1;
        Ok(())
    }

    fn write_port_text(&mut self, port: Value, text: &str, who: &str) -> RunResult<()> {
        self.rt.write_port_text(port, text, who)
    }
}

#[cfg(test)]
mod tests {
    use super::floored_mod;

    #[test]
    fn floored_mod_follows_the_divisor_sign() {
        assert_eq!(floored_mod(7, 2), 1);
        assert_eq!(floored_mod(-7, 2), 1);
        assert_eq!(floored_mod(7, -2), -1);
        assert_eq!(floored_mod(-7, -2), -1);
        assert_eq!(floored_mod(6, 3), 0);
        assert_eq!(floored_mod(-6, 3), 0);
    }
}
