//! The runtime handle and public entry points.
//!
//! A `Runtime` owns the heap, the symbol interner, the foreign function
//! table, the standard (interaction) environment, the error-handler cell,
//! the resumer bytecodes, and the current-port parameters. Every public
//! entry point threads through it; there are no ambient globals.

use ahash::AHashMap;

use crate::{
    analyze::Analyzer,
    ast::CoreForm,
    bytecode::{make_opcode_procedure, CodeBuilder, Compiler, Context, Opcode, Vm},
    env,
    exception::{CompileError, Exception, ExcKind, RunError, RunResult},
    heap::{Heap, HeapData, HeapId, Procedure},
    intern::Interns,
    object::{object_from_value, Object},
    parse::{read_all, read_datum, ReadOutcome},
    port::{InputPort, OutputPort, Port},
    primitive::{self, ForeignFn, PrimitiveId, RuntimeParam, PRIMITIVES},
    resource::{NoLimitTracker, ResourceTracker},
    tracer::{NoopTracer, VmTracer},
    value::Value,
};

/// A compiled program: a nullary thunk ready to run any number of times.
#[derive(Debug, Clone, Copy)]
pub struct CompiledProgram {
    thunk: HeapId,
}

/// Primary interface for compiling and running code.
///
/// # Example
/// ```
/// use vireo::{Object, Runtime};
///
/// let mut rt = Runtime::new();
/// let result = rt.run("(+ 40 2)").unwrap();
/// assert_eq!(result, Object::Int(42));
/// ```
#[derive(Debug)]
pub struct Runtime<T: ResourceTracker = NoLimitTracker> {
    pub(crate) heap: Heap<T>,
    pub(crate) interns: Interns,
    pub(crate) foreign: Vec<ForeignFn<T>>,
    pub(crate) interaction_env: HeapId,
    pub(crate) handler_cell: HeapId,
    pub(crate) continuation_resumer: HeapId,
    pub(crate) final_resumer: HeapId,
    cur_input: Value,
    cur_output: Value,
    cur_error: Value,
    /// Synthesized wrappers for opcodes called as first-class values, keyed
    /// by primitive and call-site arity.
    opcode_procs: AHashMap<(PrimitiveId, usize), HeapId>,
}

impl Runtime<NoLimitTracker> {
    /// Builds a runtime with no resource limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_tracker(NoLimitTracker).expect("unlimited construction cannot hit a budget")
    }
}

impl Default for Runtime<NoLimitTracker> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ResourceTracker> Runtime<T> {
    /// Builds a runtime whose heap allocations and executed instructions
    /// are gated by `tracker`.
    pub fn with_tracker(tracker: T) -> Result<Self, Exception> {
        debug_assert!(primitive::table_is_coherent());
        let mut heap = Heap::new(tracker);
        let mut interns = Interns::new();

        // resumer thunks: the continuation resumer's sole opcode reinstates
        // a captured stack; the final resumer ends the VM
        let mut builder = CodeBuilder::new();
        builder.emit(Opcode::ResumeCc);
        let continuation_resumer = heap.allocate(HeapData::Bytecode(builder.finalize()))?;
        let mut builder = CodeBuilder::new();
        builder.emit(Opcode::Done);
        let final_resumer = heap.allocate(HeapData::Bytecode(builder.finalize()))?;

        // standard environment: core forms plus the primitive table
        let env = heap.allocate(HeapData::Env(crate::env::EnvFrame::default()))?;
        for form in [
            CoreForm::Define,
            CoreForm::Set,
            CoreForm::Lambda,
            CoreForm::If,
            CoreForm::Begin,
            CoreForm::Quote,
        ] {
            let name = interns.intern(&form.to_string());
            env::define(&mut heap, env, name, Value::Core(form))?;
        }
        for (index, prim) in PRIMITIVES.iter().enumerate() {
            let name = interns.intern(prim.name);
            env::define(&mut heap, env, name, Value::Primitive(PrimitiveId::new(index)))?;
        }

        // the default error handler returns the exception value and unwinds
        // the VM; drivers report it
        let mut builder = CodeBuilder::new();
        builder.emit(Opcode::LocalRef);
        builder.emit_word(4);
        builder.emit(Opcode::Done);
        let handler_code = heap.allocate(HeapData::Bytecode(builder.finalize()))?;
        let handler_vars = heap.allocate(HeapData::Vector(Vec::new()))?;
        let handler = heap.allocate(HeapData::Procedure(Procedure {
            flags: 0,
            num_args: 1,
            code: handler_code,
            vars: handler_vars,
        }))?;
        let handler_name = interns.intern("*error-handler*");
        env::define(&mut heap, env, handler_name, Value::Ref(handler))?;
        let handler_cell = env::lookup(&heap, env, handler_name).expect("error-handler cell was just defined");

        let stdin = heap.allocate(HeapData::Port(Port::Input(InputPort::stdin())))?;
        let stdout = heap.allocate(HeapData::Port(Port::Output(OutputPort::stdout())))?;
        let stderr = heap.allocate(HeapData::Port(Port::Output(OutputPort::stderr())))?;

        Ok(Self {
            heap,
            interns,
            foreign: primitive::foreign_table::<T>(),
            interaction_env: env,
            handler_cell,
            continuation_resumer,
            final_resumer,
            cur_input: Value::Ref(stdin),
            cur_output: Value::Ref(stdout),
            cur_error: Value::Ref(stderr),
            opcode_procs: AHashMap::new(),
        })
    }

    /// Current value of a runtime parameter.
    pub(crate) fn param_value(&self, param: RuntimeParam) -> Value {
        match param {
            RuntimeParam::CurrentInput => self.cur_input,
            RuntimeParam::CurrentOutput => self.cur_output,
            RuntimeParam::CurrentError => self.cur_error,
            RuntimeParam::InteractionEnv => Value::Ref(self.interaction_env),
        }
    }

    /// Heap statistics, for monitoring and tests.
    #[must_use]
    pub fn heap_stats(&self) -> crate::heap::HeapStats {
        self.heap.stats()
    }

    /// Number of interned symbols.
    #[must_use]
    pub fn interned_symbols(&self) -> usize {
        self.interns.len()
    }

    // ------------------------------------------------------------------
    // compile / run
    // ------------------------------------------------------------------

    /// Parses and compiles a source string into a runnable program. Multiple
    /// forms are compiled as a single top-level sequence.
    pub fn compile(&mut self, source: &str) -> Result<CompiledProgram, Exception> {
        let data = read_all(source, &mut self.heap, &mut self.interns).map_err(Exception::from)?;
        let expr = match data.as_slice() {
            [] => Value::Undefined,
            [only] => *only,
            _ => {
                // synthesize (begin form...)
                let begin = Value::Symbol(self.interns.intern("begin"));
                let mut list = Value::Nil;
                for &form in data.iter().rev() {
                    list = Value::Ref(self.heap.allocate(HeapData::Pair(form, list))?);
                }
                Value::Ref(self.heap.allocate(HeapData::Pair(begin, list))?)
            }
        };
        let thunk = self.compile_datum(expr)?;
        Ok(CompiledProgram { thunk })
    }

    /// Runs a compiled program in the given context.
    pub fn execute(&mut self, program: &CompiledProgram, ctx: &mut Context) -> Result<Object, Exception> {
        let value = self.apply_thunk(program.thunk, ctx, &mut NoopTracer)?;
        Ok(object_from_value(value, &self.heap, &self.interns))
    }

    /// Parses, compiles, and runs a source string, returning the value of
    /// its last form.
    pub fn run(&mut self, source: &str) -> Result<Object, Exception> {
        let program = self.compile(source)?;
        let mut ctx = Context::new();
        self.execute(&program, &mut ctx)
    }

    /// Like [`run`](Self::run), with an instruction tracer attached.
    pub fn run_traced(&mut self, source: &str, tracer: &mut impl VmTracer) -> Result<Object, Exception> {
        let program = self.compile(source)?;
        let mut ctx = Context::new();
        let value = self.apply_thunk(program.thunk, &mut ctx, tracer)?;
        Ok(object_from_value(value, &self.heap, &self.interns))
    }

    /// Analyzer, free-variable pass, and compiler over one datum; returns a
    /// nullary thunk procedure.
    pub(crate) fn compile_datum(&mut self, expr: Value) -> Result<HeapId, Exception> {
        let analysis = Analyzer::analyze_program(&mut self.heap, &self.interns, expr, self.interaction_env)
            .map_err(Exception::from)?;
        Compiler::new(&mut self.heap, &analysis.lambdas)
            .compile_thunk(&analysis.root)
            .map_err(Exception::from)
    }

    /// Evaluates one already-read datum in the interaction environment.
    pub(crate) fn eval_datum(&mut self, expr: Value, tracer: &mut impl VmTracer) -> Result<Value, Exception> {
        let thunk = self.compile_datum(expr)?;
        let mut ctx = Context::new();
        self.apply_thunk(thunk, &mut ctx, tracer)
    }

    fn apply_thunk(&mut self, thunk: HeapId, ctx: &mut Context, tracer: &mut impl VmTracer) -> Result<Value, Exception> {
        let value = Vm::apply(self, ctx, thunk, &[], tracer)?;
        if value.is_exception(&self.heap) {
            let Value::Ref(id) = value else { unreachable!() };
            return Err(Exception::from_heap(id, &self.heap, &self.interns));
        }
        Ok(value)
    }

    /// `load`: reads and evaluates every form of a file in a fresh context.
    pub(crate) fn load_path(&mut self, path: &str) -> RunResult<Value> {
        let source = std::fs::read_to_string(path)
            .map_err(|err| RunError::new(ExcKind::ResourceError, format!("load: {err}"), vec![]))?;
        let data = read_all(&source, &mut self.heap, &mut self.interns)
            .map_err(|err| RunError::new(ExcKind::CompileError, err.message.clone(), vec![]))?;
        for expr in data {
            self.eval_datum(expr, &mut NoopTracer)
                .map_err(|err| RunError::new(err.kind(), err.message().to_owned(), vec![]))?;
        }
        Ok(Value::Undefined)
    }

    /// Returns (building if needed) the thin wrapper procedure for calling
    /// a primitive as a first-class value with `num_args` arguments.
    pub(crate) fn opcode_procedure(
        &mut self,
        prim: PrimitiveId,
        num_args: usize,
    ) -> Result<HeapId, Box<CompileError>> {
        if let Some(&cached) = self.opcode_procs.get(&(prim, num_args)) {
            return Ok(cached);
        }
        let proc = make_opcode_procedure(&mut self.heap, prim, num_args)?;
        self.opcode_procs.insert((prim, num_args), proc);
        Ok(proc)
    }

    // ------------------------------------------------------------------
    // port plumbing shared by the VM and the REPL
    // ------------------------------------------------------------------

    /// Runs `f` with the input port temporarily moved out of the heap, so
    /// the reader can allocate while holding it.
    fn with_input_port<R>(
        &mut self,
        port: Value,
        who: &str,
        f: impl FnOnce(&mut Self, &mut InputPort) -> R,
    ) -> RunResult<R> {
        let Value::Ref(id) = port else {
            return Err(RunError::type_error(format!("{who}: not an input port"), vec![port]));
        };
        let taken = match self.heap.get_mut(id) {
            slot @ HeapData::Port(Port::Input(_)) => std::mem::replace(slot, HeapData::Port(Port::Closed)),
            HeapData::Port(_) => {
                return Err(RunError::type_error(format!("{who}: not an input port"), vec![port]))
            }
            _ => return Err(RunError::type_error(format!("{who}: not an input port"), vec![port])),
        };
        let HeapData::Port(Port::Input(mut input)) = taken else {
            unreachable!("matched an input port above")
        };
        let result = f(self, &mut input);
        *self.heap.get_mut(id) = HeapData::Port(Port::Input(input));
        Ok(result)
    }

    pub(crate) fn read_port_datum(&mut self, port: Value, who: &str) -> RunResult<ReadOutcome> {
        self.with_input_port(port, who, |rt, input| {
            read_datum(input, &mut rt.heap, &mut rt.interns)
        })?
        .map_err(|err| RunError::new(ExcKind::CompileError, err.message.clone(), vec![]))
    }

    pub(crate) fn read_port_char(&mut self, port: Value, who: &str) -> RunResult<Option<char>> {
        self.with_input_port(port, who, |_, input| input.next_char())
    }

    pub(crate) fn write_port_text(&mut self, port: Value, text: &str, who: &str) -> RunResult<()> {
        let output = self.output_port_mut(port, who)?;
        output
            .write_str(text)
            .map_err(|err| RunError::new(ExcKind::ResourceError, format!("{who}: {err}"), vec![]))
    }

    pub(crate) fn flush_port(&mut self, port: Value, who: &str) -> RunResult<()> {
        let output = self.output_port_mut(port, who)?;
        output
            .flush()
            .map_err(|err| RunError::new(ExcKind::ResourceError, format!("{who}: {err}"), vec![]))
    }

    fn output_port_mut(&mut self, port: Value, who: &str) -> RunResult<&mut OutputPort> {
        let Value::Ref(id) = port else {
            return Err(RunError::type_error(format!("{who}: not an output port"), vec![port]));
        };
        match self.heap.get_mut(id) {
            HeapData::Port(Port::Output(output)) => Ok(output),
            _ => Err(RunError::type_error(format!("{who}: not an output port"), vec![port])),
        }
    }

    /// Reads one datum from the current input port. Used by the REPL.
    pub(crate) fn read_current_input(&mut self) -> RunResult<ReadOutcome> {
        let port = self.cur_input;
        self.read_port_datum(port, "read")
    }

    /// Writes text to the current output port. Used by the REPL.
    pub(crate) fn write_current_output(&mut self, text: &str) -> RunResult<()> {
        let port = self.cur_output;
        self.write_port_text(port, text, "write")?;
        self.flush_port(port, "write")
    }

    pub(crate) fn write_current_error(&mut self, text: &str) -> RunResult<()> {
        let port = self.cur_error;
        self.write_port_text(port, text, "write")?;
        self.flush_port(port, "write")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn standard_env_binds_core_forms_and_primitives() {
        let mut rt = Runtime::new();
        let lambda = rt.interns.intern("lambda");
        let cell = env::lookup(&rt.heap, rt.interaction_env, lambda).unwrap();
        assert_eq!(env::cell_value(&rt.heap, cell), Value::Core(CoreForm::Lambda));

        let car = rt.interns.intern("car");
        let cell = env::lookup(&rt.heap, rt.interaction_env, car).unwrap();
        assert!(matches!(env::cell_value(&rt.heap, cell), Value::Primitive(_)));
    }

    #[test]
    fn opcode_procedures_are_cached_per_arity() {
        let mut rt = Runtime::new();
        let add = PrimitiveId::new(PRIMITIVES.iter().position(|p| p.name == "+").unwrap());
        let a = rt.opcode_procedure(add, 2).unwrap();
        let b = rt.opcode_procedure(add, 2).unwrap();
        let c = rt.opcode_procedure(add, 3).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn compiled_programs_are_reusable() {
        let mut rt = Runtime::new();
        let program = rt.compile("(+ 1 2)").unwrap();
        let mut ctx = Context::new();
        assert_eq!(rt.execute(&program, &mut ctx).unwrap(), Object::Int(3));
        // repeated application yields the same result
        let mut ctx = Context::new();
        assert_eq!(rt.execute(&program, &mut ctx).unwrap(), Object::Int(3));
    }
}
