#![doc = include_str!("../../../README.md")]

mod analyze;
mod ast;
mod bytecode;
mod env;
mod exception;
mod heap;
mod intern;
mod object;
mod parse;
mod port;
mod primitive;
mod repl;
mod resource;
mod runtime;
mod tracer;
mod value;

pub use crate::{
    bytecode::{Context, Opcode},
    exception::{CompileError, ExcKind, Exception},
    heap::HeapStats,
    object::Object,
    repl::repl,
    resource::{LimitedTracker, NoLimitTracker, ResourceError, ResourceTracker},
    runtime::{CompiledProgram, Runtime},
    tracer::{NoopTracer, StderrTracer, VmTracer},
};
