//! Instruction-level tracing hooks for the VM.
//!
//! A `VmTracer` is threaded through execution and receives a callback per
//! dispatched instruction and per procedure call. `NoopTracer` compiles away
//! entirely; `StderrTracer` prints a one-line trace per instruction and is
//! useful when debugging compiler output.

use crate::bytecode::Opcode;

/// Observer for VM execution events.
pub trait VmTracer {
    /// Called before each instruction is dispatched.
    ///
    /// `ip` is the offset of the opcode byte within the current bytecode
    /// object and `top` is the current stack height.
    fn on_instruction(&mut self, ip: usize, op: Opcode, top: usize) {
        let _ = (ip, op, top);
    }

    /// Called when a procedure call is about to be performed.
    fn on_call(&mut self, arg_count: usize, tail: bool) {
        let _ = (arg_count, tail);
    }
}

/// Tracer that does nothing. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Tracer that prints every instruction to stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrTracer;

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, ip: usize, op: Opcode, top: usize) {
        eprintln!("[vm] {ip:06} {op:?} (top={top})");
    }

    fn on_call(&mut self, arg_count: usize, tail: bool) {
        let kind = if tail { "tail-call" } else { "call" };
        eprintln!("[vm] {kind} argc={arg_count}");
    }
}
