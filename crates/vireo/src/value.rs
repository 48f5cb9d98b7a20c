//! Primary value type representing Scheme data at runtime.
//!
//! This enum uses a hybrid design: small immediate values (integers, chars,
//! booleans, the empty list) are stored inline, while heap-allocated values
//! (pairs, strings, vectors, procedures, ports) live in the arena and are
//! referenced via `Ref(HeapId)`.
//!
//! A handful of variants never escape to user programs: `Core` and
//! `LambdaLoc` exist only inside environment cells during analysis, and
//! `ReturnAddr` only inside VM call frames (and therefore inside captured
//! continuation stacks). Confusing them with runtime data is a bug in the
//! compiler, not something a program can observe.
//!
//! NOTE: it's important to keep this type small and `Copy`; the VM moves
//! values through the stack constantly.

use std::fmt::Write as _;

use crate::{
    ast::{CoreForm, LambdaId},
    heap::{Heap, HeapData, HeapId},
    intern::{Interns, SymbolId},
    port::Port,
    primitive::{ForeignId, PrimitiveId, PRIMITIVES},
    resource::ResourceTracker,
};

/// A saved return location: a bytecode object plus a byte offset into it.
///
/// Lives in VM call frames in place of a raw code pointer, which keeps
/// captured continuation stacks self-contained.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ReturnAddr {
    pub bc: HeapId,
    pub ip: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Value {
    /// The unspecified value: result of `set!`, one-armed `if`, empty `begin`.
    Undefined,
    /// The end-of-file marker returned by `read` and `read-char`.
    Eof,
    /// The empty list.
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    /// An interned symbol. The name lives in the `Interns` table.
    Symbol(SymbolId),
    /// A core special form marker, bound in the standard environment.
    /// Analysis-only: resolving a head symbol to one of these selects the
    /// corresponding analyzer.
    Core(CoreForm),
    /// A primitive operation, bound in the standard environment by name.
    /// Applications of these compile to inline opcodes; calling one as a
    /// first-class value goes through a synthesized wrapper procedure.
    Primitive(PrimitiveId),
    /// A host function handle, consumed from the stack by the `Fcall*`
    /// instructions.
    Foreign(ForeignId),
    /// Analysis-only marker stored in a binding cell for a parameter or an
    /// internal definition: the lambda that owns the binding.
    LambdaLoc(LambdaId),
    /// Frame bookkeeping word: the saved return location of a call.
    ReturnAddr(ReturnAddr),
    /// Reference to a heap-allocated object.
    Ref(HeapId),
}

impl Value {
    /// Scheme truthiness: everything except `#f` is true.
    #[inline]
    pub fn is_truthy(self) -> bool {
        !matches!(self, Self::Bool(false))
    }

    #[inline]
    pub fn is_exception(self, heap: &Heap<impl ResourceTracker>) -> bool {
        matches!(self, Self::Ref(id) if matches!(heap.get(id), HeapData::Exception(_)))
    }
}

/// Maximum nesting depth the renderers will follow before giving up with
/// `...`. Guards against cyclic data built with `set-car!`/`set-cdr!`.
const MAX_RENDER_DEPTH: usize = 64;

/// Renders a value in `write` style: strings quoted and escaped, characters
/// in `#\x` notation. The output reads back as the same datum.
pub(crate) fn write_value(v: Value, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> String {
    let mut out = String::new();
    render(v, heap, interns, true, MAX_RENDER_DEPTH, &mut out);
    out
}

/// Renders a value in `display` style: strings raw, characters bare.
pub(crate) fn display_value(v: Value, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> String {
    let mut out = String::new();
    render(v, heap, interns, false, MAX_RENDER_DEPTH, &mut out);
    out
}

fn render(
    v: Value,
    heap: &Heap<impl ResourceTracker>,
    interns: &Interns,
    readable: bool,
    depth: usize,
    out: &mut String,
) {
    if depth == 0 {
        out.push_str("...");
        return;
    }
    match v {
        Value::Undefined => out.push_str("#<undef>"),
        Value::Eof => out.push_str("#<eof>"),
        Value::Nil => out.push_str("()"),
        Value::Bool(true) => out.push_str("#t"),
        Value::Bool(false) => out.push_str("#f"),
        Value::Int(n) => {
            let _ = write!(out, "{n}");
        }
        Value::Float(x) => {
            let mut buffer = ryu::Buffer::new();
            out.push_str(buffer.format(x));
        }
        Value::Char(c) => {
            if readable {
                match c {
                    ' ' => out.push_str("#\\space"),
                    '\n' => out.push_str("#\\newline"),
                    '\t' => out.push_str("#\\tab"),
                    _ => {
                        out.push_str("#\\");
                        out.push(c);
                    }
                }
            } else {
                out.push(c);
            }
        }
        Value::Symbol(id) => out.push_str(interns.resolve(id)),
        Value::Core(form) => {
            let _ = write!(out, "#<core {form}>");
        }
        Value::Primitive(id) => {
            let _ = write!(out, "#<opcode {}>", PRIMITIVES[id.index()].name);
        }
        Value::Foreign(_) => out.push_str("#<foreign>"),
        Value::LambdaLoc(_) => out.push_str("#<binding>"),
        Value::ReturnAddr(_) => out.push_str("#<return>"),
        Value::Ref(id) => render_heap(id, heap, interns, readable, depth, out),
    }
}

fn render_heap(
    id: HeapId,
    heap: &Heap<impl ResourceTracker>,
    interns: &Interns,
    readable: bool,
    depth: usize,
    out: &mut String,
) {
    match heap.get(id) {
        HeapData::Pair(..) => {
            out.push('(');
            let mut cursor = Value::Ref(id);
            let mut budget = depth;
            loop {
                if budget == 0 {
                    out.push_str("...");
                    break;
                }
                budget -= 1;
                match cursor {
                    Value::Ref(pid) => match heap.get(pid) {
                        HeapData::Pair(car, cdr) => {
                            render(*car, heap, interns, readable, depth - 1, out);
                            cursor = *cdr;
                            if !matches!(cursor, Value::Nil) {
                                out.push(' ');
                            }
                        }
                        _ => {
                            out.push_str(". ");
                            render(cursor, heap, interns, readable, depth - 1, out);
                            break;
                        }
                    },
                    Value::Nil => break,
                    _ => {
                        out.push_str(". ");
                        render(cursor, heap, interns, readable, depth - 1, out);
                        break;
                    }
                }
            }
            out.push(')');
        }
        HeapData::Str(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            if readable {
                out.push('"');
                for c in text.chars() {
                    match c {
                        '"' => out.push_str("\\\""),
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        '\t' => out.push_str("\\t"),
                        _ => out.push(c),
                    }
                }
                out.push('"');
            } else {
                out.push_str(&text);
            }
        }
        HeapData::Vector(items) => {
            out.push_str("#(");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                render(*item, heap, interns, readable, depth - 1, out);
            }
            out.push(')');
        }
        HeapData::Bytecode(_) => out.push_str("#<bytecode>"),
        HeapData::Procedure(_) => out.push_str("#<procedure>"),
        HeapData::Env(_) => out.push_str("#<environment>"),
        HeapData::Port(port) => out.push_str(match port {
            Port::Input(_) => "#<input-port>",
            Port::Output(_) => "#<output-port>",
            Port::Closed => "#<closed-port>",
        }),
        HeapData::Exception(exc) => {
            let _ = write!(out, "#<exception {}: ", exc.kind);
            render(exc.message, heap, interns, false, depth - 1, out);
            out.push('>');
        }
        HeapData::Macro(_) => out.push_str("#<macro>"),
        HeapData::Synclo(_) => out.push_str("#<syntactic-closure>"),
    }
}
