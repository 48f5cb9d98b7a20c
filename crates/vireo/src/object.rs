//! Host-facing values.
//!
//! `Object` is an owned tree detached from the heap: the public return type
//! of `run`/`execute` and the natural shape for test assertions. Values
//! without a data representation (procedures, ports, bytecode) carry their
//! printed form in `Repr`.

use std::fmt;

use crate::{
    heap::{Heap, HeapData},
    intern::Interns,
    port::Port,
    resource::ResourceTracker,
    value::{write_value, Value},
};

/// Depth bound when detaching cyclic data from the heap.
const MAX_OBJECT_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Undefined,
    Eof,
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    Symbol(String),
    Str(String),
    Pair(Box<Object>, Box<Object>),
    Vector(Vec<Object>),
    /// Printed form of a value with no data representation.
    Repr(String),
}

impl Object {
    /// Builds a proper list; convenient in tests.
    #[must_use]
    pub fn list(items: impl IntoIterator<Item = Object, IntoIter: DoubleEndedIterator>) -> Self {
        let mut out = Self::Nil;
        for item in items.into_iter().rev() {
            out = Self::Pair(Box::new(item), Box::new(out));
        }
        out
    }

    #[must_use]
    pub fn symbol(name: &str) -> Self {
        Self::Symbol(name.to_owned())
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("#<undef>"),
            Self::Eof => f.write_str("#<eof>"),
            Self::Nil => f.write_str("()"),
            Self::Bool(true) => f.write_str("#t"),
            Self::Bool(false) => f.write_str("#f"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => {
                let mut buffer = ryu::Buffer::new();
                f.write_str(buffer.format(*x))
            }
            Self::Char(c) => write!(f, "#\\{c}"),
            Self::Symbol(name) => f.write_str(name),
            Self::Str(text) => write!(f, "{text:?}"),
            Self::Pair(car, cdr) => {
                write!(f, "({car}")?;
                let mut cursor = cdr;
                loop {
                    match cursor.as_ref() {
                        Self::Nil => break,
                        Self::Pair(a, d) => {
                            write!(f, " {a}")?;
                            cursor = d;
                        }
                        other => {
                            write!(f, " . {other}")?;
                            break;
                        }
                    }
                }
                f.write_str(")")
            }
            Self::Vector(items) => {
                f.write_str("#(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
            Self::Repr(text) => f.write_str(text),
        }
    }
}

/// Detaches a runtime value from the heap.
pub(crate) fn object_from_value(v: Value, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> Object {
    detach(v, heap, interns, MAX_OBJECT_DEPTH)
}

fn detach(v: Value, heap: &Heap<impl ResourceTracker>, interns: &Interns, depth: usize) -> Object {
    if depth == 0 {
        return Object::Repr("...".to_owned());
    }
    match v {
        Value::Undefined => Object::Undefined,
        Value::Eof => Object::Eof,
        Value::Nil => Object::Nil,
        Value::Bool(b) => Object::Bool(b),
        Value::Int(n) => Object::Int(n),
        Value::Float(x) => Object::Float(x),
        Value::Char(c) => Object::Char(c),
        Value::Symbol(id) => Object::Symbol(interns.resolve(id).to_owned()),
        Value::Ref(id) => match heap.get(id) {
            HeapData::Pair(car, cdr) => Object::Pair(
                Box::new(detach(*car, heap, interns, depth - 1)),
                Box::new(detach(*cdr, heap, interns, depth - 1)),
            ),
            HeapData::Str(bytes) => Object::Str(String::from_utf8_lossy(bytes).into_owned()),
            HeapData::Vector(items) => Object::Vector(
                items
                    .iter()
                    .map(|&item| detach(item, heap, interns, depth - 1))
                    .collect(),
            ),
            HeapData::Port(Port::Input(_)) => Object::Repr("#<input-port>".to_owned()),
            HeapData::Port(Port::Output(_)) => Object::Repr("#<output-port>".to_owned()),
            _ => Object::Repr(write_value(v, heap, interns)),
        },
        // markers and frame words never escape the VM; render defensively
        _ => Object::Repr(write_value(v, heap, interns)),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn display_matches_write_syntax() {
        assert_eq!(Object::Int(42).to_string(), "42");
        assert_eq!(Object::Bool(true).to_string(), "#t");
        assert_eq!(Object::symbol("done").to_string(), "done");
        assert_eq!(
            Object::list([Object::Int(1), Object::Int(2)]).to_string(),
            "(1 2)"
        );
        assert_eq!(
            Object::Pair(Box::new(Object::Int(1)), Box::new(Object::Int(2))).to_string(),
            "(1 . 2)"
        );
        assert_eq!(Object::Float(1.5).to_string(), "1.5");
    }
}
