//! Exception kinds and error types.
//!
//! Three layers, one per phase:
//! - `CompileError` — analyzer/compiler failures, propagated with `?` and
//!   surfaced to the host before any code runs.
//! - `RunError` — a pending runtime raise inside the VM. The VM materializes
//!   it as a heap exception object and transfers control to the
//!   `*error-handler*` procedure through the normal call convention.
//! - `Exception` — the host-facing error type carried by every public
//!   `Result`.

use std::fmt;

use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    heap::{Heap, HeapData, HeapId},
    intern::Interns,
    resource::{ResourceError, ResourceTracker},
    value::{write_value, Value},
};

/// Exception kinds, rendered in their conventional lisp-case spelling
/// (`compile-error`, `type-error`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum ExcKind {
    /// Malformed syntax, unknown core form, unsupported construct.
    CompileError,
    /// Primitive applied to arguments of the wrong tag.
    TypeError,
    /// Wrong number of arguments to a procedure.
    ArityError,
    /// Vector or string index out of range.
    BoundsError,
    /// Domain failure such as division by zero.
    ValueError,
    /// Stack exhaustion, I/O failure, tracker budget exceeded.
    ResourceError,
    /// Raised by the `error` primitive.
    UserError,
}

/// Heap payload of an exception value: kind symbol, message string,
/// irritants list, plus source and continuation slots (unused by the core
/// raises but part of the value's shape).
#[derive(Debug, Clone, Copy)]
pub(crate) struct Exc {
    pub kind: ExcKind,
    /// `Ref` to a heap string.
    pub message: Value,
    /// List of offending values.
    pub irritants: Value,
    #[expect(dead_code, reason = "part of the exception value shape; no core raise fills it")]
    pub source: Value,
    #[expect(dead_code, reason = "part of the exception value shape; no core raise fills it")]
    pub continuation: Value,
}

/// Result alias for VM operations that can raise.
pub(crate) type RunResult<T> = Result<T, Box<RunError>>;

/// A runtime raise that has not yet been materialized on the heap.
#[derive(Debug)]
pub(crate) struct RunError {
    pub kind: ExcKind,
    pub message: String,
    pub irritants: Vec<Value>,
}

impl RunError {
    pub fn new(kind: ExcKind, message: impl Into<String>, irritants: Vec<Value>) -> Box<Self> {
        Box::new(Self {
            kind,
            message: message.into(),
            irritants,
        })
    }

    pub fn type_error(message: impl Into<String>, irritants: Vec<Value>) -> Box<Self> {
        Self::new(ExcKind::TypeError, message, irritants)
    }

    pub fn value_error(message: impl Into<String>, irritants: Vec<Value>) -> Box<Self> {
        Self::new(ExcKind::ValueError, message, irritants)
    }

    pub fn bounds_error(message: impl Into<String>, irritants: Vec<Value>) -> Box<Self> {
        Self::new(ExcKind::BoundsError, message, irritants)
    }

    pub fn arity_error(message: impl Into<String>, irritants: Vec<Value>) -> Box<Self> {
        Self::new(ExcKind::ArityError, message, irritants)
    }

    pub fn resource_error(message: impl Into<String>) -> Box<Self> {
        Self::new(ExcKind::ResourceError, message, vec![])
    }
}

impl From<ResourceError> for Box<RunError> {
    fn from(err: ResourceError) -> Self {
        RunError::resource_error(err.to_string())
    }
}

/// A compile-time failure. Irritants are rendered to text at the failure
/// site, where the heap and interner are at hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub(crate) message: String,
    pub(crate) irritants: Vec<String>,
}

impl CompileError {
    pub(crate) fn new(message: impl Into<String>, irritants: Vec<String>) -> Box<Self> {
        Box::new(Self {
            message: message.into(),
            irritants,
        })
    }

    pub(crate) fn of_value(
        message: impl Into<String>,
        v: Value,
        heap: &Heap<impl ResourceTracker>,
        interns: &Interns,
    ) -> Box<Self> {
        Self::new(message, vec![write_value(v, heap, interns)])
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.irritants.is_empty() {
            write!(f, " ({})", self.irritants.join(" "))?;
        }
        Ok(())
    }
}

impl From<ResourceError> for Box<CompileError> {
    fn from(err: ResourceError) -> Self {
        CompileError::new(err.to_string(), vec![])
    }
}

/// Host-facing exception: what every public entry point returns on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    kind: ExcKind,
    message: String,
    irritants: Vec<String>,
}

impl Exception {
    pub(crate) fn new(kind: ExcKind, message: impl Into<String>, irritants: Vec<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            irritants,
        }
    }

    /// Builds the host view of a heap exception object.
    pub(crate) fn from_heap(id: HeapId, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> Self {
        let HeapData::Exception(exc) = heap.get(id) else {
            return Self::new(ExcKind::ValueError, "not an exception object", vec![]);
        };
        let exc = *exc;
        let message = match exc.message {
            Value::Ref(mid) => match heap.get(mid) {
                HeapData::Str(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                _ => write_value(exc.message, heap, interns),
            },
            other => write_value(other, heap, interns),
        };
        let mut irritants = Vec::new();
        let mut cursor = exc.irritants;
        while let Value::Ref(pid) = cursor {
            let HeapData::Pair(car, cdr) = heap.get(pid) else { break };
            irritants.push(write_value(*car, heap, interns));
            cursor = *cdr;
        }
        Self::new(exc.kind, message, irritants)
    }

    #[must_use]
    pub fn kind(&self) -> ExcKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn irritants(&self) -> &[String] {
        &self.irritants
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if !self.irritants.is_empty() {
            write!(f, " ({})", self.irritants.join(" "))?;
        }
        Ok(())
    }
}

impl std::error::Error for Exception {}

impl From<Box<CompileError>> for Exception {
    fn from(err: Box<CompileError>) -> Self {
        Self::new(ExcKind::CompileError, err.message, err.irritants)
    }
}

impl From<ResourceError> for Exception {
    fn from(err: ResourceError) -> Self {
        Self::new(ExcKind::ResourceError, err.to_string(), vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_render_lisp_case() {
        assert_eq!(ExcKind::CompileError.to_string(), "compile-error");
        assert_eq!(ExcKind::TypeError.to_string(), "type-error");
        assert_eq!(ExcKind::ResourceError.to_string(), "resource-error");
    }

    #[test]
    fn exception_display_includes_irritants() {
        let exc = Exception::new(ExcKind::TypeError, "car: not a pair", vec!["()".to_owned()]);
        assert_eq!(exc.to_string(), "type-error: car: not a pair (())");
    }
}
