//! The typed AST produced by the analyzer and consumed by the compiler.
//!
//! Lambda nodes live in a per-analysis arena and are referenced by
//! `LambdaId`. A variable reference identifies its binding site by
//! `(name, loc)`: the owning lambda for parameters and internal definitions,
//! or the global binding cell otherwise. Storing lambda locations as arena
//! indices (rather than shared pointers) is what lets the free-variable pass
//! record `RefNode` identities inside lambda nodes without creating
//! ownership cycles.

use strum::{Display, EnumString};

use crate::{heap::HeapId, intern::SymbolId, primitive::PrimitiveId, value::Value};

/// Core special forms, bound in the standard environment as `Core` markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub(crate) enum CoreForm {
    #[strum(serialize = "define")]
    Define,
    #[strum(serialize = "set!")]
    Set,
    #[strum(serialize = "lambda")]
    Lambda,
    #[strum(serialize = "if")]
    If,
    #[strum(serialize = "begin")]
    Begin,
    #[strum(serialize = "quote")]
    Quote,
}

/// Index of a lambda node in the analysis arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct LambdaId(u32);

impl LambdaId {
    pub fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("lambda arena exceeds u32 range"))
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Binding site of a variable reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Loc {
    /// Bound by this lambda (parameter or internal definition).
    Lambda(LambdaId),
    /// Bound by a global cell; the id is the cell pair on the heap.
    Global(HeapId),
}

/// A resolved variable reference. Two references are the same free variable
/// iff both the name and the location match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RefNode {
    pub name: SymbolId,
    pub loc: Loc,
}

/// AST nodes.
#[derive(Debug)]
pub(crate) enum Ast {
    /// Quoted or self-evaluating literal.
    Lit(Value),
    Ref(RefNode),
    Set {
        target: RefNode,
        value: Box<Ast>,
    },
    Cnd {
        test: Box<Ast>,
        pass: Box<Ast>,
        fail: Box<Ast>,
    },
    /// Two or more expressions for effect, last for value.
    Seq(Vec<Ast>),
    Lambda(LambdaId),
    /// General application: operator first.
    App(Vec<Ast>),
    /// Application of a primitive resolved at analysis time; compiles to
    /// inline opcodes.
    PrimApp {
        prim: PrimitiveId,
        args: Vec<Ast>,
    },
}

/// A lambda under analysis and compilation.
///
/// `body` is `Option` only so the free-variable pass can temporarily move it
/// out while it mutates sibling nodes in the arena; it is always `Some`
/// outside that pass.
#[derive(Debug, Default)]
pub(crate) struct LambdaNode {
    /// Flattened parameter list; for a dotted list the rest name is last.
    pub params: Vec<SymbolId>,
    pub variadic: bool,
    pub body: Option<Ast>,
    /// Names introduced by internal `define`s, in definition order.
    pub locals: Vec<SymbolId>,
    /// References captured from enclosing lambdas, in capture order.
    pub free_vars: Vec<RefNode>,
    /// Names assigned somewhere in the body; these are box-allocated.
    pub set_vars: Vec<SymbolId>,
}

impl LambdaNode {
    /// Declared minimum argument count: the rest parameter does not count.
    pub fn min_args(&self) -> usize {
        self.params.len() - usize::from(self.variadic)
    }
}
