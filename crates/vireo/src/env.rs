//! Environments: chained frames of binding cells.
//!
//! A frame holds an ordered list of cells; a cell is an ordinary heap pair
//! `(symbol . value)` whose cdr is the mutable storage for the binding. The
//! compiler embeds global cells directly in constant pools, which is what
//! keeps forward references live: a reference to a not-yet-defined global
//! creates the cell, and a later `define` mutates that same cell.
//!
//! Non-global frames carry the `LambdaId` they were created for; that stamp
//! is the location recorded in variable references during analysis.

use crate::{
    ast::LambdaId,
    heap::{Heap, HeapData, HeapId},
    intern::SymbolId,
    resource::{ResourceError, ResourceTracker},
    value::Value,
};

/// One environment frame.
#[derive(Debug, Default)]
pub(crate) struct EnvFrame {
    pub parent: Option<HeapId>,
    /// Binding cells, scanned newest-first so later bindings shadow earlier
    /// ones within a frame.
    pub bindings: Vec<HeapId>,
    /// The lambda this frame was created for; `None` for the global frame.
    pub lambda: Option<LambdaId>,
}

fn frame(heap: &Heap<impl ResourceTracker>, env: HeapId) -> &EnvFrame {
    match heap.get(env) {
        HeapData::Env(f) => f,
        other => panic!("expected environment, found {other:?}"),
    }
}

/// Symbol stored in a binding cell.
fn cell_symbol(heap: &Heap<impl ResourceTracker>, cell: HeapId) -> Option<SymbolId> {
    match heap.get(cell) {
        HeapData::Pair(Value::Symbol(sym), _) => Some(*sym),
        _ => None,
    }
}

/// Current value stored in a binding cell.
pub(crate) fn cell_value(heap: &Heap<impl ResourceTracker>, cell: HeapId) -> Value {
    match heap.get(cell) {
        HeapData::Pair(_, cdr) => *cdr,
        other => panic!("expected binding cell, found {other:?}"),
    }
}

/// Overwrites the value stored in a binding cell.
pub(crate) fn set_cell_value(heap: &mut Heap<impl ResourceTracker>, cell: HeapId, value: Value) {
    match heap.get_mut(cell) {
        HeapData::Pair(_, cdr) => *cdr = value,
        other => panic!("expected binding cell, found {other:?}"),
    }
}

fn find_in_frame(heap: &Heap<impl ResourceTracker>, env: HeapId, key: SymbolId) -> Option<HeapId> {
    frame(heap, env)
        .bindings
        .iter()
        .rev()
        .copied()
        .find(|&cell| cell_symbol(heap, cell) == Some(key))
}

/// Walks the parent chain from innermost to global; first match wins.
/// Never creates a binding.
pub(crate) fn lookup(heap: &Heap<impl ResourceTracker>, env: HeapId, key: SymbolId) -> Option<HeapId> {
    let mut cursor = Some(env);
    while let Some(e) = cursor {
        if let Some(cell) = find_in_frame(heap, e, key) {
            return Some(cell);
        }
        cursor = frame(heap, e).parent;
    }
    None
}

/// Like [`lookup`], but on a miss allocates a new cell holding `default` in
/// the root (global) frame and returns it.
pub(crate) fn lookup_or_create(
    heap: &mut Heap<impl ResourceTracker>,
    env: HeapId,
    key: SymbolId,
    default: Value,
) -> Result<HeapId, ResourceError> {
    if let Some(cell) = lookup(heap, env, key) {
        return Ok(cell);
    }
    let mut root = env;
    while let Some(parent) = frame(heap, root).parent {
        root = parent;
    }
    let cell = heap.allocate(HeapData::Pair(Value::Symbol(key), default))?;
    match heap.get_mut(root) {
        HeapData::Env(f) => f.bindings.push(cell),
        other => panic!("expected environment, found {other:?}"),
    }
    Ok(cell)
}

/// Defines `key` in the innermost frame: updates an existing cell in place,
/// or prepends a fresh one.
pub(crate) fn define(
    heap: &mut Heap<impl ResourceTracker>,
    env: HeapId,
    key: SymbolId,
    value: Value,
) -> Result<(), ResourceError> {
    if let Some(cell) = find_in_frame(heap, env, key) {
        set_cell_value(heap, cell, value);
        return Ok(());
    }
    let cell = heap.allocate(HeapData::Pair(Value::Symbol(key), value))?;
    match heap.get_mut(env) {
        HeapData::Env(f) => f.bindings.push(cell),
        other => panic!("expected environment, found {other:?}"),
    }
    Ok(())
}

/// Builds a child frame binding each of `vars` to `value`, stamped with the
/// owning lambda.
pub(crate) fn extend(
    heap: &mut Heap<impl ResourceTracker>,
    env: HeapId,
    vars: &[SymbolId],
    value: Value,
    lambda: Option<LambdaId>,
) -> Result<HeapId, ResourceError> {
    let mut bindings = Vec::with_capacity(vars.len());
    for &var in vars {
        bindings.push(heap.allocate(HeapData::Pair(Value::Symbol(var), value))?);
    }
    heap.allocate(HeapData::Env(EnvFrame {
        parent: Some(env),
        bindings,
        lambda,
    }))
}

/// True iff no non-root frame on the chain binds `key`.
pub(crate) fn global_p(heap: &Heap<impl ResourceTracker>, env: HeapId, key: SymbolId) -> bool {
    let mut cursor = env;
    while let Some(parent) = frame(heap, cursor).parent {
        if find_in_frame(heap, cursor, key).is_some() {
            return false;
        }
        cursor = parent;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{intern::Interns, resource::NoLimitTracker};

    fn root_env(heap: &mut Heap<NoLimitTracker>) -> HeapId {
        heap.allocate(HeapData::Env(EnvFrame::default())).unwrap()
    }

    #[test]
    fn define_then_lookup() {
        let mut heap = Heap::new(NoLimitTracker);
        let mut interns = Interns::new();
        let root = root_env(&mut heap);
        let x = interns.intern("x");
        define(&mut heap, root, x, Value::Int(7)).unwrap();
        let cell = lookup(&heap, root, x).unwrap();
        assert_eq!(cell_value(&heap, cell), Value::Int(7));
        // redefinition mutates the same cell
        define(&mut heap, root, x, Value::Int(9)).unwrap();
        assert_eq!(lookup(&heap, root, x), Some(cell));
        assert_eq!(cell_value(&heap, cell), Value::Int(9));
    }

    #[test]
    fn lookup_or_create_targets_root_and_stays_live() {
        let mut heap = Heap::new(NoLimitTracker);
        let mut interns = Interns::new();
        let root = root_env(&mut heap);
        let y = interns.intern("y");
        let child = extend(&mut heap, root, &[], Value::Undefined, None).unwrap();

        // forward reference from the child frame creates the cell at the root
        let cell = lookup_or_create(&mut heap, child, y, Value::Undefined).unwrap();
        assert_eq!(lookup(&heap, root, y), Some(cell));

        // a later define finds and mutates the same cell
        define(&mut heap, root, y, Value::Int(1)).unwrap();
        assert_eq!(cell_value(&heap, cell), Value::Int(1));
    }

    #[test]
    fn global_p_sees_through_empty_frames() {
        let mut heap = Heap::new(NoLimitTracker);
        let mut interns = Interns::new();
        let root = root_env(&mut heap);
        let n = interns.intern("n");
        define(&mut heap, root, n, Value::Int(1)).unwrap();
        let child = extend(&mut heap, root, &[], Value::Undefined, None).unwrap();
        assert!(global_p(&heap, child, n));

        let m = interns.intern("m");
        let inner = extend(&mut heap, child, &[m], Value::Undefined, None).unwrap();
        assert!(!global_p(&heap, inner, m));
        assert!(global_p(&heap, inner, n));
    }

    #[test]
    fn inner_frames_shadow_outer() {
        let mut heap = Heap::new(NoLimitTracker);
        let mut interns = Interns::new();
        let root = root_env(&mut heap);
        let x = interns.intern("x");
        define(&mut heap, root, x, Value::Int(1)).unwrap();
        let child = extend(&mut heap, root, &[x], Value::Int(2), None).unwrap();
        let cell = lookup(&heap, child, x).unwrap();
        assert_eq!(cell_value(&heap, cell), Value::Int(2));
    }
}
