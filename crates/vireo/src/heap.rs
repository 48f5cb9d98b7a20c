//! Arena storage for heap-allocated values.
//!
//! The language excludes a garbage collector, so the heap is a plain growing
//! arena: objects are allocated, addressed by `HeapId`, and never reclaimed.
//! Allocation is gated by the resource tracker so sandboxed execution can
//! bound memory growth.

use std::collections::BTreeMap;

use crate::{
    bytecode::Code,
    env::EnvFrame,
    exception::Exc,
    port::Port,
    resource::{ResourceError, ResourceTracker},
    value::Value,
};

/// Index of an object in the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HeapId(u32);

impl HeapId {
    /// Returns the raw index value.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A compiled procedure: flags, declared argument count, bytecode reference,
/// captured-variables vector reference.
///
/// Bit 0 of `flags` marks a variadic (dotted parameter list) procedure.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Procedure {
    pub flags: u8,
    pub num_args: u16,
    pub code: HeapId,
    pub vars: HeapId,
}

impl Procedure {
    pub const FLAG_VARIADIC: u8 = 1;

    #[inline]
    pub fn variadic(self) -> bool {
        self.flags & Self::FLAG_VARIADIC != 0
    }
}

/// A macro transformer paired with its definition environment.
///
/// Reserved: the analyzer currently rejects macro applications, but the
/// representation is kept so a future expander can bind these in an
/// environment cell.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Macro {
    #[expect(dead_code, reason = "read by the planned macro expander")]
    pub proc: Value,
    #[expect(dead_code, reason = "read by the planned macro expander")]
    pub env: HeapId,
}

/// An expression paired with an environment override.
///
/// Reserved alongside [`Macro`]: the analyzer re-analyzes the inner
/// expression in the carried environment, which is how an expander would
/// safely splice sub-expressions across scopes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Synclo {
    pub env: HeapId,
    pub expr: Value,
}

/// Heap object variants.
#[derive(Debug)]
pub(crate) enum HeapData {
    Pair(Value, Value),
    /// Mutable byte string.
    Str(Vec<u8>),
    Vector(Vec<Value>),
    Bytecode(Code),
    Procedure(Procedure),
    Env(EnvFrame),
    Port(Port),
    Exception(Exc),
    #[cfg_attr(not(test), expect(dead_code, reason = "constructed by the planned macro expander"))]
    Macro(Macro),
    #[cfg_attr(not(test), expect(dead_code, reason = "constructed by the planned macro expander"))]
    Synclo(Synclo),
}

impl HeapData {
    /// Static name of the variant, used for heap statistics.
    fn type_name(&self) -> &'static str {
        match self {
            Self::Pair(..) => "pair",
            Self::Str(_) => "string",
            Self::Vector(_) => "vector",
            Self::Bytecode(_) => "bytecode",
            Self::Procedure(_) => "procedure",
            Self::Env(_) => "environment",
            Self::Port(_) => "port",
            Self::Exception(_) => "exception",
            Self::Macro(_) => "macro",
            Self::Synclo(_) => "syntactic-closure",
        }
    }
}

/// Snapshot of heap state at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Total number of objects in the arena.
    pub live_objects: usize,
    /// Breakdown of objects by variant name.
    pub objects_by_type: BTreeMap<&'static str, usize>,
    /// Number of interned symbols is reported by the runtime, not here.
    pub total_bytes_estimate: usize,
}

/// The arena. Generic over the resource tracker so sandboxed and unlimited
/// configurations share one implementation.
#[derive(Debug)]
pub(crate) struct Heap<T: ResourceTracker> {
    slots: Vec<HeapData>,
    tracker: T,
}

impl<T: ResourceTracker> Heap<T> {
    pub fn new(tracker: T) -> Self {
        Self {
            slots: Vec::with_capacity(256),
            tracker,
        }
    }

    /// Allocates a new object, consulting the resource tracker first.
    pub fn allocate(&mut self, data: HeapData) -> Result<HeapId, ResourceError> {
        self.tracker.on_allocate()?;
        let id = HeapId(u32::try_from(self.slots.len()).expect("heap exceeds u32 slots"));
        self.slots.push(data);
        Ok(id)
    }

    #[inline]
    pub fn get(&self, id: HeapId) -> &HeapData {
        &self.slots[id.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self.slots[id.index()]
    }

    pub fn tracker_mut(&mut self) -> &mut T {
        &mut self.tracker
    }

    /// Computes heap statistics for monitoring and tests.
    pub fn stats(&self) -> HeapStats {
        let mut objects_by_type = BTreeMap::new();
        let mut total_bytes_estimate = 0;
        for slot in &self.slots {
            *objects_by_type.entry(slot.type_name()).or_insert(0) += 1;
            total_bytes_estimate += match slot {
                HeapData::Str(bytes) => bytes.len(),
                HeapData::Vector(items) => items.len() * size_of::<Value>(),
                HeapData::Bytecode(code) => code.byte_len(),
                _ => size_of::<HeapData>(),
            };
        }
        HeapStats {
            live_objects: self.slots.len(),
            objects_by_type,
            total_bytes_estimate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    #[test]
    fn allocate_and_read_back() {
        let mut heap = Heap::new(NoLimitTracker);
        let id = heap.allocate(HeapData::Pair(Value::Int(1), Value::Nil)).unwrap();
        match heap.get(id) {
            HeapData::Pair(Value::Int(1), Value::Nil) => {}
            other => panic!("unexpected heap data: {other:?}"),
        }
        let stats = heap.stats();
        assert_eq!(stats.live_objects, 1);
        assert_eq!(stats.objects_by_type.get("pair"), Some(&1));
    }

    #[test]
    fn allocation_respects_tracker() {
        let mut heap = Heap::new(crate::resource::LimitedTracker::new(1, 100));
        heap.allocate(HeapData::Str(b"ok".to_vec())).unwrap();
        assert!(heap.allocate(HeapData::Str(b"no".to_vec())).is_err());
    }
}
