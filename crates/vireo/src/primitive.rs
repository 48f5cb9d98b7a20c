//! Primitive operation metadata and host (foreign) functions.
//!
//! Each entry in [`PRIMITIVES`] describes one name bound in the standard
//! environment: its class, the opcode it compiles to, its declared arity and
//! variadic flag, the checked argument-type tags, an optional inverse opcode
//! (unary negation/reciprocal, swapped comparison), an optional default
//! runtime parameter, and an optional foreign function.
//!
//! The reader only ever touches the `name`; the compiler consumes every
//! field.

use crate::{
    bytecode::Opcode,
    exception::{ExcKind, RunError, RunResult},
    heap::HeapData,
    port::{InputPort, OutputPort, Port},
    resource::ResourceTracker,
    runtime::Runtime,
    value::Value,
};

/// Index into [`PRIMITIVES`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PrimitiveId(u16);

impl PrimitiveId {
    pub fn new(index: usize) -> Self {
        Self(u16::try_from(index).expect("primitive table exceeds u16 range"))
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index into the runtime's foreign function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ForeignId(u16);

impl ForeignId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Primitive classes; emission rules differ per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpClass {
    Accessor,
    Arithmetic,
    /// Order-sensitive arithmetic with a unary inverse (`-`, `/`).
    ArithmeticInv,
    ArithmeticCmp,
    Predicate,
    Constructor,
    TypePredicate,
    Generic,
    Io,
    Parameter,
    Foreign,
}

/// Process-wide mutable cells carried on the runtime and read by the
/// `PARAMETER` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr)]
#[repr(usize)]
pub(crate) enum RuntimeParam {
    CurrentInput,
    CurrentOutput,
    CurrentError,
    InteractionEnv,
}

/// Checked argument-type tags, at most two positions per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TypeTag {
    Pair,
    Fixnum,
    Str,
    Vector,
    Procedure,
    InputPort,
    OutputPort,
}

/// One primitive table entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Primitive {
    pub class: OpClass,
    pub op: Opcode,
    /// Declared argument count; also the maximum unless `variadic`.
    pub num_args: u16,
    /// True rest-argument folding (`+`, `*`, `-`, `/`). An optional trailing
    /// argument is a different thing: it is marked by `param`, fills up to
    /// the declared count, and never admits surplus arguments.
    pub variadic: bool,
    /// When true, the default parameter is a plain cell; when false it is a
    /// parameter procedure and filling the default requires a nullary call.
    pub opt_param: bool,
    pub arg1: Option<TypeTag>,
    pub arg2: Option<TypeTag>,
    pub inverse: Option<Opcode>,
    pub name: &'static str,
    pub param: Option<RuntimeParam>,
    pub foreign: Option<ForeignId>,
}

impl Primitive {
    const BASE: Self = Self {
        class: OpClass::Generic,
        op: Opcode::Noop,
        num_args: 0,
        variadic: false,
        opt_param: false,
        arg1: None,
        arg2: None,
        inverse: None,
        name: "",
        param: None,
        foreign: None,
    };
}

const fn accessor(name: &'static str, op: Opcode, num_args: u16, arg1: TypeTag, arg2: Option<TypeTag>) -> Primitive {
    Primitive {
        class: OpClass::Accessor,
        op,
        num_args,
        arg1: Some(arg1),
        arg2,
        name,
        ..Primitive::BASE
    }
}

const fn type_predicate(name: &'static str, op: Opcode) -> Primitive {
    Primitive {
        class: OpClass::TypePredicate,
        op,
        num_args: 1,
        name,
        ..Primitive::BASE
    }
}

const fn io_op(name: &'static str, op: Opcode, num_args: u16, port_tag: TypeTag, param: RuntimeParam) -> Primitive {
    Primitive {
        class: OpClass::Io,
        op,
        num_args,
        opt_param: true,
        arg2: Some(port_tag),
        name,
        param: Some(param),
        ..Primitive::BASE
    }
}

const fn foreign1(name: &'static str, arg1: Option<TypeTag>, id: ForeignId) -> Primitive {
    Primitive {
        class: OpClass::Foreign,
        op: Opcode::Fcall1,
        num_args: 1,
        arg1,
        name,
        foreign: Some(id),
        ..Primitive::BASE
    }
}

const fn foreign2(name: &'static str, arg1: Option<TypeTag>, arg2: Option<TypeTag>, id: ForeignId) -> Primitive {
    Primitive {
        class: OpClass::Foreign,
        op: Opcode::Fcall2,
        num_args: 2,
        arg1,
        arg2,
        name,
        foreign: Some(id),
        ..Primitive::BASE
    }
}

const fn parameter(name: &'static str, param: RuntimeParam) -> Primitive {
    Primitive {
        class: OpClass::Parameter,
        op: Opcode::Parameter,
        num_args: 0,
        name,
        param: Some(param),
        ..Primitive::BASE
    }
}

pub(crate) const FE_LENGTH: ForeignId = ForeignId(0);
pub(crate) const FE_REVERSE: ForeignId = ForeignId(1);
pub(crate) const FE_LIST_TO_VECTOR: ForeignId = ForeignId(2);
pub(crate) const FE_OPEN_INPUT_FILE: ForeignId = ForeignId(3);
pub(crate) const FE_OPEN_OUTPUT_FILE: ForeignId = ForeignId(4);
pub(crate) const FE_CLOSE_INPUT_PORT: ForeignId = ForeignId(5);
pub(crate) const FE_CLOSE_OUTPUT_PORT: ForeignId = ForeignId(6);
pub(crate) const FE_LOAD: ForeignId = ForeignId(7);
pub(crate) const FE_MEMQ: ForeignId = ForeignId(8);
pub(crate) const FE_ASSQ: ForeignId = ForeignId(9);

/// The full primitive table bound by `make_standard_env`.
pub(crate) static PRIMITIVES: &[Primitive] = &[
    accessor("car", Opcode::Car, 1, TypeTag::Pair, None),
    accessor("set-car!", Opcode::SetCar, 2, TypeTag::Pair, None),
    accessor("cdr", Opcode::Cdr, 1, TypeTag::Pair, None),
    accessor("set-cdr!", Opcode::SetCdr, 2, TypeTag::Pair, None),
    accessor("vector-ref", Opcode::VectorRef, 2, TypeTag::Vector, Some(TypeTag::Fixnum)),
    accessor("vector-set!", Opcode::VectorSet, 3, TypeTag::Vector, Some(TypeTag::Fixnum)),
    accessor("string-ref", Opcode::StringRef, 2, TypeTag::Str, Some(TypeTag::Fixnum)),
    accessor("string-set!", Opcode::StringSet, 3, TypeTag::Str, Some(TypeTag::Fixnum)),
    Primitive {
        class: OpClass::Arithmetic,
        op: Opcode::Add,
        num_args: 0,
        variadic: true,
        arg1: Some(TypeTag::Fixnum),
        name: "+",
        ..Primitive::BASE
    },
    Primitive {
        class: OpClass::Arithmetic,
        op: Opcode::Mul,
        num_args: 0,
        variadic: true,
        arg1: Some(TypeTag::Fixnum),
        name: "*",
        ..Primitive::BASE
    },
    Primitive {
        class: OpClass::ArithmeticInv,
        op: Opcode::Sub,
        num_args: 1,
        variadic: true,
        arg1: Some(TypeTag::Fixnum),
        inverse: Some(Opcode::Neg),
        name: "-",
        ..Primitive::BASE
    },
    Primitive {
        class: OpClass::ArithmeticInv,
        op: Opcode::Div,
        num_args: 1,
        variadic: true,
        arg1: Some(TypeTag::Fixnum),
        inverse: Some(Opcode::Inv),
        name: "/",
        ..Primitive::BASE
    },
    Primitive {
        class: OpClass::Arithmetic,
        op: Opcode::Quot,
        num_args: 2,
        arg1: Some(TypeTag::Fixnum),
        arg2: Some(TypeTag::Fixnum),
        name: "quotient",
        ..Primitive::BASE
    },
    Primitive {
        class: OpClass::Arithmetic,
        op: Opcode::Mod,
        num_args: 2,
        arg1: Some(TypeTag::Fixnum),
        arg2: Some(TypeTag::Fixnum),
        name: "modulo",
        ..Primitive::BASE
    },
    Primitive {
        class: OpClass::ArithmeticCmp,
        op: Opcode::Lt,
        num_args: 2,
        arg1: Some(TypeTag::Fixnum),
        name: "<",
        ..Primitive::BASE
    },
    Primitive {
        class: OpClass::ArithmeticCmp,
        op: Opcode::Le,
        num_args: 2,
        arg1: Some(TypeTag::Fixnum),
        name: "<=",
        ..Primitive::BASE
    },
    // swapped comparisons: push in source order and emit the inverse
    Primitive {
        class: OpClass::ArithmeticCmp,
        op: Opcode::Gt,
        num_args: 2,
        arg1: Some(TypeTag::Fixnum),
        inverse: Some(Opcode::Lt),
        name: ">",
        ..Primitive::BASE
    },
    Primitive {
        class: OpClass::ArithmeticCmp,
        op: Opcode::Ge,
        num_args: 2,
        arg1: Some(TypeTag::Fixnum),
        inverse: Some(Opcode::Le),
        name: ">=",
        ..Primitive::BASE
    },
    Primitive {
        class: OpClass::ArithmeticCmp,
        op: Opcode::Eqn,
        num_args: 2,
        arg1: Some(TypeTag::Fixnum),
        name: "=",
        ..Primitive::BASE
    },
    Primitive {
        class: OpClass::Predicate,
        op: Opcode::Eq,
        num_args: 2,
        name: "eq?",
        ..Primitive::BASE
    },
    Primitive {
        class: OpClass::Constructor,
        op: Opcode::Cons,
        num_args: 2,
        name: "cons",
        ..Primitive::BASE
    },
    Primitive {
        class: OpClass::Constructor,
        op: Opcode::MakeVector,
        num_args: 2,
        arg1: Some(TypeTag::Fixnum),
        name: "make-vector",
        ..Primitive::BASE
    },
    Primitive {
        class: OpClass::Constructor,
        op: Opcode::MakeProcedure,
        num_args: 4,
        name: "make-procedure",
        ..Primitive::BASE
    },
    type_predicate("pair?", Opcode::IsPair),
    type_predicate("null?", Opcode::IsNull),
    type_predicate("integer?", Opcode::IsInteger),
    type_predicate("string?", Opcode::IsString),
    type_predicate("symbol?", Opcode::IsSymbol),
    type_predicate("char?", Opcode::IsChar),
    type_predicate("vector?", Opcode::IsVector),
    type_predicate("procedure?", Opcode::IsProcedure),
    type_predicate("input-port?", Opcode::IsInputPort),
    type_predicate("output-port?", Opcode::IsOutputPort),
    type_predicate("eof-object?", Opcode::IsEof),
    Primitive {
        class: OpClass::Generic,
        op: Opcode::Apply1,
        num_args: 2,
        arg1: Some(TypeTag::Procedure),
        arg2: Some(TypeTag::Pair),
        name: "apply1",
        ..Primitive::BASE
    },
    Primitive {
        class: OpClass::Generic,
        op: Opcode::CallCc,
        num_args: 1,
        arg1: Some(TypeTag::Procedure),
        name: "call-with-current-continuation",
        ..Primitive::BASE
    },
    Primitive {
        class: OpClass::Generic,
        op: Opcode::Error,
        num_args: 1,
        arg1: Some(TypeTag::Str),
        name: "error",
        ..Primitive::BASE
    },
    io_op("write", Opcode::Write, 2, TypeTag::OutputPort, RuntimeParam::CurrentOutput),
    io_op("display", Opcode::Display, 2, TypeTag::OutputPort, RuntimeParam::CurrentOutput),
    io_op("write-char", Opcode::WriteChar, 2, TypeTag::OutputPort, RuntimeParam::CurrentOutput),
    io_op("newline", Opcode::Newline, 1, TypeTag::OutputPort, RuntimeParam::CurrentOutput),
    io_op("flush-output", Opcode::FlushOutput, 1, TypeTag::OutputPort, RuntimeParam::CurrentOutput),
    io_op("read", Opcode::Read, 1, TypeTag::InputPort, RuntimeParam::CurrentInput),
    io_op("read-char", Opcode::ReadChar, 1, TypeTag::InputPort, RuntimeParam::CurrentInput),
    foreign1("length", Some(TypeTag::Pair), FE_LENGTH),
    foreign1("reverse", Some(TypeTag::Pair), FE_REVERSE),
    foreign1("list->vector", Some(TypeTag::Pair), FE_LIST_TO_VECTOR),
    foreign1("open-input-file", Some(TypeTag::Str), FE_OPEN_INPUT_FILE),
    foreign1("open-output-file", Some(TypeTag::Str), FE_OPEN_OUTPUT_FILE),
    foreign1("close-input-port", Some(TypeTag::InputPort), FE_CLOSE_INPUT_PORT),
    foreign1("close-output-port", Some(TypeTag::OutputPort), FE_CLOSE_OUTPUT_PORT),
    foreign1("load", Some(TypeTag::Str), FE_LOAD),
    foreign2("memq", None, Some(TypeTag::Pair), FE_MEMQ),
    foreign2("assq", None, Some(TypeTag::Pair), FE_ASSQ),
    parameter("current-input-port", RuntimeParam::CurrentInput),
    parameter("current-output-port", RuntimeParam::CurrentOutput),
    parameter("current-error-port", RuntimeParam::CurrentError),
    parameter("interaction-environment", RuntimeParam::InteractionEnv),
];

/// Checks class-dependent field coherence across the whole table. Run from
/// `Runtime::new` under `debug_assert!` and from the unit tests.
pub(crate) fn table_is_coherent() -> bool {
    let mut names = std::collections::HashSet::new();
    PRIMITIVES.iter().all(|p| {
        let fresh = names.insert(p.name);
        let class_ok = match p.class {
            OpClass::Foreign => p.foreign.is_some(),
            OpClass::Parameter => p.param.is_some(),
            OpClass::Io => p.param.is_some() && p.opt_param && !p.variadic && p.arg2.is_some(),
            OpClass::ArithmeticInv => p.inverse.is_some() && p.num_args >= 1,
            OpClass::Accessor => p.arg1.is_some(),
            _ => true,
        };
        fresh && class_ok && !p.name.is_empty()
    })
}

/// Host function signature: foreign functions receive the runtime (never the
/// calling stack) and their arguments in source order.
pub(crate) type ForeignFn<T> = fn(&mut Runtime<T>, &[Value]) -> RunResult<Value>;

/// Builds the foreign function table; order must match the `FE_*` ids.
pub(crate) fn foreign_table<T: ResourceTracker>() -> Vec<ForeignFn<T>> {
    vec![
        fe_length,
        fe_reverse,
        fe_list_to_vector,
        fe_open_input_file,
        fe_open_output_file,
        fe_close_input_port,
        fe_close_output_port,
        fe_load,
        fe_memq,
        fe_assq,
    ]
}

fn list_elements<T: ResourceTracker>(rt: &Runtime<T>, mut v: Value, who: &str) -> RunResult<Vec<Value>> {
    let mut items = Vec::new();
    loop {
        match v {
            Value::Nil => return Ok(items),
            Value::Ref(id) => match rt.heap.get(id) {
                HeapData::Pair(car, cdr) => {
                    items.push(*car);
                    v = *cdr;
                }
                _ => return Err(RunError::type_error(format!("{who}: not a list"), vec![v])),
            },
            _ => return Err(RunError::type_error(format!("{who}: not a list"), vec![v])),
        }
    }
}

fn string_arg<T: ResourceTracker>(rt: &Runtime<T>, v: Value, who: &str) -> RunResult<String> {
    match v {
        Value::Ref(id) => match rt.heap.get(id) {
            HeapData::Str(bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
            _ => Err(RunError::type_error(format!("{who}: not a string"), vec![v])),
        },
        _ => Err(RunError::type_error(format!("{who}: not a string"), vec![v])),
    }
}

fn fe_length<T: ResourceTracker>(rt: &mut Runtime<T>, args: &[Value]) -> RunResult<Value> {
    let items = list_elements(rt, args[0], "length")?;
    Ok(Value::Int(items.len() as i64))
}

fn fe_reverse<T: ResourceTracker>(rt: &mut Runtime<T>, args: &[Value]) -> RunResult<Value> {
    let items = list_elements(rt, args[0], "reverse")?;
    let mut list = Value::Nil;
    for item in items {
        list = Value::Ref(rt.heap.allocate(HeapData::Pair(item, list))?);
    }
    Ok(list)
}

fn fe_list_to_vector<T: ResourceTracker>(rt: &mut Runtime<T>, args: &[Value]) -> RunResult<Value> {
    let items = list_elements(rt, args[0], "list->vector")?;
    let id = rt.heap.allocate(HeapData::Vector(items))?;
    Ok(Value::Ref(id))
}

fn fe_open_input_file<T: ResourceTracker>(rt: &mut Runtime<T>, args: &[Value]) -> RunResult<Value> {
    let path = string_arg(rt, args[0], "open-input-file")?;
    let port = InputPort::open(&path)
        .map_err(|err| RunError::new(ExcKind::ResourceError, format!("open-input-file: {err}"), vec![args[0]]))?;
    let id = rt.heap.allocate(HeapData::Port(Port::Input(port)))?;
    Ok(Value::Ref(id))
}

fn fe_open_output_file<T: ResourceTracker>(rt: &mut Runtime<T>, args: &[Value]) -> RunResult<Value> {
    let path = string_arg(rt, args[0], "open-output-file")?;
    let port = OutputPort::create(&path)
        .map_err(|err| RunError::new(ExcKind::ResourceError, format!("open-output-file: {err}"), vec![args[0]]))?;
    let id = rt.heap.allocate(HeapData::Port(Port::Output(port)))?;
    Ok(Value::Ref(id))
}

fn close_port<T: ResourceTracker>(rt: &mut Runtime<T>, v: Value, who: &str) -> RunResult<Value> {
    let Value::Ref(id) = v else {
        return Err(RunError::type_error(format!("{who}: not a port"), vec![v]));
    };
    match rt.heap.get_mut(id) {
        slot @ HeapData::Port(_) => {
            *slot = HeapData::Port(Port::Closed);
            Ok(Value::Undefined)
        }
        _ => Err(RunError::type_error(format!("{who}: not a port"), vec![v])),
    }
}

fn fe_close_input_port<T: ResourceTracker>(rt: &mut Runtime<T>, args: &[Value]) -> RunResult<Value> {
    close_port(rt, args[0], "close-input-port")
}

fn fe_close_output_port<T: ResourceTracker>(rt: &mut Runtime<T>, args: &[Value]) -> RunResult<Value> {
    close_port(rt, args[0], "close-output-port")
}

fn fe_load<T: ResourceTracker>(rt: &mut Runtime<T>, args: &[Value]) -> RunResult<Value> {
    let path = string_arg(rt, args[0], "load")?;
    rt.load_path(&path)
}

fn fe_memq<T: ResourceTracker>(rt: &mut Runtime<T>, args: &[Value]) -> RunResult<Value> {
    let key = args[0];
    let mut cursor = args[1];
    loop {
        match cursor {
            Value::Nil => return Ok(Value::Bool(false)),
            Value::Ref(id) => match rt.heap.get(id) {
                HeapData::Pair(car, cdr) => {
                    if *car == key {
                        return Ok(cursor);
                    }
                    cursor = *cdr;
                }
                _ => return Ok(Value::Bool(false)),
            },
            _ => return Ok(Value::Bool(false)),
        }
    }
}

fn fe_assq<T: ResourceTracker>(rt: &mut Runtime<T>, args: &[Value]) -> RunResult<Value> {
    let key = args[0];
    let mut cursor = args[1];
    loop {
        match cursor {
            Value::Ref(id) => match rt.heap.get(id) {
                HeapData::Pair(entry, cdr) => {
                    if let Value::Ref(eid) = entry {
                        if let HeapData::Pair(k, _) = rt.heap.get(*eid) {
                            if *k == key {
                                return Ok(*entry);
                            }
                        }
                    }
                    cursor = *cdr;
                }
                _ => return Ok(Value::Bool(false)),
            },
            _ => return Ok(Value::Bool(false)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_coherence() {
        assert!(table_is_coherent());
    }

    #[test]
    fn foreign_ids_match_table_order() {
        let table = foreign_table::<crate::resource::NoLimitTracker>();
        assert_eq!(table.len(), 10);
        assert_eq!(FE_ASSQ.index(), table.len() - 1);
        // every foreign-class primitive points inside the table
        for p in PRIMITIVES {
            if let Some(id) = p.foreign {
                assert!(id.index() < table.len(), "{} has out-of-range foreign id", p.name);
            }
        }
    }

    #[test]
    fn comparison_inverses_swap_not_negate() {
        let gt = PRIMITIVES.iter().find(|p| p.name == ">").unwrap();
        let ge = PRIMITIVES.iter().find(|p| p.name == ">=").unwrap();
        assert_eq!(gt.inverse, Some(Opcode::Lt));
        assert_eq!(ge.inverse, Some(Opcode::Le));
    }
}
