//! The S-expression reader.
//!
//! Reads one datum at a time from an input port, allocating pairs, strings,
//! and vectors on the heap and interning symbols. Character pulls go through
//! the port so interactive streams refill a line at a time; a datum that
//! spans lines keeps reading until balanced.
//!
//! Syntax: integers, floats, symbols, `"strings"` with `\n \t \\ \"`
//! escapes, `#t`/`#f`, `#\x` characters (plus `#\space`, `#\newline`,
//! `#\tab`), proper and dotted lists, `#( ... )` vectors, `'x` quote sugar,
//! and `;` line comments.

use crate::{
    exception::CompileError,
    heap::{Heap, HeapData},
    intern::Interns,
    port::InputPort,
    resource::ResourceTracker,
    value::Value,
};

/// Result of a read attempt: a datum, or a clean end of input.
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    Datum(Value),
    Eof,
}

type ReadResult<T> = Result<T, Box<CompileError>>;

/// Reads the next datum from `port`. End of input *between* data is
/// `ReadOutcome::Eof`; end of input *inside* a datum is a compile error.
pub(crate) fn read_datum<T: ResourceTracker>(
    port: &mut InputPort,
    heap: &mut Heap<T>,
    interns: &mut Interns,
) -> ReadResult<ReadOutcome> {
    skip_atmosphere(port);
    if port.peek_char().is_none() {
        return Ok(ReadOutcome::Eof);
    }
    read_expr(port, heap, interns).map(ReadOutcome::Datum)
}

/// Reads every datum from a source string. Convenience for `eval` and tests.
pub(crate) fn read_all<T: ResourceTracker>(
    source: &str,
    heap: &mut Heap<T>,
    interns: &mut Interns,
) -> ReadResult<Vec<Value>> {
    let mut port = InputPort::from_string(source);
    let mut data = Vec::new();
    loop {
        match read_datum(&mut port, heap, interns)? {
            ReadOutcome::Datum(v) => data.push(v),
            ReadOutcome::Eof => return Ok(data),
        }
    }
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '"' | ';' | '\'')
}

fn skip_atmosphere(port: &mut InputPort) {
    while let Some(c) = port.peek_char() {
        if c.is_whitespace() {
            port.next_char();
        } else if c == ';' {
            while let Some(c) = port.next_char() {
                if c == '\n' {
                    break;
                }
            }
        } else {
            return;
        }
    }
}

fn unexpected_eof() -> Box<CompileError> {
    CompileError::new("unexpected end of input", vec![])
}

fn read_expr<T: ResourceTracker>(
    port: &mut InputPort,
    heap: &mut Heap<T>,
    interns: &mut Interns,
) -> ReadResult<Value> {
    skip_atmosphere(port);
    let c = port.peek_char().ok_or_else(unexpected_eof)?;
    match c {
        '(' => {
            port.next_char();
            read_list(port, heap, interns)
        }
        ')' => Err(CompileError::new("unexpected )", vec![])),
        '\'' => {
            port.next_char();
            let inner = read_expr(port, heap, interns)?;
            let quote = Value::Symbol(interns.intern("quote"));
            let tail = heap.allocate(HeapData::Pair(inner, Value::Nil))?;
            let pair = heap.allocate(HeapData::Pair(quote, Value::Ref(tail)))?;
            Ok(Value::Ref(pair))
        }
        '"' => {
            port.next_char();
            read_string(port, heap)
        }
        '#' => {
            port.next_char();
            read_hash(port, heap, interns)
        }
        _ => read_atom(port, interns),
    }
}

fn read_list<T: ResourceTracker>(
    port: &mut InputPort,
    heap: &mut Heap<T>,
    interns: &mut Interns,
) -> ReadResult<Value> {
    let mut items = Vec::new();
    let mut tail = Value::Nil;
    loop {
        skip_atmosphere(port);
        let c = port.peek_char().ok_or_else(unexpected_eof)?;
        if c == ')' {
            port.next_char();
            break;
        }
        // a lone `.` introduces a dotted tail; `.5` or `...` is an atom
        if c == '.' {
            port.next_char();
            let lone = port.peek_char().is_none_or(is_delimiter);
            if lone {
                if items.is_empty() {
                    return Err(CompileError::new("dotted list without head", vec![]));
                }
                tail = read_expr(port, heap, interns)?;
                skip_atmosphere(port);
                if port.next_char() != Some(')') {
                    return Err(CompileError::new("expected ) after dotted tail", vec![]));
                }
                break;
            }
            items.push(read_atom_with_prefix(port, interns, String::from("."))?);
            continue;
        }
        items.push(read_expr(port, heap, interns)?);
    }
    let mut list = tail;
    for item in items.into_iter().rev() {
        list = Value::Ref(heap.allocate(HeapData::Pair(item, list))?);
    }
    Ok(list)
}

fn read_string<T: ResourceTracker>(port: &mut InputPort, heap: &mut Heap<T>) -> ReadResult<Value> {
    let mut text = String::new();
    loop {
        let c = port.next_char().ok_or_else(unexpected_eof)?;
        match c {
            '"' => break,
            '\\' => {
                let escaped = port.next_char().ok_or_else(unexpected_eof)?;
                match escaped {
                    'n' => text.push('\n'),
                    't' => text.push('\t'),
                    '\\' => text.push('\\'),
                    '"' => text.push('"'),
                    other => {
                        return Err(CompileError::new(
                            format!("unknown string escape: \\{other}"),
                            vec![],
                        ))
                    }
                }
            }
            _ => text.push(c),
        }
    }
    let id = heap.allocate(HeapData::Str(text.into_bytes()))?;
    Ok(Value::Ref(id))
}

fn read_hash<T: ResourceTracker>(
    port: &mut InputPort,
    heap: &mut Heap<T>,
    interns: &mut Interns,
) -> ReadResult<Value> {
    let c = port.next_char().ok_or_else(unexpected_eof)?;
    match c {
        't' => Ok(Value::Bool(true)),
        'f' => Ok(Value::Bool(false)),
        '\\' => read_char(port),
        '(' => {
            let mut items = Vec::new();
            loop {
                skip_atmosphere(port);
                let c = port.peek_char().ok_or_else(unexpected_eof)?;
                if c == ')' {
                    port.next_char();
                    break;
                }
                items.push(read_expr(port, heap, interns)?);
            }
            let id = heap.allocate(HeapData::Vector(items))?;
            Ok(Value::Ref(id))
        }
        other => Err(CompileError::new(format!("unknown # syntax: #{other}"), vec![])),
    }
}

fn read_char(port: &mut InputPort) -> ReadResult<Value> {
    let first = port.next_char().ok_or_else(unexpected_eof)?;
    let mut name = String::from(first);
    if first.is_alphabetic() {
        while let Some(c) = port.peek_char() {
            if is_delimiter(c) {
                break;
            }
            name.push(c);
            port.next_char();
        }
    }
    match name.as_str() {
        "space" => Ok(Value::Char(' ')),
        "newline" => Ok(Value::Char('\n')),
        "tab" => Ok(Value::Char('\t')),
        _ if name.chars().count() == 1 => Ok(Value::Char(first)),
        _ => Err(CompileError::new(format!("unknown character name: #\\{name}"), vec![])),
    }
}

fn read_atom(port: &mut InputPort, interns: &mut Interns) -> ReadResult<Value> {
    read_atom_with_prefix(port, interns, String::new())
}

fn read_atom_with_prefix(port: &mut InputPort, interns: &mut Interns, prefix: String) -> ReadResult<Value> {
    let mut token = prefix;
    while let Some(c) = port.peek_char() {
        if is_delimiter(c) {
            break;
        }
        token.push(c);
        port.next_char();
    }
    debug_assert!(!token.is_empty());
    if let Ok(n) = token.parse::<i64>() {
        return Ok(Value::Int(n));
    }
    // reject tokens like `-` or `...` that f64 parsing would not accept,
    // but accept `1.5`, `-2e3`
    if token.starts_with(|c: char| c.is_ascii_digit())
        || (token.len() > 1
            && token.starts_with(['+', '-'])
            && token[1..].starts_with(|c: char| c.is_ascii_digit() || c == '.'))
    {
        if let Ok(x) = token.parse::<f64>() {
            return Ok(Value::Float(x));
        }
        return Err(CompileError::new(format!("malformed number: {token}"), vec![]));
    }
    Ok(Value::Symbol(interns.intern(&token)))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::resource::NoLimitTracker;

    fn setup() -> (Heap<NoLimitTracker>, Interns) {
        (Heap::new(NoLimitTracker), Interns::new())
    }

    fn read_one(src: &str) -> (Value, Heap<NoLimitTracker>, Interns) {
        let (mut heap, mut interns) = setup();
        let data = read_all(src, &mut heap, &mut interns).unwrap();
        assert_eq!(data.len(), 1, "expected one datum from {src:?}");
        (data[0], heap, interns)
    }

    fn roundtrip(src: &str) -> String {
        let (v, heap, interns) = read_one(src);
        crate::value::write_value(v, &heap, &interns)
    }

    #[test]
    fn atoms() {
        assert_eq!(read_one("42").0, Value::Int(42));
        assert_eq!(read_one("-7").0, Value::Int(-7));
        assert_eq!(read_one("1.5").0, Value::Float(1.5));
        assert_eq!(read_one("-2.5").0, Value::Float(-2.5));
        assert_eq!(read_one("#t").0, Value::Bool(true));
        assert_eq!(read_one("#f").0, Value::Bool(false));
        assert_eq!(read_one("#\\a").0, Value::Char('a'));
        assert_eq!(read_one("#\\space").0, Value::Char(' '));
        assert_eq!(read_one("#\\newline").0, Value::Char('\n'));
    }

    #[test]
    fn symbols_including_signs() {
        let (v, _, mut interns) = read_one("+");
        assert_eq!(v, Value::Symbol(interns.intern("+")));
        let (v, _, mut interns) = read_one("list->vector");
        assert_eq!(v, Value::Symbol(interns.intern("list->vector")));
    }

    #[test]
    fn lists_roundtrip() {
        assert_eq!(roundtrip("(1 2 3)"), "(1 2 3)");
        assert_eq!(roundtrip("(a . b)"), "(a . b)");
        assert_eq!(roundtrip("(a b . c)"), "(a b . c)");
        assert_eq!(roundtrip("()"), "()");
        assert_eq!(roundtrip("(1 (2 3) 4)"), "(1 (2 3) 4)");
    }

    #[test]
    fn quote_sugar_expands() {
        assert_eq!(roundtrip("'x"), "(quote x)");
        assert_eq!(roundtrip("'(1 2)"), "(quote (1 2))");
    }

    #[test]
    fn strings_and_escapes() {
        assert_eq!(roundtrip("\"hi\""), "\"hi\"");
        assert_eq!(roundtrip("\"a\\nb\""), "\"a\\nb\"");
        assert_eq!(roundtrip("\"q\\\"q\""), "\"q\\\"q\"");
    }

    #[test]
    fn vectors() {
        assert_eq!(roundtrip("#(1 2 3)"), "#(1 2 3)");
        assert_eq!(roundtrip("#()"), "#()");
    }

    #[test]
    fn comments_are_atmosphere() {
        let (mut heap, mut interns) = setup();
        let data = read_all("; leading\n1 ; trailing\n2", &mut heap, &mut interns).unwrap();
        assert_eq!(data, vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn eof_inside_datum_is_an_error() {
        let (mut heap, mut interns) = setup();
        assert!(read_all("(1 2", &mut heap, &mut interns).is_err());
        assert!(read_all("\"open", &mut heap, &mut interns).is_err());
    }
}
