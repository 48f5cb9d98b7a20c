//! The read-eval-print loop.

use crate::{
    parse::ReadOutcome,
    resource::ResourceTracker,
    runtime::Runtime,
    tracer::NoopTracer,
    value::{write_value, Value},
};

/// Reads data from the current input port and evaluates each in the
/// interaction environment until end of input. Results other than the
/// unspecified value are written back; errors are reported and the loop
/// continues.
pub fn repl<T: ResourceTracker>(rt: &mut Runtime<T>) {
    loop {
        if rt.write_current_output("> ").is_err() {
            return;
        }
        let datum = match rt.read_current_input() {
            Ok(ReadOutcome::Datum(datum)) => datum,
            Ok(ReadOutcome::Eof) => {
                let _ = rt.write_current_output("\n");
                return;
            }
            Err(err) => {
                let _ = rt.write_current_error(&format!("{}: {}\n", err.kind, err.message));
                continue;
            }
        };
        match rt.eval_datum(datum, &mut NoopTracer) {
            Ok(Value::Undefined) => {}
            Ok(value) => {
                let text = write_value(value, &rt.heap, &rt.interns);
                let _ = rt.write_current_output(&text);
                let _ = rt.write_current_output("\n");
            }
            Err(err) => {
                let _ = rt.write_current_error(&format!("{err}\n"));
            }
        }
    }
}
