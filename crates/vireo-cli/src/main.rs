use std::{env, fs, process::ExitCode};

use vireo::{repl, Runtime, StderrTracer};

const USAGE: &str = "usage: vireo [options] [file ...]
  -e <expr>   evaluate an expression
  -p <expr>   evaluate an expression and print the result
  --trace     trace every VM instruction to stderr
  -h, --help  show this help

With no expression or file arguments, vireo starts a REPL.";

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut rt = Runtime::new();
    let mut trace = false;
    let mut ran = false;
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                println!("{USAGE}");
                return ExitCode::SUCCESS;
            }
            "--trace" => trace = true,
            flag @ ("-e" | "-p") => {
                let Some(expr) = args.get(i + 1) else {
                    eprintln!("error: {flag} requires an expression");
                    return ExitCode::FAILURE;
                };
                let result = if trace {
                    rt.run_traced(expr, &mut StderrTracer)
                } else {
                    rt.run(expr)
                };
                match result {
                    Ok(value) => {
                        if flag == "-p" {
                            println!("{value}");
                        }
                    }
                    Err(err) => {
                        eprintln!("error: {err}");
                        return ExitCode::FAILURE;
                    }
                }
                ran = true;
                i += 1;
            }
            path => {
                let source = match fs::read_to_string(path) {
                    Ok(source) => source,
                    Err(err) => {
                        eprintln!("error: {path}: {err}");
                        return ExitCode::FAILURE;
                    }
                };
                if let Err(err) = rt.run(&source) {
                    eprintln!("error: {path}: {err}");
                    return ExitCode::FAILURE;
                }
                ran = true;
            }
        }
        i += 1;
    }

    if !ran {
        repl(&mut rt);
    }
    ExitCode::SUCCESS
}
