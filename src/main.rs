use std::{
    cell::RefCell,
    io::Write,
    path::{Path, PathBuf},
    process::ExitCode,
    rc::Rc,
};

use clap::Parser;
use hydor::vm::{InterpretError, Vm};

#[derive(Debug, Parser)]
#[command(name = "hydor", about = "A bytecode-compiled expression language")]
struct Cli {
    /// Script file to run; starts a REPL when omitted
    script: Vec<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.script.as_slice() {
        [] => repl(),
        [script] => run_file(script),
        _ => {
            eprintln!("Usage: hydor [script]");
            ExitCode::from(64)
        }
    }
}

fn repl() -> ExitCode {
    let mut vm = Vm::new(Rc::new(RefCell::new(std::io::stdout())));

    println!("Hydor REPL - Type '/exit' to quit");

    let mut input = String::new();
    loop {
        print!(">> ");
        std::io::stdout()
            .flush()
            .expect("should be able to flush stdout");

        input.clear();
        let read = std::io::stdin()
            .read_line(&mut input)
            .expect("should be able to read line from stdin");

        if read == 0 {
            println!();
            break;
        }

        let line = input.trim();
        if line == "/exit" {
            break;
        }
        if line.is_empty() {
            continue;
        }

        // Diagnostics were already written to stderr by the compiler or VM.
        let _ = run_source(&mut vm, line);
    }

    ExitCode::SUCCESS
}

fn run_file(path: &Path) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("Cannot open file '{}', Error: {}", path.display(), error);
            return ExitCode::from(74);
        }
    };

    let mut vm = Vm::new(Rc::new(RefCell::new(std::io::stdout())));
    match run_source(&mut vm, &source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(InterpretError::Compile(_)) => ExitCode::from(65),
        Err(InterpretError::Runtime(_)) => ExitCode::from(64),
    }
}

fn run_source<W: Write>(vm: &mut Vm<W>, source: &str) -> Result<(), InterpretError> {
    let chunk = hydor::compiler::compile(source)?;
    vm.interpret(&chunk)?;
    Ok(())
}
