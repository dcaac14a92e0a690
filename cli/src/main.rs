use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use luma_core::{InterpretResult, VM};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing_subscriber::{fmt, EnvFilter};

/// Luma - a small dynamically-typed, class-based scripting language.
#[derive(Parser, Debug)]
#[command(name = "luma")]
#[command(about = "Run a Luma script, or start a REPL with no arguments", long_about = None)]
struct Args {
    /// Script file to run. Omit to start an interactive REPL.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    paths: Vec<PathBuf>,

    /// Collect garbage on every allocation (debug aid for GC correctness).
    #[arg(long)]
    stress_gc: bool,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();

    let mut vm = VM::new();
    vm.set_stress_gc(args.stress_gc);

    match args.paths.as_slice() {
        [] => {
            run_repl(&mut vm);
            ExitCode::SUCCESS
        }
        [path] => run_file(&mut vm, path),
        _ => {
            eprintln!("Usage: luma [path]");
            ExitCode::from(64)
        }
    }
}

fn run_file(vm: &mut VM, path: &PathBuf) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read file \"{}\": {}", path.display(), err);
            return ExitCode::from(74);
        }
    };

    match vm.interpret(&source) {
        InterpretResult::Ok => ExitCode::SUCCESS,
        InterpretResult::CompileError(errors) => {
            for error in &errors {
                eprintln!("{}", error);
            }
            ExitCode::from(65)
        }
        InterpretResult::RuntimeError(error) => {
            eprintln!("{}", error);
            ExitCode::from(70)
        }
    }
}

fn run_repl(vm: &mut VM) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("Could not start line editor: {}", err);
            return;
        }
    };

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                match vm.interpret(&line) {
                    InterpretResult::Ok => {}
                    InterpretResult::CompileError(errors) => {
                        for error in &errors {
                            eprintln!("{}", error);
                        }
                    }
                    InterpretResult::RuntimeError(error) => eprintln!("{}", error),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Readline error: {}", err);
                break;
            }
        }
    }
}
