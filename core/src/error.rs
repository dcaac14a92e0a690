//! The two error domains the engine can surface: compile errors (collected
//! during `compile`, never thrown/caught) and runtime errors (surfaced
//! during `run`, each fatal to the current `interpret` call).

use thiserror::Error;

/// A single compile-time diagnostic, formatted as `[line L] Error at
/// 'lexeme': message` (or `at end` when `lexeme` is `None`), matching the
/// reference implementation's error wire format.
#[derive(Error, Debug, Clone)]
#[error("[line {line}] Error{}: {message}", at_clause(&self.lexeme))]
pub struct CompileError {
    pub line: u32,
    pub lexeme: Option<String>,
    pub message: String,
}

fn at_clause(lexeme: &Option<String>) -> String {
    match lexeme {
        Some(lexeme) => format!(" at '{}'", lexeme),
        None => " at end".to_string(),
    }
}

/// One frame of a runtime error's back-trace: `[line N] in <name|script>`.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub line: u32,
    pub name: String,
}

/// A runtime fault. The VM resets its stack after producing one, so a REPL
/// session can keep going.
#[derive(Error, Debug, Clone)]
#[error("{}", format_runtime_error(&self.message, &self.trace))]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

fn format_runtime_error(message: &str, trace: &[TraceFrame]) -> String {
    let mut out = message.to_string();
    for frame in trace {
        out.push('\n');
        out.push_str(&format!("[line {}] in {}", frame.line, frame.name));
    }
    out
}
