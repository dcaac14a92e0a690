//! Compiler, bytecode VM and garbage collector for the Luma scripting
//! language: a small, dynamically-typed, class-based language compiled to a
//! stack-based bytecode and run by a tree-walking-free VM.

pub mod chunk;
pub mod compiler;
pub mod error;
pub mod gc;
pub mod lexer;
pub mod native;
pub mod object;
pub mod table;
pub mod value;
pub mod vm;

pub use error::{CompileError, RuntimeError};
pub use vm::{InterpretResult, VM};

#[cfg(test)]
pub mod test_utils {
    /// Initializes a tracing subscriber at DEBUG level for tests that want
    /// to see compiler/GC diagnostics. Safe to call more than once.
    pub fn init_test_logging() {
        use tracing_subscriber::{fmt, EnvFilter};

        let _ = fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
            .with_test_writer()
            .try_init();
    }
}
