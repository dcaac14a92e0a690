//! Native-function ABI and the standard-library surface the spec allows
//! (`clock` only — no broader stdlib is in scope).

use std::time::Instant;

use crate::value::Value;

/// `typedef value native(argc, args)`. The VM calls this with the argument
/// slice (callee and receiver already stripped); the return value replaces
/// the callee + arguments region on the stack.
pub type NativeFn = fn(argc: usize, args: &[Value]) -> Value;

/// Returns CPU-seconds elapsed since the VM was started, as a double.
pub fn clock_native(_argc: usize, _args: &[Value]) -> Value {
    thread_local! {
        static START: Instant = Instant::now();
    }
    let elapsed = START.with(|start| start.elapsed());
    Value::Number(elapsed.as_secs_f64())
}
