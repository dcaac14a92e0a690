//! Compiler limits: local/constant/parameter counts and jump sizes.

use luma_core::compiler::compile;
use luma_core::gc::Heap;

fn compiles(source: &str) -> bool {
    let mut heap = Heap::new();
    compile(source, &mut heap).is_ok()
}

fn errors(source: &str) -> Vec<String> {
    let mut heap = Heap::new();
    match compile(source, &mut heap) {
        Ok(_) => Vec::new(),
        Err(errors) => errors.iter().map(|e| e.to_string()).collect(),
    }
}

/// Slot 0 of every function's locals array is reserved (the call-target /
/// receiver slot, per `FunctionScope::new`), so a function body can declare
/// at most `MAX_LOCALS - 1` additional locals before hitting the cap.
fn function_with_locals(count: usize) -> String {
    let mut body = String::from("fun f() {\n");
    for i in 0..count {
        body.push_str(&format!("var v{i} = {i};\n"));
    }
    body.push_str("}\n");
    body
}

#[test]
fn exactly_the_local_cap_compiles() {
    assert!(compiles(&function_with_locals(255)));
}

#[test]
fn one_past_the_local_cap_errors() {
    let errs = errors(&function_with_locals(256));
    assert!(
        errs.iter().any(|e| e.contains("Too many local variables in function.")),
        "errors were: {errs:?}"
    );
}

fn statements_of_distinct_constants(count: usize) -> String {
    let mut body = String::new();
    for i in 0..count {
        body.push_str(&format!("{i};\n"));
    }
    body
}

#[test]
fn exactly_the_constant_cap_compiles() {
    assert!(compiles(&statements_of_distinct_constants(256)));
}

#[test]
fn one_past_the_constant_cap_errors() {
    let errs = errors(&statements_of_distinct_constants(257));
    assert!(
        errs.iter().any(|e| e.contains("Too many constants in one chunk.")),
        "errors were: {errs:?}"
    );
}

fn function_with_params(count: usize) -> String {
    let params: Vec<String> = (0..count).map(|i| format!("p{i}")).collect();
    format!("fun f({}) {{}}\n", params.join(", "))
}

#[test]
fn exactly_eight_parameters_compiles() {
    assert!(compiles(&function_with_params(8)));
}

#[test]
fn nine_parameters_errors() {
    let errs = errors(&function_with_params(9));
    assert!(
        errs.iter().any(|e| e.contains("Can't have more than 8 parameters.")),
        "errors were: {errs:?}"
    );
}

#[test]
fn oversized_then_branch_rejects_the_jump() {
    let mut body = String::from("if (true) {\n");
    for _ in 0..40_000 {
        body.push_str("nil;\n");
    }
    body.push_str("}\n");
    let errs = errors(&body);
    assert!(
        errs.iter().any(|e| e.contains("Too much code to jump over.")),
        "errors were: {errs:?}"
    );
}
