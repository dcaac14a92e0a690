//! End-to-end scenarios from the driver surface down to printed output,
//! covering the happy paths and the runtime-error paths a script can hit.

use std::io::Write;
use std::sync::{Arc, Mutex};

use luma_core::{InterpretResult, VM};

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuffer {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).expect("print output is valid utf-8")
    }
}

fn run(source: &str) -> (InterpretResult, String) {
    let buffer = SharedBuffer::default();
    let mut vm = VM::with_output(Box::new(buffer.clone()));
    let result = vm.interpret(source);
    (result, buffer.contents())
}

fn expect_ok(source: &str) -> String {
    let (result, output) = run(source);
    assert!(matches!(result, InterpretResult::Ok), "expected success, output so far: {output}");
    output
}

fn expect_runtime_error(source: &str) -> String {
    let (result, output) = run(source);
    match result {
        InterpretResult::RuntimeError(err) => err.message,
        InterpretResult::CompileError(errors) => {
            panic!("expected a runtime error, got compile errors: {errors:?}")
        }
        InterpretResult::Ok => panic!("expected a runtime error, program ran to completion: {output}"),
    }
}

#[test]
fn arithmetic_precedence() {
    assert_eq!(expect_ok("print 1 + 2 * 3;"), "7\n");
}

#[test]
fn string_concatenation() {
    assert_eq!(expect_ok("var a = \"foo\"; var b = \"bar\"; print a + b;"), "foobar\n");
}

#[test]
fn closures_share_captured_state() {
    let source = r#"
        fun mk() {
            var x = 0;
            fun inc() { x = x + 1; return x; }
            return inc;
        }
        var c = mk();
        print c();
        print c();
        print c();
    "#;
    assert_eq!(expect_ok(source), "1\n2\n3\n");
}

#[test]
fn class_init_and_method() {
    let source = r#"
        class A {
            init(n) { this.n = n; }
            show() { print this.n; }
        }
        A(42).show();
    "#;
    assert_eq!(expect_ok(source), "42\n");
}

#[test]
fn superclass_method_override_and_concat() {
    let source = r#"
        class B { m() { return "b"; } }
        class C < B { m() { return super.m() + "c"; } }
        print C().m();
    "#;
    assert_eq!(expect_ok(source), "bc\n");
}

#[test]
fn superclass_call_with_arguments_binds_this_correctly() {
    let source = r#"
        class B {
            init(n) { this.n = n; }
            show() { print this.n; }
        }
        class C < B {
            init(n) { super.init(n + 1); }
        }
        C(41).show();
    "#;
    assert_eq!(expect_ok(source), "42\n");
}

#[test]
fn while_loop() {
    assert_eq!(
        expect_ok("var i = 0; while (i < 3) { print i; i = i + 1; }"),
        "0\n1\n2\n"
    );
}

#[test]
fn or_yields_first_truthy_operand() {
    assert_eq!(
        expect_ok("if (nil or 0 or \"x\") print \"truthy\"; else print \"nope\";"),
        "truthy\n"
    );
}

#[test]
fn interned_strings_compare_equal_by_reference() {
    assert_eq!(expect_ok("print \"a\" == \"a\";"), "true\n");
}

#[test]
fn assignment_is_an_expression() {
    assert_eq!(expect_ok("var x; print x = 1;"), "1\n");
}

#[test]
fn printed_forms_match_canonical_representations() {
    let source = r#"
        print nil;
        print true;
        print false;
        print 3.5;
        print 2;
        class Greeter {}
        print Greeter;
        print Greeter();
    "#;
    assert_eq!(
        expect_ok(source),
        "nil\ntrue\nfalse\n3.5\n2\nGreeter\nGreeter instance\n"
    );
}

#[test]
fn numbers_print_in_g_format() {
    assert_eq!(expect_ok("print 0.1 + 0.2;"), "0.3\n");
    // No scientific-notation literal syntax (matching the reference
    // scanner), so the same magnitude is spelled out in full.
    assert_eq!(expect_ok("print 1000000000000000000000.0;"), "1e+21\n");
}

#[test]
fn undefined_variable_is_a_runtime_error() {
    assert_eq!(expect_runtime_error("a + 1;"), "Undefined variable 'a'.");
}

#[test]
fn mismatched_operand_types_are_a_runtime_error() {
    assert_eq!(expect_runtime_error("\"x\" - 1;"), "Operands must be numbers.");
}

#[test]
fn calling_a_non_callable_is_a_runtime_error() {
    assert_eq!(
        expect_runtime_error("var f = 3; f();"),
        "Can only call functions and classes."
    );
}

#[test]
fn undefined_property_is_a_runtime_error() {
    assert_eq!(
        expect_runtime_error("class X {} X().y;"),
        "Undefined property 'y'."
    );
}

#[test]
fn strict_arity_rejects_extra_arguments() {
    let source = "fun f(a) { return a; } f(1, 2);";
    assert!(expect_runtime_error(source).starts_with("Expected 1 arguments but got 2."));
}

#[test]
fn class_without_init_rejects_nonzero_arguments() {
    let source = "class X {} X(1);";
    assert!(expect_runtime_error(source).starts_with("Expected 0 arguments but got 1."));
}
