//! Tests for the two failure domains:
//! - Compile errors: diagnostics with line and token, parse keeps going
//! - Runtime errors: type mismatches, arity, indexing, dispatch, overflow

use rlux::{Error, VM};

fn compile_and_run(src: &str) -> Result<String, String> {
    let mut vm = VM::default();
    let mut out = Vec::new();
    match vm.interpret(src, &mut out) {
        Ok(()) => Ok(String::from_utf8(out).expect("output is utf-8")),
        Err(Error::Compile(errors)) => Err(errors
            .first()
            .map(|err| err.to_string())
            .unwrap_or_default()),
        Err(Error::Runtime(err)) => Err(err.to_string()),
    }
}

fn expect_error(src: &str, expected_pattern: &str) {
    match compile_and_run(src) {
        Err(err) => {
            assert!(
                err.contains(expected_pattern),
                "Error '{}' should contain '{}' for source: {}",
                err,
                expected_pattern,
                src
            );
        }
        Ok(val) => {
            panic!(
                "Expected error containing '{}', but got success: {} for source: {}",
                expected_pattern, val, src
            );
        }
    }
}

// ============================================================================
// Runtime errors
// ============================================================================

#[test]
fn adding_unjoinable_operands() {
    expect_error("dump \"x\" + 1;", "must be two joinable types");
    expect_error("dump [1] + {};", "must be two joinable types");
    expect_error("dump nil + nil;", "must be two joinable types");
}

#[test]
fn arithmetic_requires_numbers() {
    expect_error("dump \"a\" - 1;", "Operands must be numbers.");
    expect_error("dump nil * 2;", "Operands must be numbers.");
    expect_error("dump true % 2;", "Operands must be numbers.");
    expect_error("dump -\"a\";", "Operand must be a number.");
    expect_error("dump \"a\" < \"b\";", "Operands must be numbers.");
}

#[test]
fn modulo_by_zero() {
    expect_error("dump 1 % 0;", "Division by zero.");
}

#[test]
fn arity_is_checked_exactly() {
    expect_error(
        "fun f(a) { return a; } f(1, 2);",
        "Expected 1 arguments but got 2.",
    );
    expect_error("fun f(a) { return a; } f();", "Expected 1 arguments but got 0.");
    expect_error("class A {} A(1);", "Expected 0 arguments but got 1.");
}

#[test]
fn undefined_variables() {
    expect_error("dump missing;", "Undefined variable 'missing'.");
    expect_error("missing = 1;", "Undefined variable 'missing'.");
}

#[test]
fn undefined_properties() {
    expect_error("class A {} dump A().nope;", "Undefined property 'nope'.");
    expect_error("let t = {}; dump t.nope;", "Undefined property 'nope'.");
    expect_error("let t = {}; dump t[\"nope\"];", "Undefined table property 'nope'.");
}

#[test]
fn only_instances_and_tables_have_properties() {
    expect_error("dump (1).x;", "Only instances and tables have properties.");
    expect_error("let n = 1; n.x = 2;", "Only instances and tables have fields.");
}

#[test]
fn invoking_a_method_on_a_non_instance() {
    expect_error(
        "let t = { \"f\": 1 }; t.f();",
        "Only instances have methods.",
    );
}

#[test]
fn indexing_errors() {
    expect_error("dump \"abc\"[5];", "String index out of bounds.");
    expect_error("dump \"abc\"[true];", "Index must be a number.");
    expect_error("dump [1][3];", "Array index out of bounds.");
    expect_error("dump [1][0 - 1];", "Array index out of bounds.");
    expect_error("dump [1][nil];", "Index must be a number.");
    expect_error("let a = [1]; a[5] = 2;", "Index out of bounds.");
    expect_error("let a = [1]; a[\"x\"] = 2;", "Index must be a number.");
    expect_error("dump (1)[0];", "Only strings, tables and arrays can be indexed.");
    expect_error(
        "let s = \"ab\"; s[0] = \"c\";",
        "Only tables and arrays support index assignment.",
    );
}

#[test]
fn calling_a_non_callable() {
    expect_error("let x = 1; x();", "Can only call functions and classes.");
    expect_error("\"s\"();", "Can only call functions and classes.");
}

#[test]
fn operator_dispatch_requires_one_class() {
    expect_error(
        "class A {} class B {} A() + B();",
        "Operands must be two instances of the same class.",
    );
    expect_error("class A {} A() + A();", "Undefined property '__add'.");
    expect_error("class A {} dump A() == A();", "Undefined property '__eq'.");
}

#[test]
fn superclass_must_be_a_class() {
    expect_error("let x = 1; class A < x {}", "Superclass must be a class.");
}

#[test]
fn deep_recursion_overflows_the_frame_stack() {
    expect_error("fun f() { return f(); } f();", "Stack overflow.");
}

#[test]
fn runtime_error_resets_the_machine_for_reuse() {
    let mut vm = VM::default();
    let mut out = Vec::new();
    assert!(vm.interpret("dump \"x\" + 1;", &mut out).is_err());
    vm.interpret("dump 1 + 1;", &mut out)
        .expect("the machine is reusable after a runtime error");
    assert_eq!(String::from_utf8(out).unwrap(), "2\n");
}

// ============================================================================
// Compile errors
// ============================================================================

#[test]
fn self_inheritance() {
    expect_error("class A {} class A < A {}", "A class can't inherit from itself.");
}

#[test]
fn compile_errors_carry_line_and_token() {
    expect_error("let a = ;", "[line 1] Error at ';':");
    expect_error("\nlet b = ;", "[line 2] Error at ';':");
}

#[test]
fn missing_semicolons() {
    expect_error("dump 1", "Expect ';' after value.");
    expect_error("let a = 1", "Expect ';' after variable declaration.");
}

#[test]
fn invalid_assignment_targets() {
    expect_error("1 + 2 = 3;", "Invalid assignment target.");
    expect_error("a + b = 1;", "Invalid assignment target.");
}

#[test]
fn loop_control_outside_loops() {
    expect_error("break;", "Can't use 'break' outside of a loop.");
    expect_error("continue;", "Can't use 'continue' outside of a loop.");
    expect_error("fun f() { break; } f();", "Can't use 'break' outside of a loop.");
}

#[test]
fn class_misuse() {
    expect_error("dump this;", "Can't use 'this' outside of a class.");
    expect_error("dump super.f;", "Can't use 'super' outside of a class.");
    expect_error(
        "class A { f() { return super.f(); } }",
        "Can't use 'super' in a class with no superclass.",
    );
    expect_error(
        "class A { init() { return 1; } }",
        "Can't return a value from an initializer.",
    );
}

#[test]
fn top_level_return() {
    expect_error("return;", "Can't return from top-level code.");
}

#[test]
fn scanner_faults_become_compile_errors() {
    expect_error("let a = \"unterminated;", "Unterminated string.");
    expect_error("let a = 1 ~ 2;", "Unexpected character '~'.");
}

#[test]
fn multiple_errors_are_collected() {
    let mut vm = VM::default();
    let mut out = Vec::new();
    match vm.interpret("let = 1; let b = ; dump b;", &mut out) {
        Err(Error::Compile(errors)) => assert!(errors.len() >= 2),
        other => panic!("expected a compile error, got {:?}", other.err()),
    }
}
