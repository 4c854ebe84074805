//! Codegen coverage through the pure-cell path: control flow, promotion,
//! functions, dictionaries, symbols. Each compiled result is checked
//! against the reference interpreter.

mod common;

use nbjit::{new_session, read_program, Expr, NbError, PureOutcome, Session};

fn run(session: &mut Session, src: &str, id: &str) -> i64 {
    let ast = read_program(src).expect("source parses");
    match session.run_pure_cell(&ast, id).expect("cell compiles") {
        PureOutcome::Value(v) => v,
        PureOutcome::Cached => panic!("unexpected cache hit for fresh id {}", id),
    }
}

fn check(session: &mut Session, src: &str, id: &str) -> i64 {
    let value = run(session, src, id);
    assert_eq!(value, common::interp_i64(src), "source:\n{}", src);
    value
}

#[test]
fn arithmetic_and_precedence() {
    let mut s = new_session();
    assert_eq!(check(&mut s, "return 2 + 3 * 4", "a1"), 14);
    assert_eq!(check(&mut s, "return (2 + 3) * 4", "a2"), 20);
    assert_eq!(check(&mut s, "return 17 % 5 + 20 / 4", "a3"), 7);
    assert_eq!(check(&mut s, "return 1 - 2 - 3", "a4"), -4);
}

#[test]
fn preserved_loop_runs_natively() {
    let mut s = new_session();
    // 100 iterations is beyond the unroll limit, so the loop survives
    // partial evaluation and exercises the native loop skeleton.
    let src = "s = 0\nfor i in 1:100\n s = s + i\nend\nreturn s";
    assert_eq!(check(&mut s, src, "loop1"), 5050);
}

#[test]
fn while_loop_with_mutation() {
    let mut s = new_session();
    let src = "n = 100\nc = 0\nwhile n > 1\n n = n / 2\n c = c + 1\nend\nreturn c";
    assert_eq!(check(&mut s, src, "loop2"), common::interp_i64(src));
}

#[test]
fn break_and_continue() {
    let mut s = new_session();
    let src = "s = 0\nfor i in 1:100\n if i > 4\n  break\n end\n s = s + i\nend\nreturn s";
    assert_eq!(check(&mut s, src, "b1"), 10);

    let src = "s = 0\nfor i in 1:20\n if i % 2 == 0\n  continue\n end\n s = s + i\nend\nreturn s";
    assert_eq!(check(&mut s, src, "b2"), 100);
}

#[test]
fn function_calls_compile_in_module() {
    let mut s = new_session();
    let src = "function double_plus(a)\n return a * 2 + 1\nend\nreturn double_plus(20)";
    assert_eq!(check(&mut s, src, "f1"), 41);

    // Two functions, one calling through the other's result.
    let src = "function sq(a)\n return a * a\nend\nfunction sumsq(a, b)\n return sq(a) + sq(b)\nend\nreturn sumsq(3, 4)";
    assert_eq!(check(&mut s, src, "f2"), 25);
}

#[test]
fn short_circuit_logic_in_functions() {
    let mut s = new_session();
    let src = "function inrange(a)\n if a > 3 && a < 10\n  return 1\n end\n return 0\nend\nreturn inrange(5) + inrange(11) * 10";
    assert_eq!(check(&mut s, src, "l1"), 1);

    let src = "function outside(a)\n if a < 0 || a > 100\n  return 1\n end\n return 0\nend\nreturn outside(-3) + outside(50)";
    assert_eq!(check(&mut s, src, "l2"), 1);
}

#[test]
fn mixed_arithmetic_promotes_to_float() {
    let mut s = new_session();
    // The float path runs natively inside the function; the entry
    // truncates back to an integer.
    let src = "function halfway(a)\n return a + 0.5\nend\nreturn halfway(2) * 10";
    // (2 + 0.5) truncated at the call boundary: the hole ABI carries
    // i64, so the callee returns 2.
    assert_eq!(check(&mut s, src, "fl1"), common::interp_i64(src));

    let src = "x = 2.5\ny = 4\nreturn x * y";
    assert_eq!(check(&mut s, src, "fl2"), 10);
}

#[test]
fn dictionaries_and_symbols_round_trip() {
    let mut s = new_session();
    let src = "d = Dict()\nd[:k] = 41\nreturn d[:k] + 1";
    assert_eq!(run(&mut s, src, "d1"), 42);

    let src = "d = Dict()\nd[1] = 10\nd[2] = 20\nreturn d[1] + d[2]";
    assert_eq!(run(&mut s, src, "d2"), 30);
}

#[test]
fn dict_element_reads_unbox_at_the_entry() {
    let mut s = new_session();
    // The final expression is an element read, so the unit returns an
    // integer and the boxed value is unwrapped on the way out.
    let src = "d = Dict()\nd[:answer] = 42\nreturn d[:answer]";
    assert_eq!(run(&mut s, src, "d3"), 42);
}

#[test]
fn conditional_expression_value() {
    let mut s = new_session();
    let src = "function pick(a)\n if a > 0\n  b = a * 2\n else\n  b = 0 - a\n end\n return b\nend\nreturn pick(5) + pick(-3)";
    assert_eq!(check(&mut s, src, "c1"), 13);
}

#[test]
fn println_lowering_links_against_printf() {
    let mut s = new_session();
    let src = "x = 6\nprintln(x * 7)\nprintln(\"done\")\nreturn x";
    assert_eq!(run(&mut s, src, "p1"), 6);
}

#[test]
fn tuples_are_rejected_by_the_ir_builder() {
    let mut s = new_session();
    let ast = Expr::Block(vec![Expr::Tuple(vec![Expr::int(1), Expr::int(2)])]);
    let err = s.run_pure_cell(&ast, "t1").unwrap_err();
    assert!(matches!(err, NbError::IrBuild { .. }));
}

#[test]
fn undefined_variable_is_a_build_error() {
    let mut s = new_session();
    let ast = read_program("return missing_name + 1").unwrap();
    let err = s.run_pure_cell(&ast, "u1").unwrap_err();
    assert!(matches!(err, NbError::IrBuild { .. }));
}

#[test]
fn nested_scopes_shadow_correctly() {
    let mut s = new_session();
    // The loop variable shadows nothing outside; `i` after the loop
    // would be undefined, so keep reads inside.
    let src = "t = 0\nfor i in 1:12\n for j in 1:12\n  if (i + j) % 3 == 0\n   t = t + 1\n  end\n end\nend\nreturn t";
    assert_eq!(check(&mut s, src, "n1"), common::interp_i64(src));
}
