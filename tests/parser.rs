use script_vm::ast::{BinOp, Stmt};
use script_vm::parser::parse;

#[test]
fn a_well_formed_chunk_parses_with_no_diagnostics() {
    let out = parse("local s = 0\nfor i = 1, 10 do\n  s += i\nend\nreturn s\n");
    assert!(!out.diagnostics.has_errors());
    assert_eq!(out.block.stmts.len(), 3);
}

#[test]
fn numeric_for_captures_var_bounds_and_body() {
    let out = parse("for i = 1, 10 do\n  break\nend\n");
    assert!(!out.diagnostics.has_errors());
    match &out.block.stmts[0] {
        Stmt::NumericFor { var, step, body, .. } => {
            assert_eq!(&**var, "i");
            assert!(step.is_none());
            assert_eq!(body.stmts.len(), 1);
            assert!(matches!(body.stmts[0], Stmt::Break));
        }
        other => panic!("expected NumericFor, got {other:?}"),
    }
}

#[test]
fn generic_for_accepts_multiple_loop_variables() {
    let out = parse("for k, v in pairs(t) do\nend\n");
    assert!(!out.diagnostics.has_errors());
    match &out.block.stmts[0] {
        Stmt::GenericFor { vars, exprs, .. } => {
            assert_eq!(vars.len(), 2);
            assert_eq!(exprs.len(), 1);
        }
        other => panic!("expected GenericFor, got {other:?}"),
    }
}

#[test]
fn repeat_until_binds_the_condition_outside_the_body_scope() {
    let out = parse("repeat\n  local x = 1\nuntil x == 1\n");
    assert!(!out.diagnostics.has_errors());
    assert!(matches!(out.block.stmts[0], Stmt::Repeat { .. }));
}

#[test]
fn local_function_declaration_binds_its_own_name_before_the_body() {
    let out = parse("local function make()\n  return 1\nend\n");
    assert!(!out.diagnostics.has_errors());
    match &out.block.stmts[0] {
        Stmt::LocalFunctionDecl { name, .. } => assert_eq!(&**name, "make"),
        other => panic!("expected LocalFunctionDecl, got {other:?}"),
    }
}

#[test]
fn compound_assignment_lowers_to_a_binop_against_the_same_target() {
    let out = parse("local s = 0\ns += 1\n");
    assert!(!out.diagnostics.has_errors());
    match &out.block.stmts[1] {
        Stmt::CompoundAssign { op, .. } => assert_eq!(*op, BinOp::Add),
        other => panic!("expected CompoundAssign, got {other:?}"),
    }
}

#[test]
fn a_malformed_statement_is_recovered_past_rather_than_aborting_the_parse() {
    let out = parse("local x = \nreturn x\n");
    assert!(out.diagnostics.has_errors());
    // parsing always returns a full block even after an error
    assert!(out.block.stmts.iter().any(|s| matches!(s, Stmt::Return(_))));
}

#[test]
fn and_or_not_parse_with_the_expected_relative_precedence() {
    let out = parse("local ok = not a and b or c\n");
    assert!(!out.diagnostics.has_errors());
    match &out.block.stmts[0] {
        Stmt::LocalDecl { values, .. } => match &values[0] {
            script_vm::ast::Expr::Binary { op: BinOp::Or, .. } => {}
            other => panic!("expected top-level `or`, got {other:?}"),
        },
        other => panic!("expected LocalDecl, got {other:?}"),
    }
}
