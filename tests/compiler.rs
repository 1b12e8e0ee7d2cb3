use script_vm::bytecode::Opcode;
use script_vm::compiler::compile;
use script_vm::parser::parse;

fn compile_ok(source: &str) -> script_vm::bytecode::Module {
    let out = parse(source);
    assert!(!out.diagnostics.has_errors(), "parse errors: {:?}", out.diagnostics.all());
    compile(&out.block).expect("compile should succeed")
}

#[test]
fn numeric_for_emits_exactly_one_prepare_and_one_back_edge() {
    let module = compile_ok("local s = 0\nfor i = 1, 10 do\n  s += i\nend\nreturn s\n");
    let main = &module.functions[module.main_function_id as usize];
    let prepares = main.code.iter().filter(|i| i.op() == Some(Opcode::ForNumericLoopPrepare)).count();
    let backedges = main.code.iter().filter(|i| i.op() == Some(Opcode::ForNumericLoop)).count();
    assert_eq!(prepares, 1);
    assert_eq!(backedges, 1);
}

#[test]
fn a_function_literal_becomes_a_child_prototype() {
    let module = compile_ok("local function make()\n  return 1\nend\nreturn make\n");
    let main = &module.functions[module.main_function_id as usize];
    assert_eq!(main.children.len(), 1);
    assert!(module.functions.len() >= 2);
}

#[test]
fn an_if_statement_patches_its_jump_past_the_else_branch() {
    let module = compile_ok("local x = 1\nif x == 1 then\n  x = 2\nelse\n  x = 3\nend\nreturn x\n");
    let main = &module.functions[module.main_function_id as usize];
    assert!(main.code.iter().any(|i| matches!(i.op(), Some(Opcode::JumpIf) | Some(Opcode::JumpIfNot))));
}
