//! Two-pass bytecode validation run at the end of [`super::Builder::end_function`]
//! (§4.3.1).

use super::builder::BuilderFrame;
use super::instruction::Opcode;
use crate::error::{CompileError, CompileResult};

fn fail(message: impl Into<String>) -> CompileError {
    CompileError::ValidationFailed {
        message: message.into(),
    }
}

/// Validate a function's finished instruction stream: every instruction
/// start is tagged, every register/constant/upvalue index it references
/// is in range, every jump lands on an instruction start, and the
/// `new_closure`/`capture` and `named_call`/`call` adjacency rules hold.
pub(super) fn validate(
    frame: &BuilderFrame,
    max_stack_size: u8,
    num_upvalues: u8,
) -> CompileResult<()> {
    let starts = tag_instruction_starts(frame);

    let mut pc = 0usize;
    while pc < frame.code.len() {
        if !starts[pc] {
            pc += 1;
            continue;
        }
        let instr = frame.code[pc];
        let op = instr
            .op()
            .ok_or_else(|| fail(format!("unknown opcode byte at pc {pc}")))?;

        check_registers(op, instr.a(), instr.b(), instr.c(), max_stack_size, pc)?;
        check_upvalue_refs(op, instr, num_upvalues, pc)?;
        check_constant_refs(frame, op, instr, pc)?;
        check_jump_target(frame, &starts, op, instr, pc)?;

        if op == Opcode::NewClosure {
            check_closure_captures(frame, &starts, pc)?;
        }
        if op == Opcode::NamedCall {
            check_named_call_adjacency(frame, &starts, pc)?;
        }

        pc += op.len_words() as usize;
    }

    Ok(())
}

fn tag_instruction_starts(frame: &BuilderFrame) -> Vec<bool> {
    let mut starts = vec![false; frame.code.len()];
    let mut pc = 0usize;
    while pc < frame.code.len() {
        starts[pc] = true;
        let words = frame.code[pc]
            .op()
            .map(Opcode::len_words)
            .unwrap_or(1) as usize;
        pc += words.max(1);
    }
    starts
}

fn check_registers(
    op: Opcode,
    a: u8,
    b: u8,
    c: u8,
    max_stack_size: u8,
    pc: usize,
) -> CompileResult<()> {
    // A holds a register operand for essentially every opcode; B/C only
    // do so for the register-register-register arithmetic/table forms.
    // We conservatively validate A always, and B/C when the opcode's
    // name implies they index registers rather than small immediates.
    if a > max_stack_size && !matches!(op, Opcode::Jump | Opcode::JumpBack | Opcode::JumpExtra) {
        return Err(fail(format!(
            "register A={a} out of range (max {max_stack_size}) at pc {pc}"
        )));
    }
    let uses_bc_as_registers = matches!(
        op,
        Opcode::Move
            | Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Pow
            | Opcode::Lt
            | Opcode::Le
            | Opcode::Eq
            | Opcode::LoadTable
            | Opcode::StoreTable
            | Opcode::BAnd
            | Opcode::BOr
            | Opcode::BXor
            | Opcode::Shl
            | Opcode::Shr
    );
    if uses_bc_as_registers && (b > max_stack_size || c > max_stack_size) {
        return Err(fail(format!(
            "register B/C out of range (max {max_stack_size}) at pc {pc}"
        )));
    }
    Ok(())
}

fn check_upvalue_refs(
    op: Opcode,
    instr: super::instruction::Instruction,
    num_upvalues: u8,
    pc: usize,
) -> CompileResult<()> {
    if matches!(op, Opcode::GetUpvalue | Opcode::SetUpvalue) && instr.b() >= num_upvalues {
        return Err(fail(format!(
            "upvalue index {} out of range (have {num_upvalues}) at pc {pc}",
            instr.b()
        )));
    }
    Ok(())
}

fn check_constant_refs(
    frame: &BuilderFrame,
    op: Opcode,
    instr: super::instruction::Instruction,
    pc: usize,
) -> CompileResult<()> {
    let uses_constant_d = matches!(
        op,
        Opcode::LoadNumber | Opcode::LoadKey | Opcode::AddKey | Opcode::SubKey
            | Opcode::MulKey | Opcode::DivKey | Opcode::ModKey | Opcode::LtKey
            | Opcode::LeKey | Opcode::EqKey | Opcode::JumpIfEqualKey
    );
    if uses_constant_d {
        let idx = instr.d();
        if idx < 0 || idx as usize >= frame.constants.len() {
            return Err(fail(format!(
                "constant index {idx} out of range (have {}) at pc {pc}",
                frame.constants.len()
            )));
        }
    }
    Ok(())
}

fn check_jump_target(
    frame: &BuilderFrame,
    starts: &[bool],
    op: Opcode,
    instr: super::instruction::Instruction,
    pc: usize,
) -> CompileResult<()> {
    let is_jump = matches!(
        op,
        Opcode::Jump
            | Opcode::JumpBack
            | Opcode::JumpIf
            | Opcode::JumpIfNot
            | Opcode::JumpIfEqualKey
    );
    if !is_jump {
        return Ok(());
    }
    let target = pc as i64 + 1 + instr.d() as i64;
    if target < 0 || target as usize > frame.code.len() || (target as usize) < frame.code.len() && !starts[target as usize] {
        return Err(fail(format!(
            "jump at pc {pc} targets non-instruction-boundary {target}"
        )));
    }
    Ok(())
}

fn check_closure_captures(frame: &BuilderFrame, starts: &[bool], pc: usize) -> CompileResult<()> {
    let expected = frame
        .capture_types_by_closure_site
        .get(&(pc as u32))
        .map(|v| v.len())
        .unwrap_or(0);
    let mut cursor = pc + Opcode::NewClosure.len_words() as usize;
    let mut found = 0usize;
    while cursor < frame.code.len() && starts[cursor] {
        match frame.code[cursor].op() {
            Some(Opcode::Capture) => {
                found += 1;
                cursor += 1;
            }
            _ => break,
        }
    }
    if found != expected {
        return Err(fail(format!(
            "new_closure at pc {pc} expects {expected} capture instructions, found {found}"
        )));
    }
    Ok(())
}

fn check_named_call_adjacency(frame: &BuilderFrame, starts: &[bool], pc: usize) -> CompileResult<()> {
    let cursor = pc + Opcode::NamedCall.len_words() as usize;
    if cursor >= frame.code.len() || !starts[cursor] {
        return Err(fail(format!(
            "named_call at pc {pc} is not followed by a valid instruction"
        )));
    }
    match frame.code[cursor].op() {
        Some(Opcode::Call) => Ok(()),
        _ => Err(fail(format!(
            "named_call at pc {pc} must be immediately followed by call"
        ))),
    }
}
