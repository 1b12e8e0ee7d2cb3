//! Peephole jump folding, run once per function during
//! [`super::Builder::end_function`] when no long jump was flagged (§4.3.2).
//!
//! Two rewrites, both length-preserving so no downstream pc needs remapping:
//!
//! - chain-following: a jump whose target is itself an unconditional `jump`
//!   is retargeted straight to that jump's own target, repeated until a
//!   non-jump instruction or a cycle is hit;
//! - call/return collapse: a `call` immediately followed by an unconditional
//!   `jump` to the very next instruction (a no-op jump emitted by naive
//!   statement-sequencing) becomes `call_return`, and the jump becomes `nop`.

use super::builder::BuilderFrame;
use super::instruction::{Instruction, Opcode};

pub(super) fn fold_jumps(frame: &mut BuilderFrame) {
    fold_chains(frame);
    fold_call_return(frame);
}

fn is_unconditional_jump(op: Opcode) -> bool {
    matches!(op, Opcode::Jump | Opcode::JumpBack)
}

fn jump_target(pc: usize, instr: Instruction) -> i64 {
    pc as i64 + 1 + instr.d() as i64
}

fn fold_chains(frame: &mut BuilderFrame) {
    let len = frame.code.len();
    for pc in 0..len {
        let Some(op) = frame.code[pc].op() else {
            continue;
        };
        let is_jump = matches!(
            op,
            Opcode::Jump | Opcode::JumpBack | Opcode::JumpIf | Opcode::JumpIfNot
        );
        if !is_jump {
            continue;
        }

        let mut visited = std::collections::HashSet::new();
        let mut target = jump_target(pc, frame.code[pc]);
        loop {
            if target < 0 || target as usize >= len || !visited.insert(target) {
                break;
            }
            let target_instr = frame.code[target as usize];
            match target_instr.op() {
                Some(t_op) if is_unconditional_jump(t_op) => {
                    target = jump_target(target as usize, target_instr);
                }
                _ => break,
            }
        }

        if target >= 0 && target as usize <= len {
            let new_d = target - (pc as i64 + 1);
            if new_d >= i16::MIN as i64 && new_d <= i16::MAX as i64 {
                let a = frame.code[pc].a();
                frame.code[pc] = Instruction::ad(op, a, new_d as i16);
            }
        }
    }
}

fn fold_call_return(frame: &mut BuilderFrame) {
    let len = frame.code.len();
    let mut pc = 0usize;
    while pc < len {
        let Some(op) = frame.code[pc].op() else {
            pc += 1;
            continue;
        };
        let words = op.len_words() as usize;
        let jump_pc = pc + words;
        if op == Opcode::Call && jump_pc < len {
            if let Some(Opcode::Jump) = frame.code[jump_pc].op() {
                let target = jump_target(jump_pc, frame.code[jump_pc]);
                if target == (jump_pc as i64 + 1) {
                    let instr = frame.code[pc];
                    frame.code[pc] = Instruction::abc(Opcode::CallReturn, instr.a(), instr.b(), instr.c());
                    frame.code[jump_pc] = Instruction::abc(Opcode::Nop, 0, 0, 0);
                }
            }
        }
        pc += words;
    }
}
