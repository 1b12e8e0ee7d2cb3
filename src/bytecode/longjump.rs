//! Long-jump expansion: rewrites any jump whose distance exceeds
//! [`crate::consts::CONSERVATIVE_JUMP_LIMIT`] into a wide trampoline built
//! from `jump_extra` (§4.3.3).
//!
//! `jump_extra` carries its target as an absolute (already-remapped)
//! instruction index in its AUX word, so one rewrite pass is sufficient:
//! every instruction start is mapped from its old pc to its new pc first,
//! then every jump (expanded or not) has its `D`/AUX re-derived from that
//! map in a second pass. This converges in a single sweep because
//! [`crate::consts::CONSERVATIVE_JUMP_LIMIT`] leaves enough headroom that a
//! jump left un-expanded cannot be pushed out of `i16` range by the modest
//! per-site growth (2 words at most) introduced elsewhere in the function.

use super::builder::BuilderFrame;
use super::instruction::{Instruction, Opcode};
use crate::consts::CONSERVATIVE_JUMP_LIMIT;
use crate::error::{CompileError, CompileResult};
use std::collections::HashMap;

fn fail(message: impl Into<String>) -> CompileError {
    CompileError::ValidationFailed {
        message: message.into(),
    }
}

fn is_jump(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::Jump | Opcode::JumpBack | Opcode::JumpIf | Opcode::JumpIfNot | Opcode::JumpIfEqualKey
    )
}

/// The conditional-jump guard that precedes a `jump_extra` trampoline must
/// test the *opposite* predicate of the jump it replaces: the trampoline
/// only needs to be taken (falling through into `jump_extra`) when the
/// original predicate holds, so the guard should skip past `jump_extra`
/// precisely when the original predicate does *not* hold. `JumpIfEqualKey`
/// dispatches identically to `JumpIf` (a plain truthy test, per
/// `src/vm/dispatch.rs`), so `JumpIfNot` inverts it too.
fn inverted_guard_opcode(op: Opcode) -> Opcode {
    match op {
        Opcode::JumpIf | Opcode::JumpIfEqualKey => Opcode::JumpIfNot,
        Opcode::JumpIfNot => Opcode::JumpIf,
        _ => unreachable!("only conditional jumps reach the guard-trampoline path"),
    }
}

/// Resolve the true old-space target of the jump at `pc`, using the
/// recorded overflow target if the `D` field could not hold it, otherwise
/// decoding `D` directly.
fn old_target(frame: &BuilderFrame, pc: u32, instr: Instruction) -> u32 {
    if let Some(&target) = frame.overflowed_jumps.get(&pc) {
        return target;
    }
    (pc as i64 + 1 + instr.d() as i64).max(0) as u32
}

pub(super) fn expand_long_jumps(frame: &mut BuilderFrame) -> CompileResult<()> {
    let old_code = std::mem::take(&mut frame.code);
    let old_lines = std::mem::take(&mut frame.lines);

    // Pass 1: decide which jump sites need the wide trampoline, and build
    // the old-pc -> new-pc map for every instruction start.
    let mut needs_trampoline: HashMap<u32, bool> = HashMap::new();
    let mut pc = 0usize;
    while pc < old_code.len() {
        if let Some(op) = old_code[pc].op() {
            if is_jump(op) {
                let target = old_target(frame, pc as u32, old_code[pc]);
                let distance = target as i64 - (pc as i64 + 1);
                let wide = distance.unsigned_abs() as i64 > CONSERVATIVE_JUMP_LIMIT as i64;
                needs_trampoline.insert(pc as u32, wide);
            }
            pc += op.len_words() as usize;
        } else {
            pc += 1;
        }
    }

    let mut pc_map: HashMap<u32, u32> = HashMap::new();
    let mut new_pc = 0u32;
    let mut pc = 0usize;
    while pc < old_code.len() {
        pc_map.insert(pc as u32, new_pc);
        let op = old_code[pc].op();
        let old_words = op.map(Opcode::len_words).unwrap_or(1);
        let growth = match op {
            Some(o) if needs_trampoline.get(&(pc as u32)).copied().unwrap_or(false) => {
                if matches!(o, Opcode::Jump | Opcode::JumpBack) {
                    2 // 1 word -> jump_extra (2 words)
                } else {
                    3 // 1 word -> guard + jump_extra (3 words total)
                }
            }
            _ => old_words,
        };
        new_pc += growth;
        pc += old_words as usize;
    }
    // Sentinel for "one past the end", used when a jump targets the very
    // end of the function (e.g. a `break` out of the last statement).
    pc_map.insert(old_code.len() as u32, new_pc);

    // Pass 2: rebuild the instruction stream.
    let mut new_code = Vec::with_capacity(new_pc as usize);
    let mut new_lines = Vec::with_capacity(new_pc as usize);
    let mut pc = 0usize;
    while pc < old_code.len() {
        let instr = old_code[pc];
        let line = old_lines.get(pc).copied().unwrap_or(0);
        let op = instr.op().ok_or_else(|| fail(format!("unknown opcode at pc {pc}")))?;
        let words = op.len_words() as usize;

        if is_jump(op) && needs_trampoline.get(&(pc as u32)).copied().unwrap_or(false) {
            let old_tgt = old_target(frame, pc as u32, instr);
            let new_tgt = *pc_map
                .get(&old_tgt)
                .ok_or_else(|| fail(format!("jump at pc {pc} targets unmapped pc {old_tgt}")))?;

            if matches!(op, Opcode::Jump | Opcode::JumpBack) {
                new_code.push(Instruction::e(Opcode::JumpExtra, 0));
                new_code.push(Instruction::from_raw(new_tgt));
                new_lines.push(line);
                new_lines.push(line);
            } else {
                // Guard: inverted predicate, same operand register.
                // Original predicate false -> guard's inverted predicate is
                // true -> short-jump past the jump_extra (2 words), landing
                // on the original fall-through site. Original predicate true
                // -> guard's inverted predicate is false -> fall through by
                // one word into jump_extra, which performs the original
                // jump's wide target.
                new_code.push(Instruction::ad(inverted_guard_opcode(op), instr.a(), 2));
                new_code.push(Instruction::e(Opcode::JumpExtra, 0));
                new_code.push(Instruction::from_raw(new_tgt));
                new_lines.push(line);
                new_lines.push(line);
                new_lines.push(line);
            }
        } else if is_jump(op) {
            let old_tgt = old_target(frame, pc as u32, instr);
            let new_tgt = *pc_map
                .get(&old_tgt)
                .ok_or_else(|| fail(format!("jump at pc {pc} targets unmapped pc {old_tgt}")))?;
            let new_self_pc = new_code.len() as i64;
            let new_d = new_tgt as i64 - (new_self_pc + 1);
            if new_d < i16::MIN as i64 || new_d > i16::MAX as i64 {
                return Err(fail(format!(
                    "jump at old pc {pc} still out of range after one expansion sweep"
                )));
            }
            new_code.push(Instruction::ad(op, instr.a(), new_d as i16));
            new_lines.push(line);
        } else {
            for w in 0..words {
                new_code.push(old_code[pc + w]);
                new_lines.push(old_lines.get(pc + w).copied().unwrap_or(line));
            }
        }

        pc += words;
    }

    // Remap debug metadata and closure-capture bookkeeping, whose keys
    // and ranges are expressed in the old pc space.
    for local in &mut frame.debug_locals {
        local.begin_pc = *pc_map.get(&local.begin_pc).unwrap_or(&local.begin_pc);
        local.end_pc = *pc_map.get(&local.end_pc).unwrap_or(&local.end_pc);
    }
    let remapped_captures: HashMap<u32, _> = frame
        .capture_types_by_closure_site
        .drain()
        .filter_map(|(old_pc, v)| pc_map.get(&old_pc).map(|&new_pc| (new_pc, v)))
        .collect();
    frame.capture_types_by_closure_site = remapped_captures;

    frame.code = new_code;
    frame.lines = new_lines;
    frame.overflowed_jumps.clear();
    Ok(())
}
